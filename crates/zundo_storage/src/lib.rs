//! # Zundo Storage
//!
//! Append-only byte backends for undo-log space.
//!
//! Every undo log owns one backend. A backend is an **opaque byte window**
//! addressed by logical offsets that only ever grow: records are appended at
//! the tail, the tail can be rewound, and the head can be discarded once no
//! transaction needs it. Backends never interpret the bytes they hold.
//!
//! ## Design Principles
//!
//! - Logical offsets are stable: discarding the head does not shift them
//! - `discarded() <= size()` always; bytes below `discarded()` are unreadable
//! - No knowledge of undo record formats, pages or transactions
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral logs
//! - [`FileBackend`] - For persistent logs using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use zundo_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"undo bytes").unwrap();
//! backend.discard_to(offset + 5).unwrap();
//! assert_eq!(backend.read_at(offset + 5, 5).unwrap(), b"bytes");
//! assert!(backend.read_at(offset, 5).is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
