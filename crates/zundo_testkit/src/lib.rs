//! # Zundo Testkit
//!
//! Test utilities for the zundo undo engine.
//!
//! This crate provides:
//! - A wired-up test engine and a workload driver that changes pages while
//!   writing their undo, the way an in-place-update heap does
//! - Fault injection for the durability log, and page recovery from
//!   logged images
//! - Property-based test generators using proptest
//! - Undo record wire-format test vectors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zundo_testkit::prelude::*;
//!
//! #[test]
//! fn aborted_insert_is_undone() {
//!     let engine = TestEngine::memory();
//!     let rel = engine.create_relation(false);
//!     let page = engine.new_page(&rel);
//!     let mut txn = engine.begin();
//!     txn.insert(&page, b"row").unwrap();
//!     txn.rollback().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_logging;
    pub use crate::vectors::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use vectors::*;

/// Sends `tracing` output to the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Calling this
/// more than once is harmless.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
