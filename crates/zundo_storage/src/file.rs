//! File-based storage backend for persistent undo logs.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every undo-log file.
const FILE_MAGIC: [u8; 4] = *b"ZUNL";

/// Current file format version.
const FILE_VERSION: u16 = 1;

/// magic (4) + version (2) + reserved (2) + discard point (8)
const HEADER_SIZE: u64 = 16;

/// Offset of the discard point inside the header.
const DISCARD_FIELD: u64 = 8;

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
    discarded: u64,
}

/// A file-based undo-log backend.
///
/// The file starts with a small header that records the discard point, so a
/// reopened log keeps refusing reads below it. Logical offset `n` lives at
/// file position `HEADER_SIZE + n`. Discarded bytes stay on disk; only the
/// live window moves.
///
/// # Durability
///
/// - `flush()` pushes buffered data to the OS
/// - `sync()` calls `File::sync_all()`
/// - `discard_to()` and `truncate()` sync before returning
///
/// # Example
///
/// ```no_run
/// use zundo_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("undo.0001")).unwrap();
/// let offset = backend.append(b"undo record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: RwLock<FileState>,
}

impl FileBackend {
    /// Opens or creates an undo-log file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created, or if an
    /// existing file has an invalid header.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let (size, discarded) = if len == 0 {
            write_header(&mut file, 0)?;
            file.sync_all()?;
            (0, 0)
        } else {
            let discarded = read_header(&mut file, len)?;
            let size = len - HEADER_SIZE;
            if discarded > size {
                return Err(StorageError::Corrupted(format!(
                    "discard point {discarded} beyond end {size}"
                )));
            }
            (size, discarded)
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(FileState {
                file,
                size,
                discarded,
            }),
        })
    }

    /// Opens or creates an undo-log file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File, discarded: u64) -> StorageResult<()> {
    let mut header = Vec::with_capacity(HEADER_SIZE as usize);
    header.extend_from_slice(&FILE_MAGIC);
    header.extend_from_slice(&FILE_VERSION.to_le_bytes());
    header.extend_from_slice(&[0, 0]);
    header.extend_from_slice(&discarded.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn read_header(file: &mut File, len: u64) -> StorageResult<u64> {
    if len < HEADER_SIZE {
        return Err(StorageError::Corrupted(format!(
            "file too short for header: {len} bytes"
        )));
    }

    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    if header[0..4] != FILE_MAGIC {
        return Err(StorageError::Corrupted("invalid undo-log magic".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > FILE_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported undo-log version {version}"
        )));
    }

    let mut discard = [0u8; 8];
    discard.copy_from_slice(&header[DISCARD_FIELD as usize..]);
    Ok(u64::from_le_bytes(discard))
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.state.write();
        if offset < state.discarded {
            return Err(StorageError::Discarded {
                offset,
                discarded: state.discarded,
            });
        }

        let end = offset.saturating_add(len as u64);
        if end > state.size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: state.size,
            });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(HEADER_SIZE + offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.write();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::Start(HEADER_SIZE + offset))?;
        state.file.write_all(data)?;
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.state.write().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.read().size)
    }

    fn discarded(&self) -> StorageResult<u64> {
        Ok(self.state.read().discarded)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.read().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        if new_size < state.discarded || new_size > state.size {
            return Err(StorageError::OutOfWindow {
                offset: new_size,
                discarded: state.discarded,
                size: state.size,
            });
        }

        state.file.set_len(HEADER_SIZE + new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }

    fn discard_to(&mut self, offset: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        if offset > state.size {
            return Err(StorageError::OutOfWindow {
                offset,
                discarded: state.discarded,
                size: state.size,
            });
        }
        if offset <= state.discarded {
            return Ok(());
        }

        state.file.seek(SeekFrom::Start(DISCARD_FIELD))?;
        state.file.write_all(&offset.to_le_bytes())?;
        state.file.sync_all()?;
        state.discarded = offset;
        Ok(())
    }
}
