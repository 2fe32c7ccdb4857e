//! Backing resources for remote streams.
//!
//! Locators name what a stream is backed by:
//!
//! - `mem:<name>` - named in-memory buffer shared by every session
//! - `file:<relative path>` - file under the configured stream root
//! - `scratch:` - anonymous in-memory buffer private to one handle

use crate::error::ServerError;
use bytes::Bytes;
use osnet_protocol::OpenMode;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Length of the diagnostic stream served for STREAM_TEST.
pub const TEST_STREAM_LEN: usize = 10_000;

/// Deterministic content of the diagnostic stream.
pub fn test_pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// In-memory buffer that can be shared between handles.
pub type SharedBuffer = Arc<RwLock<Vec<u8>>>;

/// A parsed resource locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Memory(String),
    File(PathBuf),
    Scratch,
}

impl Locator {
    pub fn parse(locator: &str) -> Result<Self, ServerError> {
        let (scheme, rest) = locator.split_once(':').ok_or_else(|| {
            ServerError::ResourceUnavailable(format!("malformed locator '{}'", locator))
        })?;

        match scheme {
            "mem" if !rest.is_empty() => Ok(Locator::Memory(rest.to_string())),
            "mem" => Err(ServerError::ResourceUnavailable(
                "memory locator needs a name".to_string(),
            )),
            "file" => {
                let path = Path::new(rest);
                let confined = !rest.is_empty()
                    && path.components().all(|c| matches!(c, Component::Normal(_)));
                if !confined {
                    return Err(ServerError::ResourceUnavailable(format!(
                        "file path '{}' must be relative and stay under the stream root",
                        rest
                    )));
                }
                Ok(Locator::File(path.to_path_buf()))
            }
            "scratch" => Ok(Locator::Scratch),
            other => Err(ServerError::ResourceUnavailable(format!(
                "unknown locator scheme '{}'",
                other
            ))),
        }
    }
}

/// Storage behind one stream handle.
pub enum Resource {
    Memory(SharedBuffer),
    File(File),
}

impl Resource {
    /// A fresh buffer holding the diagnostic test pattern.
    pub fn test_stream() -> Self {
        Resource::memory(test_pattern(TEST_STREAM_LEN).to_vec())
    }

    pub fn memory(data: Vec<u8>) -> Self {
        Resource::Memory(Arc::new(RwLock::new(data)))
    }

    /// Opens a file resource in `mode`.
    pub fn open_file(path: &Path, mode: OpenMode) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(mode.readable()).write(mode.writable());
        if mode == OpenMode::Create {
            options.create(true).truncate(true);
        }
        Ok(Resource::File(options.open(path)?))
    }

    pub fn len(&self) -> io::Result<u64> {
        match self {
            Resource::Memory(buffer) => Ok(buffer.read().len() as u64),
            Resource::File(file) => Ok(file.metadata()?.len()),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every current backend supports random access.
    pub fn is_seekable(&self) -> bool {
        true
    }

    /// Reads up to `len` bytes at `offset`. Empty at or past the end.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Bytes> {
        match self {
            Resource::Memory(buffer) => {
                let data = buffer.read();
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(Bytes::copy_from_slice(&data[start..end]))
            }
            Resource::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                let mut out = Vec::with_capacity(len.min(64 * 1024));
                Read::by_ref(file).take(len as u64).read_to_end(&mut out)?;
                Ok(out.into())
            }
        }
    }

    /// Writes `data` at `offset`, zero-filling any gap past the end.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        match self {
            Resource::Memory(buffer) => {
                let start = usize::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
                let end = start + data.len();
                let mut buffer = buffer.write();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(data);
                Ok(data.len())
            }
            Resource::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                Ok(data.len())
            }
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Memory(buffer) => write!(f, "Memory({} bytes)", buffer.read().len()),
            Resource::File(file) => write!(f, "File({:?})", file),
        }
    }
}
