//! Physical log streams.
//!
//! A log stream is a random-access byte sink that also supports an atomic
//! whole-content replacement (used by `shrink`).

use crate::error::WalError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte stream backing a [`StreamStorage`](crate::StreamStorage).
pub trait LogStream: Send {
    /// Reads the full stream content.
    fn read_all(&mut self) -> Result<Vec<u8>, WalError>;

    /// Writes `data` at `offset`, extending the stream if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WalError>;

    /// Flushes written data to durable storage.
    fn sync(&mut self) -> Result<(), WalError>;

    /// Atomically replaces the whole content with `data`.
    fn replace(&mut self, data: &[u8]) -> Result<(), WalError>;

    /// Returns the current physical length.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStream for Box<dyn LogStream> {
    fn read_all(&mut self) -> Result<Vec<u8>, WalError> {
        (**self).read_all()
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WalError> {
        (**self).write_at(offset, data)
    }

    fn sync(&mut self) -> Result<(), WalError> {
        (**self).sync()
    }

    fn replace(&mut self, data: &[u8]) -> Result<(), WalError> {
        (**self).replace(data)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

/// A log stored in a single file.
pub struct FileStream {
    path: PathBuf,
    file: File,
    size: u64,
    sync_pending: bool,
}

impl FileStream {
    /// Opens the log file at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            sync_pending: false,
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".shrink");
        self.path.with_file_name(name)
    }
}

impl LogStream for FileStream {
    fn read_all(&mut self) -> Result<Vec<u8>, WalError> {
        let mut data = Vec::with_capacity(self.size as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WalError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.size = self.size.max(offset + data.len() as u64);
        self.sync_pending = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), WalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> Result<(), WalError> {
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)?;

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = data.len() as u64;
        self.sync_pending = false;

        tracing::debug!(
            "Replaced log {} ({} bytes)",
            self.path.display(),
            self.size
        );
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// A log held in a shared in-memory buffer.
///
/// Clones share the same buffer, so a test can drop the storage that wrote
/// the log and reopen it from a clone as if the process had restarted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stream over existing bytes.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: Arc::new(Mutex::new(data.into())),
        }
    }

    /// Returns a copy of the current content.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

impl LogStream for MemoryStream {
    fn read_all(&mut self) -> Result<Vec<u8>, WalError> {
        Ok(self.buf.lock().clone())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WalError> {
        let mut buf = self.buf.lock();
        let start = offset as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> Result<(), WalError> {
        *self.buf.lock() = data.to_vec();
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_stream_write_and_read() {
        let dir = TempDir::new().unwrap();
        let mut stream = FileStream::open(dir.path().join("session.log")).unwrap();
        assert!(stream.is_empty());

        stream.write_at(0, b"hello").unwrap();
        stream.write_at(4, b"!!").unwrap();
        stream.sync().unwrap();

        assert_eq!(stream.len(), 6);
        assert_eq!(stream.read_all().unwrap(), b"hell!!".to_vec());
    }

    #[test]
    fn test_file_stream_replace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.log");
        let mut stream = FileStream::open(&path).unwrap();
        stream.write_at(0, b"a long original content").unwrap();

        stream.replace(b"short").unwrap();
        assert_eq!(stream.len(), 5);
        assert_eq!(stream.read_all().unwrap(), b"short".to_vec());

        // Reopening sees the replacement
        let mut reopened = FileStream::open(&path).unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"short".to_vec());
        assert!(!dir.path().join("session.log.shrink").exists());
    }

    #[test]
    fn test_memory_stream_clones_share_buffer() {
        let mut stream = MemoryStream::new();
        let observer = stream.clone();

        stream.write_at(2, b"xy").unwrap();
        assert_eq!(observer.to_vec(), vec![0, 0, b'x', b'y']);
        assert_eq!(observer.len(), 4);
    }
}
