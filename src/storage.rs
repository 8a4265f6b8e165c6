//! Local byte storage for transfers.
//!
//! A [`Storage`] resolves request filenames to a readable [`ByteSource`] or
//! a freshly created [`ByteSink`]. [`FsStorage`] serves files below one root
//! directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("illegal filename: {0:?}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub trait ByteSource {
    /// Reads up to `max_len` bytes. Fewer bytes are returned only at end of
    /// input; an empty vector means the input is exhausted.
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Vec<u8>>;
}

pub trait ByteSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<R: Read + ?Sized> ByteSource for R {
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(max_len);
        // `take` keeps reading across short reads until the limit or EOF.
        Read::take(&mut *self, max_len as u64).read_to_end(&mut chunk)?;
        Ok(chunk)
    }
}

impl<W: Write + ?Sized> ByteSink for W {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }
}

pub trait Storage: Send + Sync + 'static {
    type Source: ByteSource + Send + 'static;
    type Sink: ByteSink + Send + 'static;

    fn open_read(&self, name: &str) -> Result<Self::Source, StorageError>;

    /// Creates `name`; fails if it already exists.
    fn open_write(&self, name: &str) -> Result<Self::Sink, StorageError>;

    /// Deletes `name`, used to discard an upload that did not complete.
    fn remove(&self, name: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(name);
        let mut resolved = self.root.clone();
        let mut depth = 0;
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => (),
                _ => return Err(StorageError::InvalidName(name.to_string())),
            }
        }
        if depth == 0 {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(resolved)
    }
}

impl Storage for FsStorage {
    type Source = File;
    type Sink = File;

    fn open_read(&self, name: &str) -> Result<File, StorageError> {
        let path = self.resolve(name)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => (),
            Ok(_) => return Err(StorageError::NotFound(name.to_string())),
            Err(e) => return Err(map_io(e, name)),
        }
        File::open(&path).map_err(|e| map_io(e, name))
    }

    fn open_write(&self, name: &str) -> Result<File, StorageError> {
        let path = self.resolve(name)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| map_io(e, name))
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).map_err(|e| map_io(e, name))
    }
}

fn map_io(e: io::Error, name: &str) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(name.to_string()),
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(name.to_string()),
        io::ErrorKind::PermissionDenied => StorageError::AccessDenied(name.to_string()),
        _ => StorageError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_chunk_fills_block_until_eof() {
        let mut src = Cursor::new(vec![7u8; 1000]);
        assert_eq!(src.read_chunk(512).unwrap().len(), 512);
        assert_eq!(src.read_chunk(512).unwrap().len(), 488);
        assert!(src.read_chunk(512).unwrap().is_empty());
    }

    // A reader that hands out one byte per call.
    struct Trickle(Vec<u8>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0.remove(0);
            Ok(1)
        }
    }

    #[test]
    fn short_reads_do_not_end_a_block() {
        let mut src = Trickle(vec![1; 600]);
        assert_eq!(src.read_chunk(512).unwrap().len(), 512);
        assert_eq!(src.read_chunk(512).unwrap().len(), 88);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(matches!(
            storage.open_read("nope.bin"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(matches!(
            storage.open_read("sub"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"original").unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(matches!(
            storage.open_write("keep.txt"),
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(fs::read(dir.path().join("keep.txt")).unwrap(), b"original");
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let mut sink = storage.open_write("new.bin").unwrap();
        sink.append(b"hello ").unwrap();
        sink.append(b"world").unwrap();
        drop(sink);
        let mut src = storage.open_read("new.bin").unwrap();
        assert_eq!(src.read_chunk(512).unwrap(), b"hello world");
    }

    #[test]
    fn remove_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let mut sink = storage.open_write("partial.bin").unwrap();
        sink.append(&[1; 100]).unwrap();
        drop(sink);
        storage.remove("partial.bin").unwrap();
        assert!(!dir.path().join("partial.bin").exists());
        assert!(matches!(
            storage.remove("partial.bin"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.remove("../outside"),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn escaping_the_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        for name in ["../etc/passwd", "/etc/passwd", "a/../../b", "", "."] {
            assert!(
                matches!(storage.open_read(name), Err(StorageError::InvalidName(_))),
                "{name:?} was accepted"
            );
        }
    }

    #[test]
    fn nested_names_resolve_under_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("boot")).unwrap();
        fs::write(dir.path().join("boot/kernel"), b"k").unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(storage.open_read("boot/kernel").is_ok());
        assert!(storage.open_read("./boot/kernel").is_ok());
    }
}
