#![forbid(unsafe_code)]

//! Positioned file I/O.
//!
//! Everything above this crate reaches the backing file through `FileIo`,
//! so tests can substitute failing or instrumented implementations.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use vellum_types::{Result, VellumError};

/// Positioned reads and writes against a single backing file.
///
/// Offsets are absolute; implementations must not keep a shared cursor.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`, erroring with `UnexpectedEof` on a short file.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes file data and metadata to the medium.
    fn sync_all(&self) -> Result<()>;
    /// Current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
fn read_step(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(dst, off)
}

#[cfg(unix)]
fn write_step(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(src, off)
}

#[cfg(windows)]
fn read_step(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(dst, off)
}

#[cfg(windows)]
fn write_step(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(src, off)
}

#[cfg(not(any(unix, windows)))]
fn read_step(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positioned reads unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn write_step(_file: &File, _off: u64, _src: &[u8]) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positioned writes unsupported on this platform",
    ))
}

/// `FileIo` over `std::fs::File`, cloneable through a shared handle.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating the file when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            match read_step(&self.file, off + done as u64, &mut dst[done..])? {
                0 => {
                    return Err(VellumError::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "positioned read past end of file",
                    )))
                }
                n => done += n,
            }
        }
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < src.len() {
            match write_step(&self.file, off + done as u64, &src[done..])? {
                0 => {
                    return Err(VellumError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "positioned write made no progress",
                    )))
                }
                n => done += n,
            }
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();

        let payload = b"hello mundo";
        io.write_at(0, payload).unwrap();
        io.sync_all().unwrap();

        let mut buf = vec![0u8; payload.len()];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert!(io.len().unwrap() >= payload.len() as u64);
    }

    #[test]
    fn read_past_eof_returns_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();
        let mut buf = [0u8; 8];
        let err = io.read_at(0, &mut buf).unwrap_err();
        match err {
            VellumError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reopen_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io_roundtrip.bin");
        {
            let io = StdFileIo::open(&path).unwrap();
            let buf = vec![42u8; 8192];
            io.write_at(0, &buf).unwrap();
            io.sync_all().unwrap();
        }
        let reopen = StdFileIo::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap(),
        );
        let mut buf = vec![0u8; 8192];
        reopen.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 42));
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io_trunc.bin");
        let io = StdFileIo::open(&path).unwrap();
        io.write_at(0, &vec![1u8; 4096]).unwrap();
        io.truncate(1024).unwrap();
        assert_eq!(io.len().unwrap(), 1024);
    }

    #[test]
    fn reads_at_offsets_are_independent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io_offsets.bin");
        let io = StdFileIo::open(&path).unwrap();
        io.write_at(0, b"aaaa").unwrap();
        io.write_at(4, b"bbbb").unwrap();

        let mut buf = [0u8; 4];
        io.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"bbbb");
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaa");
    }
}
