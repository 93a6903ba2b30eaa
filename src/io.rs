use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::error::{FveError, Result};

/// Random-access read capability over a fixed-size medium.
///
/// Positioned reads take `&self` so an already-unlocked session can serve
/// concurrent sector reads; implementations that cannot read concurrently
/// must serialize internally.
pub trait ByteSource {
    /// Fills `buf` from `offset`. A short read is an error, not a partial
    /// success.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Total size of the medium in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed byte source (disk image, device node).
///
/// `std::fs::File` positioned reads are not portable across platforms, so
/// seek+read is held behind a mutex. That is the mutual-exclusion boundary
/// the session relies on for concurrent reads.
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }

    pub fn new(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        if end > self.size {
            return Err(FveError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// In-memory byte source, used for tests and pre-loaded images.
impl ByteSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }

    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_in_bounds() {
        let source: Vec<u8> = (0u8..32).collect();
        let mut buf = [0u8; 4];
        source.read_at(8, &mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11]);
    }

    #[test]
    fn memory_source_rejects_short_read() {
        let source = vec![0u8; 16];
        let mut buf = [0u8; 8];
        assert!(matches!(
            source.read_at(12, &mut buf),
            Err(FveError::Io(_))
        ));
        assert!(matches!(
            source.read_at(u64::MAX, &mut buf),
            Err(FveError::Io(_))
        ));
    }
}
