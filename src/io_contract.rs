//! Sink/source contracts consumed by the engine (§6).
//!
//! The engine never touches a filesystem path directly — it is handed an
//! already-open [`Sink`] (receiver) or [`Source`] (sender) and only uses
//! the narrow operations below. [`FileSink`]/[`FileSource`] are provided
//! for embedders and integration tests; [`MemorySink`]/[`MemorySource`]
//! back the unit tests.

use crate::codec::{BLOCK_SIZE, SUB};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bulk-read-into-memory source, consumed once at `start_send`.
pub trait Source {
    /// Read the entire source into memory.
    fn read_all(&mut self) -> io::Result<Vec<u8>>;
}

/// Append-only destination, owned exclusively by the engine for the
/// duration of a receive.
pub trait Sink {
    /// Append `data` to the destination.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the destination. Called once, on `EOT` or on abort.
    fn close(&mut self) -> io::Result<()>;

    /// Remove trailing [`SUB`] padding left by the last, possibly short,
    /// block (§4.5). Called only after a successful close on `EOT`.
    ///
    /// Scans backwards over at most the last [`BLOCK_SIZE`] bytes. If the
    /// whole scanned region is `SUB`, truncates to the start of that
    /// region. Does nothing if the destination is empty.
    fn truncate_trailing_sub(&mut self) -> io::Result<()>;
}

/// Filesystem-backed [`Source`]: bulk-reads an existing regular file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Reference a source file by path. The file is not opened until
    /// [`Source::read_all`] is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Source for FileSource {
    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let metadata = std::fs::metadata(&self.path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", self.path.display()),
            ));
        }
        let mut file = File::open(&self.path)?;
        let mut data = Vec::with_capacity(metadata.len() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Filesystem-backed [`Sink`]: append-only during the transfer, with
/// random-access truncation afterward.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    /// Create (or truncate) the destination file and open it for
    /// appending.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn reopen_for_random_access(&self) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(&self.path)
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sink already closed"))?;
        file.write_all(data)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn truncate_trailing_sub(&mut self) -> io::Result<()> {
        let mut file = self.reopen_for_random_access()?;
        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            return Ok(());
        }

        let scan_len = len.min(BLOCK_SIZE as u64);
        let scan_start = len - scan_len;
        file.seek(SeekFrom::Start(scan_start))?;
        let mut tail = vec![0u8; scan_len as usize];
        file.read_exact(&mut tail)?;

        let last_non_sub = tail.iter().rposition(|&b| b != SUB);
        let new_len = match last_non_sub {
            Some(idx) => scan_start + idx as u64 + 1,
            None => scan_start,
        };

        file.set_len(new_len)
    }
}

/// In-memory [`Source`], used by unit tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    /// Wrap an in-memory byte buffer as a source.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Source for MemorySource {
    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.data.clone())
    }
}

/// In-memory [`Sink`], used by unit tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    closed: bool,
}

impl MemorySink {
    /// Create an empty in-memory sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Sink for MemorySink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "sink already closed"));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn truncate_trailing_sub(&mut self) -> io::Result<()> {
        let scan_len = self.data.len().min(BLOCK_SIZE);
        let scan_start = self.data.len() - scan_len;
        let tail = &self.data[scan_start..];
        let last_non_sub = tail.iter().rposition(|&b| b != SUB);
        let new_len = match last_non_sub {
            Some(idx) => scan_start + idx + 1,
            None => scan_start,
        };
        self.data.truncate(new_len);
        Ok(())
    }
}

/// Returns whether `path` refers to an existing, readable regular file.
#[must_use]
pub fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_truncates_all_sub_padding() {
        let mut sink = MemorySink::new();
        sink.write_all(&[0x41, 0x42]).unwrap();
        sink.write_all(&[SUB; 126]).unwrap();
        sink.close().unwrap();
        sink.truncate_trailing_sub().unwrap();
        assert_eq!(sink.bytes(), &[0x41, 0x42]);
    }

    #[test]
    fn memory_sink_truncate_on_all_sub_block() {
        let mut sink = MemorySink::new();
        sink.write_all(&[SUB; BLOCK_SIZE]).unwrap();
        sink.close().unwrap();
        sink.truncate_trailing_sub().unwrap();
        assert!(sink.bytes().is_empty());
    }

    #[test]
    fn memory_sink_truncate_on_empty_is_noop() {
        let mut sink = MemorySink::new();
        sink.close().unwrap();
        sink.truncate_trailing_sub().unwrap();
        assert!(sink.bytes().is_empty());
    }

    #[test]
    fn memory_sink_rejects_writes_after_close() {
        let mut sink = MemorySink::new();
        sink.close().unwrap();
        assert!(sink.write_all(&[1, 2, 3]).is_err());
    }

    #[test]
    fn file_sink_roundtrips_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path).unwrap();
        sink.write_all(&[0x41, 0x42]).unwrap();
        sink.write_all(&[SUB; 126]).unwrap();
        sink.close().unwrap();
        sink.truncate_trailing_sub().unwrap();

        let mut source = FileSource::new(&path);
        assert_eq!(source.read_all().unwrap(), vec![0x41, 0x42]);
    }

    #[test]
    fn file_source_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let mut source = FileSource::new(&path);
        assert!(source.read_all().is_err());
    }

    #[test]
    fn is_regular_file_detects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_regular_file(dir.path()));
    }
}
