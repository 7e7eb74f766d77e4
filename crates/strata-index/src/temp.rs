//! Uncommitted object data.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// A writer for new object bytes, living in the device's `tmp/` directory.
///
/// Dropping it without committing deletes the file.
#[derive(Debug)]
pub struct TempFile {
    file: NamedTempFile,
    expected: u64,
    written: u64,
}

impl TempFile {
    pub(crate) fn new_in(dir: &Path, expected: u64) -> std::io::Result<Self> {
        Ok(Self {
            file: NamedTempFile::new_in(dir)?,
            expected,
            written: 0,
        })
    }

    /// Size announced when the writer was opened.
    pub fn expected_len(&self) -> u64 {
        self.expected
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, sync and rename into `dest`.
    pub(crate) fn persist(mut self, dest: &Path) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.file.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}
