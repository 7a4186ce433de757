//! Spill files handed to the helper.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::engine::DocumentKey;
use crate::error::Result;

/// A temporary file holding one part's raw bytes, unlinked on drop.
#[derive(Debug)]
pub struct SpillFile {
    file: NamedTempFile,
    len: u64,
}

impl SpillFile {
    /// Create `<uid>.<where>.<sequence>.<random>.spill` in `dir`.
    pub fn create(dir: &Path, key: &DocumentKey) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let prefix = format!("{}.{}.{}.", key.uid, key.location, key.sequence);
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".spill")
            .tempfile_in(dir)?;
        log::debug!("spilling {key} to {}", file.path().display());
        Ok(SpillFile { file, len: 0 })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes so another process can read the file.
    pub fn finish(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
