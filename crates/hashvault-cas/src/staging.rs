//! Staged writes.
//!
//! A `StagedBlob` is the first half of the two-phase write: bytes are streamed
//! into a uniquely named temp file, and the store's `commit` publishes them
//! under their key. Commit is never implicit. Dropping an uncommitted handle
//! removes the temp file, so an abandoned write can never surface under a
//! shard path.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::Result;

/// Process-wide sequence for unique temp names (avoids races between
/// concurrent staged writes in the same directory).
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// An open staged write. Owns its temp file until committed or dropped.
#[derive(Debug)]
pub struct StagedBlob {
    path: PathBuf,
    file: Option<File>,
    len: u64,
    keep: bool,
}

impl StagedBlob {
    /// Open a fresh temp file in `dir`, creating the directory if needed.
    pub fn create_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!("stage-{}-{}.tmp", std::process::id(), seq);
        let path = dir.join(name);
        let file = File::create(&path)?;
        debug!(path = %path.display(), "opened staging file");
        Ok(Self {
            path,
            file: Some(file),
            len: 0,
            keep: false,
        })
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Location of the backing temp file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync the staged bytes, close the handle, and hand the temp
    /// file over to the caller. After this returns the caller owns the file:
    /// it must be renamed into place or deleted. On error the temp file is
    /// removed before the error propagates.
    pub fn finish(mut self) -> Result<PathBuf> {
        // Drop cleans up the temp file on any early return below.
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "staging handle already finished"))?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        self.keep = true;
        Ok(self.path.clone())
    }
}

impl Write for StagedBlob {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "staging handle already finished"))?;
        let n = file.write(buf)?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        // Close before unlink so the delete works on platforms that refuse
        // to remove open files.
        self.file.take();
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tracks_written_length() {
        let temp = TempDir::new().unwrap();
        let mut staged = StagedBlob::create_in(temp.path()).unwrap();
        assert!(staged.is_empty());
        staged.write_all(b"hello").unwrap();
        staged.write_all(b" world").unwrap();
        assert_eq!(staged.len(), 11);
    }

    #[test]
    fn test_drop_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        let path;
        {
            let mut staged = StagedBlob::create_in(temp.path()).unwrap();
            staged.write_all(b"abandoned").unwrap();
            path = staged.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists(), "abandoned staging file must be cleaned up");
    }

    #[test]
    fn test_finish_keeps_temp_file() {
        let temp = TempDir::new().unwrap();
        let mut staged = StagedBlob::create_in(temp.path()).unwrap();
        staged.write_all(b"kept").unwrap();
        let path = staged.finish().unwrap();
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap(), b"kept");
    }

    #[test]
    fn test_unique_names() {
        let temp = TempDir::new().unwrap();
        let a = StagedBlob::create_in(temp.path()).unwrap();
        let b = StagedBlob::create_in(temp.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
