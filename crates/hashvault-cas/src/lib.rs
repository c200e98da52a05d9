//! # hashvault-cas
//!
//! Hash-addressable blob storage on a directory tree.
//!
//! Blobs are keyed by a 32-byte BLAKE3 digest and stored under a 2-level
//! fan-out derived from the key, so no single directory grows unbounded.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! ├── ab/
//! │   └── cd/
//! │       └── abcd1234...ef        # full hex digest
//! └── stage-1234-0.tmp             # in-flight staged write
//! ```
//!
//! ## Write protocol
//!
//! All writes go through a temp file that is atomically renamed into place:
//! either the full blob appears under its shard path or nothing does. The
//! two-phase API makes the commit explicit:
//!
//! ```no_run
//! use std::io::Write;
//! use hashvault_cas::{ContentHash, FileStore};
//!
//! # fn main() -> hashvault_cas::Result<()> {
//! let store = FileStore::new("/tmp/vault")?;
//! let data = b"hello";
//! let key = ContentHash::of(data);
//!
//! let mut staged = store.stage()?;
//! staged.write_all(data)?;
//! store.commit(&key, staged)?;
//!
//! assert!(store.contains(&key));
//! # Ok(())
//! # }
//! ```

mod hash;
mod staging;

pub use hash::ContentHash;
pub use staging::StagedBlob;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {hash}")]
    NotFound { hash: String },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid hash literal: {0:?}")]
    InvalidHash(String),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Size and timestamp snapshot for a stored blob. No lifecycle of its own;
/// the values are whatever was true at lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ItemInfo {
    /// Content length in bytes.
    pub len: u64,
    /// Last write time (UTC).
    pub modified: SystemTime,
}

/// Map a key to its location under `root`: `root/ab/cd/<full-hex>`.
///
/// Pure and deterministic. The 2-byte prefix only distributes files across
/// directories; uniqueness comes from the digest itself.
pub fn shard_path(root: &Path, hash: &ContentHash) -> PathBuf {
    let hex = hash.to_hex();
    root.join(&hex[..2]).join(&hex[2..4]).join(&hex)
}

/// Hash-addressable file store.
///
/// One file per key at its shard path. Files are only ever created via
/// atomic rename or deleted, never modified in place. The store assumes a
/// single writer; concurrent writers to the same key resolve by last rename
/// (no corruption), writers to different keys never collide.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        shard_path(&self.root, hash)
    }

    /// True iff a blob exists at the key's shard path.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Content-mode write. Returns `false` without touching the disk when the
    /// key is already present (idempotent: identical content under the same
    /// key need not be rewritten), `true` when the blob was added.
    #[instrument(skip(self, data), level = "debug")]
    pub fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<bool> {
        if self.contains(hash) {
            debug!(hash = %hash, "blob already present, skipping write");
            return Ok(false);
        }

        let mut staged = self.stage()?;
        staged.write_all(data)?;
        match self.commit(hash, staged) {
            Ok(()) => Ok(true),
            // A racing content-mode writer published the key first. Under
            // this write mode key == digest of the bytes, so an existing
            // destination means the content is already stored.
            Err(CasError::Io(_)) if self.contains(hash) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a staged write. Bytes go to a temp file inside the root until
    /// [`commit`](Self::commit) publishes them.
    pub fn stage(&self) -> Result<StagedBlob> {
        StagedBlob::create_in(&self.root)
    }

    /// Publish a staged write under `hash`.
    ///
    /// Creates the shard directories and atomically renames the temp file to
    /// the destination. Policy is last-writer-wins: an existing blob under
    /// the same key is replaced. On any failure the temp file is removed
    /// before the error propagates.
    #[instrument(skip(self, staged), level = "debug")]
    pub fn commit(&self, hash: &ContentHash, staged: StagedBlob) -> Result<()> {
        let dest = self.blob_path(hash);
        let temp = staged.finish()?;

        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            }
        }

        if let Err(e) = fs::rename(&temp, &dest) {
            // Committing may replace different bytes under the same key, so a
            // pre-existing destination proves nothing here; the failure must
            // surface. Only the content-mode `put` path may treat an existing
            // destination as success.
            let _ = fs::remove_file(&temp);
            return Err(CasError::Io(e));
        }

        debug!(hash = %hash, "committed blob");
        Ok(())
    }

    /// Open a blob for reading. Absence is a caller bug here: check
    /// [`contains`](Self::contains) first if a missing key is expected.
    pub fn open(&self, hash: &ContentHash) -> Result<File> {
        let path = self.blob_path(hash);
        if !path.is_file() {
            return Err(CasError::NotFound {
                hash: hash.to_hex(),
            });
        }
        Ok(File::open(path)?)
    }

    /// Read a blob fully into memory.
    pub fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut file = self.open(hash)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Recompute a stored blob's digest and compare it to its key.
    pub fn verify(&self, hash: &ContentHash) -> Result<()> {
        let mut file = self.open(hash)?;
        let actual = ContentHash::of_reader(&mut file)?;
        if actual != *hash {
            return Err(CasError::HashMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }

    /// Filesystem path of a stored blob, for direct access by the caller.
    /// Absent keys are an error, same as [`open`](Self::open).
    pub fn get_path(&self, hash: &ContentHash) -> Result<PathBuf> {
        let path = self.blob_path(hash);
        if !path.is_file() {
            return Err(CasError::NotFound {
                hash: hash.to_hex(),
            });
        }
        Ok(path)
    }

    /// Delete the blob for `hash`. Returns whether anything was removed;
    /// an absent key is a no-op.
    pub fn remove(&self, hash: &ContentHash) -> Result<bool> {
        let path = self.blob_path(hash);
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        debug!(hash = %hash, "removed blob");
        Ok(true)
    }

    /// Stat a blob without opening it. `None` if the key is absent.
    pub fn try_get_info(&self, hash: &ContentHash) -> Result<Option<ItemInfo>> {
        match fs::metadata(self.blob_path(hash)) {
            Ok(meta) => Ok(Some(ItemInfo {
                len: meta.len(),
                modified: meta.modified()?,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every child of the root directory, keeping the root itself.
    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        debug!(root = %self.root.display(), "cleared store");
        Ok(())
    }

    /// Iterate over all stored keys. Staged temp files are skipped.
    pub fn iter(&self) -> Result<StoreIter> {
        Ok(StoreIter {
            l1: fs::read_dir(&self.root)?,
            l2: None,
            l3: None,
        })
    }

    /// Count blobs and total bytes by walking the shard tree.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for hash in self.iter()? {
            let hash = hash?;
            if let Some(info) = self.try_get_info(&hash)? {
                stats.blob_count += 1;
                stats.total_bytes += info.len;
            }
        }
        Ok(stats)
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub blob_count: u64,
    pub total_bytes: u64,
}

/// Iterator over stored keys (walks `ab/cd/<hex>`).
pub struct StoreIter {
    l1: fs::ReadDir,
    l2: Option<fs::ReadDir>,
    l3: Option<fs::ReadDir>,
}

impl Iterator for StoreIter {
    type Item = Result<ContentHash>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Innermost level: blob files.
            if let Some(ref mut l3) = self.l3 {
                match l3.next() {
                    Some(Ok(entry)) => {
                        let path = entry.path();
                        if path.is_file() {
                            if path.extension().is_some_and(|ext| ext == "tmp") {
                                continue;
                            }
                            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                                if let Ok(hash) = ContentHash::from_hex(name) {
                                    return Some(Ok(hash));
                                }
                            }
                        }
                        continue;
                    }
                    Some(Err(e)) => return Some(Err(CasError::Io(e))),
                    None => self.l3 = None,
                }
            }

            if let Some(ref mut l2) = self.l2 {
                match l2.next() {
                    Some(Ok(entry)) => {
                        if entry.file_type().ok()?.is_dir() {
                            match fs::read_dir(entry.path()) {
                                Ok(iter) => self.l3 = Some(iter),
                                Err(e) => return Some(Err(CasError::Io(e))),
                            }
                        }
                        continue;
                    }
                    Some(Err(e)) => return Some(Err(CasError::Io(e))),
                    None => self.l2 = None,
                }
            }

            match self.l1.next() {
                Some(Ok(entry)) => {
                    if entry.file_type().ok()?.is_dir() {
                        match fs::read_dir(entry.path()) {
                            Ok(iter) => self.l2 = Some(iter),
                            Err(e) => return Some(Err(CasError::Io(e))),
                        }
                    }
                }
                Some(Err(e)) => return Some(Err(CasError::Io(e))),
                None => return None,
            }
        }
    }
}
