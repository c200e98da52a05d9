//! The hybrid store.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use hashvault_cas::{ContentHash, FileStore, ItemInfo, StagedBlob};

use crate::schema;
use crate::{HybridError, Result};

/// Default inline threshold: 100MB. Content at or below this size lives in
/// the index row; anything larger goes to the file store.
pub const DEFAULT_MAX_INLINE_BLOB_SIZE: u64 = 100 * 1024 * 1024;

/// Default number of writes batched into one index transaction.
pub const DEFAULT_FLUSH_EVERY_WRITES: u32 = 100;

/// Tuning knobs for a [`HybridStore`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridOptions {
    /// Content at or below this size is inlined into the index.
    pub max_inline_blob_size: u64,
    /// Commit the open index transaction after this many writes.
    pub flush_every_writes: u32,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            max_inline_blob_size: DEFAULT_MAX_INLINE_BLOB_SIZE,
            flush_every_writes: DEFAULT_FLUSH_EVERY_WRITES,
        }
    }
}

/// Hybrid hash-addressable store.
///
/// Owns an SQLite index and a [`FileStore`] for large blobs, both under one
/// root directory:
///
/// ```text
/// <root>/
/// ├── index.db      # entries table, WAL mode
/// ├── blobs/        # file store root (sharded)
/// └── staging/      # in-flight staged writes
/// ```
///
/// Single writer per instance; mutating operations take `&mut self`. The
/// store holds one open index transaction at all times and commits it every
/// `flush_every_writes` writes, on [`flush`](Self::flush), and on
/// [`close`](Self::close)/drop. A crash loses at most the writes since the
/// last flush; committed blobs are never corrupted.
pub struct HybridStore {
    conn: Connection,
    files: FileStore,
    staging_dir: PathBuf,
    options: HybridOptions,
    writes_since_flush: u32,
    tx_open: bool,
}

impl HybridStore {
    /// Open or create a hybrid store under `root`.
    pub fn open<P: AsRef<Path>>(root: P, options: HybridOptions) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        // Staging lives next to blobs/ so the delegate rename stays on one
        // volume and remains atomic.
        let files = FileStore::new(root.join("blobs"))?;
        let staging_dir = root.join("staging");
        fs::create_dir_all(&staging_dir)?;

        let conn = Connection::open(root.join("index.db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::init_schema(&conn)?;

        let mut store = Self {
            conn,
            files,
            staging_dir,
            options,
            writes_since_flush: 0,
            tx_open: false,
        };
        store.begin()?;

        info!(root = %root.display(), "opened hybrid store");
        Ok(store)
    }

    /// The file-backed store holding delegated (large) blobs.
    pub fn file_store(&self) -> &FileStore {
        &self.files
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN DEFERRED")?;
        self.tx_open = true;
        Ok(())
    }

    fn commit_tx(&mut self) -> Result<()> {
        if self.tx_open {
            self.conn.execute_batch("COMMIT")?;
            self.tx_open = false;
        }
        Ok(())
    }

    /// Commit the open index transaction and start a new one.
    pub fn flush(&mut self) -> Result<()> {
        self.commit_tx()?;
        self.begin()?;
        self.writes_since_flush = 0;
        Ok(())
    }

    fn note_write(&mut self) -> Result<()> {
        self.writes_since_flush += 1;
        if self.writes_since_flush >= self.options.flush_every_writes {
            debug!(writes = self.writes_since_flush, "flushing index batch");
            self.flush()?;
        }
        Ok(())
    }

    /// Open a staged write. The inline-vs-delegate decision is deferred to
    /// [`commit`](Self::commit), when the size is known.
    pub fn stage(&self) -> Result<StagedBlob> {
        Ok(StagedBlob::create_in(&self.staging_dir)?)
    }

    /// Publish a staged write under `hash`.
    ///
    /// Any prior entry for the key is removed first (overwrite is
    /// remove-then-insert, the threshold re-decided every time). Content at
    /// or below `max_inline_blob_size` is stored as the row's blob value;
    /// larger content is renamed into the file store and the row keeps
    /// `inline = NULL` as the delegation marker. The row's `len` always
    /// records the staged size, so metadata lookups stay index-only.
    #[instrument(skip(self, staged), level = "debug")]
    pub fn commit(&mut self, hash: &ContentHash, staged: StagedBlob) -> Result<()> {
        self.remove_entry(hash)?;

        let len = staged.len();
        let mtime_ms = unix_ms(SystemTime::now());
        let key = hash.as_bytes().as_slice();

        if len <= self.options.max_inline_blob_size {
            let temp = staged.finish()?;
            let data = match fs::read(&temp) {
                Ok(data) => data,
                Err(e) => {
                    let _ = fs::remove_file(&temp);
                    return Err(e.into());
                }
            };
            let _ = fs::remove_file(&temp);

            self.conn.execute(
                "INSERT INTO entries (key, len, mtime_ms, inline) VALUES (?1, ?2, ?3, ?4)",
                params![key, len as i64, mtime_ms, data],
            )?;
            debug!(hash = %hash, len, "inlined blob");
        } else {
            self.files.commit(hash, staged)?;
            self.conn.execute(
                "INSERT INTO entries (key, len, mtime_ms, inline) VALUES (?1, ?2, ?3, NULL)",
                params![key, len as i64, mtime_ms],
            )?;
            debug!(hash = %hash, len, "delegated blob to file store");
        }

        self.note_write()
    }

    /// Convenience write from an in-memory buffer. Returns whether the key
    /// was newly added (`false` means an existing entry was replaced).
    pub fn put(&mut self, hash: &ContentHash, data: &[u8]) -> Result<bool> {
        let existed = self.contains(hash)?;
        let mut staged = self.stage()?;
        staged.write_all(data)?;
        self.commit(hash, staged)?;
        Ok(!existed)
    }

    /// Open a blob for reading, wherever it lives.
    pub fn read(&self, hash: &ContentHash) -> Result<BlobReader> {
        let row: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT inline FROM entries WHERE key = ?1",
                params![hash.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;

        match row {
            None => Err(HybridError::NotFound {
                hash: hash.to_hex(),
            }),
            Some(Some(blob)) => Ok(BlobReader::Inline(Cursor::new(blob))),
            Some(None) => Ok(BlobReader::File(self.files.open(hash)?)),
        }
    }

    /// Read a blob fully into memory.
    pub fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut reader = self.read(hash)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// True iff the index has a row for the key. Never touches the
    /// filesystem.
    pub fn contains(&self, hash: &ContentHash) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM entries WHERE key = ?1",
                params![hash.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Remove the entry for `hash`, including any delegated file. Returns
    /// whether anything was removed.
    pub fn remove(&mut self, hash: &ContentHash) -> Result<bool> {
        self.remove_entry(hash)
    }

    fn remove_entry(&mut self, hash: &ContentHash) -> Result<bool> {
        let key = hash.as_bytes().as_slice();
        let delegated: Option<bool> = self
            .conn
            .query_row(
                "SELECT inline IS NULL FROM entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match delegated {
            None => Ok(false),
            Some(delegated) => {
                if delegated {
                    self.files.remove(hash)?;
                }
                self.conn
                    .execute("DELETE FROM entries WHERE key = ?1", params![key])?;
                debug!(hash = %hash, delegated, "removed entry");
                Ok(true)
            }
        }
    }

    /// Size and timestamp for a key, served from the index row. For
    /// delegated entries `len` is the original content size recorded at
    /// write time; the delegated file is never re-statted.
    pub fn try_get_info(&self, hash: &ContentHash) -> Result<Option<ItemInfo>> {
        let row: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT len, mtime_ms FROM entries WHERE key = ?1",
                params![hash.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(len, mtime_ms)| ItemInfo {
            len: len as u64,
            modified: UNIX_EPOCH + Duration::from_millis(mtime_ms as u64),
        }))
    }

    /// Drop every entry, the delegated blobs, and any abandoned staging
    /// files, then commit so the empty state is durable.
    pub fn clear(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM entries", [])?;
        self.files.clear()?;
        for entry in fs::read_dir(&self.staging_dir)? {
            let entry = entry?;
            let _ = fs::remove_file(entry.path());
        }
        info!("cleared hybrid store");
        self.flush()
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Aggregate counts from the index.
    pub fn stats(&self) -> Result<HybridStats> {
        self.conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(len), 0),
                        COALESCE(SUM(inline IS NULL), 0)
                 FROM entries",
                [],
                |row| {
                    Ok(HybridStats {
                        entry_count: row.get::<_, i64>(0)? as u64,
                        total_bytes: row.get::<_, i64>(1)? as u64,
                        delegated_count: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .map_err(HybridError::from)
    }

    /// Commit any pending writes and release the store. Pending transactions
    /// are always committed, never rolled back.
    pub fn close(mut self) -> Result<()> {
        self.commit_tx()
    }
}

impl Drop for HybridStore {
    fn drop(&mut self) {
        if self.tx_open {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                warn!(error = %e, "failed to commit pending writes on drop");
            }
            self.tx_open = false;
        }
    }
}

/// Aggregate index statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HybridStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub delegated_count: u64,
}

/// Read handle over a blob, wherever it lives.
pub enum BlobReader {
    /// Inline row value.
    Inline(Cursor<Vec<u8>>),
    /// Delegated file-store blob.
    File(File),
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobReader::Inline(cursor) => cursor.read(buf),
            BlobReader::File(file) => file.read(buf),
        }
    }
}

fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
