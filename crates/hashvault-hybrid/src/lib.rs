//! # hashvault-hybrid
//!
//! Hybrid hash-addressable storage.
//!
//! Small blobs are inlined as rows in an embedded SQLite index; large blobs
//! are delegated to the file-backed store from `hashvault-cas` under the same
//! key, with the index row keeping only metadata. The split is decided per
//! write against a configurable size threshold, after the content has been
//! staged (size is unknown until the stream is closed).
//!
//! Index commits are batched: one transaction is held open at all times and
//! committed every `flush_every_writes` writes, trading a bounded window of
//! durability for throughput. Reads on the same store instance always see
//! its own uncommitted writes.

mod schema;
mod store;

pub use store::{
    BlobReader, HybridOptions, HybridStats, HybridStore, DEFAULT_FLUSH_EVERY_WRITES,
    DEFAULT_MAX_INLINE_BLOB_SIZE,
};

use thiserror::Error;

/// Errors that can occur during hybrid store operations
#[derive(Error, Debug)]
pub enum HybridError {
    #[error("blob not found: {hash}")]
    NotFound { hash: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error(transparent)]
    Cas(#[from] hashvault_cas::CasError),
}

pub type Result<T> = std::result::Result<T, HybridError>;
