//! Error taxonomy shared by discovery, transfer and catalog code.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the core.
///
/// A scan whose window elapses is not an error: `scan()` simply returns the
/// registry snapshot. `PreviewDecodeFailure` is produced by the preview
/// generator for logging only and never fails a transfer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: SocketAddr, reason: String },

    #[error("connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    #[error("peer rejected transfer: {0}")]
    Rejected(String),

    #[error("size mismatch: declared {expected} bytes, got {actual}")]
    TransferSizeMismatch { expected: u64, actual: u64 },

    #[error("cannot read local file {path}: {source}")]
    LocalFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage write failed for {path}: {source}")]
    StorageWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("preview decode failed: {0}")]
    PreviewDecodeFailure(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("a transfer of {file_name} to {addr} is already in flight")]
    AlreadyInFlight { addr: SocketAddr, file_name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StorageWriteFailure {
            path: path.into(),
            source,
        }
    }
}
