//! Crate-wide error type.

use thiserror::Error;

/// Any failure that can escape a public operation of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage error: open, prepare, bind, or step failed.
    #[error("store error: {0}")]
    Db(#[from] rusqlite::Error),

    /// A network or file-system I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A protocol error: unknown parcel kind, wrong connection state, or a
    /// mismatched identifier. The operation that raised this must not have
    /// mutated any stored row.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A configuration error: a missing `State` key, or a malformed value
    /// for one (bad port, bad address).
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
