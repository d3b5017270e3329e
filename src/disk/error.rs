//! Errors surfaced by the disk IO subsystem.
//!
//! Kept separate from [`crate::error::Error`] because most disk failures
//! (a write that hit `ENOSPC`, a torrent id that raced with removal) are
//! reported back to the torrent asynchronously over [`super::TorrentAlert`]
//! rather than propagated with `?`, and callers need to distinguish "this
//! whole write batch failed" from "this specific piece's hash didn't
//! match" (the latter being [`crate::error::HashMismatch`], not a disk
//! error at all).

use std::fmt;
use std::io;

/// A specialized `Result` for the disk module's internal plumbing (channel
/// sends, torrent lookups) — NOT the per-operation error carried in alerts,
/// which is [`WriteError`] / [`NewTorrentError`] / [`ReadError`].
pub(super) type Result<T, E = crate::error::Error> = std::result::Result<T, E>;

/// Failure allocating storage for a newly added torrent.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// A torrent with this id is already present in the disk task.
    AlreadyExists,
    Io(io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure writing (or hashing, in preparation for writing) a piece.
#[derive(Debug)]
pub(crate) enum WriteError {
    InvalidPieceIndex,
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure reading a piece back off disk to serve to a peer.
#[derive(Debug)]
pub(crate) enum ReadError {
    InvalidPieceIndex,
    Io(io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
