//! The crate-wide error type and a handful of narrower, operation-specific
//! error types used by individual subsystems (see e.g. [`crate::disk`]).
//!
//! Each subsystem error maps the distilled error kinds from the design
//! (transient peer/tracker errors, hash mismatches, fatal disk errors,
//! protocol errors, configuration errors) to a concrete Rust variant, and
//! converts losslessly into [`Error`] so that call sites that don't care
//! about the specific subsystem can simply use `?`.

use std::fmt;
use std::io;

use crate::PieceIndex;

/// A specialized `Result` using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
///
/// This is intentionally a flat enum rather than a tree of nested errors:
/// call sites almost always want to log the error and move on (disconnect a
/// peer, pause a torrent, back off a tracker) rather than match on deeply
/// nested variants.
#[derive(Debug)]
pub enum Error {
    /// Wraps an I/O error, e.g. from the peer socket or disk operations.
    Io(io::Error),
    /// The peer's handshake carried an info hash that doesn't match ours.
    InvalidPeerInfoHash,
    /// We only support downloading (for now), so the remote peer must
    /// present itself as a seed (all bits set in its handshake bitfield).
    PeerNotSeed,
    /// A peer sent a bitfield message outside of the availability exchange
    /// state, which the protocol disallows.
    BitfieldNotAfterHandshake,
    /// A peer sent a message that could not be parsed, or whose framing
    /// violates the wire protocol.
    InvalidMessage,
    /// An operation referenced a piece index outside of `[0, num_pieces)`.
    InvalidPieceIndex,
    /// An operation referenced a block index outside of
    /// `[0, blocks_in_piece)`.
    InvalidBlockIndex,
    /// An operation referenced a torrent id not present in the session.
    InvalidTorrentId,
    /// An operation referenced a file index outside of the torrent's file
    /// list.
    InvalidFileIndex,
    /// The torrent's metainfo could not be parsed.
    InvalidMetainfo,
    /// A storage (disk) operation failed fatally; the torrent must be
    /// paused and the user notified.
    Storage(String),
    /// A tracker announce or scrape failed.
    Tracker(String),
    /// An operation was attempted on a torrent that is in a state that
    /// doesn't support it (e.g. setting piece priorities before metadata is
    /// known).
    InvalidTorrentState,
    /// The session or torrent is shutting down; the caller should treat
    /// this as a no-op rather than an error to be surfaced to the user.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::InvalidPeerInfoHash => write!(f, "peer handshake info hash mismatch"),
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield message not after handshake")
            }
            Self::InvalidMessage => write!(f, "invalid or unparsable peer message"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidBlockIndex => write!(f, "invalid block index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::InvalidFileIndex => write!(f, "invalid file index"),
            Self::InvalidMetainfo => write!(f, "invalid metainfo"),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
            Self::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Self::InvalidTorrentState => write!(f, "torrent is not in a state that allows this operation"),
            Self::Shutdown => write!(f, "session is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Shutdown
    }
}

/// Per-piece hash verification outcome, reported by the disk layer to
/// [`crate::verifier::PieceVerifier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashMismatch {
    pub piece: PieceIndex,
}

impl fmt::Display for HashMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} failed hash verification", self.piece)
    }
}

impl std::error::Error for HashMismatch {}
