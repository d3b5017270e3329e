//! Notifications [`crate::engine::Engine`] surfaces to the application.
//!
//! Alerts are the one channel crossing from the network thread (and, for
//! disk/tracker completions, worker threads posting back into it) out to
//! the caller. They carry enough identifying information (`TorrentId`,
//! peer address) that the application doesn't need to otherwise poll state.

use std::net::SocketAddr;

use crate::{storage_info::FileInfo, PeerId, PieceIndex, TorrentId};

/// A torrent-scoped or session-scoped event worth surfacing to the user
/// of the library.
#[derive(Clone, Debug)]
pub enum Alert {
    /// A torrent finished downloading every piece it wants.
    TorrentComplete { id: TorrentId },
    /// A torrent's metadata (the info dict) was fully fetched via the
    /// ut_metadata extension and the torrent can now allocate storage.
    MetadataComplete { id: TorrentId },
    /// `piece` passed its hash check and is now held locally.
    PieceComplete { id: TorrentId, piece: PieceIndex },
    /// A resume-data or files-check pass finished.
    FilesChecked { id: TorrentId },
    /// A graceful or immediate pause completed; no more disk writes or
    /// outbound requests will happen for this torrent until it's resumed.
    TorrentPaused { id: TorrentId },
    /// A new peer connection was established and handshaked.
    PeerConnected { id: TorrentId, addr: SocketAddr, peer_id: PeerId },
    /// A peer connection was torn down, with the reason if known.
    PeerDisconnected { id: TorrentId, addr: SocketAddr, error: Option<String> },
    /// The torrent entered its latched error state (§4.5); it is now
    /// implicitly paused.
    TorrentError { id: TorrentId, message: String, file: Option<FileInfo> },
    /// A tracker announce completed, successfully or not.
    TrackerAnnounce {
        id: TorrentId,
        tracker_url: String,
        result: Result<TrackerAnnounceOutcome, String>,
    },
    /// `move_storage` finished.
    StorageMoved { id: TorrentId, result: Result<(), String> },
    /// A save-resume-data request completed and the bencoded bytes are
    /// ready to be persisted by the caller.
    ResumeDataSaved { id: TorrentId, result: Result<Vec<u8>, String> },
}

/// Payload of a successful tracker response, surfaced for diagnostics.
#[derive(Clone, Debug)]
pub struct TrackerAnnounceOutcome {
    pub num_peers: usize,
    pub interval_secs: u64,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
}
