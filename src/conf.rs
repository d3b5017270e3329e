//! This module defines types used to configure the engine and its parts.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The max number of simultaneously connected peers across all
    /// torrents in the session.
    pub connections_limit: usize,

    /// The max number of simultaneous half-open (SYN-sent, handshake
    /// pending) outbound connections across all torrents.
    pub half_open_limit: usize,

    /// The max number of new outbound connection attempts started per
    /// tick (approximately once a second).
    pub connection_speed: usize,

    /// A newly added torrent gets this many bonus connection attempts
    /// per tick for its first few ticks, so it doesn't have to wait in
    /// line behind older torrents to reach a healthy peer count.
    pub connect_boost: usize,

    /// How often the unchoke algorithm re-evaluates who to unchoke.
    pub unchoke_interval: Duration,

    /// Every this many unchoke intervals, one additional peer is
    /// unchoked at random (the "optimistic unchoke"), regardless of its
    /// transfer rate, to discover reciprocating peers.
    pub optimistic_unchoke_multiplier: u32,

    /// The address(es) to accept incoming connections on. Empty means the
    /// session runs outbound-only (no listener is bound).
    pub listen_addrs: Vec<SocketAddr>,
}

impl EngineConf {
    pub fn new() -> Self {
        Self {
            client_id: *CRATETORRENT_CLIENT_ID,
            // A few hundred is a reasonable ceiling for a single process
            // before file descriptor and scheduling overhead start to
            // dominate.
            connections_limit: 200,
            // libtorrent itself defaults to 8; higher fans out connection
            // attempts faster at the cost of more half-open sockets.
            half_open_limit: 8,
            connection_speed: 10,
            // decremented by one on every successful connection attempt;
            // see the open question in the design notes on its exact
            // decay policy.
            connect_boost: 30,
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_multiplier: 3,
            listen_addrs: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                6881,
            )],
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Whether to keep announcing to every tracker in a tier (rather than
    /// stopping at the first one that responds).
    pub announce_to_all_trackers: bool,

    /// Whether to keep announcing to every tier (rather than stopping at
    /// the first tier that yields a successful response).
    pub announce_to_all_tiers: bool,

    /// The max number of candidate peers kept in a torrent's peer list.
    /// Lowered while the torrent is paused, since there's no use holding
    /// on to a full candidate list for a torrent that isn't connecting.
    pub max_peer_list_size: usize,

    /// The number of upload slots offered to peers; the unchoke algorithm
    /// picks this many peers (minus one, reserved for the optimistic
    /// unchoke) to unchoke each round.
    pub max_upload_slots: usize,

    /// The request queue length ("pipeline depth") newly connected peers
    /// start out with, before the bandwidth-delay product estimator takes
    /// over.
    pub initial_request_queue_len: usize,

    /// Once the number of partially downloaded pieces exceeds this
    /// count, `prioritize_partials` is auto-enabled for the picker so
    /// that in-progress pieces get finished before new ones are started.
    pub max_partial_pieces: usize,

    /// The size, in blocks, of the piece-extent-affinity neighbourhood
    /// the picker scans first when in rarest-first mode, to encourage
    /// disk locality. 4 MiB / 16 KiB default block size.
    pub piece_extent_affinity_len: usize,

    /// The total memory budget, in bytes, for outstanding piece-checking
    /// hash jobs while a torrent is in the `checking_files` state.
    pub checking_mem_usage: usize,

    /// The minimum number of concurrently outstanding hash jobs while
    /// checking files, regardless of `checking_mem_usage` (keeps the
    /// hasher thread pool fed even for very large pieces).
    pub min_checking_jobs: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            announce_to_all_trackers: false,
            announce_to_all_tiers: false,
            max_peer_list_size: 1000,
            max_upload_slots: 4,
            initial_request_queue_len: 4,
            max_partial_pieces: 15,
            piece_extent_affinity_len: 4 * 1024 * 1024 / crate::BLOCK_LEN as usize,
            checking_mem_usage: 256 * 1024 * 1024,
            min_checking_jobs: 4,
        }
    }
}
