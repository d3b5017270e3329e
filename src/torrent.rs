//! Per-torrent state machine (§4.5): owns a torrent's shared picker/have
//! bitfield, drives its tracker announces and peer list, and reacts to disk
//! alerts and peer session events.
//!
//! The shape mirrors [`crate::peer::PeerSession`]'s own task loop (an owned
//! struct driven by a `futures::select!` over a handful of channels) one
//! level up: where a peer session reacts to wire messages and torrent
//! commands, a [`TorrentCore`] reacts to peer session events, disk alerts,
//! and session commands.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{select, FutureExt, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{mpsc, RwLock},
    time,
};

use crate::{
    alert::Alert,
    announce::{AnnounceEvent, AnnouncePolicy, AnnounceScheduler},
    conf::{Conf, TorrentConf},
    disk::{self, DiskHandle, TorrentAlert, TorrentAlertReceiver},
    engine::AddTorrentParams,
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{self, codec::Handshake, PeerSession},
    peer_list::{PeerList, Source},
    piece_picker::{PickMode, PiecePicker, Priority},
    resume::{ResumeData, ResumeFlags},
    storage_info::StorageInfo,
    tracker::{TrackerClient, TrackerRequest},
    unchoke::{UnchokeCandidate, UnchokeManager},
    verifier::PieceVerifier,
    BlockInfo, FileIndex, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Commands [`crate::session::SessionCore`] posts down to a torrent task.
pub(crate) enum Command {
    /// A candidate address, e.g. from a tracker response or the public
    /// `add_peer` API.
    AddPeer { addr: SocketAddr, source: Source },
    /// An incoming connection the session already handshaked and routed
    /// here by info hash.
    Accept { socket: TcpStream, handshake: Handshake },
    /// The disk task finished allocating this torrent's storage; carries
    /// the per-torrent alert channel to switch over to from now on.
    DiskAllocated(
        std::result::Result<disk::TorrentAllocation, disk::NewTorrentError>,
    ),
    SetFilePriority { file: FileIndex, priority: u8 },
    SetPiecePriority { piece: PieceIndex, priority: u8 },
    SetSequential(bool),
    /// Sets (or, with `deadline: None`, clears) a streaming deadline on
    /// `piece`, switching the picker into [`PickMode::TimeCritical`] for as
    /// long as any deadline is outstanding (§4.8 tick's "streaming
    /// deadline picker").
    SetPieceDeadline { piece: PieceIndex, deadline: Option<i64> },
    Pause { graceful: bool },
    Resume,
    ForceRecheck,
    SaveResumeData,
    MoveStorage(PathBuf),
    RenameFile { file: FileIndex, name: String },
    AddTracker(String),
    /// Evicts candidate peers (and disconnects connected ones) whose
    /// address is no longer allowed, per a session-wide IP filter update.
    ApplyBannedAddrs(Arc<std::collections::HashSet<std::net::IpAddr>>),
    SetSessionPaused(bool),
    Tick,
    Shutdown { delete_files: bool },
}

/// The subset of a torrent's state peer sessions need direct, concurrent
/// access to. Lives behind an [`Arc`] shared between [`TorrentCore`] and
/// every [`PeerSession`] it spawns.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub piece_picker: RwLock<PiecePicker>,
    pub have_pieces: RwLock<crate::Bitfield>,
    pub conf: TorrentConf,

    /// Atomic mirror of the picker's current mode, so peer sessions can read
    /// it synchronously without awaiting the picker's lock a second time
    /// (they already hold it for `pick_pieces`).
    pick_mode: AtomicUsize,
    end_game: AtomicBool,
}

impl SharedStatus {
    fn new(
        id: TorrentId,
        info_hash: Sha1Hash,
        client_id: PeerId,
        storage: StorageInfo,
        piece_picker: PiecePicker,
        have_pieces: crate::Bitfield,
        conf: TorrentConf,
    ) -> Self {
        Self {
            id,
            info_hash,
            client_id,
            storage,
            piece_picker: RwLock::new(piece_picker),
            have_pieces: RwLock::new(have_pieces),
            conf,
            pick_mode: AtomicUsize::new(pick_mode_to_usize(PickMode::Default)),
            end_game: AtomicBool::new(false),
        }
    }

    pub fn pick_mode(&self) -> PickMode {
        usize_to_pick_mode(self.pick_mode.load(Ordering::Relaxed))
    }

    fn set_pick_mode(&self, mode: PickMode) {
        self.pick_mode.store(pick_mode_to_usize(mode), Ordering::Relaxed);
    }

    pub fn is_end_game(&self) -> bool {
        self.end_game.load(Ordering::Relaxed)
    }

    fn set_end_game(&self, end_game: bool) {
        self.end_game.store(end_game, Ordering::Relaxed);
    }
}

fn pick_mode_to_usize(mode: PickMode) -> usize {
    match mode {
        PickMode::Sequential => 0,
        PickMode::RarestFirst => 1,
        PickMode::TimeCritical => 2,
        PickMode::Default => 3,
    }
}

fn usize_to_pick_mode(v: usize) -> PickMode {
    match v {
        0 => PickMode::Sequential,
        1 => PickMode::RarestFirst,
        2 => PickMode::TimeCritical,
        _ => PickMode::Default,
    }
}

/// The torrent's lifecycle state (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Allocating,
    DownloadingMetadata,
    CheckingFiles,
    Downloading,
    Seeding,
    Finished,
}

struct ErrorInfo {
    message: String,
    file: Option<FileIndex>,
}

struct PeerHandle {
    addr: SocketAddr,
    cmd_chan: peer::Sender,
}

#[derive(Default, Clone, Copy)]
struct PeerStatsSnapshot {
    download_rate: f64,
    upload_rate: f64,
    downloaded_total: u64,
    uploaded_total: u64,
    is_interested: bool,
    is_seed: bool,
    ticks_since_last_optimistic: Option<u32>,
}

/// Owns one torrent's lifecycle: storage allocation, hash checking, peer and
/// tracker bookkeeping, and file/piece priority propagation.
pub(crate) struct TorrentCore {
    status: Arc<SharedStatus>,
    disk: DiskHandle,
    disk_alert_port: Option<TorrentAlertReceiver>,
    cmd_port: CommandReceiver,
    metainfo: Option<Metainfo>,

    state: State,
    torrent_paused: bool,
    session_paused: bool,
    graceful_pause_pending: bool,
    upload_mode: bool,
    seed_mode: bool,
    sequential: bool,
    error: Option<ErrorInfo>,

    peer_list: PeerList,
    sessions: HashMap<PeerId, PeerHandle>,
    /// Sessions that have been spawned but haven't completed their
    /// handshake yet, keyed by address since their [`PeerId`] isn't known
    /// until [`peer::Event::Connected`] arrives; moved into `sessions` at
    /// that point.
    pending_sessions: HashMap<SocketAddr, peer::Sender>,
    pending_reads: HashMap<BlockInfo, Vec<PeerId>>,
    peer_stats: HashMap<PeerId, PeerStatsSnapshot>,
    /// Outstanding streaming deadlines set via `set_piece_deadline`;
    /// non-empty forces [`PickMode::TimeCritical`] (§4.8 tick).
    deadlines: HashMap<PieceIndex, i64>,

    announce: AnnounceScheduler,
    announce_policy: AnnouncePolicy,
    tracker_clients: HashMap<String, TrackerClient>,
    listen_endpoints: Vec<SocketAddr>,
    tracker_key: u32,

    unchoke: UnchokeManager,
    unchoke_interval: Duration,
    optimistic_unchoke_multiplier: u32,
    ticks_since_unchoke: u32,

    file_priorities: Vec<Priority>,
    deferred_file_priorities: Option<Vec<Priority>>,

    global_connections: Arc<AtomicUsize>,
    alert_chan: mpsc::UnboundedSender<Alert>,
    event_chan: mpsc::UnboundedSender<peer::Event>,
    event_port: mpsc::UnboundedReceiver<peer::Event>,

    added_time: i64,
    completed_time: Option<i64>,
    last_seen_complete: Option<i64>,
    active_time: u64,
    finished_time: u64,
    seeding_time: u64,
    total_uploaded: u64,
    total_downloaded: u64,
    session_time: u64,
}

impl TorrentCore {
    /// Builds a new torrent and its command channel. The returned
    /// [`TorrentCore`] is not yet running: call [`Self::run`] on a spawned
    /// task to drive it.
    pub fn new(
        id: TorrentId,
        params: AddTorrentParams,
        conf: &Conf,
        disk: DiskHandle,
        listen_endpoints: Vec<SocketAddr>,
        global_connections: Arc<AtomicUsize>,
        alert_chan: mpsc::UnboundedSender<Alert>,
        now: i64,
    ) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (event_chan, event_port) = mpsc::unbounded_channel();

        let mut torrent_conf = conf.torrent.clone();
        if let Some(dir) = &params.download_dir {
            torrent_conf.download_dir = dir.clone();
        }

        let trackers: Vec<Vec<String>> = if !params.trackers.is_empty() {
            vec![params.trackers.clone()]
        } else {
            params
                .metainfo
                .as_ref()
                .map(|m| m.trackers.clone())
                .unwrap_or_default()
        };
        let announce = AnnounceScheduler::new(&trackers);
        let announce_policy = AnnouncePolicy {
            announce_to_all_tiers: torrent_conf.announce_to_all_tiers,
            announce_to_all_trackers: torrent_conf.announce_to_all_trackers,
        };

        let (status, state, file_priorities) = match &params.metainfo {
            Some(metainfo) => {
                let storage = StorageInfo::new(metainfo, torrent_conf.download_dir.clone());
                let piece_count = storage.piece_count;
                let mut picker = PiecePicker::new(
                    piece_count,
                    storage.piece_len,
                    storage.last_piece_len,
                );
                picker.set_extent_affinity(torrent_conf.piece_extent_affinity_len);
                let have_pieces = crate::empty_bitfield(piece_count);
                let status = Arc::new(SharedStatus::new(
                    id,
                    metainfo.info_hash(),
                    conf.engine.client_id,
                    storage,
                    picker,
                    have_pieces,
                    torrent_conf.clone(),
                ));
                let mut file_priorities = if !params.file_priorities.is_empty() {
                    params
                        .file_priorities
                        .iter()
                        .map(|p| Priority::new(*p))
                        .collect()
                } else {
                    vec![Priority::DEFAULT; status.storage.file_count()]
                };
                file_priorities.resize(
                    status.storage.file_count(),
                    Priority::DEFAULT,
                );
                (status, State::Allocating, file_priorities)
            }
            None => {
                // Magnet link: metadata hasn't been fetched yet. Storage
                // can't be constructed (piece count is unknown), so no
                // `SharedStatus` exists until the metadata arrives.
                //
                // TODO: actually fetch the info dict over ut_metadata
                // (BEP 9). `peer::Event` would need an `ExtendedMessage`
                // variant carrying the raw extension payload before this
                // state can ever leave `DownloadingMetadata`.
                let storage = StorageInfo::empty(torrent_conf.download_dir.clone());
                let mut picker = PiecePicker::new(1, crate::BLOCK_LEN, crate::BLOCK_LEN);
                picker.set_extent_affinity(torrent_conf.piece_extent_affinity_len);
                let have_pieces = crate::empty_bitfield(1);
                let status = Arc::new(SharedStatus::new(
                    id,
                    [0; 20],
                    conf.engine.client_id,
                    storage,
                    picker,
                    have_pieces,
                    torrent_conf.clone(),
                ));
                (status, State::DownloadingMetadata, Vec::new())
            }
        };

        let max_peer_list_size = torrent_conf.max_peer_list_size;
        let mut this = Self {
            status,
            disk,
            disk_alert_port: None,
            cmd_port,
            metainfo: params.metainfo,
            state,
            torrent_paused: params.paused,
            session_paused: false,
            graceful_pause_pending: false,
            upload_mode: false,
            seed_mode: params.seed_mode,
            sequential: false,
            error: None,
            peer_list: PeerList::new(max_peer_list_size),
            sessions: HashMap::new(),
            pending_sessions: HashMap::new(),
            pending_reads: HashMap::new(),
            peer_stats: HashMap::new(),
            deadlines: HashMap::new(),
            announce,
            announce_policy,
            tracker_clients: HashMap::new(),
            listen_endpoints,
            tracker_key: rand::thread_rng().gen(),
            unchoke: UnchokeManager::new(),
            unchoke_interval: conf.engine.unchoke_interval,
            optimistic_unchoke_multiplier: conf.engine.optimistic_unchoke_multiplier,
            ticks_since_unchoke: 0,
            file_priorities,
            deferred_file_priorities: None,
            global_connections,
            alert_chan,
            event_chan,
            event_port,
            added_time: now,
            completed_time: None,
            last_seen_complete: None,
            active_time: 0,
            finished_time: 0,
            seeding_time: 0,
            total_uploaded: 0,
            total_downloaded: 0,
            session_time: 0,
        };

        if let Some(resume) = &params.resume_data {
            this.apply_resume_data(resume);
        }
        for peer in &params.peers {
            this.peer_list.add_candidate(*peer, Source::RESUME);
        }

        (this, cmd_chan)
    }

    pub fn id(&self) -> TorrentId {
        self.status.id
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.status.info_hash
    }

    fn apply_resume_data(&mut self, resume: &ResumeData) {
        self.torrent_paused = resume.flags.paused;
        self.seed_mode = resume.flags.seed_mode;
        self.total_uploaded = resume.total_uploaded;
        self.total_downloaded = resume.total_downloaded;
        self.active_time = resume.active_time;
        self.finished_time = resume.finished_time;
        self.seeding_time = resume.seeding_time;
        self.last_seen_complete = resume.last_seen_complete;
        self.completed_time = resume.completed_time;
        for addr in resume.peers.iter().filter_map(|a| a.parse().ok()) {
            self.peer_list.add_candidate(addr, Source::RESUME);
        }
        for url in resume.trackers.iter().flatten() {
            self.announce.add_tracker(url);
        }
        if !resume.file_priorities.is_empty() {
            self.file_priorities =
                resume.file_priorities.iter().map(|p| Priority::new(*p)).collect();
        }
    }

    /// Runs the torrent to completion (until a `Shutdown` command or a
    /// fatal channel error).
    pub async fn run(mut self) -> Result<()> {
        if self.state == State::Allocating {
            if let Some(metainfo) = &self.metainfo {
                let piece_hashes = metainfo.pieces.clone();
                self.disk.new_torrent(
                    self.status.id,
                    self.status.storage.clone(),
                    piece_hashes,
                )?;
            }
        }

        self.mark_pad_pieces_have().await;

        let mut tick = time::interval(Duration::from_secs(1));
        let mut unchoke_tick = time::interval(self.unchoke_interval);

        loop {
            let disk_alert = async {
                match &mut self.disk_alert_port {
                    Some(port) => port.recv().await,
                    None => futures::future::pending().await,
                }
            };

            select! {
                cmd = self.cmd_port.recv().fuse() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await? {
                                break;
                            }
                        }
                        // The engine handle and session were both dropped;
                        // nothing can ever reach this torrent again.
                        None => break,
                    }
                }
                alert = disk_alert.fuse() => {
                    match alert {
                        Some(alert) => self.handle_disk_alert(alert).await?,
                        None => self.disk_alert_port = None,
                    }
                }
                event = self.event_port.recv().fuse() => {
                    match event {
                        Some(event) => self.handle_peer_event(event).await?,
                        None => {}
                    }
                }
                _ = tick.tick().fuse() => {
                    self.on_tick().await?;
                }
                _ = unchoke_tick.tick().fuse() => {
                    self.run_unchoke_round().await;
                }
            }
        }

        Ok(())
    }

    /// Dispatches a single command from [`crate::session::SessionCore`].
    /// Returns `false` when the torrent should stop running (a
    /// `Shutdown` command was received).
    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::AddPeer { addr, source } => {
                if !self.peer_list.is_banned(addr) {
                    self.peer_list.add_candidate(addr, source);
                }
            }
            Command::Accept { socket, handshake } => {
                if let Ok(addr) = socket.peer_addr() {
                    if !self.peer_list.is_banned(addr)
                        && self.sessions.len() < self.status.conf.max_connected_peer_count
                    {
                        self.spawn_inbound(socket, handshake, addr);
                    }
                }
            }
            Command::DiskAllocated(result) => {
                self.handle_disk_allocated(result).await?;
            }
            Command::SetFilePriority { file, priority } => {
                if let Some(slot) = self.file_priorities.get_mut(file) {
                    *slot = Priority::new(priority);
                    if self.state == State::CheckingFiles {
                        self.deferred_file_priorities =
                            Some(self.file_priorities.clone());
                    } else {
                        self.recompute_piece_priorities().await?;
                    }
                }
            }
            Command::SetPiecePriority { piece, priority } => {
                let mut picker = self.status.piece_picker.write().await;
                picker.set_piece_priority(piece, Priority::new(priority))?;
            }
            Command::SetSequential(sequential) => {
                self.sequential = sequential;
            }
            Command::SetPieceDeadline { piece, deadline } => {
                match deadline {
                    Some(deadline) => {
                        self.deadlines.insert(piece, deadline);
                    }
                    None => {
                        self.deadlines.remove(&piece);
                    }
                }
            }
            Command::Pause { graceful } => self.do_pause(graceful).await,
            Command::Resume => self.do_resume(),
            Command::ForceRecheck => {
                self.state = State::CheckingFiles;
                self.disk.check_files(self.status.id)?;
            }
            Command::SaveResumeData => self.save_resume_data().await,
            Command::MoveStorage(path) => {
                self.disk.move_storage(self.status.id, path)?;
            }
            Command::RenameFile { file, name } => {
                self.disk.rename_file(self.status.id, file, name)?;
            }
            Command::AddTracker(url) => {
                self.announce.add_tracker(&url);
            }
            Command::ApplyBannedAddrs(banned) => {
                let evicted = self
                    .peer_list
                    .apply_filter(|addr| !banned.contains(&addr.ip()));
                for addr in evicted {
                    if let Some((peer_id, _)) = self
                        .sessions
                        .iter()
                        .find(|(_, h)| h.addr == addr)
                        .map(|(id, h)| (*id, h.addr))
                    {
                        if let Some(handle) = self.sessions.remove(&peer_id) {
                            let _ = handle.cmd_chan.send(peer::Command::Shutdown);
                        }
                    }
                }
            }
            Command::SetSessionPaused(paused) => {
                self.session_paused = paused;
            }
            Command::Tick => self.on_tick().await?,
            Command::Shutdown { delete_files } => {
                if delete_files {
                    let _ = self.disk.delete_files(self.status.id);
                } else {
                    let _ = self.disk.release_files(self.status.id);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The disk task finished (or failed) allocating this torrent's
    /// storage. Switches over to the per-torrent alert channel it hands
    /// back and, on success, starts the initial files check.
    async fn handle_disk_allocated(
        &mut self,
        result: std::result::Result<disk::TorrentAllocation, disk::NewTorrentError>,
    ) -> Result<()> {
        match result {
            Ok(alloc) => {
                self.disk_alert_port = Some(alloc.alert_port);
                if self.state == State::Allocating {
                    self.state = State::CheckingFiles;
                    self.disk.check_files(self.status.id)?;
                }
            }
            Err(e) => self.latch_error(e.to_string(), None),
        }
        Ok(())
    }

    /// Implements pause (§4.5): graceful pause chokes peers and lets
    /// their outstanding requests drain rather than disconnecting
    /// outright (S6); a hard pause tears every connection down and
    /// releases the torrent's open file handles immediately.
    async fn do_pause(&mut self, graceful: bool) {
        self.torrent_paused = true;
        if graceful && !self.sessions.is_empty() {
            self.graceful_pause_pending = true;
            for handle in self.sessions.values() {
                let _ = handle.cmd_chan.send(peer::Command::Choke);
            }
        } else {
            self.graceful_pause_pending = false;
            for handle in self.sessions.values() {
                let _ = handle.cmd_chan.send(peer::Command::Shutdown);
            }
            let _ = self.disk.release_files(self.status.id);
            let _ = self
                .alert_chan
                .send(Alert::TorrentPaused { id: self.status.id });
        }
    }

    fn do_resume(&mut self) {
        self.torrent_paused = false;
        self.graceful_pause_pending = false;
        if self.state == State::CheckingFiles {
            let _ = self.disk.check_files(self.status.id);
        }
    }

    async fn save_resume_data(&mut self) {
        let have_pieces = self.status.have_pieces.read().await.clone();
        let resume = ResumeData {
            version: 0,
            info_hash: self.status.info_hash,
            total_uploaded: self.total_uploaded,
            total_downloaded: self.total_downloaded,
            active_time: self.active_time,
            finished_time: self.finished_time,
            seeding_time: self.seeding_time,
            last_seen_complete: self.last_seen_complete,
            added_time: self.added_time,
            completed_time: self.completed_time,
            save_path: self.status.storage.download_dir.clone(),
            flags: ResumeFlags {
                paused: self.torrent_paused,
                auto_managed: false,
                seed_mode: self.seed_mode,
                super_seeding: false,
                sequential_download: self.sequential,
            },
            have_pieces: have_pieces.into_vec(),
            verified_pieces: Vec::new(),
            unfinished_pieces: HashMap::new(),
            trackers: Vec::new(),
            url_seeds: Vec::new(),
            http_seeds: Vec::new(),
            banned_peers: self
                .peer_list
                .iter()
                .filter(|c| c.banned)
                .map(|c| c.addr.to_string())
                .collect(),
            peers: self.peer_list.iter().map(|c| c.addr.to_string()).collect(),
            renamed_files: HashMap::new(),
            file_priorities: self.file_priorities.iter().map(|p| p.as_u8()).collect(),
            piece_priorities: Vec::new(),
            upload_limit: None,
            download_limit: None,
            max_connections: Some(self.status.conf.max_connected_peer_count as u32),
            max_uploads: Some(self.status.conf.max_upload_slots as u32),
        };
        let result = resume.to_bytes().map_err(|e| e.to_string());
        let _ = self
            .alert_chan
            .send(Alert::ResumeDataSaved { id: self.status.id, result });
    }

    async fn mark_pad_pieces_have(&mut self) {
        let piece_count = self.status.storage.piece_count;
        let mut newly_have = Vec::new();
        {
            let mut picker = self.status.piece_picker.write().await;
            for piece in 0..piece_count {
                if self.status.storage.is_piece_pad(piece) {
                    if picker.we_have(piece).is_ok() {
                        newly_have.push(piece);
                    }
                }
            }
        }
        if !newly_have.is_empty() {
            let mut have = self.status.have_pieces.write().await;
            for piece in newly_have {
                if piece < have.len() {
                    have.set(piece, true);
                }
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        self.session_time += 1;
        if !self.effectively_paused() {
            self.active_time += 1;
            if self.state == State::Seeding || self.state == State::Finished {
                self.seeding_time += 1;
            }
            self.connect_more_peers();
            self.run_announce_round(AnnounceEvent::None).await;
        }
        self.refresh_end_game().await;
        Ok(())
    }

    fn effectively_paused(&self) -> bool {
        self.torrent_paused || self.session_paused
    }

    fn connect_more_peers(&mut self) {
        if self.sessions.len() + self.pending_sessions.len()
            >= self.status.conf.max_connected_peer_count
        {
            return;
        }
        if let Some(addr) = self.peer_list.connect_one_peer(self.session_time) {
            self.spawn_outbound(addr);
        }
    }

    fn spawn_outbound(&mut self, addr: SocketAddr) {
        let (mut session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&self.status),
            self.disk.clone(),
            self.event_chan.clone(),
            addr,
        );
        self.pending_sessions.insert(addr, cmd_chan);
        tokio::spawn(async move {
            if let Err(e) = session.start_outbound().await {
                log::debug!("Peer session to {} ended: {}", addr, e);
            }
        });
    }

    fn spawn_inbound(&mut self, socket: TcpStream, handshake: Handshake, addr: SocketAddr) {
        let (mut session, cmd_chan) = PeerSession::inbound(
            Arc::clone(&self.status),
            self.disk.clone(),
            self.event_chan.clone(),
            addr,
        );
        self.pending_sessions.insert(addr, cmd_chan);
        tokio::spawn(async move {
            if let Err(e) = session.start_inbound(socket, handshake).await {
                log::debug!("Inbound peer session from {} ended: {}", addr, e);
            }
        });
    }

    async fn handle_peer_event(&mut self, event: peer::Event) -> Result<()> {
        match event {
            peer::Event::Connected { addr, peer_id } => {
                self.peer_list.mark_connected(addr, peer_id, self.session_time);
                self.global_connections.fetch_add(1, Ordering::Relaxed);
                if let Some(cmd_chan) = self.pending_sessions.remove(&addr) {
                    self.sessions.insert(peer_id, PeerHandle { addr, cmd_chan });
                }
                let _ = self.alert_chan.send(Alert::PeerConnected {
                    id: self.status.id,
                    addr,
                    peer_id,
                });
            }
            peer::Event::Disconnected { addr, peer_id, error } => {
                self.pending_sessions.remove(&addr);
                if let Some(peer_id) = peer_id {
                    self.peer_list.mark_disconnected(peer_id);
                    self.sessions.remove(&peer_id);
                    self.peer_stats.remove(&peer_id);
                } else {
                    self.peer_list.record_connect_failure(addr);
                }
                self.global_connections.fetch_sub(1, Ordering::Relaxed);
                if self.graceful_pause_pending
                    && self.sessions.is_empty()
                    && self.pending_sessions.is_empty()
                {
                    self.graceful_pause_pending = false;
                    let _ = self
                        .alert_chan
                        .send(Alert::TorrentPaused { id: self.status.id });
                }
                let _ = self.alert_chan.send(Alert::PeerDisconnected {
                    id: self.status.id,
                    addr,
                    error,
                });
            }
            peer::Event::BlockRequested { peer_id, block } => {
                self.pending_reads.entry(block).or_default().push(peer_id);
                self.disk.read_block(self.status.id, block)?;
            }
            peer::Event::Stats {
                peer_id,
                download_rate,
                upload_rate,
                downloaded_total,
                uploaded_total,
                is_peer_interested,
                is_seed,
            } => {
                let entry = self.peer_stats.entry(peer_id).or_default();
                entry.download_rate = download_rate;
                entry.upload_rate = upload_rate;
                entry.downloaded_total = downloaded_total;
                entry.uploaded_total = uploaded_total;
                entry.is_interested = is_peer_interested;
                entry.is_seed = is_seed;
                self.total_downloaded = self
                    .peer_stats
                    .values()
                    .map(|s| s.downloaded_total)
                    .sum();
                self.total_uploaded =
                    self.peer_stats.values().map(|s| s.uploaded_total).sum();
            }
        }
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                self.handle_batch_write(batch).await?;
            }
            TorrentAlert::BatchWrite(Err((piece, e))) => {
                self.handle_disk_write_error(piece, e);
            }
            TorrentAlert::Read(Ok(read)) => {
                if let Some(peers) = self.pending_reads.remove(&read.info) {
                    for peer_id in peers {
                        if let Some(handle) = self.sessions.get(&peer_id) {
                            let _ = handle.cmd_chan.send(peer::Command::SendBlock {
                                block: read.info,
                                data: read.data.clone(),
                            });
                        }
                    }
                }
            }
            TorrentAlert::Read(Err(e)) => {
                log::debug!("Read failed for torrent {}: {}", self.status.id, e);
            }
            TorrentAlert::CheckFiles(Ok(report)) => {
                self.apply_check_files_report(report).await?;
            }
            TorrentAlert::CheckFiles(Err(e)) => {
                self.latch_error(e.to_string(), None);
            }
            TorrentAlert::PieceCleared(piece) => {
                let mut picker = self.status.piece_picker.write().await;
                PieceVerifier::on_piece_sync(&mut picker, piece)?;
            }
            TorrentAlert::StorageMoved(Ok(path)) => {
                let _ = self.alert_chan.send(Alert::StorageMoved {
                    id: self.status.id,
                    result: Ok(()),
                });
                self.status.conf.download_dir.clone();
                let _ = path;
            }
            TorrentAlert::StorageMoved(Err(e)) => {
                let _ = self.alert_chan.send(Alert::StorageMoved {
                    id: self.status.id,
                    result: Err(e.to_string()),
                });
            }
            TorrentAlert::FileRenamed(_)
            | TorrentAlert::FilesReleased(_)
            | TorrentAlert::FilesDeleted(_) => {}
        }
        Ok(())
    }

    async fn handle_batch_write(&mut self, batch: disk::BatchWrite) -> Result<()> {
        match batch.is_piece_valid {
            Some(true) => {
                let contributors = {
                    let picker = self.status.piece_picker.read().await;
                    picker.contributing_peers(batch.piece)
                };
                let became_have = {
                    let mut picker = self.status.piece_picker.write().await;
                    PieceVerifier::piece_passed(&mut picker, batch.piece)?
                };
                for peer_id in contributors {
                    self.peer_list.credit_piece(peer_id);
                }
                if became_have {
                    self.on_piece_have(batch.piece).await?;
                }
            }
            Some(false) => {
                let banned = {
                    let mut picker = self.status.piece_picker.write().await;
                    PieceVerifier::piece_failed(&mut picker, &mut self.peer_list, batch.piece)?
                };
                for peer_id in banned {
                    if let Some(addr) = self.peer_list.addr_of(peer_id) {
                        self.peer_list.ban(addr);
                    }
                    if let Some(handle) = self.sessions.remove(&peer_id) {
                        let _ = handle.cmd_chan.send(peer::Command::Shutdown);
                    }
                }
                self.disk.clear_piece(self.status.id, batch.piece)?;
            }
            None => {
                log::debug!(
                    "Torrent {}: piece {} write reported no verdict",
                    self.status.id,
                    batch.piece
                );
            }
        }
        Ok(())
    }

    fn handle_disk_write_error(&mut self, piece: PieceIndex, e: disk::WriteError) {
        let is_space_or_permission = match &e {
            disk::WriteError::Io(io_err) => {
                io_err.kind() == std::io::ErrorKind::PermissionDenied
                    || io_err.raw_os_error() == Some(28)
            }
            disk::WriteError::InvalidPieceIndex => false,
        };
        if is_space_or_permission {
            log::warn!(
                "Torrent {} disk write failed (piece {}): entering upload_mode: {}",
                self.status.id,
                piece,
                e
            );
            self.upload_mode = true;
        } else {
            self.latch_error(e.to_string(), None);
        }
    }

    async fn on_piece_have(&mut self, piece: PieceIndex) -> Result<()> {
        {
            let mut have = self.status.have_pieces.write().await;
            if piece < have.len() {
                have.set(piece, true);
            }
        }
        for handle in self.sessions.values() {
            let _ = handle.cmd_chan.send(peer::Command::SendHave(piece));
        }
        let _ = self
            .alert_chan
            .send(Alert::PieceComplete { id: self.status.id, piece });

        let picker = self.status.piece_picker.read().await;
        if picker.num_have() >= self.downloadable_piece_count(&picker) {
            drop(picker);
            self.on_torrent_complete().await;
        }
        Ok(())
    }

    fn downloadable_piece_count(&self, picker: &PiecePicker) -> usize {
        picker.piece_count()
    }

    async fn on_torrent_complete(&mut self) {
        if self.completed_time.is_none() {
            self.completed_time = Some(self.added_time + self.active_time as i64);
            self.last_seen_complete = self.completed_time;
            let _ =
                self.alert_chan.send(Alert::TorrentComplete { id: self.status.id });
        }
        self.state = if self.seed_mode || self.file_priorities.iter().all(|p| *p == Priority::DONT_DOWNLOAD) {
            State::Finished
        } else {
            State::Seeding
        };
        self.run_announce_round(AnnounceEvent::Completed).await;
    }

    async fn apply_check_files_report(
        &mut self,
        report: disk::CheckFilesReport,
    ) -> Result<()> {
        {
            let mut picker = self.status.piece_picker.write().await;
            for (i, has) in report.have_pieces.iter().enumerate() {
                if *has {
                    picker.we_have(i)?;
                }
            }
        }
        {
            let mut have = self.status.have_pieces.write().await;
            *have = report.have_pieces;
        }

        self.state = State::Downloading;
        let picker = self.status.piece_picker.read().await;
        if picker.num_have() >= picker.piece_count() {
            drop(picker);
            self.on_torrent_complete().await;
        }

        let _ = self
            .alert_chan
            .send(Alert::FilesChecked { id: self.status.id });

        if let Some(priorities) = self.deferred_file_priorities.take() {
            self.file_priorities = priorities;
            self.recompute_piece_priorities().await?;
        }

        Ok(())
    }

    async fn recompute_piece_priorities(&mut self) -> Result<()> {
        let piece_count = self.status.storage.piece_count;
        let mut picker = self.status.piece_picker.write().await;
        for piece in 0..piece_count {
            if self.status.storage.is_piece_pad(piece) {
                continue;
            }
            let files = self.status.storage.files_intersecting_piece(piece)?;
            let priority = files
                .clone()
                .filter_map(|f| self.file_priorities.get(f).copied())
                .max()
                .unwrap_or(Priority::DEFAULT);
            picker.set_piece_priority(piece, priority)?;
        }
        Ok(())
    }

    async fn run_announce_round(&mut self, event: AnnounceEvent) {
        if self.status.info_hash == [0; 20] {
            // no metadata yet; nothing to announce against.
            return;
        }
        let now = self.session_time;
        let pending = self.announce.pending_announces(
            now,
            &self.listen_endpoints,
            event,
            self.announce_policy,
        );
        for announce in pending {
            let port = self.listen_endpoints.first().map(|a| a.port()).unwrap_or(0);
            let left = self.bytes_left().await;
            let request = TrackerRequest {
                info_hash: self.status.info_hash,
                peer_id: self.status.client_id,
                port,
                uploaded: self.total_uploaded,
                downloaded: self.total_downloaded,
                left,
                event: announce.event,
                key: self.tracker_key,
                num_want: Some(50),
                ip: None,
                compact: true,
            };
            let url = announce.tracker_url.clone();
            if !self.tracker_clients.contains_key(&url.to_string()) {
                match TrackerClient::for_url(&url) {
                    Ok(client) => {
                        self.tracker_clients.insert(url.to_string(), client);
                    }
                    Err(e) => {
                        log::debug!(
                            "Torrent {} cannot announce to {}: {}",
                            self.status.id,
                            url,
                            e
                        );
                        let _ = self.alert_chan.send(Alert::TrackerAnnounce {
                            id: self.status.id,
                            tracker_url: url.to_string(),
                            result: Err(e.to_string()),
                        });
                        continue;
                    }
                }
            }
            let client = self.tracker_clients.get(&url.to_string()).unwrap();
            match client.announce(&url, &request).await {
                Ok(resp) => {
                    self.announce.on_announce_success(
                        &url,
                        announce.endpoint,
                        announce.event,
                        resp.interval,
                        resp.min_interval.unwrap_or(self.status.conf.announce_interval),
                        now,
                    );
                    for addr in &resp.peers {
                        self.peer_list.add_candidate(*addr, Source::TRACKER);
                    }
                    let _ = self.alert_chan.send(Alert::TrackerAnnounce {
                        id: self.status.id,
                        tracker_url: url.to_string(),
                        result: Ok(crate::alert::TrackerAnnounceOutcome {
                            num_peers: resp.peers.len(),
                            interval_secs: resp.interval.as_secs(),
                            seeders: resp.complete,
                            leechers: resp.incomplete,
                        }),
                    });
                }
                Err(e) => {
                    let gone = matches!(&e, Error::Tracker(msg) if msg.contains("410"));
                    self.announce.on_announce_error(
                        &url,
                        announce.endpoint,
                        now,
                        gone,
                        false,
                    );
                    let _ = self.alert_chan.send(Alert::TrackerAnnounce {
                        id: self.status.id,
                        tracker_url: url.to_string(),
                        result: Err(e.to_string()),
                    });
                }
            }
        }
    }

    async fn bytes_left(&self) -> u64 {
        let have = self.status.have_pieces.read().await;
        let mut have_bytes: u64 = 0;
        for (i, has) in have.iter().enumerate() {
            if *has {
                have_bytes += self.status.storage.piece_len(i).unwrap_or(0) as u64;
            }
        }
        self.status.storage.download_len.saturating_sub(have_bytes)
    }

    async fn refresh_end_game(&mut self) {
        let picker = self.status.piece_picker.read().await;
        let remaining = picker.piece_count().saturating_sub(picker.num_have());
        let end_game = remaining > 0
            && remaining <= 20
            && picker.num_pieces_downloading() >= remaining;
        self.status.set_end_game(end_game);

        let mode = if self.status.conf.max_partial_pieces == 0 {
            PickMode::Sequential
        } else {
            PickMode::RarestFirst
        };
        self.status.set_pick_mode(mode);
    }

    async fn run_unchoke_round(&mut self) {
        if self.effectively_paused() {
            return;
        }
        let is_seeding = matches!(self.state, State::Seeding | State::Finished);
        let candidates: Vec<UnchokeCandidate> = self
            .peer_stats
            .iter()
            .map(|(peer_id, stats)| UnchokeCandidate {
                peer_id: *peer_id,
                interested: stats.is_interested,
                is_seed: stats.is_seed,
                download_rate: stats.download_rate,
                upload_rate: stats.upload_rate,
                uploaded_to_peer: stats.uploaded_total,
                downloaded_from_peer: stats.downloaded_total,
                ticks_since_last_optimistic_unchoke: stats.ticks_since_last_optimistic,
            })
            .collect();

        let decision = self.unchoke.run(
            &candidates,
            self.status.conf.max_upload_slots,
            self.optimistic_unchoke_multiplier,
            is_seeding,
        );

        for peer_id in &decision.unchoke {
            if let Some(handle) = self.sessions.get(peer_id) {
                let _ = handle.cmd_chan.send(peer::Command::Unchoke);
            }
        }
        for peer_id in &decision.choke {
            if let Some(handle) = self.sessions.get(peer_id) {
                let _ = handle.cmd_chan.send(peer::Command::Choke);
            }
        }
    }

    fn latch_error(&mut self, message: String, file: Option<FileIndex>) {
        log::error!("Torrent {} latched error: {}", self.status.id, message);
        self.error = Some(ErrorInfo { message: message.clone(), file });
        self.torrent_paused = true;
    }
}
