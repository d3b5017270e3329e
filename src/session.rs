//! The multi-torrent owner (§4.8): admission control, the listen accept
//! loop, the outgoing dial tick, and routing of engine-wide disk alerts and
//! commands to the right [`crate::torrent::TorrentCore`].
//!
//! Mirrors the shape of [`crate::torrent::TorrentCore`] one level up: an
//! owned struct driven by a `futures::select!` over a handful of channels,
//! running as a single task on the network thread (§5 "one network/event
//! thread owns `SessionCore` and every `TorrentCore`").

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use futures::{select, FutureExt};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_util::codec::Decoder;

use crate::{
    alert::Alert,
    conf::Conf,
    disk::{self, DiskHandle},
    engine::AddTorrentParams,
    error::{Error, Result},
    peer::codec::{Handshake, HandshakeCodec, HANDSHAKE_LEN},
    peer_list::Source,
    torrent::{self, TorrentCore},
    Sha1Hash, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Commands the public [`crate::engine::Engine`] handle posts to the
/// session task.
pub(crate) enum Command {
    AddTorrent {
        params: Box<AddTorrentParams>,
        result_chan: tokio::sync::oneshot::Sender<Result<TorrentId>>,
    },
    RemoveTorrent { id: TorrentId, delete_files: bool },
    AddPeer { id: TorrentId, addr: SocketAddr },
    SetFilePriority { id: TorrentId, file: crate::FileIndex, priority: u8 },
    SetPiecePriority { id: TorrentId, piece: crate::PieceIndex, priority: u8 },
    SetSequential { id: TorrentId, sequential: bool },
    SetPieceDeadline {
        id: TorrentId,
        piece: crate::PieceIndex,
        deadline: Option<i64>,
    },
    PauseTorrent { id: TorrentId, graceful: bool },
    ResumeTorrent { id: TorrentId },
    ForceRecheck { id: TorrentId },
    SaveResumeData { id: TorrentId },
    MoveStorage { id: TorrentId, path: std::path::PathBuf },
    RenameFile { id: TorrentId, file: crate::FileIndex, name: String },
    AddTracker { id: TorrentId, url: String },
    SetIpFilter(Arc<std::collections::HashSet<std::net::IpAddr>>),
    SetSessionPaused(bool),
    Shutdown,
}

struct TorrentEntry {
    cmd_chan: torrent::CommandSender,
}

/// Owns every torrent, the listen sockets, and the one disk task shared
/// across all of them.
pub(crate) struct SessionCore {
    conf: Conf,
    disk: DiskHandle,
    disk_alert_port: disk::AlertReceiver,
    cmd_port: CommandReceiver,
    alert_chan: mpsc::UnboundedSender<Alert>,

    torrents: HashMap<TorrentId, TorrentEntry>,
    info_hashes: HashMap<Sha1Hash, TorrentId>,
    /// Torrents still waiting on their `DiskAllocated` result, so an
    /// incoming `TorrentAllocation` alert can be routed even though the
    /// torrent was only just added.
    pending_allocations: HashMap<TorrentId, Sha1Hash>,

    listeners: Vec<TcpListener>,
    listen_endpoints: Vec<SocketAddr>,
    global_connections: Arc<AtomicUsize>,
    banned_addrs: Arc<std::collections::HashSet<std::net::IpAddr>>,
    session_paused: bool,

    next_torrent_id: TorrentId,
}

impl SessionCore {
    /// Binds the configured listen addresses (best-effort: an address that
    /// fails to bind is logged and skipped, since a session that can't
    /// accept incoming connections can still dial out) and returns the
    /// session plus the handles the engine facade keeps.
    pub(crate) async fn new(
        conf: Conf,
    ) -> Result<(Self, CommandSender, mpsc::UnboundedReceiver<Alert>)> {
        let (disk, disk_alert_port) = disk::spawn()?;
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        let mut listeners = Vec::new();
        let mut listen_endpoints = Vec::new();
        for addr in &conf.engine.listen_addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr().unwrap_or(*addr);
                    listen_endpoints.push(local_addr);
                    listeners.push(listener);
                }
                Err(e) => {
                    log::warn!("Failed to bind listen address {}: {}", addr, e);
                }
            }
        }

        let session = Self {
            conf,
            disk,
            disk_alert_port,
            cmd_port,
            alert_chan,
            torrents: HashMap::new(),
            info_hashes: HashMap::new(),
            pending_allocations: HashMap::new(),
            listeners,
            listen_endpoints,
            global_connections: Arc::new(AtomicUsize::new(0)),
            banned_addrs: Arc::new(std::collections::HashSet::new()),
            session_paused: false,
            next_torrent_id: 0,
        };

        Ok((session, cmd_chan, alert_port))
    }

    /// Runs the session until a `Shutdown` command or the engine handle is
    /// dropped.
    pub(crate) async fn run(mut self) -> Result<()> {
        let mut tick = time::interval(Duration::from_secs(1));

        // Each listener gets its own perpetually-reinvoked accept future;
        // `select_all`-style polling isn't needed since listeners rarely
        // number more than one or two (typically one per address family).
        loop {
            let accepted = accept_any(&mut self.listeners);

            select! {
                cmd = self.cmd_port.recv().fuse() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                alert = self.disk_alert_port.recv().fuse() => {
                    match alert {
                        Some(disk::Alert::TorrentAllocation(result)) => {
                            self.route_allocation(result);
                        }
                        None => {}
                    }
                }
                accepted = accepted.fuse() => {
                    if let Some((socket, addr)) = accepted {
                        self.handle_incoming(socket, addr).await;
                    }
                }
                _ = tick.tick().fuse() => {
                    self.on_tick().await;
                }
            }
        }

        for entry in self.torrents.values() {
            let _ = entry.cmd_chan.send(torrent::Command::Shutdown { delete_files: false });
        }

        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::AddTorrent { params, result_chan } => {
                let result = self.add_torrent(*params);
                let _ = result_chan.send(result);
            }
            Command::RemoveTorrent { id, delete_files } => {
                if let Some(entry) = self.torrents.remove(&id) {
                    self.info_hashes.retain(|_, v| *v != id);
                    let _ = entry
                        .cmd_chan
                        .send(torrent::Command::Shutdown { delete_files });
                }
            }
            Command::AddPeer { id, addr } => {
                self.send_to(id, torrent::Command::AddPeer { addr, source: Source::USER });
            }
            Command::SetFilePriority { id, file, priority } => {
                self.send_to(id, torrent::Command::SetFilePriority { file, priority });
            }
            Command::SetPiecePriority { id, piece, priority } => {
                self.send_to(id, torrent::Command::SetPiecePriority { piece, priority });
            }
            Command::SetSequential { id, sequential } => {
                self.send_to(id, torrent::Command::SetSequential(sequential));
            }
            Command::SetPieceDeadline { id, piece, deadline } => {
                self.send_to(id, torrent::Command::SetPieceDeadline { piece, deadline });
            }
            Command::PauseTorrent { id, graceful } => {
                self.send_to(id, torrent::Command::Pause { graceful });
            }
            Command::ResumeTorrent { id } => {
                self.send_to(id, torrent::Command::Resume);
            }
            Command::ForceRecheck { id } => {
                self.send_to(id, torrent::Command::ForceRecheck);
            }
            Command::SaveResumeData { id } => {
                self.send_to(id, torrent::Command::SaveResumeData);
            }
            Command::MoveStorage { id, path } => {
                self.send_to(id, torrent::Command::MoveStorage(path));
            }
            Command::RenameFile { id, file, name } => {
                self.send_to(id, torrent::Command::RenameFile { file, name });
            }
            Command::AddTracker { id, url } => {
                self.send_to(id, torrent::Command::AddTracker(url));
            }
            Command::SetIpFilter(banned) => {
                self.banned_addrs = Arc::clone(&banned);
                for entry in self.torrents.values() {
                    let _ = entry
                        .cmd_chan
                        .send(torrent::Command::ApplyBannedAddrs(Arc::clone(&banned)));
                }
            }
            Command::SetSessionPaused(paused) => {
                self.session_paused = paused;
                for entry in self.torrents.values() {
                    let _ = entry
                        .cmd_chan
                        .send(torrent::Command::SetSessionPaused(paused));
                }
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn send_to(&self, id: TorrentId, cmd: torrent::Command) {
        if let Some(entry) = self.torrents.get(&id) {
            let _ = entry.cmd_chan.send(cmd);
        }
    }

    fn add_torrent(&mut self, params: AddTorrentParams) -> Result<TorrentId> {
        let info_hash = params
            .metainfo
            .as_ref()
            .map(|m| m.info_hash())
            .or_else(|| params.resume_data.as_ref().map(|r| r.info_hash));
        if let Some(info_hash) = info_hash {
            if self.info_hashes.contains_key(&info_hash) {
                return Err(Error::InvalidTorrentState);
            }
        }

        let id = self.next_torrent_id;
        self.next_torrent_id = self.next_torrent_id.wrapping_add(1);

        let now = crate::now_secs();
        let (torrent, cmd_chan) = TorrentCore::new(
            id,
            params,
            &self.conf,
            self.disk.clone(),
            self.listen_endpoints.clone(),
            Arc::clone(&self.global_connections),
            self.alert_chan.clone(),
            now,
        );

        if let Some(info_hash) = info_hash {
            self.info_hashes.insert(info_hash, id);
            self.pending_allocations.insert(id, info_hash);
        }
        self.torrents.insert(id, TorrentEntry { cmd_chan });

        tokio::spawn(async move {
            if let Err(e) = torrent.run().await {
                log::error!("Torrent {} task ended with error: {}", id, e);
            }
        });

        Ok(id)
    }

    fn route_allocation(
        &mut self,
        result: std::result::Result<disk::TorrentAllocation, disk::NewTorrentError>,
    ) {
        let id = match &result {
            Ok(alloc) => alloc.id,
            // A failed allocation doesn't carry an id to route by if the
            // disk task couldn't even get that far; in practice `id` is
            // always set since `NewTorrent` always carries one.
            Err(_) => return,
        };
        self.pending_allocations.remove(&id);
        self.send_to(id, torrent::Command::DiskAllocated(result));
    }

    async fn handle_incoming(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.banned_addrs.contains(&addr.ip()) {
            return;
        }
        if self.torrents.is_empty() {
            return;
        }
        let total_connections = self
            .global_connections
            .load(std::sync::atomic::Ordering::Relaxed);
        if total_connections >= self.conf.engine.connections_limit {
            return;
        }

        let torrents = self
            .torrents
            .iter()
            .map(|(id, entry)| (*id, entry.cmd_chan.clone()))
            .collect::<Vec<_>>();
        let info_hashes = self.info_hashes.clone();
        tokio::spawn(async move {
            match read_handshake(socket).await {
                Ok((socket, handshake)) => {
                    if let Some(id) = info_hashes.get(&handshake.info_hash) {
                        if let Some((_, cmd_chan)) =
                            torrents.iter().find(|(tid, _)| tid == id)
                        {
                            let _ = cmd_chan
                                .send(torrent::Command::Accept { socket, handshake });
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Incoming connection from {} failed handshake: {}", addr, e);
                }
            }
        });
    }

    async fn on_tick(&mut self) {
        for entry in self.torrents.values() {
            let _ = entry.cmd_chan.send(torrent::Command::Tick);
        }
    }
}

/// Reads exactly the 68-byte fixed handshake off a freshly accepted
/// socket without wrapping it in a buffered codec, so that any bytes the
/// peer pipelined immediately after the handshake (a bitfield, say) are
/// left untouched on the stream for [`crate::peer::PeerSession`] to pick
/// up once it takes over.
async fn read_handshake(mut socket: TcpStream) -> Result<(TcpStream, Handshake)> {
    let mut buf = bytes::BytesMut::with_capacity(HANDSHAKE_LEN);
    buf.resize(HANDSHAKE_LEN, 0);
    socket.read_exact(&mut buf).await?;
    let mut codec = HandshakeCodec;
    let handshake = codec.decode(&mut buf)?.ok_or(Error::InvalidMessage)?;
    Ok((socket, handshake))
}

/// Polls every bound listener for the next incoming connection, returning
/// `None` forever (rather than erroring out the whole session) if none
/// are bound, so the outer `select!` can still make progress on other
/// branches via outgoing-only operation.
async fn accept_any(
    listeners: &mut [TcpListener],
) -> Option<(TcpStream, SocketAddr)> {
    if listeners.is_empty() {
        futures::future::pending::<()>().await;
        return None;
    }
    let accepts = listeners.iter_mut().map(|l| Box::pin(l.accept()));
    let (result, _, _) = futures::future::select_all(accepts).await;
    result.ok()
}
