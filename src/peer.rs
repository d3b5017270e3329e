//! A single peer connection's session loop (wire protocol exchange, piece
//! request pipelining, serving blocks back out).
//!
//! Unlike the original seed-only leech client, a session here is fully
//! bidirectional: the remote may be a partial peer, may request blocks from
//! us, and we register its bitfield/have messages straight into the
//! torrent's shared [`PiecePicker`] rather than rejecting anything but an
//! all-ones bitfield.

pub(crate) mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        FutureExt, SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc},
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use crate::{
    counter::ThroughputCounter, disk::DiskHandle, error::*,
    piece_picker::PickMode, torrent::SharedStatus, Bitfield, BlockInfo, PeerId,
};
use codec::*;

/// The channel on which a torrent sends commands to a peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Events a peer session reports back up to its owning
/// [`crate::torrent::TorrentCore`]. Availability bookkeeping
/// (have/bitfield/choke/interested) is handled by the session itself
/// directly against the shared picker; only events the torrent alone can
/// act on cross this channel.
pub(crate) enum Event {
    /// The handshake completed and the session entered its normal running
    /// state.
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// The session ended, for whatever reason.
    Disconnected {
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        error: Option<String>,
    },
    /// The peer requested a block we have; the torrent is responsible for
    /// reading it off disk and posting back [`Command::SendBlock`].
    BlockRequested { peer_id: PeerId, block: BlockInfo },
    /// A periodic (roughly once a second) snapshot used by the torrent's
    /// unchoke round to rank peers: throughput plus the pieces of session
    /// state (interest, seed status) the torrent has no other way to see.
    Stats {
        peer_id: PeerId,
        download_rate: f64,
        upload_rate: f64,
        downloaded_total: u64,
        uploaded_total: u64,
        /// Whether the peer has told us it's interested in requesting
        /// blocks from us.
        is_peer_interested: bool,
        /// Whether the peer's advertised bitfield is all-ones.
        is_seed: bool,
    },
}

/// Commands a torrent posts down to a peer session.
pub(crate) enum Command {
    /// Choke the remote peer (refuse to serve their requests).
    Choke,
    /// Unchoke the remote peer.
    Unchoke,
    /// Announce that we now have `piece`.
    SendHave(crate::PieceIndex),
    /// A block the peer previously requested has been read off disk;
    /// send it unless the peer cancelled the request in the meantime.
    SendBlock { block: BlockInfo, data: Vec<u8> },
    Shutdown,
}

pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    disk: DiskHandle,
    event_chan: UnboundedSender<Event>,
    cmd_port: Fuse<Receiver>,
    addr: SocketAddr,
    status: Status,
    /// Blocks we've requested from the peer and are still waiting on.
    outgoing_requests: Vec<BlockInfo>,
    /// Blocks the peer has requested from us that we haven't served (or had
    /// cancelled) yet.
    serving: Vec<BlockInfo>,
    peer_info: Option<PeerInfo>,
    download_counter: ThroughputCounter,
    upload_counter: ThroughputCounter,
}

impl PeerSession {
    /// Creates a new outbound session that will connect to `addr`.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        disk: DiskHandle,
        event_chan: UnboundedSender<Event>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self::new(torrent, disk, event_chan, cmd_port, addr),
            cmd_chan,
        )
    }

    /// Creates a new inbound session for a socket that has already been
    /// accepted and whose peer handshake has already been read (the
    /// session owning the listener has to peek the info hash to route the
    /// connection to the right torrent before we ever see it).
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        disk: DiskHandle,
        event_chan: UnboundedSender<Event>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::outbound(torrent, disk, event_chan, addr)
    }

    fn new(
        torrent: Arc<SharedStatus>,
        disk: DiskHandle,
        event_chan: UnboundedSender<Event>,
        cmd_port: Receiver,
        addr: SocketAddr,
    ) -> Self {
        Self {
            torrent,
            disk,
            event_chan,
            cmd_port: cmd_port.fuse(),
            addr,
            status: Status::default(),
            outgoing_requests: Vec::new(),
            serving: Vec::new(),
            peer_info: None,
            download_counter: ThroughputCounter::new(),
            upload_counter: ThroughputCounter::new(),
        }
    }

    /// Starts an outbound session: connects, exchanges handshakes, then
    /// runs the session loop until the connection closes or errors.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(Error::InvalidMessage),
        };
        self.verify_handshake(&peer_handshake)?;

        let socket = self.switch_to_peer_codec(socket);
        self.run_from_handshake(socket).await
    }

    /// Completes an inbound session whose peer handshake has already been
    /// validated by the caller (the session that owns the listen socket):
    /// replies with our own handshake, switches codecs and runs the
    /// session loop.
    pub async fn start_inbound(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
    ) -> Result<()> {
        self.verify_handshake(&peer_handshake)?;
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;
        let socket = self.switch_to_peer_codec(socket);
        self.run_from_handshake(socket).await
    }

    fn verify_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        if handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        self.peer_info = Some(PeerInfo {
            peer_id: handshake.peer_id,
            pieces: None,
        });
        Ok(())
    }

    fn switch_to_peer_codec(
        &self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Framed<TcpStream, PeerCodec> {
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Framed::from_parts(new_parts)
    }

    /// Sends our bitfield (if we have any pieces) and runs the session
    /// loop, reporting [`Event::Connected`]/[`Event::Disconnected`] as
    /// appropriate.
    async fn run_from_handshake(
        &mut self,
        mut socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let have_pieces = self.torrent.have_pieces.read().await.clone();
        if have_pieces.count_ones() > 0 {
            socket.send(Message::Bitfield(have_pieces)).await?;
        }

        self.status.state = State::AvailabilityExchange;

        let peer_id = self
            .peer_info
            .as_ref()
            .map(|i| i.peer_id)
            .unwrap_or([0; 20]);
        let _ = self
            .event_chan
            .send(Event::Connected { addr: self.addr, peer_id });

        let result = self.run(socket).await;

        let _ = self.event_chan.send(Event::Disconnected {
            addr: self.addr,
            peer_id: self.peer_info.as_ref().map(|i| i.peer_id),
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        result
    }

    /// The main session loop: exchanges messages, runs periodic throughput
    /// sampling, and drains commands from the torrent.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut stats_tick = time::interval(std::time::Duration::from_secs(1));

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!("Received {} from peer {}", msg.id(), self.addr);

                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield).await?;
                        } else {
                            // no bitfield: treat as a peer starting out with
                            // nothing, and process this message normally.
                            self.adopt_empty_bitfield();
                            self.handle_msg(&mut sink, msg).await?;
                        }
                        self.status.state = State::Connected;
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(&mut sink, cmd).await? {
                        break;
                    }
                }
                _ = stats_tick.tick().fuse() => {
                    self.report_stats();
                }
            }
        }

        Ok(())
    }

    fn adopt_empty_bitfield(&mut self) {
        if let Some(info) = &mut self.peer_info {
            if info.pieces.is_none() {
                info.pieces =
                    Some(crate::empty_bitfield(self.torrent.storage.piece_count));
            }
        }
    }

    fn report_stats(&mut self) {
        let download_rate = self.download_counter.tick();
        let upload_rate = self.upload_counter.tick();
        if let Some(info) = &self.peer_info {
            let is_seed = info
                .pieces
                .as_ref()
                .map(|p| p.count_ones() == p.len())
                .unwrap_or(false);
            let _ = self.event_chan.send(Event::Stats {
                peer_id: info.peer_id,
                download_rate,
                upload_rate,
                downloaded_total: self.download_counter.total(),
                uploaded_total: self.upload_counter.total(),
                is_peer_interested: self.status.is_peer_interested,
                is_seed,
            });
        }
    }

    async fn handle_cmd(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Choke => {
                self.status.is_peer_choked = true;
                sink.send(Message::Choke).await?;
            }
            Command::Unchoke => {
                self.status.is_peer_choked = false;
                sink.send(Message::Unchoke).await?;
            }
            Command::SendHave(piece) => {
                sink.send(Message::Have { piece_index: piece }).await?;
            }
            Command::SendBlock { block, data } => {
                if let Some(pos) =
                    self.serving.iter().position(|b| *b == block)
                {
                    self.serving.remove(pos);
                    self.upload_counter.add(data.len());
                    sink.send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await?;
                } else {
                    log::debug!(
                        "Dropping block {:?} for peer {}: no longer being served (cancelled?)",
                        block,
                        self.addr
                    );
                }
            }
            Command::Shutdown => {
                log::info!("Shutting down peer {} session", self.addr);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Handles the peer's initial bitfield message.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        bitfield.resize(self.torrent.storage.piece_count, false);

        self.torrent.piece_picker.write().await.inc_refcount_bitfield(&bitfield);

        let is_interested = self.compute_interest(&bitfield).await;
        if let Some(info) = &mut self.peer_info {
            info.pieces = Some(bitfield);
        }

        self.set_interested(sink, is_interested).await?;
        self.status.best_request_queue_len =
            Some(self.torrent.conf.initial_request_queue_len);

        Ok(())
    }

    async fn compute_interest(&self, bitfield: &Bitfield) -> bool {
        let have = self.torrent.have_pieces.read().await;
        bitfield
            .iter()
            .enumerate()
            .any(|(i, has)| *has && !(i < have.len() && have[i]))
    }

    async fn set_interested(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        interested: bool,
    ) -> Result<()> {
        if interested != self.status.is_interested {
            self.status.is_interested = interested;
            if interested {
                sink.send(Message::Interested).await?;
            } else {
                sink.send(Message::NotInterested).await?;
            }
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.is_choked {
                    log::debug!("Peer {} choked us", self.addr);
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::debug!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                self.torrent
                    .piece_picker
                    .write()
                    .await
                    .inc_refcount(piece_index)?;
                if let Some(info) = &mut self.peer_info {
                    let pieces = info
                        .pieces
                        .get_or_insert_with(|| {
                            crate::empty_bitfield(self.torrent.storage.piece_count)
                        });
                    if piece_index < pieces.len() {
                        pieces.set(piece_index, true);
                    }
                }
                if !self.status.is_interested {
                    let have = self.torrent.have_pieces.read().await;
                    let we_have_it = piece_index < have.len() && have[piece_index];
                    if !we_have_it {
                        self.set_interested(sink, true).await?;
                    }
                }
            }
            Message::Request(block) => {
                if self.status.is_peer_choked {
                    log::debug!(
                        "Ignoring request from choked peer {}",
                        self.addr
                    );
                } else if let Some(info) = &self.peer_info {
                    self.serving.push(block);
                    let _ = self.event_chan.send(Event::BlockRequested {
                        peer_id: info.peer_id,
                        block,
                    });
                }
            }
            Message::Cancel(block) => {
                self.serving.retain(|b| *b != block);
            }
            Message::Block { piece_index, offset, data } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Extended { .. } => {
                log::debug!(
                    "Ignoring unsupported extension message from {}",
                    self.addr
                );
            }
        }
        Ok(())
    }

    /// Fills the outgoing request pipeline up to the peer's allowed depth.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let queue_len = self.status.best_request_queue_len.unwrap_or(0);
        if queue_len <= self.outgoing_requests.len() {
            return Ok(());
        }
        let want = queue_len - self.outgoing_requests.len();

        let peer_has = match &self.peer_info {
            Some(info) => info
                .pieces
                .clone()
                .unwrap_or_else(|| crate::empty_bitfield(self.torrent.storage.piece_count)),
            None => return Ok(()),
        };
        let peer_id = self.peer_info.as_ref().unwrap().peer_id;

        let picks = {
            let mut picker = self.torrent.piece_picker.write().await;
            picker.pick_pieces(
                &peer_has,
                want,
                self.torrent.pick_mode(),
                // Contiguous-block preference and parole/suggest wiring
                // are per-peer refinements the session loop doesn't yet
                // track; defaults preserve existing request behavior.
                false,
                false,
                self.torrent.is_end_game(),
                &[],
                peer_id,
            )
        };
        if picks.is_empty() {
            return Ok(());
        }

        {
            let mut picker = self.torrent.piece_picker.write().await;
            for block in &picks {
                picker.mark_as_requested(*block, peer_id)?;
            }
        }

        self.outgoing_requests.extend_from_slice(&picks);
        for block in &picks {
            sink.send(Message::Request(*block)).await?;
        }
        Ok(())
    }

    /// Records a downloaded block, hands it to disk, and advances the
    /// picker's bookkeeping for it. The picker's `writing` -> `finished`
    /// transition happens synchronously here rather than once the disk
    /// write durably completes, since this crate's disk task performs its
    /// own hashing internally and reports piece-level, not block-level,
    /// completion back to the torrent.
    async fn handle_block_msg(
        &mut self,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let pos = match self.outgoing_requests.iter().position(|b| *b == block) {
            Some(pos) => pos,
            None => {
                log::debug!(
                    "Peer {} sent unrequested block {:?}",
                    self.addr,
                    block
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);

        let peer_id = self.peer_info.as_ref().unwrap().peer_id;
        {
            let mut picker = self.torrent.piece_picker.write().await;
            picker.mark_as_writing(block, peer_id)?;
            picker.mark_as_finished(block, peer_id)?;
        }

        self.download_counter.add(data.len());
        self.disk.write_block(self.torrent.id, block, data)?;

        Ok(())
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    is_choked: bool,
    is_interested: bool,
    is_peer_choked: bool,
    is_peer_interested: bool,
    /// The number of outstanding requests we try to keep pipelined to this
    /// peer. Starts out at [`crate::conf::TorrentConf::initial_request_queue_len`];
    /// a future revision could grow this based on observed bandwidth-delay
    /// product (see the design notes on request pipelining).
    best_request_queue_len: Option<usize>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

struct PeerInfo {
    peer_id: PeerId,
    pieces: Option<Bitfield>,
}
