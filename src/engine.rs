//! The public facade (§6 "CLI / Configuration surface"): a handle an
//! application holds to add/remove torrents, react to [`crate::Alert`]s,
//! and otherwise drive the engine, without ever touching the network
//! thread directly.
//!
//! Mirrors the teacher's own handle-wraps-a-channel pattern
//! ([`crate::peer::PeerSession`]'s `Sender`, [`crate::disk::DiskHandle`]):
//! [`Engine`] is a thin, `Clone`-free wrapper around a command channel to
//! [`crate::session::SessionCore`], which is the only thing that actually
//! owns torrent state.

use std::{collections::HashSet, net::SocketAddr, path::PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::{
    alert::Alert,
    conf::Conf,
    error::{Error, Result},
    metainfo::Metainfo,
    resume::ResumeData,
    session::{self, SessionCore},
    FileIndex, PieceIndex, TorrentId,
};

/// Parameters for adding a new torrent (§6's `add_torrent(params)`).
///
/// Exactly one of `metainfo` or `resume_data` (carrying its own info hash)
/// must eventually be available for the torrent to leave its initial
/// state: a magnet link (`metainfo: None`, no resume data) starts in
/// `DownloadingMetadata` and fetches the info dict from peers first.
#[derive(Debug, Clone, Default)]
pub struct AddTorrentParams {
    /// The parsed `.torrent` file, if available up front. `None` for a
    /// magnet-link add.
    pub metainfo: Option<Metainfo>,
    /// Overrides [`crate::conf::TorrentConf::download_dir`] for this
    /// torrent only, if set.
    pub download_dir: Option<PathBuf>,
    /// Extra trackers to announce to, beyond (or instead of, if the
    /// metainfo carries none) `metainfo`'s own tracker list.
    pub trackers: Vec<String>,
    /// Per-file priorities (§4.5), indexed the same as the metainfo's file
    /// list. Empty means every file defaults to normal priority.
    pub file_priorities: Vec<u8>,
    /// Whether the torrent should start paused rather than immediately
    /// allocating and checking files.
    pub paused: bool,
    /// Seed mode: every piece is assumed already verified and present,
    /// skipping the initial hash check (§4.5).
    pub seed_mode: bool,
    /// Previously saved resume data (§6 "Persisted state") to restore
    /// progress, peer list, and settings from.
    pub resume_data: Option<ResumeData>,
    /// Candidate peers to seed the peer list with up front (from resume
    /// data or a direct caller-supplied list), beyond what tracker/DHT/PEX
    /// will supply once running.
    pub peers: Vec<SocketAddr>,
}

/// A handle to a running engine. Cloning is cheap (it's just a channel
/// sender) and safe to share across tasks; every method posts a command to
/// the single network thread and, where a result is meaningful, awaits it
/// back over a oneshot channel.
#[derive(Clone)]
pub struct Engine {
    cmd_chan: session::CommandSender,
}

impl Engine {
    /// Starts the engine: binds its configured listen address(es), spawns
    /// the session task, and returns a handle plus the channel on which
    /// the application receives [`Alert`]s.
    pub async fn new(conf: Conf) -> Result<(Self, mpsc::UnboundedReceiver<Alert>)> {
        let (session, cmd_chan, alert_port) = SessionCore::new(conf).await?;
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                log::error!("Session task ended with error: {}", e);
            }
        });
        Ok((Self { cmd_chan }, alert_port))
    }

    /// Adds a new torrent and returns the [`TorrentId`] it was assigned.
    pub async fn add_torrent(&self, params: AddTorrentParams) -> Result<TorrentId> {
        let (result_chan, result_port) = oneshot::channel();
        self.cmd_chan.send(session::Command::AddTorrent {
            params: Box::new(params),
            result_chan,
        })?;
        result_port.await.map_err(|_| Error::Shutdown)?
    }

    /// Removes a torrent, optionally deleting its downloaded files.
    pub fn remove_torrent(&self, id: TorrentId, delete_files: bool) -> Result<()> {
        Ok(self
            .cmd_chan
            .send(session::Command::RemoveTorrent { id, delete_files })?)
    }

    /// Pauses a single torrent. A graceful pause lets outstanding peer
    /// requests drain before disconnecting (S6); a hard pause disconnects
    /// immediately.
    pub fn pause_torrent(&self, id: TorrentId, graceful: bool) -> Result<()> {
        Ok(self
            .cmd_chan
            .send(session::Command::PauseTorrent { id, graceful })?)
    }

    pub fn resume_torrent(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::ResumeTorrent { id })?)
    }

    /// Pauses or resumes every torrent in the session at once.
    pub fn set_session_paused(&self, paused: bool) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::SetSessionPaused(paused))?)
    }

    pub fn set_file_priority(
        &self,
        id: TorrentId,
        file: FileIndex,
        priority: u8,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::SetFilePriority {
            id,
            file,
            priority,
        })?)
    }

    pub fn set_piece_priority(
        &self,
        id: TorrentId,
        piece: PieceIndex,
        priority: u8,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::SetPiecePriority {
            id,
            piece,
            priority,
        })?)
    }

    /// Sets or clears a streaming deadline on `piece` (§4.8 tick's
    /// "streaming deadline picker"): while any deadline is outstanding the
    /// torrent's picker switches into time-critical mode, preferring
    /// pieces by deadline over rarity.
    pub fn set_piece_deadline(
        &self,
        id: TorrentId,
        piece: PieceIndex,
        deadline: Option<i64>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::SetPieceDeadline {
            id,
            piece,
            deadline,
        })?)
    }

    pub fn set_sequential_download(&self, id: TorrentId, sequential: bool) -> Result<()> {
        Ok(self
            .cmd_chan
            .send(session::Command::SetSequential { id, sequential })?)
    }

    /// Forces a full files check (hash verification of all pieces already
    /// on disk), as if the torrent had just been added without trustworthy
    /// resume data.
    pub fn force_recheck(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::ForceRecheck { id })?)
    }

    /// Requests that resume data be produced; the bencoded bytes arrive
    /// asynchronously as [`Alert::ResumeDataSaved`].
    pub fn save_resume_data(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::SaveResumeData { id })?)
    }

    pub fn move_storage(&self, id: TorrentId, path: PathBuf) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::MoveStorage { id, path })?)
    }

    pub fn rename_file(&self, id: TorrentId, file: FileIndex, name: String) -> Result<()> {
        Ok(self
            .cmd_chan
            .send(session::Command::RenameFile { id, file, name })?)
    }

    pub fn add_tracker(&self, id: TorrentId, url: String) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::AddTracker { id, url })?)
    }

    /// Adds a candidate peer directly, e.g. from an out-of-band source the
    /// application knows about (DHT, PEX, or a user-supplied address).
    pub fn add_peer(&self, id: TorrentId, addr: SocketAddr) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::AddPeer { id, addr })?)
    }

    /// Replaces the session-wide IP filter: any connected peer whose
    /// address is no longer allowed is disconnected, and no further
    /// candidate from a banned address is dialed.
    pub fn set_ip_filter(&self, banned: HashSet<std::net::IpAddr>) -> Result<()> {
        Ok(self
            .cmd_chan
            .send(session::Command::SetIpFilter(std::sync::Arc::new(banned)))?)
    }

    /// Shuts the engine down: every torrent is asked to stop (files are
    /// released, not deleted) and the session task exits once they have.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(session::Command::Shutdown)?)
    }
}
