//! The disk IO subsystem: the only place in the crate that touches the
//! filesystem.
//!
//! Mirrors the teacher's actor shape (`disk::io::Disk` owns all open file
//! handles and runs its own command loop; everyone else talks to it over a
//! channel) but widens the command surface from "allocate + write" to the
//! full capability list the core consumes (§6 of the design): reads (to
//! serve blocks to peers), whole-file hash checks (for `checking_files`),
//! and the storage-management operations (move/delete/rename/flush/clear).

mod error;
pub(crate) mod io;

use tokio::sync::mpsc;

pub(crate) use error::{NewTorrentError, ReadError, WriteError};

use crate::{
    storage_info::StorageInfo, BlockInfo, FileIndex, PieceIndex, TorrentId,
};
use error::Result;

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Commands the engine (or a peer session, for writes) posts to the disk
/// task.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block back off disk (fully written pieces only) to serve to
    /// a requesting peer.
    ReadBlock { id: TorrentId, info: BlockInfo },
    /// Hashes every piece already present on disk, e.g. on first load of a
    /// torrent whose resume data couldn't be trusted.
    CheckFiles { id: TorrentId },
    /// Drops a piece's write buffer after a hash mismatch, so stale block
    /// data isn't reused on the retry.
    ClearPiece { id: TorrentId, piece: PieceIndex },
    MoveStorage {
        id: TorrentId,
        new_path: std::path::PathBuf,
    },
    RenameFile {
        id: TorrentId,
        file: FileIndex,
        name: String,
    },
    ReleaseFiles { id: TorrentId },
    DeleteFiles { id: TorrentId },
    Shutdown,
}

/// Engine-wide alerts, i.e. not scoped to a particular torrent's dedicated
/// channel.
pub(crate) enum Alert {
    TorrentAllocation(std::result::Result<TorrentAllocation, NewTorrentError>),
}

/// Returned to the engine once a torrent's storage has been allocated
/// (files created/opened); carries the per-torrent alert channel the
/// engine should forward to that torrent's task from then on.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts scoped to a single torrent.
pub(crate) enum TorrentAlert {
    /// The `Err` side carries the piece the failed batch belonged to, since
    /// a write failure can occur before the piece is far enough along to
    /// populate `BatchWrite::blocks`.
    BatchWrite(std::result::Result<BatchWrite, (PieceIndex, WriteError)>),
    Read(std::result::Result<ReadBlock, ReadError>),
    CheckFiles(std::result::Result<CheckFilesReport, WriteError>),
    PieceCleared(PieceIndex),
    /// `move_storage` finished; carries the path storage now lives at.
    StorageMoved(std::result::Result<std::path::PathBuf, WriteError>),
    FileRenamed(std::result::Result<(FileIndex, String), WriteError>),
    FilesReleased(std::result::Result<(), WriteError>),
    FilesDeleted(std::result::Result<(), WriteError>),
}

/// Reports the outcome of flushing a completed piece's write buffer to
/// disk.
pub(crate) struct BatchWrite {
    /// The piece this batch completed, regardless of whether it passed.
    pub piece: PieceIndex,
    /// The blocks that were (or, on failure, would have been) written.
    pub blocks: Vec<BlockInfo>,
    /// `None` if the disk write itself failed before hashing was even
    /// attempted; `Some(false)` if the piece hashed incorrectly.
    pub is_piece_valid: Option<bool>,
}

pub(crate) struct ReadBlock {
    pub info: BlockInfo,
    pub data: Vec<u8>,
}

/// The result of a full-file recheck: which pieces, of those already on
/// disk, hashed correctly.
pub(crate) struct CheckFilesReport {
    pub have_pieces: crate::Bitfield,
}

/// A lightweight handle callers use to talk to the disk task without
/// needing direct access to its channels.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    pub fn new(cmd_chan: CommandSender) -> Self {
        Self { cmd_chan }
    }

    pub fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
        })?)
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    pub fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ReadBlock { id, info })?)
    }

    pub fn check_files(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(Command::CheckFiles { id })?)
    }

    pub fn clear_piece(&self, id: TorrentId, piece: PieceIndex) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ClearPiece { id, piece })?)
    }

    pub fn move_storage(
        &self,
        id: TorrentId,
        new_path: std::path::PathBuf,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::MoveStorage { id, new_path })?)
    }

    pub fn rename_file(
        &self,
        id: TorrentId,
        file: FileIndex,
        name: String,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::RenameFile { id, file, name })?)
    }

    pub fn release_files(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ReleaseFiles { id })?)
    }

    pub fn delete_files(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(Command::DeleteFiles { id })?)
    }

    pub fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}

/// Spawns the disk task on a blocking-friendly executor thread and returns
/// a handle plus the engine-wide alert receiver.
pub(crate) fn spawn() -> Result<(DiskHandle, AlertReceiver)> {
    let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
    tokio::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk IO event loop exited with error: {}", e);
        }
    });
    Ok((DiskHandle::new(cmd_chan), alert_port))
}
