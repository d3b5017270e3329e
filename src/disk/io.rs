use {
    nix::sys::uio::pwritev,
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        io,
        ops::Range,
        os::unix::{fs::FileExt, io::AsRawFd},
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        error::*, Alert, AlertReceiver, AlertSender, BatchWrite, CheckFilesReport,
        Command, CommandReceiver, CommandSender, ReadBlock, TorrentAlert,
        TorrentAlertReceiver, TorrentAlertSender, TorrentAllocation,
    },
    crate::{
        block_count,
        error::Error,
        iovecs::{IoVec, IoVecs},
        storage_info::{FsStructure, StorageInfo},
        BlockInfo, Bitfield, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    let torrent_res = Torrent::new(info, piece_hashes);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.torrent(id)?.write().await.write_block(info, data).await?;
                }
                Command::ReadBlock { id, info } => {
                    self.torrent(id)?.write().await.read_block(info).await?;
                }
                Command::CheckFiles { id } => {
                    self.torrent(id)?.write().await.check_files().await?;
                }
                Command::ClearPiece { id, piece } => {
                    self.torrent(id)?.write().await.clear_piece(piece).await?;
                }
                Command::MoveStorage { id, new_path } => {
                    self.torrent(id)?.write().await.move_storage(new_path).await?;
                }
                Command::RenameFile { id, file, name } => {
                    self.torrent(id)?.write().await.rename_file(file, name).await?;
                }
                Command::ReleaseFiles { id } => {
                    self.torrent(id)?.write().await.release_files().await?;
                }
                Command::DeleteFiles { id } => {
                    self.torrent(id)?.write().await.delete_files().await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Looks up `id`'s torrent entry.
    ///
    /// TODO: maybe we don't want to crash the disk task due to an invalid
    /// torrent id: could it be that disk requests for a torrent arrive after
    /// a torrent has been removed?
    fn torrent(&self, id: TorrentId) -> Result<&RwLock<Torrent>> {
        self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster lookups.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// Each writer thread will get exclusive access to the file handle it
    /// needs, referring to it directly in the vector (hence the arc).
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For a single file, the file's path is joined onto the download
    /// directory, same as every file of an archive torrent; neither exists
    /// ahead of time.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        if info.download_dir.exists() {
            log::warn!("Download path {:?} exists", info.download_dir);
            return Err(NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "Download path already exists",
            )));
        }

        let open_file = |info: FileInfo| {
            if let Some(subdir) = info.path.parent() {
                if !subdir.as_os_str().is_empty() && !subdir.exists() {
                    log::info!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(&subdir).map_err(|e| {
                        log::warn!("Failed to create subdir {:?}", subdir);
                        NewTorrentError::Io(e)
                    })?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        fs::create_dir_all(&info.download_dir).map_err(|e| {
            log::warn!("Failed to create download dir {:?}", info.download_dir);
            NewTorrentError::Io(e)
        })?;

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                    is_pad: file.is_pad,
                };
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                        is_pad: file.is_pad,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan
                    .send(TorrentAlert::BatchWrite(Err((piece_index, e))))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("Newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                let (write_count, blocks) = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset =
                        piece_index as u64 * piece_len as u64;
                    let write_count = piece.write(piece_torrent_offset, &*files)?;

                    let blocks = piece
                        .blocks
                        .iter()
                        .map(|(offset, block)| BlockInfo {
                            piece_index: info.piece_index,
                            offset: *offset,
                            len: block.len() as u32,
                        })
                        .collect();

                    (Some(write_count), blocks)
                } else {
                    log::warn!("Piece {} is NOT valid", info.piece_index);
                    (None, Vec::new())
                };

                Ok((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if is_piece_valid {
                        if let Some(write_count) = write_count {
                            self.stats.write_count += write_count as u64;
                        }
                    }

                    self.alert_chan.send(TorrentAlert::BatchWrite(Ok(
                        BatchWrite {
                            piece: piece_index,
                            blocks,
                            is_piece_valid: Some(is_piece_valid),
                        },
                    )))?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan
                        .send(TorrentAlert::BatchWrite(Err((piece_index, e))))?;
                }
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", info.piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }

        let hash_slice = &self.piece_hashes[hash_pos..hash_pos + 20];
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!(
            "Piece {} intersects files: {:?}",
            info.piece_index,
            files
        );

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }

    /// Reads a previously written block back off disk to serve to a peer.
    async fn read_block(&mut self, info: BlockInfo) -> Result<()> {
        log::trace!("Reading block {:?} from disk", info);

        if self.info.piece_len(info.piece_index).is_err() {
            self.alert_chan.send(TorrentAlert::Read(Err(
                ReadError::InvalidPieceIndex,
            )))?;
            return Ok(());
        }

        let files = Arc::clone(&self.files);
        let piece_len = self.info.piece_len;
        let file_range = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| Error::InvalidPieceIndex)?;

        let result = task::spawn_blocking(move || {
            read_block_sync(&files, file_range, piece_len, info)
        })
        .await
        .expect("disk IO read task panicked");

        match result {
            Ok(data) => {
                self.alert_chan
                    .send(TorrentAlert::Read(Ok(ReadBlock { info, data })))?;
            }
            Err(e) => {
                log::warn!("Disk read error: {}", e);
                self.alert_chan.send(TorrentAlert::Read(Err(e)))?;
            }
        }
        Ok(())
    }

    /// Hashes every piece of the torrent already present on disk and
    /// reports which ones match their expected hash.
    async fn check_files(&mut self) -> Result<()> {
        log::info!("Checking torrent files on disk");

        let files = Arc::clone(&self.files);
        let info = self.info.clone();
        let piece_hashes = self.piece_hashes.clone();

        let result = task::spawn_blocking(move || -> Result<Bitfield, WriteError> {
            let mut have_pieces = Bitfield::new();
            have_pieces.resize(info.piece_count, false);
            for piece_index in 0..info.piece_count {
                let piece_len = info
                    .piece_len(piece_index)
                    .map_err(|_| WriteError::InvalidPieceIndex)?;
                let file_range = info
                    .files_intersecting_piece(piece_index)
                    .map_err(|_| WriteError::InvalidPieceIndex)?;
                let expected_hash =
                    &piece_hashes[piece_index * 20..piece_index * 20 + 20];
                match read_piece_sync(&files, file_range, piece_index, piece_len) {
                    Ok(bytes) => {
                        let digest = Sha1::digest(&bytes);
                        if digest.as_slice() == expected_hash {
                            have_pieces.set(piece_index, true);
                        }
                    }
                    Err(_) => {
                        // a missing or short file just means we don't have
                        // this piece yet, not a hard failure
                    }
                }
            }
            Ok(have_pieces)
        })
        .await
        .expect("disk IO check task panicked");

        match result {
            Ok(have_pieces) => {
                self.alert_chan.send(TorrentAlert::CheckFiles(Ok(
                    CheckFilesReport { have_pieces },
                )))?;
            }
            Err(e) => {
                log::warn!("File check error: {}", e);
                self.alert_chan.send(TorrentAlert::CheckFiles(Err(e)))?;
            }
        }
        Ok(())
    }

    /// Drops `piece`'s in-memory write buffer, if any is still present.
    /// Blocks that passed their hash check are never written to disk in
    /// the first place (see [`Self::write_block`]), so there's nothing
    /// durable left to clear; this just guards against a lingering
    /// partial buffer from a peer that disconnected mid-piece.
    async fn clear_piece(&mut self, piece: PieceIndex) -> Result<()> {
        self.pieces.remove(&piece);
        self.alert_chan.send(TorrentAlert::PieceCleared(piece))?;
        Ok(())
    }

    /// Moves the torrent's entire download directory to `new_path`.
    async fn move_storage(&mut self, new_path: std::path::PathBuf) -> Result<()> {
        log::info!("Moving storage to {:?}", new_path);
        let old_path = self.info.download_dir.clone();
        let result = task::spawn_blocking(move || -> Result<(), WriteError> {
            if let Some(parent) = new_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&old_path, &new_path)?;
            Ok(())
        })
        .await
        .expect("disk IO move task panicked");

        match result {
            Ok(()) => {
                self.info.download_dir = new_path.clone();
                for file in self.files.iter() {
                    let mut file = file.lock().unwrap();
                    if let Ok(rel) = file.info.path.strip_prefix(&self.info.download_dir) {
                        file.info.path = new_path.join(rel);
                    }
                }
                self.alert_chan
                    .send(TorrentAlert::StorageMoved(Ok(new_path)))?;
            }
            Err(e) => {
                log::warn!("Storage move error: {}", e);
                self.alert_chan.send(TorrentAlert::StorageMoved(Err(e)))?;
            }
        }
        Ok(())
    }

    /// Renames a single file within the torrent, keeping it in its current
    /// directory.
    async fn rename_file(&mut self, file: FileIndex, name: String) -> Result<()> {
        log::info!("Renaming file {} to {}", file, name);
        let file_mutex = match self.files.get(file) {
            Some(f) => f,
            None => {
                self.alert_chan.send(TorrentAlert::FileRenamed(Err(
                    WriteError::InvalidPieceIndex,
                )))?;
                return Ok(());
            }
        };

        let (old_path, new_path) = {
            let info = &file_mutex.lock().unwrap().info;
            let new_path = match info.path.parent() {
                Some(parent) => parent.join(&name),
                None => std::path::PathBuf::from(&name),
            };
            (info.path.clone(), new_path)
        };

        let rename_result = {
            let old_path = old_path.clone();
            let new_path = new_path.clone();
            task::spawn_blocking(move || -> Result<(), WriteError> {
                fs::rename(&old_path, &new_path)?;
                Ok(())
            })
            .await
            .expect("disk IO rename task panicked")
        };

        match rename_result {
            Ok(()) => {
                file_mutex.lock().unwrap().info.path = new_path;
                self.alert_chan
                    .send(TorrentAlert::FileRenamed(Ok((file, name))))?;
            }
            Err(e) => {
                log::warn!("File rename error: {}", e);
                self.alert_chan.send(TorrentAlert::FileRenamed(Err(e)))?;
            }
        }
        Ok(())
    }

    /// Closes every open file handle for this torrent. A later operation
    /// (e.g. a resumed download) will fail until the torrent is
    /// reallocated, since there is no longer anywhere to read or write to.
    async fn release_files(&mut self) -> Result<()> {
        log::info!("Releasing file handles");
        self.files = Arc::new(Vec::new());
        self.alert_chan.send(TorrentAlert::FilesReleased(Ok(())))?;
        Ok(())
    }

    /// Deletes every file belonging to the torrent from disk.
    async fn delete_files(&mut self) -> Result<()> {
        log::info!("Deleting torrent files");
        let download_dir = self.info.download_dir.clone();
        let result = task::spawn_blocking(move || -> Result<(), WriteError> {
            if download_dir.exists() {
                fs::remove_dir_all(&download_dir)?;
            }
            Ok(())
        })
        .await
        .expect("disk IO delete task panicked");

        match &result {
            Ok(()) => self.files = Arc::new(Vec::new()),
            Err(e) => log::warn!("File delete error: {}", e),
        }
        self.alert_chan.send(TorrentAlert::FilesDeleted(result))?;
        Ok(())
    }
}

/// Reads `info`'s bytes back from wherever they were written, potentially
/// spanning multiple files.
fn read_block_sync(
    files: &[Mutex<TorrentFile>],
    file_range: Range<FileIndex>,
    piece_len: u32,
    info: BlockInfo,
) -> Result<Vec<u8>, ReadError> {
    let piece_torrent_offset =
        info.piece_index as u64 * piece_len as u64 + info.offset as u64;
    let mut buf = vec![0u8; info.len as usize];
    read_range(files, &file_range, piece_torrent_offset, &mut buf)?;
    Ok(buf)
}

/// Reads an entire piece's bytes back from disk, for hash verification.
fn read_piece_sync(
    files: &[Mutex<TorrentFile>],
    file_range: Range<FileIndex>,
    piece_index: PieceIndex,
    piece_len: u32,
) -> Result<Vec<u8>, ReadError> {
    let piece_torrent_offset = piece_index as u64 * piece_len as u64;
    let mut buf = vec![0u8; piece_len as usize];
    read_range(files, &file_range, piece_torrent_offset, &mut buf)?;
    Ok(buf)
}

/// `FileExt::read_at` may return short of a full buffer; this retries at
/// the advanced offset until `buf` is completely filled or an error or EOF
/// is hit.
fn read_exact_at(file: &File, buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of file",
            ));
        }
        filled += n;
        offset += n as u64;
    }
    Ok(())
}

/// Fills `buf` starting at `torrent_offset`, reading across as many of
/// `files[file_range]` as needed.
fn read_range(
    files: &[Mutex<TorrentFile>],
    file_range: &Range<FileIndex>,
    torrent_offset: u64,
    buf: &mut [u8],
) -> Result<(), ReadError> {
    let mut filled = 0usize;
    let mut offset = torrent_offset;
    for file in &files[file_range.clone()] {
        if filled == buf.len() {
            break;
        }
        let file = file.lock().unwrap();
        let file_end = file.info.torrent_end_offset();
        if offset >= file_end {
            continue;
        }
        let remaining = (buf.len() - filled) as u64;
        let slice = file.info.get_slice(offset, remaining);
        let chunk_len = slice.len as usize;
        read_exact_at(&file.handle, &mut buf[filled..filled + chunk_len], slice.offset)
            .map_err(|e| {
                log::warn!("File {:?} read error: {}", file.info.path, e);
                ReadError::Io(e)
            })?;
        filled += chunk_len;
        offset += chunk_len as u64;
    }
    if filled != buf.len() {
        log::warn!("Short read: expected {} bytes, got {}", buf.len(), filled);
        return Err(ReadError::InvalidPieceIndex);
    }
    Ok(())
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at<'a>(
        &self,
        iovecs: &mut IoVecs<'a>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count = pwritev(
                self.handle.as_raw_fd(),
                iovecs.buffers(),
                offset as i64,
            )
            .map_err(|_| {
                log::warn!("File {:?} write error", self.info.path);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks, keyed by offset within piece.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with.
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread pool
    /// and not the executor.
    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.input(&block);
        }
        let hash = hasher.result();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;

        let mut bufs: Vec<IoVec> =
            self.blocks.values().map(|b| IoVec::from_slice(&b)).collect();
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice =
                file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(&bufs);
            debug_assert!(
                iovecs
                    .buffers()
                    .iter()
                    .map(|iov| iov.as_slice().len() as u64)
                    .sum::<u64>()
                    <= slice.len
            );

            total_write_count +=
                file.write_vectored_at(&mut iovecs, slice.offset)?;

            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice =
                    file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());
                debug_assert!(!bufs[0].as_slice().is_empty());

                let mut iovecs = IoVecs::bounded(&bufs, slice.len as usize);
                debug_assert!(
                    iovecs
                        .buffers()
                        .iter()
                        .map(|iov| iov.as_slice().len() as u64)
                        .sum::<u64>()
                        <= slice.len
                );

                let write_count =
                    file.write_vectored_at(&mut iovecs, slice.offset)?;

                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
}
