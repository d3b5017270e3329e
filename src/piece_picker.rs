//! Decides which blocks to request next.
//!
//! This is a reimplementation of libtorrent's `piece_picker`: pieces are
//! kept in a flat pick list partitioned into contiguous priority buckets
//! (`m_pieces` / `m_priority_boundaries` in the original), so that a
//! priority change only has to swap the piece across a bucket boundary
//! rather than re-sort the whole list. Block-level bookkeeping for pieces
//! that are currently being downloaded lives in a pooled [`BlockTable`].

use std::collections::HashMap;

use lru::LruCache;
use rand::Rng;

use crate::{
    block_table::{BlockState, BlockTable, BlockTableSlot},
    error::{Error, Result},
    block_count, block_len,
    BlockInfo, PeerId, PieceIndex,
};

/// User-assigned download priority of a piece. `DontDownload` excludes the
/// piece from the pick list entirely (priority `-1` in the distilled spec).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Priority(u8);

impl Priority {
    pub const DONT_DOWNLOAD: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(4);
    pub const TOP: Priority = Priority(7);

    pub fn new(level: u8) -> Self {
        Self(level.min(7))
    }

    pub fn is_downloadable(self) -> bool {
        self.0 > 0
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// The state of a piece that currently has a [`DownloadingPiece`] record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PieceState {
    Open,
    Downloading,
    Full,
    Finished,
}

/// Always-resident per-piece bookkeeping (one entry per piece in the
/// torrent, regardless of whether it's being downloaded).
#[derive(Clone, Debug)]
struct PiecePosition {
    /// Number of connected non-seed peers that advertise this piece (I4).
    peer_count: u32,
    priority: Priority,
    have: bool,
    /// Whether the peer that contributed the most recent block request was
    /// going in reverse pick-list order; used only for bucket ranking.
    reverse: bool,
    /// Position in `pick_list`, if this piece currently has one (i.e. it's
    /// downloadable and we don't have it yet) and the list isn't dirty.
    index_in_pick_list: Option<usize>,
}

impl PiecePosition {
    fn new() -> Self {
        Self {
            peer_count: 0,
            priority: Priority::DEFAULT,
            have: false,
            reverse: false,
            index_in_pick_list: None,
        }
    }

    /// Whether this piece belongs in the pick list at all.
    fn is_pickable(&self) -> bool {
        !self.have && self.priority.is_downloadable()
    }
}

/// A piece that has at least one non-`none` block, or is locked pending
/// restoration after a failed hash check.
#[derive(Clone, Debug)]
struct DownloadingPiece {
    piece: PieceIndex,
    slot: BlockTableSlot,
    block_count: usize,
    requested: u32,
    writing: u32,
    finished: u32,
    /// The verifier confirmed the piece's hash, but the disk flush of its
    /// last block(s) may still be outstanding.
    passed_hash_check: bool,
    /// Hash check failed; no further requests are handed out for this
    /// piece until [`PiecePicker::restore_piece`] is called.
    locked: bool,
}

impl DownloadingPiece {
    fn state(&self) -> PieceState {
        let total = self.block_count as u32;
        if self.requested == 0 && self.writing + self.finished == total {
            PieceState::Finished
        } else if self.requested + self.writing + self.finished == total
            && self.requested > 0
        {
            PieceState::Full
        } else {
            PieceState::Downloading
        }
    }
}

/// The picking strategy to use for a call to
/// [`PiecePicker::pick_pieces`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PickMode {
    Sequential,
    RarestFirst,
    TimeCritical,
    Default,
}

/// How many blocks past which the partial-piece count auto-enables
/// `prioritize_partials`, absent an explicit setting. Mirrors
/// [`crate::conf::TorrentConf::max_partial_pieces`], duplicated here as a
/// fallback for picker unit tests that construct a bare picker.
const DEFAULT_MAX_PARTIAL_PIECES: usize = 15;

/// Default piece-extent-affinity neighbourhood, in blocks, absent an
/// explicit [`crate::conf::TorrentConf::piece_extent_affinity_len`]. 4 MiB
/// worth of the default 16 KiB block size.
const DEFAULT_EXTENT_AFFINITY_BLOCKS: usize = 256;

/// How many extents [`PiecePicker::extents`] remembers before evicting the
/// least recently touched one.
const EXTENT_LRU_CAPACITY: usize = 8;

/// Converts an affinity neighbourhood expressed in blocks into one
/// expressed in pieces, for a torrent whose nominal piece is
/// `piece_len` bytes.
fn extent_len_for(affinity_blocks: usize, piece_len: u32) -> usize {
    let affinity_bytes = affinity_blocks as u64 * crate::BLOCK_LEN as u64;
    ((affinity_bytes / piece_len.max(1) as u64).max(1)) as usize
}

/// Picks which blocks to request next, and tracks piece/block state needed
/// to do so. Owns no network or disk state — it is driven entirely by the
/// [`crate::torrent::TorrentCore`] and [`crate::peer`] session loops calling
/// in with observed peer/disk events.
pub(crate) struct PiecePicker {
    pieces: Vec<PiecePosition>,
    /// Number of blocks in the torrent's nominal (non-last) piece.
    blocks_per_piece: usize,
    /// Length, in bytes, of the torrent's last piece; needed to compute its
    /// (possibly smaller) block count.
    last_piece_len: u32,
    nominal_piece_len: u32,

    downloading: Vec<DownloadingPiece>,
    /// Maps a piece index to its slot in `downloading`, for O(1) lookup.
    downloading_index: HashMap<PieceIndex, usize>,
    blocks: BlockTable,

    /// The flat, priority-bucketed pick list. Only pieces with
    /// `is_pickable() == true` appear here.
    pick_list: Vec<PieceIndex>,
    /// Cumulative bucket boundaries: `priority_boundaries[p]` is one past
    /// the last index in `pick_list` belonging to priority `p` or lower.
    priority_boundaries: Vec<usize>,
    /// Set when a bulk refcount update has happened and `pick_list`'s
    /// ordering can no longer be trusted until `rebuild_pick_list` runs.
    dirty: bool,

    /// Seeds are not decomposed into per-piece `peer_count` until they
    /// signal they don't have a specific piece ("break_one_seed").
    seed_count: u32,

    num_have: usize,
    num_filtered: usize,
    num_have_filtered: usize,

    /// Auto-enabled once the number of in-progress pieces exceeds
    /// `max_partial_pieces`; forces `pick_pieces` to finish partials before
    /// starting new pieces.
    pub prioritize_partials: bool,
    max_partial_pieces: usize,

    /// Bounded LRU of 4 MiB-aligned piece "extents", most recently touched
    /// (a block requested within it) first. Rarest-first picking scans
    /// these before falling back to the flat pick list, to keep a peer's
    /// requests clustered for disk locality.
    extents: LruCache<usize, ()>,
    /// Number of pieces per extent; derived from the affinity length in
    /// blocks (see [`Self::set_extent_affinity`]).
    extent_len: usize,
}

impl std::fmt::Debug for PiecePicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiecePicker")
            .field("piece_count", &self.pieces.len())
            .field("downloading", &self.downloading.len())
            .field("dirty", &self.dirty)
            .field("num_have", &self.num_have)
            .finish()
    }
}

impl PiecePicker {
    /// Creates a picker for a torrent with `piece_count` pieces, each
    /// `nominal_piece_len` bytes except the last, which is `last_piece_len`
    /// bytes.
    pub fn new(
        piece_count: usize,
        nominal_piece_len: u32,
        last_piece_len: u32,
    ) -> Self {
        let blocks_per_piece = block_count(nominal_piece_len);
        let extent_len = extent_len_for(
            DEFAULT_EXTENT_AFFINITY_BLOCKS,
            nominal_piece_len,
        );
        Self {
            pieces: vec![PiecePosition::new(); piece_count],
            blocks_per_piece,
            last_piece_len,
            nominal_piece_len,
            downloading: Vec::new(),
            downloading_index: HashMap::new(),
            blocks: BlockTable::new(blocks_per_piece),
            pick_list: Vec::new(),
            priority_boundaries: vec![0; 16],
            dirty: false,
            seed_count: 0,
            num_have: 0,
            num_filtered: 0,
            num_have_filtered: 0,
            prioritize_partials: false,
            max_partial_pieces: DEFAULT_MAX_PARTIAL_PIECES,
            extents: LruCache::new(EXTENT_LRU_CAPACITY),
            extent_len,
        }
    }

    /// Overrides the extent-affinity neighbourhood size (in blocks),
    /// matching [`crate::conf::TorrentConf::piece_extent_affinity_len`].
    pub fn set_extent_affinity(&mut self, affinity_blocks: usize) {
        self.extent_len =
            extent_len_for(affinity_blocks, self.nominal_piece_len);
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    fn block_count_in(&self, piece: PieceIndex) -> usize {
        if piece == self.pieces.len() - 1 {
            block_count(self.last_piece_len)
        } else {
            self.blocks_per_piece
        }
    }

    fn check_piece(&self, piece: PieceIndex) -> Result<()> {
        if piece >= self.pieces.len() {
            Err(Error::InvalidPieceIndex)
        } else {
            Ok(())
        }
    }

    // -- priority & pick list -------------------------------------------

    pub fn piece_priority(&self, piece: PieceIndex) -> Result<Priority> {
        self.check_piece(piece)?;
        Ok(self.pieces[piece].priority)
    }

    /// Transitions a piece between filtered (`DontDownload`) and
    /// non-filtered, re-slotting it within the pick list as needed.
    pub fn set_piece_priority(
        &mut self,
        piece: PieceIndex,
        priority: Priority,
    ) -> Result<()> {
        self.check_piece(piece)?;

        let was_pickable = self.pieces[piece].is_pickable();
        let was_filtered = self.pieces[piece].priority == Priority::DONT_DOWNLOAD;
        self.pieces[piece].priority = priority;
        let is_pickable = self.pieces[piece].is_pickable();
        let is_filtered = priority == Priority::DONT_DOWNLOAD;

        match (was_filtered, is_filtered) {
            (false, true) => {
                self.num_filtered += 1;
                if self.pieces[piece].have {
                    self.num_have_filtered += 1;
                }
            }
            (true, false) => {
                self.num_filtered -= 1;
                if self.pieces[piece].have {
                    self.num_have_filtered -= 1;
                }
            }
            _ => {}
        }

        if was_pickable && !is_pickable {
            self.remove_from_pick_list(piece);
        } else if !was_pickable && is_pickable {
            self.add_to_pick_list(piece);
        } else if was_pickable && is_pickable {
            // still pickable, but possibly in a different bucket now
            self.remove_from_pick_list(piece);
            self.add_to_pick_list(piece);
        }

        Ok(())
    }

    /// Bucket index within `pick_list`/`priority_boundaries`. Splits each
    /// user-priority level into two sub-buckets so a downloading piece
    /// always ranks above an open piece of the same priority (higher
    /// bucket number is picked first, since `pick_rarest_first` walks the
    /// list end-first).
    fn bucket_of(&self, piece: PieceIndex) -> usize {
        let base = self.pieces[piece].priority.0 as usize * 2;
        if self.downloading_index.contains_key(&piece) {
            base + 1
        } else {
            base
        }
    }

    /// Inserts `piece` at a uniform-random position within its priority
    /// bucket, displacing whatever piece was there to the bucket's new
    /// last slot (see design notes on random-within-bucket insertion).
    fn add_to_pick_list(&mut self, piece: PieceIndex) {
        if self.dirty {
            // deferred; `rebuild_pick_list` will pick this piece up since it
            // rescans all pieces from scratch.
            return;
        }
        let bucket = self.bucket_of(piece);
        let bucket_start = if bucket == 0 {
            0
        } else {
            self.priority_boundaries[bucket - 1]
        };
        let bucket_end = self.priority_boundaries[bucket];

        self.pick_list.insert(bucket_end, piece);
        for boundary in &mut self.priority_boundaries[bucket..] {
            *boundary += 1;
        }

        if bucket_end > bucket_start {
            let swap_with = bucket_start
                + rand::thread_rng().gen_range(0..(bucket_end - bucket_start + 1));
            self.pick_list.swap(swap_with, bucket_end);
        }

        self.reindex_range(bucket_start, self.pick_list.len());
    }

    fn remove_from_pick_list(&mut self, piece: PieceIndex) {
        if self.dirty {
            return;
        }
        let index = match self.pieces[piece].index_in_pick_list {
            Some(i) => i,
            None => return,
        };
        let bucket = self.bucket_of(piece);
        self.pick_list.remove(index);
        for boundary in &mut self.priority_boundaries[bucket..] {
            *boundary = boundary.saturating_sub(1);
        }
        self.pieces[piece].index_in_pick_list = None;
        self.reindex_range(index, self.pick_list.len());
    }

    fn reindex_range(&mut self, from: usize, to: usize) {
        for (i, &p) in self.pick_list[from..to].iter().enumerate() {
            self.pieces[p].index_in_pick_list = Some(from + i);
        }
    }

    /// Recomputes `pick_list` and `priority_boundaries` from scratch,
    /// shuffling each priority bucket uniformly. Deferred bulk refcount
    /// updates funnel here on the next pick.
    fn rebuild_pick_list(&mut self) {
        let mut buckets: Vec<Vec<PieceIndex>> = vec![Vec::new(); 16];
        for (piece, pos) in self.pieces.iter().enumerate() {
            if pos.is_pickable() {
                let bucket = pos.priority.0 as usize * 2
                    + if self.downloading_index.contains_key(&piece) {
                        1
                    } else {
                        0
                    };
                buckets[bucket].push(piece);
            }
        }

        let mut rng = rand::thread_rng();
        for bucket in &mut buckets {
            // Fisher-Yates
            for i in (1..bucket.len()).rev() {
                let j = rng.gen_range(0..=i);
                bucket.swap(i, j);
            }
        }

        self.pick_list.clear();
        self.priority_boundaries = vec![0; 16];
        let mut cumulative = 0;
        for (level, bucket) in buckets.into_iter().enumerate() {
            cumulative += bucket.len();
            self.pick_list.extend(bucket);
            self.priority_boundaries[level] = cumulative;
        }

        self.reindex_range(0, self.pick_list.len());
        self.dirty = false;
    }

    fn ensure_fresh_pick_list(&mut self) {
        if self.dirty {
            self.rebuild_pick_list();
        }
    }

    // -- refcounts --------------------------------------------------------

    /// A single connected non-seed peer now advertises `piece`.
    pub fn inc_refcount(&mut self, piece: PieceIndex) -> Result<()> {
        self.check_piece(piece)?;
        self.pieces[piece].peer_count += 1;
        Ok(())
    }

    /// The peer that previously advertised `piece` disconnected or sent
    /// `dont_have`.
    pub fn dec_refcount(&mut self, piece: PieceIndex) -> Result<()> {
        self.check_piece(piece)?;
        self.pieces[piece].peer_count =
            self.pieces[piece].peer_count.saturating_sub(1);
        Ok(())
    }

    /// Applies a peer's full bitfield. If 50 or more pieces would change
    /// and the list is not already dirty, marks it dirty instead of
    /// re-slotting each piece individually.
    pub fn inc_refcount_bitfield(&mut self, bitfield: &crate::Bitfield) {
        let changes = bitfield.count_ones();
        if changes >= 50 && !self.dirty {
            self.dirty = true;
        }
        for (piece, has) in bitfield.iter().enumerate() {
            if *has && piece < self.pieces.len() {
                self.pieces[piece].peer_count += 1;
            }
        }
    }

    pub fn dec_refcount_bitfield(&mut self, bitfield: &crate::Bitfield) {
        let changes = bitfield.count_ones();
        if changes >= 50 && !self.dirty {
            self.dirty = true;
        }
        for (piece, has) in bitfield.iter().enumerate() {
            if *has && piece < self.pieces.len() {
                self.pieces[piece].peer_count =
                    self.pieces[piece].peer_count.saturating_sub(1);
            }
        }
    }

    /// A seed connected. Counted in a scalar rather than decomposed into
    /// per-piece counts until it signals it's missing a specific piece.
    pub fn inc_refcount_seed(&mut self) {
        self.seed_count += 1;
    }

    pub fn dec_refcount_seed(&mut self) {
        self.seed_count = self.seed_count.saturating_sub(1);
    }

    /// A peer we had accounted for as a seed turns out not to have
    /// `piece` (sent `have_none` then a later `dont_have`, or its bitfield
    /// wasn't all-ones after all). Converts its contribution from the
    /// scalar `seed_count` into explicit per-piece counts for every piece
    /// except `piece`.
    pub fn break_one_seed(&mut self) {
        if self.seed_count == 0 {
            return;
        }
        self.seed_count -= 1;
        for pos in &mut self.pieces {
            pos.peer_count += 1;
        }
    }

    // -- have / finish ----------------------------------------------------

    /// Marks a piece as fully verified and owned, removing it from the pick
    /// list and destroying any downloading-piece record for it (I3).
    pub fn we_have(&mut self, piece: PieceIndex) -> Result<()> {
        self.check_piece(piece)?;
        if self.pieces[piece].have {
            return Ok(());
        }
        if self.pieces[piece].is_pickable() {
            self.remove_from_pick_list(piece);
        }
        self.pieces[piece].have = true;
        self.num_have += 1;
        if self.pieces[piece].priority == Priority::DONT_DOWNLOAD {
            self.num_have_filtered += 1;
        }
        self.destroy_downloading(piece);
        Ok(())
    }

    pub fn have(&self, piece: PieceIndex) -> Result<bool> {
        self.check_piece(piece)?;
        Ok(self.pieces[piece].have)
    }

    fn destroy_downloading(&mut self, piece: PieceIndex) {
        if let Some(index) = self.downloading_index.remove(&piece) {
            let record = self.downloading.swap_remove(index);
            self.blocks.free(record.slot);
            // swap_remove moved the last element into `index`; fix its
            // index if it wasn't the one we just removed.
            if index < self.downloading.len() {
                let moved = self.downloading[index].piece;
                self.downloading_index.insert(moved, index);
            }
        }
    }

    fn get_or_create_downloading(&mut self, piece: PieceIndex) -> usize {
        if let Some(&index) = self.downloading_index.get(&piece) {
            return index;
        }
        let block_count = self.block_count_in(piece);
        let slot = self.blocks.alloc();
        let index = self.downloading.len();
        self.downloading.push(DownloadingPiece {
            piece,
            slot,
            block_count,
            requested: 0,
            writing: 0,
            finished: 0,
            passed_hash_check: false,
            locked: false,
        });
        self.downloading_index.insert(piece, index);
        self.touch_extent(piece);
        // The piece just moved from the open to the downloading bucket;
        // re-slot it so it outranks open pieces of the same priority.
        self.update_piece_priority_for_state(piece);
        index
    }

    /// Re-slots `piece` within the pick list after its downloading/open
    /// bucket changed (see [`Self::bucket_of`]). No-op if the piece isn't
    /// pickable (filtered or already `have`) or a bulk rebuild is already
    /// pending, since the next rebuild will pick up the new bucket anyway.
    fn update_piece_priority_for_state(&mut self, piece: PieceIndex) {
        if self.dirty || !self.pieces[piece].is_pickable() {
            return;
        }
        self.remove_from_pick_list(piece);
        self.add_to_pick_list(piece);
    }

    // -- block state transitions ------------------------------------------

    /// Marks `block` as requested from `peer`. Returns `false` (no change)
    /// if the block is already in a later state.
    pub fn mark_as_requested(
        &mut self,
        block: BlockInfo,
        peer: PeerId,
    ) -> Result<bool> {
        self.check_piece(block.piece_index)?;
        let index = self.get_or_create_downloading(block.piece_index);
        let block_index = block.index_in_piece();
        let block_count = self.downloading[index].block_count;
        let slot = self.downloading[index].slot;
        let record = &mut self.blocks.blocks_mut(slot, block_count)
            [block_index.min(block_count - 1)];
        if !matches!(record.state, BlockState::None) {
            return Ok(false);
        }
        record.state = BlockState::Requested;
        record.num_peers = 1;
        if record.peer.is_none() {
            record.peer = Some(peer);
        }
        self.downloading[index].requested += 1;
        self.update_piece_priority_for_state(block.piece_index);
        Ok(true)
    }

    /// The block's bytes arrived and are queued for a disk write.
    pub fn mark_as_writing(
        &mut self,
        block: BlockInfo,
        peer: PeerId,
    ) -> Result<bool> {
        self.check_piece(block.piece_index)?;
        let index = self.get_or_create_downloading(block.piece_index);
        let block_index = block.index_in_piece();
        let block_count = self.downloading[index].block_count;
        let slot = self.downloading[index].slot;
        let record = &mut self.blocks.blocks_mut(slot, block_count)
            [block_index.min(block_count - 1)];
        if matches!(record.state, BlockState::Writing | BlockState::Finished) {
            return Ok(false);
        }
        if matches!(record.state, BlockState::Requested) {
            self.downloading[index].requested -= 1;
        }
        record.state = BlockState::Writing;
        record.num_peers = 0;
        record.peer = Some(peer);
        self.downloading[index].writing += 1;
        Ok(true)
    }

    /// The disk write for `block` completed. If this was the piece's last
    /// outstanding block, the caller should issue a hash check.
    pub fn mark_as_finished(
        &mut self,
        block: BlockInfo,
        peer: PeerId,
    ) -> Result<bool> {
        self.check_piece(block.piece_index)?;
        let index = self.get_or_create_downloading(block.piece_index);
        let block_index = block.index_in_piece();
        let block_count = self.downloading[index].block_count;
        let slot = self.downloading[index].slot;
        let record = &mut self.blocks.blocks_mut(slot, block_count)
            [block_index.min(block_count - 1)];
        if matches!(record.state, BlockState::Finished) {
            return Ok(false);
        }
        match record.state {
            BlockState::Requested => self.downloading[index].requested -= 1,
            BlockState::Writing => self.downloading[index].writing -= 1,
            _ => {}
        }
        record.state = BlockState::Finished;
        record.num_peers = 0;
        record.peer = Some(peer);
        self.downloading[index].finished += 1;
        Ok(true)
    }

    /// Returns true if the piece is fully finished (all blocks written).
    pub fn is_piece_finished(&self, piece: PieceIndex) -> bool {
        self.downloading_index
            .get(&piece)
            .map(|&i| self.downloading[i].state() == PieceState::Finished)
            .unwrap_or(false)
    }

    /// The verifier confirmed this piece's hash (but a disk flush might
    /// still be pending for its last block).
    pub fn piece_passed(&mut self, piece: PieceIndex) {
        if let Some(&index) = self.downloading_index.get(&piece) {
            self.downloading[index].passed_hash_check = true;
        }
    }

    /// Reverts a block from `writing` back to `none`, locks the piece so no
    /// further requests go out for it, and tells the caller whether the
    /// piece had already passed its hash check (in which case the caller
    /// should decredit that state too).
    pub fn write_failed(&mut self, block: BlockInfo) -> Result<()> {
        self.check_piece(block.piece_index)?;
        let index = self.get_or_create_downloading(block.piece_index);
        let block_index = block.index_in_piece();
        let block_count = self.downloading[index].block_count;
        let slot = self.downloading[index].slot;
        let record = &mut self.blocks.blocks_mut(slot, block_count)
            [block_index.min(block_count - 1)];
        if matches!(record.state, BlockState::Writing) {
            self.downloading[index].writing -= 1;
        }
        record.state = BlockState::None;
        record.num_peers = 0;
        record.peer = None;
        self.downloading[index].passed_hash_check = false;
        self.downloading[index].locked = true;
        Ok(())
    }

    /// Unlocks a piece after its hash failed and the disk cache for it was
    /// cleared, so it is eligible for re-download.
    pub fn restore_piece(&mut self, piece: PieceIndex) -> Result<()> {
        self.check_piece(piece)?;
        if let Some(&index) = self.downloading_index.get(&piece) {
            let record = &mut self.downloading[index];
            record.locked = false;
            record.requested = 0;
            record.writing = 0;
            record.finished = 0;
            let block_count = record.block_count;
            let slot = record.slot;
            for b in self.blocks.blocks_mut(slot, block_count) {
                *b = Default::default();
            }
        }
        Ok(())
    }

    pub fn is_locked(&self, piece: PieceIndex) -> bool {
        self.downloading_index
            .get(&piece)
            .map(|&i| self.downloading[i].locked)
            .unwrap_or(false)
    }

    /// Returns the distinct peers that contributed a block to `piece`,
    /// for the verifier to attribute trust credit/decredit to after a hash
    /// check (S3). Empty if the piece has no downloading-piece record
    /// (e.g. it was restored and re-finished by the time this is called).
    pub fn contributing_peers(&self, piece: PieceIndex) -> Vec<PeerId> {
        let index = match self.downloading_index.get(&piece) {
            Some(&i) => i,
            None => return Vec::new(),
        };
        let block_count = self.downloading[index].block_count;
        let slot = self.downloading[index].slot;
        let mut peers = Vec::new();
        for record in self.blocks.blocks(slot, block_count) {
            if let Some(peer) = record.peer {
                if !peers.contains(&peer) {
                    peers.push(peer);
                }
            }
        }
        peers
    }

    /// Locks a fully-hashed piece whose hash check failed, without
    /// resetting its blocks (the caller still needs [`Self::contributing_peers`]
    /// before the disk write-cache clear completes and [`Self::restore_piece`]
    /// wipes them).
    pub fn fail_piece(&mut self, piece: PieceIndex) -> Result<()> {
        self.check_piece(piece)?;
        let index = self.get_or_create_downloading(piece);
        self.downloading[index].passed_hash_check = false;
        self.downloading[index].locked = true;
        Ok(())
    }

    // -- picking ------------------------------------------------------------

    /// Picks up to `max_blocks` blocks to request from `requester`, given
    /// its bitfield and, if any, the pieces it has suggested (BEP 6). Walk
    /// order follows §4.2: partials, suggested pieces, the mode-specific
    /// walk (which also drains the two backup lists it collects), then
    /// end-game. `prefer_contiguous` asks `add_blocks_downloading` to favor
    /// runs of adjacent blocks over scattering requests within a piece.
    pub fn pick_pieces(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        mode: PickMode,
        prefer_contiguous: bool,
        on_parole: bool,
        end_game: bool,
        suggested: &[PieceIndex],
        requester: PeerId,
    ) -> Vec<BlockInfo> {
        let mut picks = Vec::with_capacity(max_blocks);
        let mut backup1 = Vec::new();
        let mut backup2 = Vec::new();

        if self.prioritize_partials
            || self.downloading.len() > self.max_partial_pieces
        {
            self.pick_from_partials(
                peer_has,
                max_blocks,
                requester,
                on_parole,
                prefer_contiguous,
                &mut picks,
                &mut backup2,
            );
        }

        if picks.len() < max_blocks {
            self.pick_suggested(
                peer_has,
                max_blocks,
                requester,
                on_parole,
                prefer_contiguous,
                suggested,
                &mut picks,
                &mut backup2,
            );
        }

        if picks.len() < max_blocks {
            self.ensure_fresh_pick_list();
            match mode {
                PickMode::Sequential | PickMode::TimeCritical => {
                    self.pick_sequential(
                        peer_has,
                        max_blocks,
                        requester,
                        on_parole,
                        prefer_contiguous,
                        &mut picks,
                        &mut backup1,
                        &mut backup2,
                    );
                }
                PickMode::RarestFirst | PickMode::Default => {
                    self.pick_rarest_first(
                        peer_has,
                        max_blocks,
                        requester,
                        on_parole,
                        prefer_contiguous,
                        &mut picks,
                        &mut backup1,
                        &mut backup2,
                    );
                }
            }
        }

        if picks.len() < max_blocks {
            let take = (max_blocks - picks.len()).min(backup1.len());
            picks.extend(backup1.drain(0..take));
        }
        if picks.len() < max_blocks {
            let take = (max_blocks - picks.len()).min(backup2.len());
            picks.extend(backup2.drain(0..take));
        }

        if picks.len() < max_blocks && end_game && !on_parole {
            self.pick_end_game(peer_has, max_blocks, &mut picks);
        }

        picks
    }

    fn pick_from_partials(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        requester: PeerId,
        on_parole: bool,
        prefer_contiguous: bool,
        picks: &mut Vec<BlockInfo>,
        backup2: &mut Vec<BlockInfo>,
    ) {
        let mut ordered: Vec<usize> = (0..self.downloading.len()).collect();
        ordered.sort_by_key(|&i| {
            let piece = self.downloading[i].piece;
            self.pieces[piece].peer_count
        });

        for i in ordered {
            if picks.len() >= max_blocks {
                break;
            }
            let piece = self.downloading[i].piece;
            if self.downloading[i].locked {
                continue;
            }
            if piece >= peer_has.len() || !peer_has[piece] {
                continue;
            }
            let want = max_blocks - picks.len();
            self.add_blocks_downloading(
                piece,
                want,
                requester,
                on_parole,
                prefer_contiguous,
                picks,
                backup2,
            );
        }
    }

    /// Walks the pieces `requester` suggested to us (BEP 6 `suggest
    /// piece`), second in the pick precedence after in-progress partials.
    fn pick_suggested(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        requester: PeerId,
        on_parole: bool,
        prefer_contiguous: bool,
        suggested: &[PieceIndex],
        picks: &mut Vec<BlockInfo>,
        backup2: &mut Vec<BlockInfo>,
    ) {
        for &piece in suggested {
            if picks.len() >= max_blocks {
                break;
            }
            if piece >= self.pieces.len() || !self.pieces[piece].is_pickable()
            {
                continue;
            }
            if piece >= peer_has.len() || !peer_has[piece] {
                continue;
            }
            if self.is_locked(piece) {
                continue;
            }
            let want = max_blocks - picks.len();
            self.get_or_create_downloading(piece);
            self.add_blocks_downloading(
                piece,
                want,
                requester,
                on_parole,
                prefer_contiguous,
                picks,
                backup2,
            );
        }
    }

    /// Requests `none` blocks within a single downloading piece, up to
    /// `want` of them, enforcing the parole and contiguous-run rules of
    /// §4.2. `exclusive` holds when every block already claimed in this
    /// piece was claimed by `requester` alone; `exclusive_active` further
    /// requires one of those blocks to already be writing or finished
    /// (not merely requested), the stronger bar needed to override an
    /// insufficient contiguous run. An on-parole `requester` is refused
    /// outright unless the piece is exclusively theirs, so blame for a
    /// future bad hash stays unambiguous. Rejected contiguous-preference
    /// picks are appended to `backup2` rather than `picks`.
    fn add_blocks_downloading(
        &mut self,
        piece: PieceIndex,
        want: usize,
        requester: PeerId,
        on_parole: bool,
        prefer_contiguous: bool,
        picks: &mut Vec<BlockInfo>,
        backup2: &mut Vec<BlockInfo>,
    ) {
        if want == 0 {
            return;
        }
        let index = match self.downloading_index.get(&piece) {
            Some(&i) => i,
            None => return,
        };
        if self.downloading[index].locked {
            return;
        }
        let block_count = self.downloading[index].block_count;
        let slot = self.downloading[index].slot;
        let piece_len = self.piece_len(piece);
        let records = self.blocks.blocks(slot, block_count);

        let mut exclusive = true;
        let mut exclusive_active = false;
        for record in records {
            if let Some(peer) = record.peer {
                if peer != requester {
                    exclusive = false;
                } else if matches!(
                    record.state,
                    BlockState::Writing | BlockState::Finished
                ) {
                    exclusive_active = true;
                }
            }
        }
        if !exclusive {
            exclusive_active = false;
        }

        if on_parole && !exclusive {
            return;
        }

        // Longest run of `none` blocks, wrapping, so a contiguous request
        // doesn't have to start at block 0.
        let mut run_start = 0;
        let mut run_len = 0;
        let mut cur_start = 0;
        let mut cur_len = 0;
        for (i, record) in records.iter().enumerate() {
            if matches!(record.state, BlockState::None) {
                if cur_len == 0 {
                    cur_start = i;
                }
                cur_len += 1;
                if cur_len > run_len {
                    run_len = cur_len;
                    run_start = cur_start;
                }
            } else {
                cur_len = 0;
            }
        }
        if run_len == 0 {
            return;
        }

        let target = if prefer_contiguous && run_len < want && !exclusive_active {
            &mut *backup2
        } else {
            &mut *picks
        };

        let mut taken = 0;
        let mut i = run_start;
        let mut scanned = 0;
        while taken < want && scanned < block_count {
            if matches!(records[i].state, BlockState::None) {
                let offset = i as u32 * crate::BLOCK_LEN;
                target.push(BlockInfo {
                    piece_index: piece,
                    offset,
                    len: block_len(piece_len, i),
                });
                taken += 1;
            }
            i = (i + 1) % block_count;
            scanned += 1;
        }
    }

    fn piece_len(&self, piece: PieceIndex) -> u32 {
        if piece == self.pieces.len() - 1 {
            self.last_piece_len
        } else {
            self.nominal_piece_len
        }
    }

    fn extent_of(&self, piece: PieceIndex) -> usize {
        piece / self.extent_len.max(1)
    }

    /// Records that `piece` was just touched (a block in it was
    /// requested), promoting its extent to most-recently-used.
    fn touch_extent(&mut self, piece: PieceIndex) {
        let extent = self.extent_of(piece);
        self.extents.put(extent, ());
    }

    fn extent_range(&self, extent: usize) -> std::ops::Range<PieceIndex> {
        let start = extent * self.extent_len;
        let end = ((extent + 1) * self.extent_len).min(self.pieces.len());
        start..end
    }

    fn extent_fully_have(&self, extent: usize) -> bool {
        self.extent_range(extent).all(|p| self.pieces[p].have)
    }

    /// Scans the most-recently-touched extents first, to keep a peer's
    /// requests clustered for disk locality, before the caller falls back
    /// to the flat priority-bucket walk. Extents whose pieces are all
    /// `have` are evicted as they're found.
    fn pick_extent_affinity(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        requester: PeerId,
        on_parole: bool,
        prefer_contiguous: bool,
        picks: &mut Vec<BlockInfo>,
        backup2: &mut Vec<BlockInfo>,
    ) {
        let recent: Vec<usize> =
            self.extents.iter().map(|(extent, _)| *extent).collect();
        for extent in recent {
            if picks.len() >= max_blocks {
                break;
            }
            if self.extent_fully_have(extent) {
                self.extents.pop(&extent);
                continue;
            }
            for piece in self.extent_range(extent) {
                if picks.len() >= max_blocks {
                    break;
                }
                if !self.pieces[piece].is_pickable() {
                    continue;
                }
                if piece >= peer_has.len() || !peer_has[piece] {
                    continue;
                }
                if self.is_locked(piece) {
                    continue;
                }
                let want = max_blocks - picks.len();
                self.get_or_create_downloading(piece);
                self.add_blocks_downloading(
                    piece,
                    want,
                    requester,
                    on_parole,
                    prefer_contiguous,
                    picks,
                    backup2,
                );
            }
        }
    }

    fn pick_rarest_first(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        requester: PeerId,
        on_parole: bool,
        prefer_contiguous: bool,
        picks: &mut Vec<BlockInfo>,
        backup1: &mut Vec<BlockInfo>,
        backup2: &mut Vec<BlockInfo>,
    ) {
        self.pick_extent_affinity(
            peer_has,
            max_blocks,
            requester,
            on_parole,
            prefer_contiguous,
            picks,
            backup2,
        );
        if picks.len() >= max_blocks {
            return;
        }

        // walk highest-priority bucket first, which is the end of the
        // flat pick list since boundaries are cumulative low-to-high.
        let candidates: Vec<PieceIndex> =
            self.pick_list.iter().rev().copied().collect();
        for piece in candidates {
            if picks.len() >= max_blocks {
                break;
            }
            if piece >= peer_has.len() || !peer_has[piece] {
                continue;
            }
            if self.is_locked(piece) {
                continue;
            }
            let want = max_blocks - picks.len();
            // A piece someone else already started is fair game, but a
            // fresh one is preferred so work isn't needlessly spread thin;
            // park it in `backup1` unless partials are being prioritized.
            let already_downloading =
                self.downloading_index.contains_key(&piece);
            self.get_or_create_downloading(piece);
            let target: &mut Vec<BlockInfo> =
                if already_downloading && !self.prioritize_partials {
                    &mut *backup1
                } else {
                    &mut *picks
                };
            self.add_blocks_downloading(
                piece,
                want,
                requester,
                on_parole,
                prefer_contiguous,
                target,
                backup2,
            );
        }
    }

    fn pick_sequential(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        requester: PeerId,
        on_parole: bool,
        prefer_contiguous: bool,
        picks: &mut Vec<BlockInfo>,
        backup1: &mut Vec<BlockInfo>,
        backup2: &mut Vec<BlockInfo>,
    ) {
        for piece in 0..self.pieces.len() {
            if picks.len() >= max_blocks {
                break;
            }
            if !self.pieces[piece].is_pickable() {
                continue;
            }
            if piece >= peer_has.len() || !peer_has[piece] {
                continue;
            }
            if self.is_locked(piece) {
                continue;
            }
            let want = max_blocks - picks.len();
            let already_downloading =
                self.downloading_index.contains_key(&piece);
            self.get_or_create_downloading(piece);
            let target: &mut Vec<BlockInfo> =
                if already_downloading && !self.prioritize_partials {
                    &mut *backup1
                } else {
                    &mut *picks
                };
            self.add_blocks_downloading(
                piece,
                want,
                requester,
                on_parole,
                prefer_contiguous,
                target,
                backup2,
            );
        }
    }

    /// End-game: pick an already-requested block (from a different peer)
    /// preferring the lowest-availability pieces.
    fn pick_end_game(
        &mut self,
        peer_has: &crate::Bitfield,
        max_blocks: usize,
        picks: &mut Vec<BlockInfo>,
    ) {
        let mut ordered: Vec<usize> = (0..self.downloading.len()).collect();
        ordered.sort_by_key(|&i| {
            let piece = self.downloading[i].piece;
            self.pieces[piece].peer_count
        });

        'pieces: for i in ordered {
            if picks.len() >= max_blocks {
                break;
            }
            let piece = self.downloading[i].piece;
            if self.downloading[i].locked {
                continue;
            }
            if piece >= peer_has.len() || !peer_has[piece] {
                continue;
            }
            let block_count = self.downloading[i].block_count;
            let slot = self.downloading[i].slot;
            let piece_len = self.piece_len(piece);
            for (block_index, record) in
                self.blocks.blocks(slot, block_count).iter().enumerate()
            {
                if picks.len() >= max_blocks {
                    break 'pieces;
                }
                if matches!(record.state, BlockState::Requested) {
                    let offset = block_index as u32 * crate::BLOCK_LEN;
                    picks.push(BlockInfo {
                        piece_index: piece,
                        offset,
                        len: block_len(piece_len, block_index),
                    });
                }
            }
        }
    }

    // -- statistics -----------------------------------------------------

    /// A second-order availability estimate: on average, how many complete
    /// copies of the torrent are available from currently-accounted peers.
    /// Returned as `(integer part, fractional part in parts-per-thousand)`,
    /// matching the original's split representation (see DESIGN.md for the
    /// exact formula chosen here, since the BitTorrent protocol doesn't
    /// define one).
    pub fn distributed_copies(&self) -> (u32, u32) {
        if self.pieces.is_empty() {
            return (0, 0);
        }
        // pieces with the fewest copies form the bottleneck; average their
        // counts (plus the scalar seed count, which by definition holds
        // every piece) to get a single "copies" figure.
        let min_count = self
            .pieces
            .iter()
            .map(|p| p.peer_count)
            .min()
            .unwrap_or(0);
        let total: u64 = self
            .pieces
            .iter()
            .map(|p| (p.peer_count + self.seed_count) as u64)
            .sum();
        let avg_milli = total * 1000 / self.pieces.len() as u64;
        let integral = (min_count as u64 + self.seed_count as u64) as u32;
        let fractional = (avg_milli % 1000) as u32;
        (integral, fractional)
    }

    pub fn num_have(&self) -> usize {
        self.num_have
    }

    pub fn num_pieces_downloading(&self) -> usize {
        self.downloading.len()
    }

    /// The number of pieces that aren't set to [`Priority::DONT_DOWNLOAD`],
    /// i.e. how many pieces a torrent needs in hand to count as complete.
    pub fn num_wanted(&self) -> usize {
        self.pieces.len() - self.num_filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield_all(n: usize) -> crate::Bitfield {
        let mut bf = crate::Bitfield::new();
        bf.resize(n, true);
        bf
    }

    const PEER_A: PeerId = [1; 20];
    const PEER_B: PeerId = [2; 20];

    #[test]
    fn new_picker_has_empty_pick_list_until_priority_set() {
        let picker = PiecePicker::new(4, 16 * 1024, 16 * 1024);
        assert_eq!(picker.piece_count(), 4);
        // default priority is downloadable, so all 4 pieces are pickable
        assert_eq!(picker.num_have(), 0);
    }

    #[test]
    fn set_piece_priority_removes_from_pick_list() {
        let mut picker = PiecePicker::new(4, 16 * 1024, 16 * 1024);
        picker
            .set_piece_priority(0, Priority::DONT_DOWNLOAD)
            .unwrap();
        assert_eq!(picker.piece_priority(0).unwrap(), Priority::DONT_DOWNLOAD);
        let peer_has = bitfield_all(4);
        let picks = picker.pick_pieces(
            &peer_has,
            100,
            PickMode::Sequential,
            false,
            false,
            false,
            &[],
            PEER_A,
        );
        assert!(picks.iter().all(|b| b.piece_index != 0));
    }

    #[test]
    fn we_have_excludes_piece_from_future_picks() {
        let mut picker = PiecePicker::new(2, 16 * 1024, 16 * 1024);
        picker.we_have(0).unwrap();
        assert!(picker.have(0).unwrap());
        let peer_has = bitfield_all(2);
        let picks = picker.pick_pieces(
            &peer_has,
            100,
            PickMode::Sequential,
            false,
            false,
            false,
            &[],
            PEER_A,
        );
        assert!(picks.iter().all(|b| b.piece_index != 0));
    }

    #[test]
    fn mark_as_requested_then_finished_completes_piece() {
        let mut picker = PiecePicker::new(1, 2 * crate::BLOCK_LEN, 2 * crate::BLOCK_LEN);
        let peer = [1; 20];
        let block0 = BlockInfo { piece_index: 0, offset: 0, len: crate::BLOCK_LEN };
        let block1 = BlockInfo { piece_index: 0, offset: crate::BLOCK_LEN, len: crate::BLOCK_LEN };

        assert!(picker.mark_as_requested(block0, peer).unwrap());
        assert!(picker.mark_as_requested(block1, peer).unwrap());
        assert!(picker.mark_as_writing(block0, peer).unwrap());
        assert!(picker.mark_as_writing(block1, peer).unwrap());
        assert!(picker.mark_as_finished(block0, peer).unwrap());
        assert!(!picker.is_piece_finished(0));
        assert!(picker.mark_as_finished(block1, peer).unwrap());
        assert!(picker.is_piece_finished(0));
    }

    #[test]
    fn write_failed_locks_piece_until_restored() {
        let mut picker = PiecePicker::new(1, crate::BLOCK_LEN, crate::BLOCK_LEN);
        let peer = [1; 20];
        let block = BlockInfo { piece_index: 0, offset: 0, len: crate::BLOCK_LEN };
        picker.mark_as_requested(block, peer).unwrap();
        picker.mark_as_writing(block, peer).unwrap();
        picker.write_failed(block).unwrap();
        assert!(picker.is_locked(0));
        picker.restore_piece(0).unwrap();
        assert!(!picker.is_locked(0));
    }

    #[test]
    fn break_one_seed_converts_scalar_into_per_piece_counts() {
        let mut picker = PiecePicker::new(3, 16 * 1024, 16 * 1024);
        picker.inc_refcount_seed();
        picker.inc_refcount_seed();
        picker.break_one_seed();
        assert_eq!(picker.seed_count, 1);
        for piece in &picker.pieces {
            assert_eq!(piece.peer_count, 1);
        }
    }

    #[test]
    fn bulk_bitfield_update_marks_list_dirty_and_rebuilds_on_pick() {
        let mut picker = PiecePicker::new(60, 16 * 1024, 16 * 1024);
        let bf = bitfield_all(60);
        picker.inc_refcount_bitfield(&bf);
        assert!(picker.dirty);
        let picks = picker.pick_pieces(
            &bf,
            10,
            PickMode::RarestFirst,
            false,
            false,
            false,
            &[],
            PEER_A,
        );
        assert!(!picker.dirty);
        assert!(!picks.is_empty());
    }

    #[test]
    fn end_game_repicks_already_requested_block() {
        let mut picker = PiecePicker::new(1, crate::BLOCK_LEN, crate::BLOCK_LEN);
        let peer_a = [1; 20];
        let bf = bitfield_all(1);
        let first = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            false,
            false,
            &[],
            peer_a,
        );
        assert_eq!(first.len(), 1);
        picker.mark_as_requested(first[0], peer_a).unwrap();

        let second = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            false,
            true,
            &[],
            peer_a,
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0], first[0]);
    }

    #[test]
    fn suggested_piece_is_picked_before_normal_walk() {
        let mut picker = PiecePicker::new(4, 16 * 1024, 16 * 1024);
        let bf = bitfield_all(4);
        // Suggest piece 3, which a plain sequential walk would pick last.
        let picks = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            false,
            false,
            &[3],
            PEER_A,
        );
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].piece_index, 3);
    }

    #[test]
    fn on_parole_peer_is_refused_a_shared_piece() {
        let mut picker = PiecePicker::new(1, 2 * crate::BLOCK_LEN, 2 * crate::BLOCK_LEN);
        let bf = bitfield_all(1);
        // Peer A starts the piece first.
        let first = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            false,
            false,
            &[],
            PEER_A,
        );
        assert_eq!(first.len(), 1);

        // Peer B is on parole and must not be handed a block of a piece
        // someone else is already downloading.
        let second = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            true,
            false,
            &[],
            PEER_B,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn on_parole_peer_may_continue_its_own_exclusive_piece() {
        let mut picker = PiecePicker::new(1, 2 * crate::BLOCK_LEN, 2 * crate::BLOCK_LEN);
        let bf = bitfield_all(1);
        let first = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            false,
            false,
            &[],
            PEER_A,
        );
        assert_eq!(first.len(), 1);

        // Same peer continuing the piece it exclusively holds is fine even
        // while on parole.
        let second = picker.pick_pieces(
            &bf,
            1,
            PickMode::Sequential,
            false,
            true,
            false,
            &[],
            PEER_A,
        );
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn downloading_piece_outranks_open_piece_of_same_priority() {
        let mut picker = PiecePicker::new(4, 16 * 1024, 16 * 1024);
        // All four pieces start at the same default priority, so they
        // share the same base bucket.
        let base = picker.bucket_of(0);
        assert_eq!(picker.bucket_of(1), base);

        picker.get_or_create_downloading(1);

        // Piece 1 moved into the downloading sub-bucket, one above the
        // still-open pieces of the same priority.
        assert_eq!(picker.bucket_of(1), base + 1);
        assert_eq!(picker.bucket_of(0), base);
    }
}
