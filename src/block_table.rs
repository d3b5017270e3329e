//! Pooled storage for per-block bookkeeping records.
//!
//! [`PiecePicker`](crate::piece_picker::PiecePicker) needs a place to park
//! per-block state (`none`/`requested`/`writing`/`finished`, the peer that
//! requested it, etc.) for every piece that is currently downloading. Rather
//! than growing and shrinking a `Vec` per downloading piece, we carve fixed
//! size chunks of `blocks_per_piece` records out of one contiguous pool and
//! hand out chunk indices; destroyed pieces return their chunk to a
//! free-list for O(1) reuse. This mirrors libtorrent's `block_info`
//! allocation inside `piece_picker`, but as a standalone, independently
//! testable type.

use crate::PeerId;

/// The state of a single block within a downloading piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Not requested from anyone.
    None,
    /// Outstanding request(s) for this block.
    Requested,
    /// The block has arrived and is queued for (or undergoing) a disk
    /// write.
    Writing,
    /// The disk write completed.
    Finished,
}

impl Default for BlockState {
    fn default() -> Self {
        Self::None
    }
}

/// A single pooled block-info record.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BlockRecord {
    pub state: BlockState,
    /// Number of peers with an outstanding request for this block. Always 0
    /// once `state` reaches `Writing` or `Finished` (I2).
    pub num_peers: u32,
    /// The first peer to request (or deliver) this block.
    pub peer: Option<PeerId>,
}

impl BlockRecord {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A handle to a contiguous range of [`BlockRecord`]s allocated for one
/// downloading piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockTableSlot {
    base: usize,
}

/// Pooled, free-list-backed storage of [`BlockRecord`]s.
///
/// All chunks are the same fixed size (`blocks_per_piece`, the maximum
/// number of blocks in any piece of the torrent); the last piece's view into
/// its chunk is simply truncated to its actual, possibly smaller, block
/// count.
#[derive(Debug)]
pub(crate) struct BlockTable {
    blocks_per_piece: usize,
    records: Vec<BlockRecord>,
    free_chunks: Vec<usize>,
}

impl BlockTable {
    /// Creates an empty table for a torrent whose largest piece holds
    /// `blocks_per_piece` blocks.
    pub fn new(blocks_per_piece: usize) -> Self {
        Self {
            blocks_per_piece,
            records: Vec::new(),
            free_chunks: Vec::new(),
        }
    }

    /// Allocates a new chunk of `blocks_per_piece` records, all in state
    /// `None`, returning a slot that addresses it. O(1) amortized: reuses a
    /// freed chunk if one is available, otherwise grows the pool.
    pub fn alloc(&mut self) -> BlockTableSlot {
        if let Some(base) = self.free_chunks.pop() {
            for record in &mut self.records[base..base + self.blocks_per_piece]
            {
                record.reset();
            }
            return BlockTableSlot { base };
        }
        let base = self.records.len();
        self.records
            .resize(base + self.blocks_per_piece, BlockRecord::default());
        BlockTableSlot { base }
    }

    /// Returns a chunk to the free-list so it may be reused by a later
    /// `alloc`. The slot must not be used again afterwards.
    pub fn free(&mut self, slot: BlockTableSlot) {
        debug_assert!(slot.base < self.records.len());
        debug_assert!(slot.base % self.blocks_per_piece == 0);
        self.free_chunks.push(slot.base);
    }

    /// Returns the view of a piece's blocks, truncated to `block_count`
    /// (which may be less than `blocks_per_piece` for the torrent's last
    /// piece).
    pub fn blocks(
        &self,
        slot: BlockTableSlot,
        block_count: usize,
    ) -> &[BlockRecord] {
        debug_assert!(block_count <= self.blocks_per_piece);
        &self.records[slot.base..slot.base + block_count]
    }

    /// Mutable counterpart of [`BlockTable::blocks`].
    pub fn blocks_mut(
        &mut self,
        slot: BlockTableSlot,
        block_count: usize,
    ) -> &mut [BlockRecord] {
        debug_assert!(block_count <= self.blocks_per_piece);
        &mut self.records[slot.base..slot.base + block_count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_gives_fresh_zeroed_chunk() {
        let mut table = BlockTable::new(4);
        let slot = table.alloc();
        for block in table.blocks(slot, 4) {
            assert_eq!(block.state, BlockState::None);
            assert_eq!(block.num_peers, 0);
        }
    }

    #[test]
    fn freed_chunk_is_reused_and_reset() {
        let mut table = BlockTable::new(4);
        let slot = table.alloc();
        table.blocks_mut(slot, 4)[0].state = BlockState::Finished;
        table.free(slot);

        let reused = table.alloc();
        assert_eq!(reused, slot, "freeing then allocating should reuse the chunk");
        for block in table.blocks(reused, 4) {
            assert_eq!(block.state, BlockState::None);
        }
        // only one chunk was ever allocated
        assert!(table.free_chunks.is_empty());
    }

    #[test]
    fn last_piece_view_is_truncated() {
        let mut table = BlockTable::new(4);
        let slot = table.alloc();
        assert_eq!(table.blocks(slot, 1).len(), 1);
        assert_eq!(table.blocks(slot, 4).len(), 4);
    }

    #[test]
    fn two_live_chunks_do_not_alias() {
        let mut table = BlockTable::new(2);
        let a = table.alloc();
        let b = table.alloc();
        assert_ne!(a, b);
        table.blocks_mut(a, 2)[0].state = BlockState::Requested;
        assert_eq!(table.blocks(b, 2)[0].state, BlockState::None);
    }
}
