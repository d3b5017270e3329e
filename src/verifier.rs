//! Bridges disk hash-check results into [`crate::piece_picker::PiecePicker`]
//! and [`crate::peer_list::PeerList`] trust bookkeeping.
//!
//! This is intentionally a stateless set of associated functions rather
//! than an owned object: the picker and peer list it operates on already
//! live on [`crate::torrent::TorrentCore`], and the verifier has no
//! bookkeeping of its own beyond the piece index it's told about (§4.3).

use crate::{
    error::Result, peer_list::PeerList, piece_picker::PiecePicker, PeerId,
    PieceIndex,
};

/// Trust penalty applied to the sole contributor of a piece that fails its
/// hash check. Harsher than the split penalty below since blame is
/// unambiguous.
const SINGLE_SOURCE_PENALTY: i8 = -2;

/// Trust penalty applied to each of several peers that jointly contributed
/// blocks to a piece that failed its hash check. Blame can't be pinned on
/// any one of them, so each gets off comparatively lightly.
const SHARED_SOURCE_PENALTY: i8 = -1;

pub(crate) struct PieceVerifier;

impl PieceVerifier {
    /// The disk layer reports `piece`'s hash matched. Marks the picker's
    /// bookkeeping and, if every block has also been durably written,
    /// promotes the piece to `have`. Returns whether it did.
    pub fn piece_passed(
        picker: &mut PiecePicker,
        piece: PieceIndex,
    ) -> Result<bool> {
        picker.piece_passed(piece);
        if picker.is_piece_finished(piece) {
            picker.we_have(piece)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The disk layer reports `piece`'s hash did not match. Attributes
    /// trust penalties to the peers that supplied its blocks, locks the
    /// piece against further requests, and reports which peers (if any)
    /// crossed the ban threshold as a result.
    ///
    /// The caller is still responsible for issuing the disk clear for the
    /// piece's write buffer and, once that completes, calling
    /// [`Self::on_piece_sync`] to make the piece requestable again (S3).
    pub fn piece_failed(
        picker: &mut PiecePicker,
        peer_list: &mut PeerList,
        piece: PieceIndex,
    ) -> Result<Vec<PeerId>> {
        let contributors = picker.contributing_peers(piece);
        picker.fail_piece(piece)?;

        let single_source = contributors.len() == 1;
        let penalty = if single_source {
            SINGLE_SOURCE_PENALTY
        } else {
            SHARED_SOURCE_PENALTY
        };

        let mut banned = Vec::new();
        for peer in &contributors {
            if peer_list.apply_trust_penalty(*peer, penalty, single_source) {
                banned.push(*peer);
            }
        }
        Ok(banned)
    }

    /// The disk layer finished clearing the failed piece's write-cache;
    /// restore it so the picker offers it again.
    pub fn on_piece_sync(
        picker: &mut PiecePicker,
        piece: PieceIndex,
    ) -> Result<()> {
        picker.restore_piece(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockInfo;

    fn picker_with_full_piece(peer: PeerId) -> PiecePicker {
        let mut picker = PiecePicker::new(1, crate::BLOCK_LEN, crate::BLOCK_LEN);
        let block =
            BlockInfo { piece_index: 0, offset: 0, len: crate::BLOCK_LEN };
        picker.mark_as_requested(block, peer).unwrap();
        picker.mark_as_writing(block, peer).unwrap();
        picker.mark_as_finished(block, peer).unwrap();
        picker
    }

    #[test]
    fn passed_piece_becomes_have_once_finished() {
        let peer = [1; 20];
        let mut picker = picker_with_full_piece(peer);
        let became_have = PieceVerifier::piece_passed(&mut picker, 0).unwrap();
        assert!(became_have);
        assert!(picker.have(0).unwrap());
    }

    #[test]
    fn failed_piece_single_source_is_banned_after_enough_failures() {
        let peer = [1; 20];
        let mut picker = picker_with_full_piece(peer);
        let mut peer_list = PeerList::new(100);
        let addr = "127.0.0.1:6000".parse().unwrap();
        peer_list.add_candidate(addr, crate::peer_list::Source::TRACKER);
        peer_list.mark_connected(addr, peer, 0);

        // repeatedly fail the same peer until it crosses the ban threshold
        let mut banned = Vec::new();
        for _ in 0..5 {
            banned = PieceVerifier::piece_failed(&mut picker, &mut peer_list, 0)
                .unwrap();
            assert!(picker.is_locked(0));
            PieceVerifier::on_piece_sync(&mut picker, 0).unwrap();
            // re-populate the piece from the same peer for the next round
            let block = BlockInfo {
                piece_index: 0,
                offset: 0,
                len: crate::BLOCK_LEN,
            };
            picker.mark_as_requested(block, peer).unwrap();
            picker.mark_as_writing(block, peer).unwrap();
            picker.mark_as_finished(block, peer).unwrap();
        }
        assert_eq!(banned, vec![peer]);
    }
}
