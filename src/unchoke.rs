//! Periodic unchoke and optimistic-unchoke peer selection (§4.7).
//!
//! Like [`crate::announce`], this is a pure decision function over a
//! snapshot the caller assembles each tick: it doesn't hold a reference to
//! live peer sessions, just the inputs needed to rank them.

use crate::PeerId;

/// Per-connected-peer inputs the manager needs to rank and choose slots.
/// The caller (`TorrentCore`) builds one of these per connected peer each
/// tick from its live session state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct UnchokeCandidate {
    pub peer_id: PeerId,
    pub interested: bool,
    pub is_seed: bool,
    /// Bytes/sec this peer has sent us recently (download rate from our
    /// perspective). Used to rank candidates when we're still leeching.
    pub download_rate: f64,
    /// Bytes/sec we've sent this peer recently. Used, alongside
    /// `downloaded`, to compute the uploaded-to-downloaded ratio peers are
    /// ranked by once we're seeding.
    pub upload_rate: f64,
    pub uploaded_to_peer: u64,
    pub downloaded_from_peer: u64,
    /// Ticks since this peer was last the optimistic unchoke, or `None` if
    /// never. Newly connected peers (not yet ever chosen) sort first.
    pub ticks_since_last_optimistic_unchoke: Option<u32>,
}

/// Outcome of a single unchoke round: who to unchoke (normal slots plus,
/// on qualifying ticks, the optimistic slot) and who to choke.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct UnchokeDecision {
    pub unchoke: Vec<PeerId>,
    pub choke: Vec<PeerId>,
    pub optimistic_unchoke: Option<PeerId>,
}

pub(crate) struct UnchokeManager {
    /// Counts ticks since the last optimistic unchoke was chosen; a new
    /// one is picked every `optimistic_unchoke_multiplier` ticks.
    ticks_since_optimistic: u32,
}

impl UnchokeManager {
    pub fn new() -> Self {
        Self { ticks_since_optimistic: 0 }
    }

    /// Runs one unchoke round. `allowed_upload_slots` is the total number
    /// of peers we're willing to unchoke, including the optimistic one;
    /// `optimistic_unchoke_multiplier` is how many ticks pass between
    /// optimistic-unchoke reselections; `is_seeding` switches the ranking
    /// comparator per §4.7 step 2.
    pub fn run(
        &mut self,
        candidates: &[UnchokeCandidate],
        allowed_upload_slots: usize,
        optimistic_unchoke_multiplier: u32,
        is_seeding: bool,
    ) -> UnchokeDecision {
        let eligible: Vec<&UnchokeCandidate> =
            candidates.iter().filter(|c| c.interested).collect();

        if allowed_upload_slots == 0 || eligible.is_empty() {
            return UnchokeDecision {
                choke: candidates.iter().map(|c| c.peer_id).collect(),
                ..Default::default()
            };
        }

        let mut ranked = eligible.clone();
        ranked.sort_by(|a, b| Self::compare(a, b, is_seeding));

        // reserve exactly one slot for the optimistic unchoke whenever
        // there's more than one slot available; with only one slot the
        // regular ranking already covers it.
        let regular_slots = allowed_upload_slots.saturating_sub(1).max(1).min(ranked.len());
        let regular_slots = if allowed_upload_slots == 1 { allowed_upload_slots.min(ranked.len()) } else { regular_slots };

        let mut unchoke: Vec<PeerId> =
            ranked.iter().take(regular_slots).map(|c| c.peer_id).collect();

        self.ticks_since_optimistic += 1;
        let mut optimistic_unchoke = None;
        if allowed_upload_slots > 1 && self.ticks_since_optimistic >= optimistic_unchoke_multiplier
        {
            let remaining: Vec<&&UnchokeCandidate> = ranked
                .iter()
                .skip(regular_slots)
                .collect();
            if let Some(chosen) = remaining
                .iter()
                .max_by_key(|c| c.ticks_since_last_optimistic_unchoke.unwrap_or(u32::MAX))
            {
                optimistic_unchoke = Some(chosen.peer_id);
                unchoke.push(chosen.peer_id);
                self.ticks_since_optimistic = 0;
            }
        }

        let choke = candidates
            .iter()
            .map(|c| c.peer_id)
            .filter(|id| !unchoke.contains(id))
            .collect();

        UnchokeDecision { unchoke, choke, optimistic_unchoke }
    }

    fn compare(
        a: &UnchokeCandidate,
        b: &UnchokeCandidate,
        is_seeding: bool,
    ) -> std::cmp::Ordering {
        if is_seeding {
            // prefer peers we've uploaded to the least relative to what
            // they've given back: a lower upload/download ratio ranks first
            let a_ratio = Self::upload_ratio(a);
            let b_ratio = Self::upload_ratio(b);
            a_ratio
                .partial_cmp(&b_ratio)
                .unwrap_or(std::cmp::Ordering::Equal)
        } else {
            b.download_rate
                .partial_cmp(&a.download_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    }

    fn upload_ratio(c: &UnchokeCandidate) -> f64 {
        if c.downloaded_from_peer == 0 {
            c.uploaded_to_peer as f64
        } else {
            c.uploaded_to_peer as f64 / c.downloaded_from_peer as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u8, interested: bool, rate: f64) -> UnchokeCandidate {
        UnchokeCandidate {
            peer_id: [id; 20],
            interested,
            is_seed: false,
            download_rate: rate,
            upload_rate: 0.0,
            uploaded_to_peer: 0,
            downloaded_from_peer: 0,
            ticks_since_last_optimistic_unchoke: None,
        }
    }

    #[test]
    fn uninterested_peers_are_never_unchoked() {
        let mut mgr = UnchokeManager::new();
        let candidates = vec![candidate(1, false, 1000.0)];
        let decision = mgr.run(&candidates, 4, 3, false);
        assert!(decision.unchoke.is_empty());
        assert_eq!(decision.choke, vec![[1; 20]]);
    }

    #[test]
    fn higher_download_rate_peers_are_ranked_above_slower_ones() {
        let mut mgr = UnchokeManager::new();
        let candidates = vec![
            candidate(1, true, 100.0),
            candidate(2, true, 500.0),
            candidate(3, true, 10.0),
        ];
        // 2 regular slots (3 allowed minus 1 reserved for optimistic)
        let decision = mgr.run(&candidates, 3, 100, false);
        assert!(decision.unchoke.contains(&[2; 20]));
        assert!(decision.unchoke.contains(&[1; 20]));
    }

    #[test]
    fn optimistic_unchoke_fires_only_every_multiplier_ticks() {
        let mut mgr = UnchokeManager::new();
        let candidates = vec![
            candidate(1, true, 100.0),
            candidate(2, true, 50.0),
            candidate(3, true, 10.0),
        ];
        let first = mgr.run(&candidates, 2, 3, false);
        assert!(first.optimistic_unchoke.is_none());
        let second = mgr.run(&candidates, 2, 3, false);
        assert!(second.optimistic_unchoke.is_none());
        let third = mgr.run(&candidates, 2, 3, false);
        assert!(third.optimistic_unchoke.is_some());
    }

    #[test]
    fn single_slot_skips_optimistic_reservation() {
        let mut mgr = UnchokeManager::new();
        let candidates = vec![candidate(1, true, 100.0)];
        let decision = mgr.run(&candidates, 1, 1, false);
        assert_eq!(decision.unchoke, vec![[1; 20]]);
    }
}
