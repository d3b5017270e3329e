//! Candidate-peer store (§4.4): every peer address the torrent has ever
//! heard about, independent of whether it's currently connected.
//!
//! Candidates arrive from trackers, DHT, PEX, LSD, incoming connections and
//! resume data; [`PeerList`] deduplicates them by address, tracks the
//! ranking inputs used to choose who to dial next, and enforces a
//! capacity bound by evicting the worst-ranked non-connected candidate.

use std::{
    collections::HashMap,
    net::SocketAddr,
};

use crate::PeerId;

/// Where a candidate peer was learned from. A peer can be merged in from
/// more than one source (e.g. both the tracker and PEX), so this is a
/// bitmask rather than an enum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Source(u8);

impl Source {
    pub const TRACKER: Source = Source(1 << 0);
    pub const DHT: Source = Source(1 << 1);
    pub const PEX: Source = Source(1 << 2);
    pub const LSD: Source = Source(1 << 3);
    pub const INCOMING: Source = Source(1 << 4);
    pub const RESUME: Source = Source(1 << 5);
    /// Added directly through the public `add_peer` API, rather than
    /// discovered.
    pub const USER: Source = Source(1 << 6);

    fn merge(self, other: Source) -> Source {
        Source(self.0 | other.0)
    }

    fn contains(self, other: Source) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A peer address known to the torrent, whether or not we're currently
/// connected to it.
#[derive(Clone, Debug)]
pub(crate) struct CandidatePeer {
    pub addr: SocketAddr,
    pub source: Source,
    /// Consecutive failed connection attempts; drives exponential back-off
    /// in [`PeerList::connect_one_peer`].
    pub failcount: u32,
    /// Clamped to `[-7, 8]`; decremented on hash-check failures attributed
    /// to this peer, incremented on successfully contributed pieces.
    pub trust_points: i8,
    /// Set when `trust_points` was last decremented; restricts the peer,
    /// once reconnected, to picking blocks of pieces nobody else is
    /// downloading (see [`crate::piece_picker::PiecePicker::pick_pieces`]'s
    /// `on_parole` argument).
    pub on_parole: bool,
    pub seed: bool,
    pub last_connected: Option<u64>,
    pub last_optimistically_unchoked: Option<u64>,
    pub prev_amount_downloaded: u64,
    pub prev_amount_uploaded: u64,
    pub banned: bool,
    /// Whether a live connection to this candidate currently exists. Plays
    /// the role of the source's weak `connection` back-reference: since we
    /// key connected peers by [`PeerId`] elsewhere, a bool plus the
    /// `PeerId` lookup table in [`PeerList`] is sufficient here.
    pub connected: bool,
}

impl CandidatePeer {
    fn new(addr: SocketAddr, source: Source) -> Self {
        Self {
            addr,
            source,
            failcount: 0,
            trust_points: 0,
            on_parole: false,
            seed: false,
            last_connected: None,
            last_optimistically_unchoked: None,
            prev_amount_downloaded: 0,
            prev_amount_uploaded: 0,
            banned: false,
            connected: false,
        }
    }

    /// Combined connect-worthiness score: higher is better. Source rank
    /// rewards peers we found ourselves (tracker/DHT) slightly over ones
    /// that found us (incoming) or were merely gossiped (PEX/LSD), since
    /// the latter are more likely stale.
    fn rank(&self) -> i64 {
        let source_rank = if self.source.contains(Source::TRACKER) {
            3
        } else if self.source.contains(Source::DHT) {
            2
        } else {
            1
        };
        source_rank * 1000 - self.failcount as i64 * 10
            + self.trust_points as i64
    }

    /// Exponential back-off, capped, based on consecutive connect failures.
    fn backoff_secs(&self) -> u64 {
        const BASE: u64 = 5;
        const CAP: u64 = 60 * 30;
        BASE.saturating_mul(1u64 << self.failcount.min(12)).min(CAP)
    }
}

/// Bounded store of [`CandidatePeer`]s for a single torrent.
pub(crate) struct PeerList {
    candidates: HashMap<SocketAddr, CandidatePeer>,
    /// Maps the peer id a connection handshaked with back to its address,
    /// so hash-check trust penalties (keyed by [`PeerId`], since that's
    /// all [`crate::piece_picker::PiecePicker`] tracks) can find the
    /// right candidate.
    connected_by_peer_id: HashMap<PeerId, SocketAddr>,
    max_size: usize,
}

impl PeerList {
    pub fn new(max_size: usize) -> Self {
        Self {
            candidates: HashMap::new(),
            connected_by_peer_id: HashMap::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Adds (or, if already known, merges source flags into) a candidate.
    /// Evicts the lowest-ranked non-connected candidate if this would
    /// exceed `max_size`. No-op for an address that's already banned.
    pub fn add_candidate(&mut self, addr: SocketAddr, source: Source) {
        if let Some(existing) = self.candidates.get_mut(&addr) {
            if !existing.banned {
                existing.source = existing.source.merge(source);
            }
            return;
        }
        if self.candidates.len() >= self.max_size {
            self.evict_worst();
        }
        self.candidates.insert(addr, CandidatePeer::new(addr, source));
    }

    fn evict_worst(&mut self) {
        let worst = self
            .candidates
            .values()
            .filter(|c| !c.connected)
            .min_by_key(|c| c.rank())
            .map(|c| c.addr);
        if let Some(addr) = worst {
            self.candidates.remove(&addr);
        }
    }

    /// Marks `addr` as permanently unreconnectable. Banned peers are never
    /// returned by [`Self::connect_one_peer`] and (the caller's
    /// responsibility) should be rejected on incoming connection too.
    pub fn ban(&mut self, addr: SocketAddr) {
        if let Some(c) = self.candidates.get_mut(&addr) {
            c.banned = true;
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        self.candidates.get(&addr).map(|c| c.banned).unwrap_or(false)
    }

    /// Associates a now-handshaked connection's [`PeerId`] with its
    /// candidate record and marks it connected.
    pub fn mark_connected(&mut self, addr: SocketAddr, peer_id: PeerId, now: u64) {
        if let Some(c) = self.candidates.get_mut(&addr) {
            c.connected = true;
            c.last_connected = Some(now);
        }
        self.connected_by_peer_id.insert(peer_id, addr);
    }

    pub fn mark_disconnected(&mut self, peer_id: PeerId) {
        if let Some(addr) = self.connected_by_peer_id.remove(&peer_id) {
            if let Some(c) = self.candidates.get_mut(&addr) {
                c.connected = false;
            }
        }
    }

    pub fn record_connect_failure(&mut self, addr: SocketAddr) {
        if let Some(c) = self.candidates.get_mut(&addr) {
            c.failcount += 1;
        }
    }

    /// Scans for the best-ranked candidate that isn't currently connected,
    /// isn't banned, and whose connect back-off has elapsed, returning its
    /// address. Updates `last_connected` on the chosen candidate.
    pub fn connect_one_peer(&mut self, session_time: u64) -> Option<SocketAddr> {
        let addr = self
            .candidates
            .values()
            .filter(|c| !c.connected && !c.banned)
            .filter(|c| {
                c.last_connected
                    .map(|t| session_time.saturating_sub(t) >= c.backoff_secs())
                    .unwrap_or(true)
            })
            .max_by_key(|c| c.rank())
            .map(|c| c.addr)?;
        if let Some(c) = self.candidates.get_mut(&addr) {
            c.last_connected = Some(session_time);
        }
        Some(addr)
    }

    /// Applies a hash-check trust penalty to the candidate behind
    /// `peer_id`, if it's currently connected. Returns whether the peer
    /// crossed the ban threshold (`trust_points <= -7`, or any penalty at
    /// all when it was the sole contributor — matching S3's "single_peer
    /// && allow_disconnect" with `allow_disconnect` always on here, since
    /// this crate doesn't expose a knob to keep serving known-bad peers).
    pub fn apply_trust_penalty(
        &mut self,
        peer_id: PeerId,
        delta: i8,
        single_source: bool,
    ) -> bool {
        let addr = match self.connected_by_peer_id.get(&peer_id) {
            Some(addr) => *addr,
            None => return false,
        };
        let c = match self.candidates.get_mut(&addr) {
            Some(c) => c,
            None => return false,
        };
        c.trust_points = c.trust_points.saturating_add(delta).max(-7).min(8);
        c.on_parole = true;
        c.trust_points <= -7 || single_source
    }

    /// Credits a peer for contributing to a piece that passed its hash
    /// check, clearing parole if it had been on it.
    pub fn credit_piece(&mut self, peer_id: PeerId) {
        if let Some(addr) = self.connected_by_peer_id.get(&peer_id) {
            if let Some(c) = self.candidates.get_mut(addr) {
                c.trust_points = c.trust_points.saturating_add(1).min(8);
                c.on_parole = false;
            }
        }
    }

    /// Evicts and returns every candidate `predicate` rejects (e.g. an IP
    /// filter update), for the caller to surface as an alert.
    pub fn apply_filter(
        &mut self,
        predicate: impl Fn(&SocketAddr) -> bool,
    ) -> Vec<SocketAddr> {
        let evicted: Vec<SocketAddr> = self
            .candidates
            .keys()
            .filter(|a| !predicate(a))
            .copied()
            .collect();
        for addr in &evicted {
            self.candidates.remove(addr);
        }
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidatePeer> {
        self.candidates.values()
    }

    /// Looks up the address of a currently connected peer by its handshaked
    /// id, so a caller that only has a [`PeerId`] (e.g. after a trust-penalty
    /// ban) can find the session to tear down.
    pub fn addr_of(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.connected_by_peer_id.get(&peer_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn duplicate_candidate_merges_source_instead_of_inserting() {
        let mut list = PeerList::new(10);
        list.add_candidate(addr(1), Source::TRACKER);
        list.add_candidate(addr(1), Source::DHT);
        assert_eq!(list.len(), 1);
        let c = list.iter().next().unwrap();
        assert!(c.source.contains(Source::TRACKER));
        assert!(c.source.contains(Source::DHT));
    }

    #[test]
    fn full_list_evicts_lowest_ranked_non_connected_peer() {
        let mut list = PeerList::new(2);
        list.add_candidate(addr(1), Source::PEX);
        list.add_candidate(addr(2), Source::TRACKER);
        // addr(1) has the lower rank (PEX source); adding a third candidate
        // should evict it rather than addr(2).
        list.add_candidate(addr(3), Source::TRACKER);
        assert_eq!(list.len(), 2);
        assert!(list.candidates.get(&addr(1)).is_none());
    }

    #[test]
    fn banned_peer_is_never_returned_to_connect() {
        let mut list = PeerList::new(10);
        list.add_candidate(addr(1), Source::TRACKER);
        list.ban(addr(1));
        assert_eq!(list.connect_one_peer(1000), None);
    }

    #[test]
    fn connect_one_peer_respects_backoff_after_failure() {
        let mut list = PeerList::new(10);
        list.add_candidate(addr(1), Source::TRACKER);
        assert_eq!(list.connect_one_peer(0), Some(addr(1)));
        // simulate a disconnect/failure right away
        list.mark_disconnected([0; 20]);
        list.record_connect_failure(addr(1));
        // immediately retrying should be refused due to back-off
        assert_eq!(list.connect_one_peer(0), None);
    }

    #[test]
    fn single_source_hash_failure_bans_regardless_of_trust_points() {
        let mut list = PeerList::new(10);
        let peer_id = [7; 20];
        list.add_candidate(addr(1), Source::TRACKER);
        list.mark_connected(addr(1), peer_id, 0);
        let banned = list.apply_trust_penalty(peer_id, -2, true);
        assert!(banned);
    }

    #[test]
    fn repeated_shared_penalties_eventually_cross_ban_threshold() {
        let mut list = PeerList::new(10);
        let peer_id = [9; 20];
        list.add_candidate(addr(1), Source::TRACKER);
        list.mark_connected(addr(1), peer_id, 0);
        let mut banned = false;
        for _ in 0..10 {
            banned = list.apply_trust_penalty(peer_id, -1, false);
            if banned {
                break;
            }
        }
        assert!(banned);
    }
}
