//! Tracker tier/endpoint bookkeeping and announce scheduling (§4.6).
//!
//! [`AnnounceScheduler`] doesn't perform any I/O itself: it's a pure
//! decision function over tracker/endpoint state that [`crate::torrent`]
//! drives, handing back the set of (tracker, endpoint) pairs that are due
//! an announce and which event to send them. The actual HTTP/UDP request
//! is the caller's concern.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use url::Url;

/// The `event` field of a tracker announce request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    None,
}

/// A parsed, not-yet-contacted tracker URL within a tier.
#[derive(Clone, Debug)]
pub(crate) struct Tracker {
    pub url: Url,
    pub tier: u8,
}

/// Per (tracker, listen-endpoint) pair bookkeeping that persists across
/// announces: retry back-off, whether we've already told this endpoint
/// we started/completed, and terminal failure states.
#[derive(Clone, Debug)]
struct EndpointState {
    fails: u32,
    next_announce: u64,
    min_announce: u64,
    updating: bool,
    start_sent: bool,
    complete_sent: bool,
    /// Set on a tracker response indicating HTTP 410 Gone: this tracker
    /// will never be retried again, on any endpoint.
    dead: bool,
    /// Set when this particular (tracker, endpoint) address-family
    /// combination is unreachable (e.g. an IPv6 endpoint against an
    /// IPv4-only tracker host). Disables only this pair, not the tracker.
    unreachable: bool,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            fails: 0,
            next_announce: 0,
            min_announce: 0,
            updating: false,
            start_sent: false,
            complete_sent: false,
            dead: false,
            unreachable: false,
        }
    }

    fn is_eligible(&self, now: u64) -> bool {
        !self.dead && !self.unreachable && !self.updating && now >= self.next_announce
    }

    fn backoff_secs(&self) -> u64 {
        const BASE: u64 = 15;
        const CAP: u64 = 60 * 30;
        BASE.saturating_mul(1u64 << self.fails.min(10)).min(CAP)
    }
}

struct TrackerEntry {
    tracker: Tracker,
    endpoints: HashMap<SocketAddr, EndpointState>,
}

/// One announce the caller should issue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PendingAnnounce {
    pub tracker_url: Url,
    pub endpoint: SocketAddr,
    pub event: AnnounceEvent,
}

/// Governs how many trackers within a tier, and how many tiers, get
/// contacted per announce round.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct AnnouncePolicy {
    pub announce_to_all_tiers: bool,
    pub announce_to_all_trackers: bool,
}

pub(crate) struct AnnounceScheduler {
    /// Outer vec is tiers, in priority order; a tier succeeding (for
    /// `announce_to_all_tiers == false`) stops the walk.
    tiers: Vec<Vec<TrackerEntry>>,
}

impl AnnounceScheduler {
    /// `trackers` mirrors the tiered structure of a metainfo
    /// `announce-list`: outer index is tier, inner is trackers within it.
    pub fn new(trackers: &[Vec<String>]) -> Self {
        let tiers = trackers
            .iter()
            .enumerate()
            .map(|(tier, urls)| {
                urls.iter()
                    .filter_map(|url| Url::parse(url).ok())
                    .map(|url| TrackerEntry {
                        tracker: Tracker { url, tier: tier as u8 },
                        endpoints: HashMap::new(),
                    })
                    .collect()
            })
            .collect();
        Self { tiers }
    }

    /// Adds a single tracker in its own new lowest-priority tier. BEP 12
    /// doesn't define how a tracker added after the torrent started should
    /// rank against the existing tiers, so it's simply appended as a tier
    /// of one.
    pub fn add_tracker(&mut self, url: &str) {
        if let Ok(parsed) = Url::parse(url) {
            let tier = self.tiers.len() as u8;
            self.tiers.push(vec![TrackerEntry {
                tracker: Tracker { url: parsed, tier },
                endpoints: HashMap::new(),
            }]);
        }
    }

    /// Walks tiers in order, collecting announces due for `event` against
    /// every `listen_endpoint`, honoring `policy`'s stop-at-first-success
    /// semantics. `event == Stopped` is special-cased below it: it ignores
    /// back-off and tier ordering, targeting every endpoint that
    /// previously sent `started`.
    pub fn pending_announces(
        &mut self,
        now: u64,
        listen_endpoints: &[SocketAddr],
        event: AnnounceEvent,
        policy: AnnouncePolicy,
    ) -> Vec<PendingAnnounce> {
        if event == AnnounceEvent::Stopped {
            return self.pending_stops(listen_endpoints);
        }

        let mut pending = Vec::new();
        'tiers: for tier in &mut self.tiers {
            let mut tier_succeeded = false;
            for entry in tier.iter_mut() {
                let mut tracker_has_pending = false;
                for &endpoint in listen_endpoints {
                    let state = entry
                        .endpoints
                        .entry(endpoint)
                        .or_insert_with(EndpointState::new);
                    if state.dead || state.unreachable {
                        continue;
                    }
                    if state.is_eligible(now) {
                        let actual_event = if !state.start_sent && event == AnnounceEvent::None {
                            AnnounceEvent::Started
                        } else {
                            event
                        };
                        state.updating = true;
                        tracker_has_pending = true;
                        pending.push(PendingAnnounce {
                            tracker_url: entry.tracker.url.clone(),
                            endpoint,
                            event: actual_event,
                        });
                    }
                }
                if tracker_has_pending {
                    tier_succeeded = true;
                    if !policy.announce_to_all_trackers {
                        break;
                    }
                }
            }
            if tier_succeeded && !policy.announce_to_all_tiers {
                break 'tiers;
            }
        }
        pending
    }

    fn pending_stops(&mut self, listen_endpoints: &[SocketAddr]) -> Vec<PendingAnnounce> {
        let mut pending = Vec::new();
        for tier in &self.tiers {
            for entry in tier {
                for &endpoint in listen_endpoints {
                    if let Some(state) = entry.endpoints.get(&endpoint) {
                        if state.start_sent && !state.dead && !state.unreachable {
                            pending.push(PendingAnnounce {
                                tracker_url: entry.tracker.url.clone(),
                                endpoint,
                                event: AnnounceEvent::Stopped,
                            });
                        }
                    }
                }
            }
        }
        pending
    }

    /// Records a successful response: clears back-off, marks
    /// started/completed as sent, and schedules the next announce no
    /// earlier than `min_interval` from now, and never earlier than the
    /// endpoint's previous `next_announce` (T6).
    pub fn on_announce_success(
        &mut self,
        tracker_url: &Url,
        endpoint: SocketAddr,
        sent_event: AnnounceEvent,
        interval: Duration,
        min_interval: Duration,
        now: u64,
    ) {
        if let Some(state) = self.find_state_mut(tracker_url, endpoint) {
            state.fails = 0;
            state.updating = false;
            state.min_announce = now + min_interval.as_secs();
            let candidate = now + interval.as_secs().max(min_interval.as_secs());
            state.next_announce = candidate.max(state.min_announce).max(state.next_announce);
            match sent_event {
                AnnounceEvent::Started => state.start_sent = true,
                AnnounceEvent::Completed => state.complete_sent = true,
                _ => {}
            }
        }
    }

    /// Records a failed response. `gone` marks the entire tracker (every
    /// endpoint) as permanently dead (HTTP 410); `unreachable` disables
    /// only this (tracker, endpoint) pair (address family mismatch).
    pub fn on_announce_error(
        &mut self,
        tracker_url: &Url,
        endpoint: SocketAddr,
        now: u64,
        gone: bool,
        unreachable: bool,
    ) {
        if gone {
            for tier in &mut self.tiers {
                for entry in tier.iter_mut() {
                    if &entry.tracker.url == tracker_url {
                        for state in entry.endpoints.values_mut() {
                            state.dead = true;
                            state.updating = false;
                        }
                    }
                }
            }
            return;
        }
        if let Some(state) = self.find_state_mut(tracker_url, endpoint) {
            state.updating = false;
            if unreachable {
                state.unreachable = true;
                return;
            }
            state.fails += 1;
            state.next_announce = now + state.backoff_secs();
        }
    }

    fn find_state_mut(
        &mut self,
        tracker_url: &Url,
        endpoint: SocketAddr,
    ) -> Option<&mut EndpointState> {
        for tier in &mut self.tiers {
            for entry in tier.iter_mut() {
                if &entry.tracker.url == tracker_url {
                    return entry.endpoints.get_mut(&endpoint);
                }
            }
        }
        None
    }

    /// Minimum `next_announce` across every non-dead, non-unreachable
    /// endpoint, for the caller to schedule a single wakeup timer.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.tiers
            .iter()
            .flatten()
            .flat_map(|e| e.endpoints.values())
            .filter(|s| !s.dead && !s.unreachable && !s.updating)
            .map(|s| s.next_announce)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    fn scheduler() -> AnnounceScheduler {
        AnnounceScheduler::new(&[vec!["http://tracker.example/announce".to_owned()]])
    }

    #[test]
    fn first_announce_round_sends_started() {
        let mut s = scheduler();
        let pending = s.pending_announces(
            0,
            &[endpoint()],
            AnnounceEvent::None,
            AnnouncePolicy::default(),
        );
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event, AnnounceEvent::Started);
    }

    #[test]
    fn next_announce_never_moves_earlier_than_previous_on_success() {
        let mut s = scheduler();
        let url = Url::parse("http://tracker.example/announce").unwrap();
        s.on_announce_success(
            &url,
            endpoint(),
            AnnounceEvent::Started,
            Duration::from_secs(1800),
            Duration::from_secs(300),
            1000,
        );
        let first_next = s.find_state_mut(&url, endpoint()).unwrap().next_announce;
        // a second response with a shorter interval must not move the
        // schedule earlier than what was already promised
        s.on_announce_success(
            &url,
            endpoint(),
            AnnounceEvent::None,
            Duration::from_secs(60),
            Duration::from_secs(60),
            1100,
        );
        let second_next = s.find_state_mut(&url, endpoint()).unwrap().next_announce;
        assert!(second_next >= first_next);
    }

    #[test]
    fn gone_tracker_stops_being_offered() {
        let mut s = scheduler();
        let url = Url::parse("http://tracker.example/announce").unwrap();
        s.pending_announces(0, &[endpoint()], AnnounceEvent::None, AnnouncePolicy::default());
        s.on_announce_error(&url, endpoint(), 0, true, false);
        let pending = s.pending_announces(
            100_000,
            &[endpoint()],
            AnnounceEvent::None,
            AnnouncePolicy::default(),
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn unreachable_pair_is_disabled_but_tracker_stays_alive_for_other_endpoints() {
        let mut s = scheduler();
        let url = Url::parse("http://tracker.example/announce").unwrap();
        let other: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        s.pending_announces(
            0,
            &[endpoint(), other],
            AnnounceEvent::None,
            AnnouncePolicy::default(),
        );
        s.on_announce_error(&url, endpoint(), 0, false, true);
        s.on_announce_success(
            &url,
            other,
            AnnounceEvent::Started,
            Duration::from_secs(60),
            Duration::from_secs(60),
            0,
        );
        let pending = s.pending_announces(
            100_000,
            &[endpoint(), other],
            AnnounceEvent::None,
            AnnouncePolicy::default(),
        );
        assert!(pending.iter().all(|p| p.endpoint != endpoint()));
        assert!(pending.iter().any(|p| p.endpoint == other));
    }

    #[test]
    fn stop_event_only_targets_endpoints_that_were_started() {
        let mut s = scheduler();
        // no started announce sent yet, so a stop should be a no-op
        let pending = s.pending_announces(
            0,
            &[endpoint()],
            AnnounceEvent::Stopped,
            AnnouncePolicy::default(),
        );
        assert!(pending.is_empty());
    }
}
