//! Time-driven cache of discovered service instances.
//!
//! Every response that mentions an instance adds one record to that
//! instance's list. `advance` expires records, folds each list into a
//! single `Peer` and reports how the visible set changed. Records older
//! than the latest are kept only while they hold addresses the newer ones
//! lack, so a peer reachable on several links keeps all of its addresses.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use drift_services::{Peer, PeerEvent};
use rand::Rng;

/// Fractions of the TTL at which a live-check query is due.
const LIVE_CHECKS: [f64; 4] = [0.80, 0.85, 0.90, 0.95];
/// Live-check points are pushed back by up to this fraction of the TTL.
const LIVE_CHECK_JITTER: f64 = 0.02;
/// Records announced with this TTL or less are treated as goodbyes.
const GOODBYE_TTL: Duration = Duration::from_secs(1);
/// Smallest step the cache clock moves when time has not advanced.
const TICK: Duration = Duration::from_nanos(1);

#[derive(Debug)]
pub struct Cache {
    records: HashMap<String, Vec<Peer>>,
    /// Instances touched by `put` since the last `advance`.
    dirty: HashSet<String>,
    entropy: f64,
    now: Instant,
    last_refresh: Instant,
    last_query: Option<Instant>,
    next_expiry: Option<Instant>,
    next_live_check: Option<Instant>,
}

impl Cache {
    pub fn new(now: Instant) -> Self {
        Self {
            records: HashMap::new(),
            dirty: HashSet::new(),
            entropy: rand::thread_rng().gen_range(0.0..1.0),
            now,
            last_refresh: now,
            last_query: None,
            next_expiry: None,
            next_live_check: None,
        }
    }

    /// Record one sighting of `peer`. A TTL of a second or less, or no
    /// addresses at all, turns it into a goodbye for that instance.
    pub fn put(&mut self, now: Instant, mut peer: Peer) {
        self.set_now(now);
        if peer.ttl <= GOODBYE_TTL || peer.addrs.is_empty() {
            peer.ttl = Duration::ZERO;
        }
        peer.seen_at = self.now;

        let key = peer.service_name();
        self.records.entry(key.clone()).or_default().push(peer);
        self.dirty.insert(key);
    }

    /// Expire and merge records at `now`.
    ///
    /// Returns whether a browse query is due for a live check, along with
    /// the changes to the visible peer set.
    pub fn advance(&mut self, now: Instant) -> (bool, Vec<PeerEvent>) {
        self.set_now(now);

        let mut keys: Vec<String> = if self.next_expiry.is_some_and(|t| t <= self.now) {
            self.records.keys().cloned().collect()
        } else {
            self.dirty.iter().cloned().collect()
        };
        keys.sort();
        self.dirty.clear();

        let mut events = Vec::new();
        for key in keys {
            if let Some(event) = self.refresh(&key) {
                events.push(event);
            }
        }
        self.last_refresh = self.now;
        self.schedule();

        let due = self.live_check_due();
        (due, events)
    }

    /// Note that a browse query went out at `now`.
    pub fn queried(&mut self, now: Instant) {
        self.set_now(now);
        self.last_query = Some(self.now);
        self.schedule();
    }

    /// The next instant `advance` has work to do, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_expiry, self.next_live_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Merged view of every cached instance.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.records.values().filter_map(|r| Peer::merge(r)).collect();
        peers.sort_by(|a, b| a.instance.cmp(&b.instance));
        peers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn set_now(&mut self, now: Instant) {
        self.now = if now > self.now { now } else { self.now + TICK };
    }

    fn refresh(&mut self, key: &str) -> Option<PeerEvent> {
        let records = self.records.remove(key)?;
        let latest_ttl = records.iter().max_by_key(|p| p.seen_at)?.ttl;

        let old: Vec<Peer> = records
            .iter()
            .filter(|p| p.seen_at < self.last_refresh)
            .cloned()
            .collect();
        let live: Vec<Peer> = records
            .into_iter()
            .filter(|p| p.seen_at + latest_ttl > self.now)
            .collect();
        let live = compact(live);

        let before = Peer::merge(&old);
        let Some(after) = Peer::merge(&live) else {
            return before.map(|_| PeerEvent::Removed(key.to_string()));
        };
        self.records.insert(key.to_string(), live);

        match before {
            None => Some(PeerEvent::Added(after)),
            Some(before) if !before.same_visible(&after) => Some(PeerEvent::Updated(after)),
            Some(_) => None,
        }
    }

    fn schedule(&mut self) {
        let mut next_expiry: Option<Instant> = None;
        let mut next_check: Option<Instant> = None;
        let floor = self.last_query.map_or(self.now, |q| q.max(self.now));

        for records in self.records.values() {
            let Some(latest) = records.iter().max_by_key(|p| p.seen_at) else {
                continue;
            };
            for p in records {
                let expiry = p.seen_at + latest.ttl;
                next_expiry = Some(next_expiry.map_or(expiry, |t| t.min(expiry)));
            }
            if let Some(check) = self
                .live_check_points(latest)
                .into_iter()
                .find(|t| *t > floor)
            {
                next_check = Some(next_check.map_or(check, |t| t.min(check)));
            }
        }
        self.next_expiry = next_expiry;
        self.next_live_check = next_check;
    }

    fn live_check_points(&self, latest: &Peer) -> Vec<Instant> {
        if latest.ttl.is_zero() {
            return Vec::new();
        }
        let jitter = self.entropy * LIVE_CHECK_JITTER;
        LIVE_CHECKS
            .iter()
            .map(|pct| latest.seen_at + latest.ttl.mul_f64(pct + jitter))
            .collect()
    }

    /// A live check is due when some check point has passed with no query
    /// since it, and no fresher sighting either.
    fn live_check_due(&self) -> bool {
        self.records.values().any(|records| {
            let Some(latest) = records.iter().max_by_key(|p| p.seen_at) else {
                return false;
            };
            let since = self.last_query.map_or(latest.seen_at, |q| q.max(latest.seen_at));
            self.live_check_points(latest)
                .into_iter()
                .any(|t| t > since && t <= self.now)
        })
    }
}

/// Newest first; an older record survives only with the addresses no newer
/// record already carries.
fn compact(mut records: Vec<Peer>) -> Vec<Peer> {
    records.sort_by(|a, b| b.seen_at.cmp(&a.seen_at));
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(records.len());
    for (i, mut record) in records.into_iter().enumerate() {
        record.addrs.retain(|a| seen.insert(*a));
        if i == 0 || !record.addrs.is_empty() {
            kept.push(record);
        }
    }
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    const TTL: Duration = Duration::from_secs(120);

    fn peer(instance: &str, addrs: &[&str], ttl: Duration) -> Peer {
        Peer {
            instance: instance.to_string(),
            service: "_drift._tcp".into(),
            domain: "local".into(),
            hostname: format!("{instance}.local"),
            port: 4000,
            addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            txt: vec!["v=0.1".into()],
            ttl,
            seen_at: Instant::now(),
        }
    }

    fn names(events: &[PeerEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                PeerEvent::Added(p) => format!("add {}", p.instance),
                PeerEvent::Updated(p) => format!("update {}", p.instance),
                PeerEvent::Removed(n) => format!("remove {n}"),
            })
            .collect()
    }

    #[test]
    fn first_sighting_is_added_once() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], TTL));
        let (_, events) = cache.advance(t0);
        assert_eq!(names(&events), vec!["add ada"]);

        cache.put(t0 + Duration::from_secs(1), peer("ada", &["10.0.0.1"], TTL));
        let (_, events) = cache.advance(t0 + Duration::from_secs(1));
        assert!(events.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_txt_is_an_update() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], TTL));
        cache.advance(t0);

        let mut changed = peer("ada", &["10.0.0.1"], TTL);
        changed.txt.push("u=Ada".into());
        let t1 = t0 + Duration::from_secs(2);
        cache.put(t1, changed);
        let (_, events) = cache.advance(t1);
        assert_eq!(names(&events), vec!["update ada"]);
    }

    #[test]
    fn goodbye_removes() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], TTL));
        cache.advance(t0);

        let t1 = t0 + Duration::from_secs(3);
        cache.put(t1, peer("ada", &["10.0.0.1"], Duration::ZERO));
        let (_, events) = cache.advance(t1);
        assert_eq!(names(&events), vec!["remove ada._drift._tcp.local"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn one_second_ttl_or_no_addresses_is_a_goodbye() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], TTL));
        cache.put(t0, peer("bob", &["10.0.0.2"], TTL));
        cache.advance(t0);

        let t1 = t0 + Duration::from_secs(1);
        cache.put(t1, peer("ada", &["10.0.0.1"], Duration::from_secs(1)));
        cache.put(t1, peer("bob", &[], TTL));
        let (_, events) = cache.advance(t1);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, PeerEvent::Removed(_))));
    }

    #[test]
    fn goodbye_for_unknown_instance_is_silent() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ghost", &["10.0.0.9"], Duration::ZERO));
        let (_, events) = cache.advance(t0);
        assert!(events.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn expires_at_full_ttl() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], TTL));
        cache.advance(t0);
        assert!(cache.next_deadline().is_some());

        let (_, events) = cache.advance(t0 + TTL - Duration::from_secs(1));
        assert!(events.is_empty());
        let (_, events) = cache.advance(t0 + TTL + Duration::from_millis(1));
        assert_eq!(names(&events), vec!["remove ada._drift._tcp.local"]);
        assert_eq!(cache.next_deadline(), None);
    }

    #[test]
    fn live_checks_start_at_eighty_percent() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], Duration::from_secs(100)));
        let (due, _) = cache.advance(t0);
        assert!(!due);

        let first = cache.next_deadline().unwrap();
        assert!(first >= t0 + Duration::from_secs(80));
        assert!(first <= t0 + Duration::from_secs(82));

        let (due, _) = cache.advance(t0 + Duration::from_secs(79));
        assert!(!due);
        let (due, _) = cache.advance(t0 + Duration::from_secs(83));
        assert!(due);

        cache.queried(t0 + Duration::from_secs(83));
        let (due, _) = cache.advance(t0 + Duration::from_secs(84));
        assert!(!due);
        let (due, _) = cache.advance(t0 + Duration::from_secs(88));
        assert!(due);
    }

    #[test]
    fn fresh_sighting_cancels_live_check() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], Duration::from_secs(100)));
        cache.advance(t0);

        let t1 = t0 + Duration::from_secs(70);
        cache.put(t1, peer("ada", &["10.0.0.1"], Duration::from_secs(100)));
        let (due, _) = cache.advance(t0 + Duration::from_secs(90));
        assert!(!due);
    }

    #[test]
    fn addresses_from_several_links_are_merged() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        cache.put(t0, peer("ada", &["10.0.0.1"], TTL));
        cache.put(t0, peer("ada", &["192.168.7.1"], TTL));
        let (_, events) = cache.advance(t0);

        let PeerEvent::Added(added) = &events[0] else {
            panic!("expected add");
        };
        let want: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "192.168.7.1".parse().unwrap()];
        assert_eq!(added.addrs, want);
    }

    #[test]
    fn redundant_old_records_are_compacted() {
        let t0 = Instant::now();
        let mut cache = Cache::new(t0);
        for i in 0..10 {
            let t = t0 + Duration::from_secs(i);
            cache.put(t, peer("ada", &["10.0.0.1"], TTL));
            cache.advance(t);
        }
        assert_eq!(cache.records["ada._drift._tcp.local"].len(), 1);
    }

    #[test]
    fn clock_never_runs_backwards() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut cache = Cache::new(t0);
        cache.put(t0 - Duration::from_secs(5), peer("ada", &["10.0.0.1"], TTL));
        let stored = &cache.records["ada._drift._tcp.local"][0];
        assert!(stored.seen_at > t0);
    }
}
