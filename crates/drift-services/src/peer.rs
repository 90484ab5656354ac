//! Peer registry: the live set of Drift peers seen on the local link.
//!
//! The mDNS engine is the only writer. The transfer supervisor and the
//! front-end read from it and may subscribe to change events.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use drift_core::crypto::{self, CryptoError, KEY_LEN};
use thiserror::Error;

/// TXT key carrying the peer's hex-encoded X25519 public key.
pub const TXT_PUBLIC_KEY: &str = "pk";
/// TXT key carrying the human-readable display name.
pub const TXT_DISPLAY_NAME: &str = "u";
/// TXT key carrying the protocol version.
pub const TXT_VERSION: &str = "v";
/// TXT key carrying the peer's operating system.
pub const TXT_OS: &str = "os";

// ── Peer ──────────────────────────────────────────────────────────────────────

/// One discovered service instance.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Instance label, e.g. `Ada’s laptop`.
    pub instance: String,
    /// Service type, e.g. `_drift._tcp`.
    pub service: String,
    /// Domain, e.g. `local`.
    pub domain: String,
    /// SRV target host.
    pub hostname: String,
    pub port: u16,
    /// Sorted, deduplicated. Never empty for a peer held in the registry.
    pub addrs: Vec<IpAddr>,
    /// Raw `key=value` TXT entries.
    pub txt: Vec<String>,
    pub ttl: Duration,
    /// When this peer (or the earliest record merged into it) was first seen.
    pub seen_at: Instant,
}

impl Peer {
    /// The registry key: `<instance>.<service>.<domain>`.
    pub fn service_name(&self) -> String {
        format!("{}.{}.{}", self.instance, self.service, self.domain)
    }

    /// Value of the TXT entry `key=...`, if present.
    pub fn record(&self, key: &str) -> Option<&str> {
        self.txt.iter().find_map(|entry| {
            entry
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    /// `u=` if advertised, else the instance label.
    pub fn display_name(&self) -> &str {
        self.record(TXT_DISPLAY_NAME)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.instance)
    }

    /// The advertised static public key.
    pub fn public_key(&self) -> Result<[u8; KEY_LEN], PeerKeyError> {
        let hex = self.record(TXT_PUBLIC_KEY).ok_or(PeerKeyError::Missing)?;
        crypto::parse_public_key(hex).map_err(PeerKeyError::Invalid)
    }

    /// The address outbound transfers dial.
    pub fn first_address(&self) -> Option<SocketAddr> {
        self.addrs.first().map(|ip| SocketAddr::new(*ip, self.port))
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.addrs.iter().any(|a| a.to_canonical() == ip)
    }

    /// Equal in everything a user could notice. TTL and timestamps are not.
    pub fn same_visible(&self, other: &Peer) -> bool {
        self.instance == other.instance
            && self.service == other.service
            && self.domain == other.domain
            && self.hostname == other.hostname
            && self.port == other.port
            && self.addrs == other.addrs
            && self.txt == other.txt
    }

    /// Merge records for one service instance into a single peer.
    ///
    /// The latest record (by `seen_at`) supplies TTL and metadata, the
    /// earliest supplies `seen_at`, and addresses are the sorted union.
    /// Input order does not matter.
    pub fn merge(records: &[Peer]) -> Option<Peer> {
        let earliest = records.iter().min_by_key(|p| p.seen_at)?;
        let latest = records.iter().max_by_key(|p| p.seen_at)?;

        let mut merged = latest.clone();
        merged.seen_at = earliest.seen_at;
        merged.addrs = records.iter().flat_map(|p| p.addrs.iter().copied()).collect();
        merged.addrs.sort();
        merged.addrs.dedup();
        Some(merged)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerKeyError {
    #[error("peer does not advertise a pk record")]
    Missing,
    #[error("peer advertises an invalid pk record: {0}")]
    Invalid(CryptoError),
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Added(Peer),
    Updated(Peer),
    /// Carries the service instance name that disappeared.
    Removed(String),
}

type Observer = Box<dyn Fn(&PeerEvent) + Send + Sync>;

// ── Registry ──────────────────────────────────────────────────────────────────

/// Shared between the mDNS engine, the transfer supervisor and the
/// front-end. Keyed on service instance name.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    peers: RwLock<HashMap<String, Peer>>,
    observers: RwLock<Vec<Observer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every known peer, sorted by instance name.
    pub fn all(&self) -> Vec<Peer> {
        let peers = self.inner.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Peer> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.instance.cmp(&b.instance));
        all
    }

    /// Look up by instance label or by full service instance name.
    pub fn get_by_instance(&self, name: &str) -> Option<Peer> {
        let peers = self.inner.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers
            .get(name)
            .or_else(|| peers.values().find(|p| p.instance == name))
            .cloned()
    }

    /// The peer advertising `ip`. IPv4-mapped IPv6 matches its IPv4 form.
    pub fn get_by_address(&self, ip: IpAddr) -> Option<Peer> {
        let peers = self.inner.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers
            .values()
            .filter(|p| p.has_address(ip))
            .min_by_key(|p| p.seen_at)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an observer for every subsequent change.
    ///
    /// Observers run on the writer's task after the registry lock is
    /// released. They must not block, and must not call `on_change`.
    pub fn on_change<F>(&self, observer: F)
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(observer));
    }

    /// Apply one discovery event, then notify observers.
    pub fn apply(&self, event: PeerEvent) {
        {
            let mut peers = self.inner.peers.write().unwrap_or_else(PoisonError::into_inner);
            match &event {
                PeerEvent::Added(peer) | PeerEvent::Updated(peer) => {
                    if peer.addrs.is_empty() {
                        tracing::debug!(peer = %peer.service_name(), "ignoring peer without addresses");
                        return;
                    }
                    peers.insert(peer.service_name(), peer.clone());
                }
                PeerEvent::Removed(name) => {
                    if peers.remove(name).is_none() {
                        return;
                    }
                }
            }
        }

        let observers = self.inner.observers.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(&event);
        }
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.len())
            .finish()
    }
}
