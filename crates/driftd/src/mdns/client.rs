//! mDNS responder and browser state, free of sockets and clocks.
//!
//! The engine feeds decoded packets and the current time in, and sends
//! whatever comes back out. Everything here is deterministic apart from
//! the backoff jitter, which keeps it testable without a network.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use drift_core::dns::{Message, Question, Record, ServiceType, MDNS_PORT};
use drift_services::PeerEvent;

use super::backoff::Backoff;
use super::cache::Cache;
use super::conn::Interface;
use super::service::{answers_for, peers_from_response, LocalService};

/// The first this many backoff firings also announce our records.
pub const ANNOUNCE_COUNT: u32 = 4;
pub const BACKOFF_MIN: Duration = Duration::from_secs(2);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);
/// Cache changes are folded together for this long before being applied.
pub const CACHE_DELAY: Duration = Duration::from_millis(50);
/// The engine never sleeps for less than this between ticks.
pub const MIN_TIMER: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The mDNS group on the interface with this index.
    Multicast(u32),
    Unicast(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub to: Destination,
    pub message: Message,
}

/// What a received packet asks the engine to do.
#[derive(Debug, Default)]
pub struct Reaction {
    pub replies: Vec<Outgoing>,
    /// The cache took new records; tick again after `CACHE_DELAY`.
    pub cache_touched: bool,
}

/// What a timer tick asks the engine to do.
#[derive(Debug)]
pub struct Tick {
    pub outgoing: Vec<Outgoing>,
    pub events: Vec<PeerEvent>,
    pub next: Instant,
}

#[derive(Debug)]
pub struct Client {
    local: LocalService,
    browse: ServiceType,
    cache: Cache,
    backoff: Backoff,
}

impl Client {
    /// Advertise `local` and browse for instances of its own type.
    pub fn new(local: LocalService, now: Instant) -> Self {
        Self {
            browse: local.service.clone(),
            local,
            cache: Cache::new(now),
            backoff: Backoff::new(BACKOFF_MIN, BACKOFF_MAX, now),
        }
    }

    pub fn local(&self) -> &LocalService {
        &self.local
    }

    /// Start announcing and querying from scratch, e.g. after the set of
    /// interfaces changed.
    pub fn reset(&mut self, now: Instant) {
        self.backoff.reset(now);
    }

    pub fn handle(&mut self, now: Instant, msg: &Message, src: SocketAddr, ifaces: &[Interface]) -> Reaction {
        if msg.is_response() {
            return Reaction {
                replies: Vec::new(),
                cache_touched: self.handle_response(now, msg),
            };
        }
        Reaction {
            replies: self.handle_query(msg, src, ifaces),
            cache_touched: false,
        }
    }

    fn handle_response(&mut self, now: Instant, msg: &Message) -> bool {
        let mut touched = false;
        for peer in peers_from_response(msg, &self.browse, now) {
            if peer.instance == self.local.instance {
                continue;
            }
            tracing::trace!(peer = %peer.service_name(), ttl = ?peer.ttl, "cache put");
            self.cache.put(now, peer);
            touched = true;
        }
        touched
    }

    fn handle_query(&self, msg: &Message, src: SocketAddr, ifaces: &[Interface]) -> Vec<Outgoing> {
        // Probes carry authority records; we never contend for names.
        if !msg.authorities.is_empty() || msg.questions.is_empty() {
            return Vec::new();
        }
        let legacy = src.port() != MDNS_PORT;
        let (unicast, multicast): (Vec<&Question>, Vec<&Question>) = msg
            .questions
            .iter()
            .partition(|q| legacy || q.wants_unicast());

        let mut out = Vec::new();
        if !unicast.is_empty() {
            if let Some(iface) = best_interface(ifaces, src) {
                if let Some(mut reply) = self.reply(&iface.addrs(), &msg.answers, &unicast) {
                    if legacy {
                        reply.id = msg.id;
                        reply.questions = msg.questions.clone();
                    }
                    out.push(Outgoing {
                        to: Destination::Unicast(src),
                        message: reply,
                    });
                }
            }
        }
        if !multicast.is_empty() {
            for iface in ifaces {
                if let Some(reply) = self.reply(&iface.addrs(), &msg.answers, &multicast) {
                    out.push(Outgoing {
                        to: Destination::Multicast(iface.index),
                        message: reply,
                    });
                }
            }
        }
        out
    }

    fn reply(&self, addrs: &[IpAddr], known: &[Record], questions: &[&Question]) -> Option<Message> {
        let records = self.local.records(addrs, false);
        let mut picked = BTreeSet::new();
        for q in questions {
            for rr in answers_for(&records, known, q) {
                if let Some(i) = records.iter().position(|r| std::ptr::eq(r, rr)) {
                    picked.insert(i);
                }
            }
        }
        if picked.is_empty() {
            return None;
        }
        let (answers, additionals) = records
            .into_iter()
            .enumerate()
            .partition::<Vec<_>, _>(|(i, _)| picked.contains(i));
        Some(Message::response(
            0,
            answers.into_iter().map(|(_, r)| r).collect(),
            additionals.into_iter().map(|(_, r)| r).collect(),
        ))
    }

    /// Run timers: announce, browse, expire. Call again at `Tick::next`.
    pub fn tick(&mut self, now: Instant, ifaces: &[Interface]) -> Tick {
        let mut outgoing = Vec::new();

        let fired = self.backoff.poll(now);
        if fired && self.backoff.attempt() <= ANNOUNCE_COUNT {
            tracing::debug!(attempt = self.backoff.attempt(), "announcing");
            outgoing.extend(self.announcements(ifaces, false));
        }

        let (live_check, events) = self.cache.advance(now);
        if fired || live_check {
            let query = self.local.browse_query(&self.browse);
            outgoing.extend(ifaces.iter().map(|iface| Outgoing {
                to: Destination::Multicast(iface.index),
                message: query.clone(),
            }));
            self.cache.queried(now);
        }

        let mut next = self.backoff.next();
        if let Some(deadline) = self.cache.next_deadline() {
            next = next.min(deadline);
        }
        Tick {
            outgoing,
            events,
            next: next.max(now + MIN_TIMER),
        }
    }

    /// Our records with TTL zero, on every interface.
    pub fn goodbye(&self, ifaces: &[Interface]) -> Vec<Outgoing> {
        self.announcements(ifaces, true)
    }

    fn announcements(&self, ifaces: &[Interface], goodbye: bool) -> Vec<Outgoing> {
        ifaces
            .iter()
            .map(|iface| Outgoing {
                to: Destination::Multicast(iface.index),
                message: Message::response(0, self.local.records(&iface.addrs(), goodbye), Vec::new()),
            })
            .collect()
    }
}

/// The interface a unicast asker most likely reached us on: the scope of a
/// link-local IPv6 source, else the IPv4 address sharing the longest prefix.
fn best_interface(ifaces: &[Interface], src: SocketAddr) -> Option<&Interface> {
    match src {
        SocketAddr::V6(v6) if v6.scope_id() != 0 => ifaces
            .iter()
            .find(|i| i.index == v6.scope_id())
            .or_else(|| ifaces.first()),
        SocketAddr::V4(v4) => ifaces
            .iter()
            .filter(|i| i.v4.is_some())
            .max_by_key(|i| {
                let ours = i.v4.map_or(0, u32::from);
                (ours ^ u32::from(*v4.ip())).leading_zeros()
            })
            .or_else(|| ifaces.first()),
        SocketAddr::V6(_) => ifaces.iter().find(|i| !i.v6.is_empty()).or_else(|| ifaces.first()),
    }
}
