//! DNS-SD records for the service we advertise, and peers parsed out of
//! the responses we hear.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use drift_core::dns::{
    Message, Name, Question, RData, Record, ServiceType, CLASS_CACHE_FLUSH, CLASS_IN, TYPE_PTR,
    TYPE_SRV, TYPE_TXT,
};
use drift_services::Peer;

/// TTL of records naming the host: SRV, A, AAAA and the host NSEC.
pub const HOST_TTL: u32 = 120;
/// TTL of every other record.
pub const DEFAULT_TTL: u32 = 75 * 60;

/// The service instance this node advertises.
#[derive(Debug, Clone)]
pub struct LocalService {
    pub service: ServiceType,
    /// Instance label, unique on the link.
    pub instance: String,
    /// Host label without domain, e.g. `ada-laptop`.
    pub host: String,
    pub port: u16,
    pub txt: Vec<String>,
}

impl LocalService {
    pub fn instance_name(&self) -> Name {
        self.service.instance_name(&self.instance)
    }

    pub fn host_name(&self) -> Name {
        Name::parse(&self.host).join(&self.service.domain)
    }

    /// Every record describing this service on a link where we hold `addrs`.
    /// With `goodbye` set all TTLs are zero.
    pub fn records(&self, addrs: &[IpAddr], goodbye: bool) -> Vec<Record> {
        let ttl = |t: u32| if goodbye { 0 } else { t };
        let shared = CLASS_IN;
        let unique = CLASS_IN | CLASS_CACHE_FLUSH;

        let instance = self.instance_name();
        let host = self.host_name();
        let ptr = RData::Ptr(instance.clone());

        let mut records = vec![
            Record::new(self.service.query_name(), shared, ttl(DEFAULT_TTL), ptr.clone()),
            Record::new(
                self.service.meta_query_name(),
                shared,
                ttl(DEFAULT_TTL),
                RData::Ptr(self.service.query_name()),
            ),
        ];
        for subtype in &self.service.subtypes {
            records.push(Record::new(
                self.service.subtype_name(subtype),
                shared,
                ttl(DEFAULT_TTL),
                ptr.clone(),
            ));
        }
        records.push(Record::new(
            instance.clone(),
            unique,
            ttl(HOST_TTL),
            RData::Srv {
                priority: 0,
                weight: 0,
                port: self.port,
                target: host.clone(),
            },
        ));
        records.push(Record::new(
            instance.clone(),
            unique,
            ttl(DEFAULT_TTL),
            RData::Txt(self.txt.clone()),
        ));
        records.push(Record::new(
            instance.clone(),
            unique,
            ttl(DEFAULT_TTL),
            RData::Nsec {
                next: instance,
                types: vec![TYPE_TXT, TYPE_SRV],
            },
        ));

        let mut host_types = Vec::new();
        for addr in addrs {
            let data = match addr {
                IpAddr::V4(v4) => RData::A(*v4),
                IpAddr::V6(v6) => RData::Aaaa(*v6),
            };
            if !host_types.contains(&data.rtype()) {
                host_types.push(data.rtype());
            }
            records.push(Record::new(host.clone(), unique, ttl(HOST_TTL), data));
        }
        host_types.sort_unstable();
        records.push(Record::new(
            host.clone(),
            unique,
            ttl(HOST_TTL),
            RData::Nsec {
                next: host,
                types: host_types,
            },
        ));
        records
    }

    /// The browse query for `browse`, carrying our own PTR as a known answer
    /// when we advertise the same type.
    pub fn browse_query(&self, browse: &ServiceType) -> Message {
        let question = Question::new(browse.query_name(), TYPE_PTR);
        let mut known = Vec::new();
        if browse.query_name().matches(&self.service.query_name()) {
            known.push(Record::new(
                self.service.query_name(),
                CLASS_IN,
                DEFAULT_TTL,
                RData::Ptr(self.instance_name()),
            ));
        }
        Message::query(vec![question], known)
    }
}

/// Records answering `question`, minus those the asker already knows with
/// at least half their TTL remaining.
pub fn answers_for<'r>(records: &'r [Record], known: &[Record], question: &Question) -> Vec<&'r Record> {
    records
        .iter()
        .filter(|rr| rr.answers(question))
        .filter(|rr| {
            !known
                .iter()
                .any(|k| k.same_rrset_member(rr) && k.ttl >= rr.ttl / 2)
        })
        .collect()
}

// ── Parsing responses ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Partial {
    instance: String,
    host: Option<Name>,
    port: u16,
    ttl: u32,
    txt: Vec<String>,
}

/// Peers of type `browse` described by a response. Instances without an
/// SRV record are skipped. A TTL of zero marks a goodbye.
pub fn peers_from_response(msg: &Message, browse: &ServiceType, now: Instant) -> Vec<Peer> {
    if !msg.is_response() || !msg.questions.is_empty() {
        return Vec::new();
    }

    let mut partials: HashMap<String, Partial> = HashMap::new();
    let mut addrs: HashMap<String, Vec<IpAddr>> = HashMap::new();

    for rr in msg.records() {
        match &rr.data {
            RData::Srv { port, target, .. } => {
                if let Some(instance) = browse.instance_of(&rr.name) {
                    let p = partials.entry(key(&rr.name)).or_default();
                    p.instance = instance.to_string();
                    p.host = Some(target.clone());
                    p.port = *port;
                    p.ttl = rr.ttl;
                }
            }
            RData::Txt(entries) => {
                if browse.instance_of(&rr.name).is_some() {
                    partials.entry(key(&rr.name)).or_default().txt = entries.clone();
                }
            }
            RData::A(v4) => {
                addrs.entry(key(&rr.name)).or_default().push(IpAddr::V4(*v4));
            }
            RData::Aaaa(v6) => {
                addrs.entry(key(&rr.name)).or_default().push(IpAddr::V6(*v6));
            }
            _ => {}
        }
    }

    let service = browse.name.labels().join(".");
    let domain = browse.domain.labels().join(".");
    let mut peers: Vec<Peer> = partials
        .into_values()
        .filter_map(|p| {
            let host = p.host?;
            let mut host_addrs = addrs.get(&key(&host)).cloned().unwrap_or_default();
            host_addrs.sort();
            host_addrs.dedup();
            Some(Peer {
                instance: p.instance,
                service: service.clone(),
                domain: domain.clone(),
                hostname: host.labels().join("."),
                port: p.port,
                addrs: host_addrs,
                txt: p.txt,
                ttl: Duration::from_secs(u64::from(p.ttl)),
                seen_at: now,
            })
        })
        .collect();
    peers.sort_by(|a, b| a.instance.cmp(&b.instance));
    peers
}

fn key(name: &Name) -> String {
    name.labels().join(".").to_ascii_lowercase()
}
