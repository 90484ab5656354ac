//! Multicast DNS wire format and DNS-SD naming.
//!
//! Implements the subset of RFC 1035 / RFC 6762 / RFC 6763 that service
//! discovery needs: the fixed header, questions, and A, AAAA, PTR, SRV, TXT
//! and NSEC records. Unknown record types are carried as raw bytes.
//!
//! Names are kept as label lists rather than dotted strings, so an instance
//! label may contain dots or spaces without escaping. Compression pointers
//! are followed on decode; the encoder writes names uncompressed.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

pub fn mdns_v4() -> SocketAddrV4 {
    SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT)
}

pub fn mdns_v6(scope_id: u32) -> SocketAddrV6 {
    SocketAddrV6::new(MDNS_GROUP_V6, MDNS_PORT, 0, scope_id)
}

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_NSEC: u16 = 47;
pub const TYPE_ANY: u16 = 255;

pub const CLASS_IN: u16 = 1;
/// Top bit of a record class: the record set replaces cached entries.
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;
/// Top bit of a question class: the querier asks for a unicast reply.
pub const CLASS_UNICAST_RESPONSE: u16 = 0x8000;

pub const FLAG_RESPONSE: u16 = 0x8000;
pub const FLAG_AUTHORITATIVE: u16 = 0x0400;

/// Largest datagram accepted from the network.
pub const MAX_PACKET_LEN: usize = 9000;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 32;

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed 12-byte DNS header. Counts are network byte order.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Header {
    pub id: U16<NetworkEndian>,
    pub flags: U16<NetworkEndian>,
    pub qdcount: U16<NetworkEndian>,
    pub ancount: U16<NetworkEndian>,
    pub nscount: U16<NetworkEndian>,
    pub arcount: U16<NetworkEndian>,
}

assert_eq_size!(Header, [u8; 12]);

// ── Names ─────────────────────────────────────────────────────────────────────

/// A domain name as a list of labels, root label omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name(Vec<String>);

impl Name {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    /// Split a dotted name. Empty labels (leading, trailing, doubled dots)
    /// are dropped, so `"local."` and `"local"` are the same name.
    pub fn parse(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    /// A new name with `label` prepended.
    pub fn prepend(&self, label: impl Into<String>) -> Self {
        let mut labels = Vec::with_capacity(self.0.len() + 1);
        labels.push(label.into());
        labels.extend(self.0.iter().cloned());
        Self(labels)
    }

    /// A new name made of `self` followed by `suffix`.
    pub fn join(&self, suffix: &Name) -> Self {
        let mut labels = self.0.clone();
        labels.extend(suffix.0.iter().cloned());
        Self(labels)
    }

    /// DNS names compare case-insensitively.
    pub fn matches(&self, other: &Name) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// True if `self` ends with `suffix`.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        self.0.len() >= suffix.0.len()
            && self.0[self.0.len() - suffix.0.len()..]
                .iter()
                .zip(&suffix.0)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), DnsError> {
        let mut total = 1;
        for label in &self.0 {
            let bytes = label.as_bytes();
            if bytes.is_empty() || bytes.len() > MAX_LABEL_LEN {
                return Err(DnsError::LabelTooLong(label.clone()));
            }
            total += bytes.len() + 1;
            if total > MAX_NAME_LEN {
                return Err(DnsError::NameTooLong);
            }
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
        buf.put_u8(0);
        Ok(())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for label in &self.0 {
            write!(f, "{}.", label.replace('.', "\\."))?;
        }
        Ok(())
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: Name, qtype: u16) -> Self {
        Self {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn wants_unicast(&self) -> bool {
        self.qclass & CLASS_UNICAST_RESPONSE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Txt(Vec<String>),
    Nsec {
        next: Name,
        types: Vec<u16>,
    },
    Other {
        rtype: u16,
        data: Vec<u8>,
    },
}

impl RData {
    pub fn rtype(&self) -> u16 {
        match self {
            RData::A(_) => TYPE_A,
            RData::Aaaa(_) => TYPE_AAAA,
            RData::Ptr(_) => TYPE_PTR,
            RData::Srv { .. } => TYPE_SRV,
            RData::Txt(_) => TYPE_TXT,
            RData::Nsec { .. } => TYPE_NSEC,
            RData::Other { rtype, .. } => *rtype,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: Name,
    pub class: u16,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn new(name: Name, class: u16, ttl: u32, data: RData) -> Self {
        Self {
            name,
            class,
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> u16 {
        self.data.rtype()
    }

    /// Class with the cache-flush bit cleared.
    pub fn base_class(&self) -> u16 {
        self.class & !CLASS_CACHE_FLUSH
    }

    /// Same owner name, type and data; TTL and class flags are ignored.
    pub fn same_rrset_member(&self, other: &Record) -> bool {
        self.name.matches(&other.name) && self.data == other.data
    }

    /// Whether this record answers `q`.
    pub fn answers(&self, q: &Question) -> bool {
        let qclass = q.qclass & !CLASS_UNICAST_RESPONSE;
        self.name.matches(&q.name)
            && (q.qtype == TYPE_ANY || q.qtype == self.rtype())
            && (qclass == TYPE_ANY || qclass == self.base_class())
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// A multicast query, optionally carrying known answers.
    pub fn query(questions: Vec<Question>, known_answers: Vec<Record>) -> Self {
        Self {
            questions,
            answers: known_answers,
            ..Self::default()
        }
    }

    /// An authoritative response.
    pub fn response(id: u16, answers: Vec<Record>, additionals: Vec<Record>) -> Self {
        Self {
            id,
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            answers,
            additionals,
            ..Self::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Every resource record in the message, across all sections.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
    }

    pub fn encode(&self) -> Result<Bytes, DnsError> {
        let header = Header {
            id: U16::new(self.id),
            flags: U16::new(self.flags),
            qdcount: U16::new(section_len(self.questions.len())?),
            ancount: U16::new(section_len(self.answers.len())?),
            nscount: U16::new(section_len(self.authorities.len())?),
            arcount: U16::new(section_len(self.additionals.len())?),
        };

        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(header.as_bytes());
        for q in &self.questions {
            q.name.encode(&mut buf)?;
            buf.put_u16(q.qtype);
            buf.put_u16(q.qclass);
        }
        for rr in self.records() {
            encode_record(rr, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(packet: &[u8]) -> Result<Self, DnsError> {
        let header = Header::read_from_prefix(packet).ok_or(DnsError::Truncated)?;
        let mut rd = Reader {
            packet,
            pos: std::mem::size_of::<Header>(),
        };

        let mut questions = Vec::new();
        for _ in 0..header.qdcount.get() {
            let name = rd.name()?;
            let qtype = rd.u16()?;
            let qclass = rd.u16()?;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        let mut section = |count: u16| -> Result<Vec<Record>, DnsError> {
            (0..count).map(|_| decode_record(&mut rd)).collect()
        };
        let answers = section(header.ancount.get())?;
        let authorities = section(header.nscount.get())?;
        let additionals = section(header.arcount.get())?;

        Ok(Self {
            id: header.id.get(),
            flags: header.flags.get(),
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

fn section_len(n: usize) -> Result<u16, DnsError> {
    u16::try_from(n).map_err(|_| DnsError::TooManyRecords)
}

fn encode_record(rr: &Record, buf: &mut BytesMut) -> Result<(), DnsError> {
    rr.name.encode(buf)?;
    buf.put_u16(rr.rtype());
    buf.put_u16(rr.class);
    buf.put_u32(rr.ttl);

    let mut rdata = BytesMut::new();
    match &rr.data {
        RData::A(ip) => rdata.put_slice(&ip.octets()),
        RData::Aaaa(ip) => rdata.put_slice(&ip.octets()),
        RData::Ptr(target) => target.encode(&mut rdata)?,
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            rdata.put_u16(*priority);
            rdata.put_u16(*weight);
            rdata.put_u16(*port);
            target.encode(&mut rdata)?;
        }
        RData::Txt(entries) => {
            if entries.is_empty() {
                rdata.put_u8(0);
            }
            for entry in entries {
                let bytes = entry.as_bytes();
                let len = u8::try_from(bytes.len())
                    .map_err(|_| DnsError::TxtEntryTooLong(bytes.len()))?;
                rdata.put_u8(len);
                rdata.put_slice(bytes);
            }
        }
        RData::Nsec { next, types } => {
            next.encode(&mut rdata)?;
            encode_type_bitmap(types, &mut rdata);
        }
        RData::Other { data, .. } => rdata.put_slice(data),
    }

    let len = u16::try_from(rdata.len()).map_err(|_| DnsError::RDataTooLong)?;
    buf.put_u16(len);
    buf.put_slice(&rdata);
    Ok(())
}

/// RFC 4034 §4.1.2 type bitmap, window 0 only; types above 255 are dropped.
fn encode_type_bitmap(types: &[u16], buf: &mut BytesMut) {
    let mut bitmap = [0u8; 32];
    let mut used = 0;
    for &t in types.iter().filter(|t| **t < 256) {
        let idx = (t / 8) as usize;
        bitmap[idx] |= 0x80 >> (t % 8);
        used = used.max(idx + 1);
    }
    if used == 0 {
        return;
    }
    buf.put_u8(0);
    buf.put_u8(used as u8);
    buf.put_slice(&bitmap[..used]);
}

fn decode_type_bitmap(mut data: &[u8]) -> Result<Vec<u16>, DnsError> {
    let mut types = Vec::new();
    while data.len() >= 2 {
        let window = data[0] as u16;
        let len = data[1] as usize;
        let bits = data.get(2..2 + len).ok_or(DnsError::Truncated)?;
        for (i, byte) in bits.iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    types.push(window * 256 + (i * 8 + bit) as u16);
                }
            }
        }
        data = &data[2 + len..];
    }
    Ok(types)
}

fn decode_record(rd: &mut Reader<'_>) -> Result<Record, DnsError> {
    let name = rd.name()?;
    let rtype = rd.u16()?;
    let class = rd.u16()?;
    let ttl = rd.u32()?;
    let rdlen = rd.u16()? as usize;
    let end = rd.pos.checked_add(rdlen).ok_or(DnsError::Truncated)?;
    if end > rd.packet.len() {
        return Err(DnsError::Truncated);
    }

    let data = match rtype {
        TYPE_A => {
            let b: [u8; 4] = rd.take(4)?.try_into().map_err(|_| DnsError::Truncated)?;
            RData::A(Ipv4Addr::from(b))
        }
        TYPE_AAAA => {
            let b: [u8; 16] = rd.take(16)?.try_into().map_err(|_| DnsError::Truncated)?;
            RData::Aaaa(Ipv6Addr::from(b))
        }
        TYPE_PTR => RData::Ptr(rd.name()?),
        TYPE_SRV => RData::Srv {
            priority: rd.u16()?,
            weight: rd.u16()?,
            port: rd.u16()?,
            target: rd.name()?,
        },
        TYPE_TXT => {
            let mut entries = Vec::new();
            while rd.pos < end {
                let len = rd.u8()? as usize;
                let bytes = rd.take(len)?;
                if !bytes.is_empty() {
                    entries.push(String::from_utf8_lossy(bytes).into_owned());
                }
            }
            RData::Txt(entries)
        }
        TYPE_NSEC => {
            let next = rd.name()?;
            if rd.pos > end {
                return Err(DnsError::Truncated);
            }
            let types = decode_type_bitmap(&rd.packet[rd.pos..end])?;
            RData::Nsec { next, types }
        }
        _ => RData::Other {
            rtype,
            data: rd.take(rdlen)?.to_vec(),
        },
    };

    if rd.pos > end {
        return Err(DnsError::Truncated);
    }
    rd.pos = end;
    Ok(Record {
        name,
        class,
        ttl,
        data,
    })
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Bounds-checked cursor over a whole packet. Names need random access to
/// follow compression pointers, which rules out a consuming `Buf`.
struct Reader<'a> {
    packet: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DnsError> {
        let end = self.pos.checked_add(n).ok_or(DnsError::Truncated)?;
        let slice = self.packet.get(self.pos..end).ok_or(DnsError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DnsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<Name, DnsError> {
        let mut labels = Vec::new();
        let mut total = 1;
        let mut cursor = self.pos;
        let mut resume = None;
        let mut jumps = 0;

        loop {
            let len = *self.packet.get(cursor).ok_or(DnsError::Truncated)? as usize;
            match len & 0xc0 {
                0x00 if len == 0 => {
                    cursor += 1;
                    break;
                }
                0x00 => {
                    let start = cursor + 1;
                    let label = self
                        .packet
                        .get(start..start + len)
                        .ok_or(DnsError::Truncated)?;
                    total += len + 1;
                    if total > MAX_NAME_LEN {
                        return Err(DnsError::NameTooLong);
                    }
                    labels.push(String::from_utf8_lossy(label).into_owned());
                    cursor = start + len;
                }
                0xc0 => {
                    let low = *self.packet.get(cursor + 1).ok_or(DnsError::Truncated)? as usize;
                    if resume.is_none() {
                        resume = Some(cursor + 2);
                    }
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(DnsError::PointerLoop);
                    }
                    cursor = ((len & 0x3f) << 8) | low;
                }
                _ => return Err(DnsError::BadLabelType(len as u8)),
            }
        }

        self.pos = resume.unwrap_or(cursor);
        Ok(Name(labels))
    }
}

// ── DNS-SD naming ─────────────────────────────────────────────────────────────

/// A DNS-SD service type such as `_drift._tcp` in domain `local`,
/// optionally with subtypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceType {
    /// Two labels: `_<service>` and `_tcp` or `_udp`.
    pub name: Name,
    pub domain: Name,
    pub subtypes: Vec<String>,
}

impl ServiceType {
    pub fn new(name: &str, domain: &str) -> Result<Self, DnsError> {
        let name = Name::parse(name);
        let labels = name.labels();
        if labels.len() != 2
            || !labels[0].starts_with('_')
            || !(labels[1] == "_tcp" || labels[1] == "_udp")
        {
            return Err(DnsError::InvalidServiceType(name.to_string()));
        }
        let domain = Name::parse(domain);
        if domain.labels().is_empty() {
            return Err(DnsError::InvalidServiceType(format!("empty domain for {name}")));
        }
        Ok(Self {
            name,
            domain,
            subtypes: Vec::new(),
        })
    }

    pub fn with_subtypes(mut self, subtypes: Vec<String>) -> Self {
        self.subtypes = subtypes;
        self
    }

    /// `_drift._tcp.local`, the PTR owner name browsed for instances.
    pub fn query_name(&self) -> Name {
        self.name.join(&self.domain)
    }

    /// `<instance>._drift._tcp.local`.
    pub fn instance_name(&self, instance: &str) -> Name {
        self.query_name().prepend(instance)
    }

    /// `<subtype>._sub._drift._tcp.local`.
    pub fn subtype_name(&self, subtype: &str) -> Name {
        self.query_name().prepend("_sub").prepend(subtype)
    }

    /// `_services._dns-sd._udp.<domain>`, the service enumeration name.
    pub fn meta_query_name(&self) -> Name {
        Name::from_labels(["_services", "_dns-sd", "_udp"]).join(&self.domain)
    }

    /// The instance label of a full service instance name of this type.
    pub fn instance_of<'n>(&self, full: &'n Name) -> Option<&'n str> {
        let labels = full.labels();
        let suffix = self.query_name();
        if labels.len() == suffix.labels().len() + 1 && full.ends_with(&suffix) {
            Some(labels[0].as_str())
        } else {
            None
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.query_name())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("packet truncated")]
    Truncated,
    #[error("label too long or empty: {0:?}")]
    LabelTooLong(String),
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    #[error("unsupported label type {0:#04x}")]
    BadLabelType(u8),
    #[error("compression pointer loop")]
    PointerLoop,
    #[error("TXT entry of {0} bytes exceeds 255")]
    TxtEntryTooLong(usize),
    #[error("record data exceeds 65535 bytes")]
    RDataTooLong,
    #[error("more than 65535 entries in one section")]
    TooManyRecords,
    #[error("invalid service type: {0}")]
    InvalidServiceType(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drift() -> ServiceType {
        ServiceType::new("_drift._tcp", "local.").unwrap()
    }

    #[test]
    fn header_is_network_order() {
        let msg = Message::response(0x1234, Vec::new(), Vec::new());
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[..4], &[0x12, 0x34, 0x84, 0x00]);
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn query_decodes() {
        let mut q = Question::new(drift().query_name(), TYPE_PTR);
        q.qclass |= CLASS_UNICAST_RESPONSE;
        let msg = Message::query(vec![q.clone()], Vec::new());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert!(!decoded.is_response());
        assert_eq!(decoded.questions, vec![q]);
        assert!(decoded.questions[0].wants_unicast());
    }

    #[test]
    fn response_with_every_record_type() {
        let svc = drift();
        let instance = svc.instance_name("Alice’s laptop. v2");
        let host = Name::parse("alice.local");
        let answers = vec![
            Record::new(svc.query_name(), CLASS_IN, 4500, RData::Ptr(instance.clone())),
            Record::new(
                instance.clone(),
                CLASS_IN | CLASS_CACHE_FLUSH,
                120,
                RData::Srv {
                    priority: 0,
                    weight: 0,
                    port: 40123,
                    target: host.clone(),
                },
            ),
            Record::new(
                instance.clone(),
                CLASS_IN | CLASS_CACHE_FLUSH,
                4500,
                RData::Txt(vec!["v=0.1".into(), "pk=00ff".into()]),
            ),
        ];
        let additionals = vec![
            Record::new(host.clone(), CLASS_IN, 120, RData::A(Ipv4Addr::new(10, 0, 0, 7))),
            Record::new(host.clone(), CLASS_IN, 120, RData::Aaaa("fe80::1".parse().unwrap())),
            Record::new(
                instance.clone(),
                CLASS_IN | CLASS_CACHE_FLUSH,
                120,
                RData::Nsec {
                    next: instance.clone(),
                    types: vec![TYPE_TXT, TYPE_SRV],
                },
            ),
        ];
        let msg = Message::response(0, answers, additionals);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(svc.instance_of(&decoded.answers[1].name), Some("Alice’s laptop. v2"));
    }

    #[test]
    fn empty_txt_encodes_single_zero_byte() {
        let rr = Record::new(Name::parse("a.local"), CLASS_IN, 1, RData::Txt(Vec::new()));
        let bytes = Message::response(0, vec![rr], Vec::new()).encode().unwrap();
        assert_eq!(&bytes[bytes.len() - 3..], &[0, 1, 0]);
    }

    #[test]
    fn compressed_names_are_followed() {
        // Header: 0 questions, 1 answer.
        let mut pkt = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        // PTR owner "_drift._tcp.local" at offset 12.
        pkt.extend_from_slice(b"\x06_drift\x04_tcp\x05local\x00");
        pkt.extend_from_slice(&[0, 12, 0, 1, 0, 0, 0x11, 0x94]);
        // rdata: "box" + pointer to offset 12.
        let rdata = [&b"\x03box"[..], &[0xc0u8, 12][..]].concat();
        pkt.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        pkt.extend_from_slice(&rdata);

        let msg = Message::decode(&pkt).unwrap();
        let RData::Ptr(target) = &msg.answers[0].data else {
            panic!("expected PTR");
        };
        assert_eq!(target, &Name::parse("box._drift._tcp.local"));
        assert_eq!(msg.answers[0].ttl, 4500);
    }

    #[test]
    fn pointer_loop_rejected() {
        let mut pkt = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        pkt.extend_from_slice(&[0xc0, 12, 0, 12, 0, 1]);
        assert_eq!(Message::decode(&pkt).unwrap_err(), DnsError::PointerLoop);
    }

    #[test]
    fn truncated_packets_rejected() {
        assert_eq!(Message::decode(&[0; 5]).unwrap_err(), DnsError::Truncated);

        let msg = Message::query(vec![Question::new(drift().query_name(), TYPE_PTR)], Vec::new());
        let bytes = msg.encode().unwrap();
        assert_eq!(
            Message::decode(&bytes[..bytes.len() - 1]).unwrap_err(),
            DnsError::Truncated
        );
    }

    #[test]
    fn oversized_label_rejected_on_encode() {
        let name = Name::from_labels(["x".repeat(64), "local".to_string()]);
        let msg = Message::query(vec![Question::new(name, TYPE_A)], Vec::new());
        assert!(matches!(msg.encode(), Err(DnsError::LabelTooLong(_))));
    }

    #[test]
    fn record_answers_question() {
        let svc = drift();
        let rr = Record::new(
            svc.query_name(),
            CLASS_IN,
            4500,
            RData::Ptr(svc.instance_name("a")),
        );
        let upper = Name::from_labels(["_DRIFT", "_TCP", "LOCAL"]);
        assert!(rr.answers(&Question::new(upper, TYPE_PTR)));
        assert!(rr.answers(&Question::new(svc.query_name(), TYPE_ANY)));
        assert!(!rr.answers(&Question::new(svc.query_name(), TYPE_SRV)));

        let mut unicast = Question::new(svc.query_name(), TYPE_PTR);
        unicast.qclass |= CLASS_UNICAST_RESPONSE;
        assert!(rr.answers(&unicast));
    }

    #[test]
    fn service_type_validation() {
        assert!(ServiceType::new("_drift._tcp", "local").is_ok());
        assert!(ServiceType::new("drift._tcp", "local").is_err());
        assert!(ServiceType::new("_drift._sctp", "local").is_err());
        assert!(ServiceType::new("_drift", "local").is_err());
        assert!(ServiceType::new("_drift._tcp", "").is_err());
    }

    #[test]
    fn service_type_names() {
        let svc = drift().with_subtypes(vec!["_printer".into()]);
        assert_eq!(svc.query_name().to_string(), "_drift._tcp.local.");
        assert_eq!(
            svc.subtype_name("_printer").to_string(),
            "_printer._sub._drift._tcp.local."
        );
        assert_eq!(
            svc.meta_query_name().to_string(),
            "_services._dns-sd._udp.local."
        );
        assert_eq!(svc.instance_of(&svc.query_name()), None);
        assert_eq!(svc.instance_of(&Name::parse("a._other._tcp.local")), None);
    }

    #[test]
    fn nsec_bitmap_layout() {
        let mut buf = BytesMut::new();
        encode_type_bitmap(&[TYPE_A, TYPE_AAAA], &mut buf);
        // Window 0, 4 bytes: A is bit 1 of byte 0, AAAA (28) is bit 4 of byte 3.
        assert_eq!(&buf[..], &[0, 4, 0x40, 0, 0, 0x08]);
        assert_eq!(decode_type_bitmap(&buf).unwrap(), vec![TYPE_A, TYPE_AAAA]);
    }
}
