use super::question::{QueryRecord, CLASS_ANY, CLASS_FLAG, CLASS_IN};
use super::txt::TxtData;
use super::RecordType;
use crate::buffer::reader::ReaderError;
use crate::buffer::writer::WriterError;
use crate::buffer::BytePacketBuffer;
use crate::name;

use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Default TTL for host records (A/AAAA/SRV/NSEC), per RFC 6762 §10.
pub const TTL_HOST: u32 = 120;
/// Default TTL for pointer and metadata records (PTR/TXT).
pub const TTL_SHARED: u32 = 4500;

/// Names that never get goodbye records: the service enumeration and
/// legacy browsing domains are not owned by any single responder.
const RESERVED_NAMES: [&str; 6] = [
    "_services._dns-sd._udp",
    "b._dns-sd._udp",
    "db._dns-sd._udp",
    "r._dns-sd._udp",
    "dr._dns-sd._udp",
    "lb._dns-sd._udp",
];

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    PTR(String),
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    TXT(TxtData),
    /// rrtypes the record's name has, restricted to window block 0
    /// (types 0..=255).
    NSEC(Vec<u16>),
    /// Anything else, carried opaquely so it survives a decode/encode
    /// round trip.
    Unknown {
        rrtype: u16,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// NAME, fully qualified, original casing kept.
    pub name: String,
    /// CLASS without the cache-flush bit.
    pub rrclass: u16,
    /// Top bit of the wire class: the sender asserts exclusive ownership
    /// of this name/type pair.
    pub cache_flush: bool,
    pub ttl: u32,
    pub rdata: RData,
    /// Records that should travel in the additional section whenever this
    /// one is answered. Additionals never nest further than one level.
    pub additionals: Vec<ResourceRecord>,
}

/// Identity of a name/type/class triple, case-folded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameKey {
    pub name: String,
    pub rrtype: u16,
    pub rrclass: u16,
}

/// Full record identity: name triple plus canonical rdata bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub name: NameKey,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    fn build(name: impl AsRef<str>, ttl: u32, cache_flush: bool, rdata: RData) -> Self {
        Self {
            name: name::fqdn(name.as_ref()),
            rrclass: CLASS_IN,
            cache_flush,
            ttl,
            rdata,
            additionals: Vec::new(),
        }
    }

    pub fn a(name: impl AsRef<str>, addr: Ipv4Addr) -> Self {
        Self::build(name, TTL_HOST, true, RData::A(addr))
    }

    pub fn aaaa(name: impl AsRef<str>, addr: Ipv6Addr) -> Self {
        Self::build(name, TTL_HOST, true, RData::AAAA(addr))
    }

    pub fn ptr(name: impl AsRef<str>, target: impl AsRef<str>) -> Self {
        Self::build(
            name,
            TTL_SHARED,
            false,
            RData::PTR(name::fqdn(target.as_ref())),
        )
    }

    pub fn srv(name: impl AsRef<str>, target: impl AsRef<str>, port: u16) -> Self {
        Self::build(
            name,
            TTL_HOST,
            true,
            RData::SRV {
                priority: 0,
                weight: 0,
                port,
                target: name::fqdn(target.as_ref()),
            },
        )
    }

    pub fn txt(name: impl AsRef<str>, txt: TxtData) -> Self {
        Self::build(name, TTL_SHARED, true, RData::TXT(txt))
    }

    /// Types above 255 (outside window block 0) are silently discarded.
    pub fn nsec(name: impl AsRef<str>, types: impl IntoIterator<Item = u16>) -> Self {
        let mut types: Vec<u16> = types.into_iter().filter(|t| *t <= 255).collect();
        types.sort_unstable();
        types.dedup();
        Self::build(name, TTL_HOST, true, RData::NSEC(types))
    }

    pub fn unknown(name: impl AsRef<str>, rrtype: u16, data: Vec<u8>, ttl: u32) -> Self {
        Self::build(name, ttl, true, RData::Unknown { rrtype, data })
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cache_flush(mut self, cache_flush: bool) -> Self {
        self.cache_flush = cache_flush;
        self
    }

    pub fn with_additionals(mut self, additionals: Vec<ResourceRecord>) -> Self {
        self.additionals = additionals;
        self
    }

    pub fn rrtype(&self) -> RecordType {
        match &self.rdata {
            RData::A(_) => RecordType::A,
            RData::AAAA(_) => RecordType::AAAA,
            RData::PTR(_) => RecordType::PTR,
            RData::SRV { .. } => RecordType::SRV,
            RData::TXT(_) => RecordType::TXT,
            RData::NSEC(_) => RecordType::NSEC,
            RData::Unknown { rrtype, .. } => RecordType::from_num(*rrtype),
        }
    }

    pub fn rrtype_num(&self) -> u16 {
        match &self.rdata {
            RData::Unknown { rrtype, .. } => *rrtype,
            _ => self.rrtype().into_num(),
        }
    }

    /// Whether the record is a member of a unique (cache-flushed) rrset.
    /// Only PTR records are shared between responders.
    pub fn unique(&self) -> bool {
        !matches!(self.rdata, RData::PTR(_))
    }

    /// The PTR target, where there is one.
    pub fn ptr_target(&self) -> Option<&str> {
        match &self.rdata {
            RData::PTR(target) => Some(target),
            _ => None,
        }
    }

    pub fn name_key(&self) -> NameKey {
        NameKey {
            name: name::key(&self.name),
            rrtype: self.rrtype_num(),
            rrclass: self.rrclass,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            name: self.name_key(),
            rdata: self.canonical_rdata(),
        }
    }

    /// Identity equality: same name/type/class and same rdata. TTL,
    /// cache-flush and additionals don't participate.
    pub fn matches(&self, other: &ResourceRecord) -> bool {
        self.record_key() == other.record_key()
    }

    /// Two records conflict when both claim exclusive ownership of the
    /// same name/type/class but disagree about the data.
    pub fn conflicts_with(&self, other: &ResourceRecord) -> bool {
        self.unique()
            && other.unique()
            && self.name_key() == other.name_key()
            && self.canonical_rdata() != other.canonical_rdata()
    }

    /// Whether this record answers the given question.
    pub fn answers(&self, question: &QueryRecord) -> bool {
        (self.rrclass == question.qclass || question.qclass == CLASS_ANY)
            && (self.rrtype_num() == question.qtype.into_num()
                || question.qtype == RecordType::ANY)
            && name::eq_ignore_case(&self.name, &question.name)
    }

    /// Lexicographic ordering for simultaneous probe tiebreaking:
    /// class (flush bit excluded), then type, then raw rdata bytes.
    pub fn cmp_tiebreak(&self, other: &ResourceRecord) -> Ordering {
        self.rrclass
            .cmp(&other.rrclass)
            .then_with(|| self.rrtype_num().cmp(&other.rrtype_num()))
            .then_with(|| self.raw_rdata().cmp(&other.raw_rdata()))
    }

    /// Reserved service-enumeration names are shared infrastructure and
    /// must never be announced as gone.
    pub fn can_goodbye(&self) -> bool {
        let lowered = name::trimmed(&self.name).to_ascii_lowercase();
        !RESERVED_NAMES
            .iter()
            .any(|reserved| lowered.starts_with(reserved))
    }

    /// Canonical rdata for identity hashing: embedded names case-folded
    /// so `box.local.` and `Box.local.` hash alike.
    pub fn canonical_rdata(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.rdata {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::AAAA(addr) => out.extend_from_slice(&addr.octets()),
            RData::PTR(target) => out.extend_from_slice(name::key(target).as_bytes()),
            RData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(name::key(target).as_bytes());
            }
            RData::TXT(txt) => out.extend_from_slice(&txt.to_wire()),
            RData::NSEC(types) => out.extend_from_slice(&nsec_bitmap(types)),
            RData::Unknown { rrtype, data } => {
                out.extend_from_slice(&rrtype.to_be_bytes());
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Uncompressed wire rdata, original casing, as compared during probe
    /// tiebreaks.
    pub fn raw_rdata(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.rdata {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::AAAA(addr) => out.extend_from_slice(&addr.octets()),
            RData::PTR(target) => name::write_labels(target, &mut out),
            RData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                name::write_labels(target, &mut out);
            }
            RData::TXT(txt) => out.extend_from_slice(&txt.to_wire()),
            RData::NSEC(types) => {
                name::write_labels(&self.name, &mut out);
                out.extend_from_slice(&nsec_bitmap(types));
            }
            RData::Unknown { data, .. } => out.extend_from_slice(data),
        }
        out
    }

    pub fn read(buffer: &mut BytePacketBuffer) -> Result<ResourceRecord, ReaderError> {
        let rname = buffer.read_qname()?;
        let rrtype_num = buffer.read_u16()?;
        let rrtype = RecordType::from_num(rrtype_num);

        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;
        let rdata_start = buffer.pos();

        let rdata = match rrtype {
            RecordType::A => {
                let raw_addr = buffer.read_u32()?;
                RData::A(Ipv4Addr::from(raw_addr))
            }
            RecordType::AAAA => {
                let mut octets = [0u8; 16];
                for chunk in octets.chunks_mut(4) {
                    chunk.copy_from_slice(&buffer.read_u32()?.to_be_bytes());
                }
                RData::AAAA(Ipv6Addr::from(octets))
            }
            RecordType::PTR => RData::PTR(buffer.read_qname()?),
            RecordType::SRV => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;
                let target = buffer.read_qname()?;
                RData::SRV {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::TXT => {
                let raw = buffer.get_range(rdata_start, data_len)?.to_vec();
                buffer.step(data_len)?;
                RData::TXT(TxtData::from_wire(&raw))
            }
            RecordType::NSEC => {
                // next-domain name; multicast DNS sets it to the record's
                // own name, so only the bitmap matters
                let _next_domain = buffer.read_qname()?;
                let rdata_end = rdata_start + data_len;
                let mut types = Vec::new();
                while buffer.pos() + 2 <= rdata_end {
                    let block = buffer.read()?;
                    let len = buffer.read()? as usize;
                    if buffer.pos() + len > rdata_end {
                        break;
                    }
                    if block != 0 || len > 32 {
                        // foreign window blocks are skipped silently
                        buffer.step(len)?;
                        continue;
                    }
                    for octet_index in 0..len {
                        let octet = buffer.read()?;
                        for bit in 0..8 {
                            if octet & (0x80 >> bit) > 0 {
                                types.push((octet_index * 8 + bit) as u16);
                            }
                        }
                    }
                }
                RData::NSEC(types)
            }
            RecordType::ANY | RecordType::Unknown(_) => {
                let data = buffer.get_range(rdata_start, data_len)?.to_vec();
                buffer.step(data_len)?;
                RData::Unknown {
                    rrtype: rrtype_num,
                    data,
                }
            }
        };

        // never trust rdata parsing to land exactly on the boundary
        buffer.seek(rdata_start + data_len)?;

        Ok(ResourceRecord {
            name: rname,
            rrclass: class & !CLASS_FLAG,
            cache_flush: (class & CLASS_FLAG) > 0,
            ttl,
            rdata,
            additionals: Vec::new(),
        })
    }

    pub fn write(&self, buffer: &mut BytePacketBuffer) -> Result<usize, WriterError> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.rrtype_num())?;

        let mut class = self.rrclass;
        if self.cache_flush {
            class |= CLASS_FLAG;
        }
        buffer.write_u16(class)?;
        buffer.write_u32(self.ttl)?;

        match &self.rdata {
            RData::A(addr) => {
                buffer.write_u16(4)?;
                buffer.write_bytes(&addr.octets())?;
            }
            RData::AAAA(addr) => {
                buffer.write_u16(16)?;
                buffer.write_bytes(&addr.octets())?;
            }
            RData::PTR(target) => {
                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(target)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            RData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_u16(*priority)?;
                buffer.write_u16(*weight)?;
                buffer.write_u16(*port)?;
                buffer.write_qname(target)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            RData::TXT(txt) => {
                let wire = txt.to_wire();
                buffer.write_u16(wire.len() as u16)?;
                buffer.write_bytes(&wire)?;
            }
            RData::NSEC(types) => {
                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(&self.name)?;
                buffer.write_bytes(&nsec_bitmap(types))?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            RData::Unknown { data, .. } => {
                buffer.write_u16(data.len() as u16)?;
                buffer.write_bytes(data)?;
            }
        }

        Ok(buffer.pos() - start_pos)
    }
}

/// Window block 0 bitmap: rrtype `n` lives at bit `7 - n % 8` of octet
/// `n / 8`. Types above 255 were rejected at construction.
fn nsec_bitmap(types: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    let max = match types.iter().max() {
        Some(max) => *max,
        None => return out,
    };
    let octets = (max / 8 + 1) as u8;
    out.push(0);
    out.push(octets);
    out.resize(2 + octets as usize, 0);
    for rrtype in types {
        let octet = (*rrtype / 8) as usize;
        let bit = *rrtype % 8;
        out[2 + octet] |= 0x80 >> bit;
    }
    out
}
