pub mod header;
pub mod question;
pub mod record;
pub mod txt;

use crate::buffer::{BytePacketBuffer, ReaderError, WriterError};
use crate::name;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use self::header::Header;
use self::question::QueryRecord;
use self::record::{RecordKey, ResourceRecord};

/// The UDP port multicast DNS lives on. Anything else marks the sender as
/// a legacy (one-shot) querier.
pub const MDNS_PORT: u16 = 5353;

#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy)]
#[allow(clippy::upper_case_acronyms)]
pub enum RecordType {
    Unknown(u16),
    /// a host address
    A, // 1
    /// a domain name pointer
    PTR, // 12
    /// descriptive text
    TXT, // 16
    /// an IPv6 host address
    AAAA, // 28
    /// service location
    SRV, // 33
    /// types existing at a name
    NSEC, // 47
    /// wildcard, only valid in questions
    ANY, // 255
}

impl RecordType {
    pub fn into_num(self) -> u16 {
        match self {
            RecordType::Unknown(x) => x,
            RecordType::A => 1,
            RecordType::PTR => 12,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::NSEC => 47,
            RecordType::ANY => 255,
        }
    }

    pub fn from_num(num: u16) -> RecordType {
        match num {
            1 => RecordType::A,
            12 => RecordType::PTR,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            47 => RecordType::NSEC,
            255 => RecordType::ANY,
            _ => RecordType::Unknown(num),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Packet {
    pub header: Header,
    pub questions: Vec<QueryRecord>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
    /// Source address of a received datagram; `None` on packets built
    /// locally.
    pub origin: Option<SocketAddr>,
}

impl TryFrom<BytePacketBuffer> for Packet {
    type Error = ReaderError;

    fn try_from(mut buffer: BytePacketBuffer) -> Result<Self, Self::Error> {
        let header = Header::read(&mut buffer)?;

        let mut questions = Vec::with_capacity(header.questions as usize);
        for _ in 0..header.questions {
            questions.push(QueryRecord::read(&mut buffer)?);
        }

        let mut answers = Vec::with_capacity(header.answers as usize);
        for _ in 0..header.answers {
            answers.push(ResourceRecord::read(&mut buffer)?);
        }

        let mut authorities = Vec::with_capacity(header.authoritative_entries as usize);
        for _ in 0..header.authoritative_entries {
            authorities.push(ResourceRecord::read(&mut buffer)?);
        }

        let mut additionals = Vec::with_capacity(header.resource_entries as usize);
        for _ in 0..header.resource_entries {
            additionals.push(ResourceRecord::read(&mut buffer)?);
        }

        Ok(Packet {
            header,
            questions,
            answers,
            authorities,
            additionals,
            origin: None,
        })
    }
}

impl Packet {
    pub fn query() -> Self {
        Self::default()
    }

    pub fn response() -> Self {
        Self {
            header: Header::response(),
            ..Self::default()
        }
    }

    /// Parse a received datagram, remembering where it came from.
    pub fn from_datagram(data: &[u8], origin: SocketAddr) -> Result<Self, ReaderError> {
        let buffer = BytePacketBuffer::from_datagram(data)?;
        let mut packet = Packet::try_from(buffer)?;
        packet.origin = Some(origin);
        Ok(packet)
    }

    pub fn set_questions(&mut self, questions: Vec<QueryRecord>) {
        self.header.questions = questions.len() as u16;
        self.questions = questions;
    }

    pub fn set_answers(&mut self, answers: Vec<ResourceRecord>) {
        self.header.answers = answers.len() as u16;
        self.answers = answers;
    }

    pub fn set_authorities(&mut self, authorities: Vec<ResourceRecord>) {
        self.header.authoritative_entries = authorities.len() as u16;
        self.authorities = authorities;
    }

    pub fn set_additionals(&mut self, additionals: Vec<ResourceRecord>) {
        self.header.resource_entries = additionals.len() as u16;
        self.additionals = additionals;
    }

    pub fn with_questions(mut self, questions: Vec<QueryRecord>) -> Self {
        self.set_questions(questions);
        self
    }

    pub fn with_answers(mut self, answers: Vec<ResourceRecord>) -> Self {
        self.set_answers(answers);
        self
    }

    pub fn with_authorities(mut self, authorities: Vec<ResourceRecord>) -> Self {
        self.set_authorities(authorities);
        self
    }

    pub fn with_additionals(mut self, additionals: Vec<ResourceRecord>) -> Self {
        self.set_additionals(additionals);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    pub fn is_answer(&self) -> bool {
        self.header.response
    }

    pub fn is_query(&self) -> bool {
        !self.header.response && self.authorities.is_empty()
    }

    /// A probe is a query claiming records in its authority section.
    pub fn is_probe(&self) -> bool {
        !self.header.response && !self.authorities.is_empty()
    }

    /// Datagrams from a source port other than 5353 come from one-shot
    /// resolvers that expect classic unicast DNS behavior.
    pub fn is_legacy(&self) -> bool {
        match self.origin {
            Some(origin) => origin.port() != MDNS_PORT,
            None => false,
        }
    }

    /// Whether the packet was sent by one of the given local addresses,
    /// i.e. looped back to us.
    pub fn is_local(&self, local_addresses: &[IpAddr]) -> bool {
        match self.origin {
            Some(origin) => local_addresses.contains(&origin.ip()),
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.header.is_valid()
    }

    /// Structural equality: headers match and each section holds the same
    /// set of entries, regardless of ordering.
    pub fn equals(&self, other: &Packet) -> bool {
        fn question_set(questions: &[QueryRecord]) -> HashSet<question::QuestionKey> {
            questions.iter().map(|q| q.key()).collect()
        }
        fn record_set(records: &[ResourceRecord]) -> HashSet<RecordKey> {
            records.iter().map(|r| r.record_key()).collect()
        }

        let ours = &self.header;
        let theirs = &other.header;
        ours.id == theirs.id
            && ours.response == theirs.response
            && ours.opcode == theirs.opcode
            && ours.authoritative_answer == theirs.authoritative_answer
            && ours.truncated_message == theirs.truncated_message
            && ours.response_code == theirs.response_code
            && question_set(&self.questions) == question_set(&other.questions)
            && record_set(&self.answers) == record_set(&other.answers)
            && record_set(&self.authorities) == record_set(&other.authorities)
            && record_set(&self.additionals) == record_set(&other.additionals)
    }

    /// Halve an oversized packet. Queries keep every question in the
    /// first half and flag it truncated, so the second half only carries
    /// the remaining known answers. Answer packets are split down the
    /// middle with the additional section recomputed per half.
    pub fn split(&self) -> (Packet, Packet) {
        let half = self.answers.len().div_ceil(2);
        let (first_answers, second_answers) = self.answers.split_at(half);

        if !self.questions.is_empty() {
            let mut first = Packet {
                header: self.header.clone(),
                ..Packet::default()
            };
            first.set_questions(self.questions.clone());
            first.set_answers(first_answers.to_vec());
            first.header.truncated_message = true;

            let mut second = Packet {
                header: self.header.clone(),
                ..Packet::default()
            };
            second.set_answers(second_answers.to_vec());
            second.header.truncated_message = false;

            (first, second)
        } else {
            let mut first = Packet {
                header: self.header.clone(),
                ..Packet::default()
            };
            first.set_answers(first_answers.to_vec());
            first.set_additionals(additionals_for(first_answers));

            let mut second = Packet {
                header: self.header.clone(),
                ..Packet::default()
            };
            second.set_answers(second_answers.to_vec());
            second.set_additionals(additionals_for(second_answers));

            (first, second)
        }
    }

    pub fn create_buffer(&self) -> Result<BytePacketBuffer, WriterError> {
        let mut buffer = BytePacketBuffer::default();

        let mut header = self.header.clone();
        header.questions = self.questions.len() as u16;
        header.answers = self.answers.len() as u16;
        header.authoritative_entries = self.authorities.len() as u16;
        header.resource_entries = self.additionals.len() as u16;
        header.write(&mut buffer)?;

        for question in &self.questions {
            question.write(&mut buffer)?;
        }
        for rec in &self.answers {
            rec.write(&mut buffer)?;
        }
        for rec in &self.authorities {
            rec.write(&mut buffer)?;
        }
        for rec in &self.additionals {
            rec.write(&mut buffer)?;
        }

        Ok(buffer)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WriterError> {
        Ok(self.create_buffer()?.bytes().to_vec())
    }

    /// Every distinct name a question or record in this packet mentions.
    pub fn record_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            if seen.insert(name::key(&rec.name)) {
                names.push(rec.name.clone());
            }
        }
        names
    }
}

/// The additional records that should accompany a set of answers: the
/// union of each answer's additionals, minus anything already answered.
pub fn additionals_for(answers: &[ResourceRecord]) -> Vec<ResourceRecord> {
    let answered: HashSet<RecordKey> = answers.iter().map(|r| r.record_key()).collect();
    let mut seen = answered.clone();
    let mut out = Vec::new();
    for answer in answers {
        for additional in &answer.additionals {
            if seen.insert(additional.record_key()) {
                out.push(additional.clone());
            }
        }
    }
    out
}
