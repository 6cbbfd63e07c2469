use crate::buffer::{BytePacketBuffer, ReaderError, WriterError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates any kind
    /// of query. Multicast DNS queries use 0; the field only matters for
    /// legacy unicast replies, which must echo the querier's identifier.
    pub id: u16, // 16 bits

    /// RD Recursion Desired. Meaningless for multicast DNS: zero on
    /// everything we send, ignored on everything we receive.
    pub recursion_desired: bool, // 1 bit
    /// TC TrunCation - specifies that this message was truncated and more
    /// known-answer records follow in another message.
    pub truncated_message: bool, // 1 bit
    /// AA Authoritative Answer. Every multicast DNS response is
    /// authoritative by definition and must carry this bit.
    pub authoritative_answer: bool, // 1 bit
    /// OPCODE A four bit field that specifies kind of query in this
    /// message. Multicast DNS only uses 0 (standard query); packets with
    /// any other value are dropped.
    pub opcode: u8, // 4 bits
    /// QR A one bit field that specifies whether this message is a query
    /// (0), or a response (1).
    pub response: bool, // 1 bit

    /// RCODE, zero on every valid multicast DNS message.
    pub response_code: u8, // 4 bits
    pub checking_disabled: bool, // 1 bit
    pub authed_data: bool,       // 1 bit
    /// Z Reserved for future use. Must be zero in all queries and
    /// responses.
    pub z: bool, // 1 bit
    /// RA Recursion Available. Zero outbound, ignored inbound.
    pub recursion_available: bool, // 1 bit

    /// QDCOUNT an unsigned 16 bit integer specifying the number of entries
    /// in the question section.
    pub questions: u16, // 16 bits
    /// ANCOUNT an unsigned 16 bit integer specifying the number of
    /// resource records in the answer section.
    pub answers: u16, // 16 bits
    /// NSCOUNT an unsigned 16 bit integer specifying the number of name
    /// server resource records in the authority records section.
    pub authoritative_entries: u16, // 16 bits
    /// ARCOUNT an unsigned 16 bit integer specifying the number of
    /// resource records in the additional records section.
    pub resource_entries: u16, // 16 bits
}

impl Default for Header {
    fn default() -> Self {
        Self {
            id: 0,

            recursion_desired: false,
            truncated_message: false,
            authoritative_answer: false,
            opcode: 0,
            response: false,

            response_code: 0,
            checking_disabled: false,
            authed_data: false,
            z: false,
            recursion_available: false,

            questions: 0,
            answers: 0,
            authoritative_entries: 0,
            resource_entries: 0,
        }
    }
}

impl Header {
    /// Header for an outbound query.
    pub fn query() -> Self {
        Self::default()
    }

    /// Header for an outbound response: QR and AA set, everything else
    /// zero.
    pub fn response() -> Self {
        Self {
            response: true,
            authoritative_answer: true,
            ..Self::default()
        }
    }

    /// A packet is acceptable iff it is a standard query with no error
    /// code, and, if it is a response, an authoritative one.
    pub fn is_valid(&self) -> bool {
        self.opcode == 0 && self.response_code == 0 && (!self.response || self.authoritative_answer)
    }

    pub fn read(buffer: &mut BytePacketBuffer) -> Result<Self, ReaderError> {
        let id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let head = (flags >> 8) as u8;
        let tail = (flags & 0xFF) as u8;

        let questions = buffer.read_u16()?;
        let answers = buffer.read_u16()?;
        let authoritative_entries = buffer.read_u16()?;
        let resource_entries = buffer.read_u16()?;

        Ok(Self {
            id,
            recursion_desired: (head & (1 << 0)) > 0,
            truncated_message: (head & (1 << 1)) > 0,
            authoritative_answer: (head & (1 << 2)) > 0,
            opcode: (head >> 3) & 0x0F,
            response: (head & (1 << 7)) > 0,
            response_code: tail & 0x0F,
            checking_disabled: (tail & (1 << 4)) > 0,
            authed_data: (tail & (1 << 5)) > 0,
            z: (tail & (1 << 6)) > 0,
            recursion_available: (tail & (1 << 7)) > 0,
            questions,
            answers,
            authoritative_entries,
            resource_entries,
        })
    }

    pub fn write(&self, buffer: &mut BytePacketBuffer) -> Result<(), WriterError> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.response_code & 0x0F)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Header;

    #[test]
    fn should_roundtrip_flags() {
        let mut header = Header::response();
        header.id = 4242;
        header.truncated_message = true;
        header.questions = 1;
        header.answers = 3;

        let mut buffer = crate::buffer::BytePacketBuffer::default();
        header.write(&mut buffer).unwrap();
        buffer.pos = 0;
        let read = Header::read(&mut buffer).unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn should_validate_mdns_rules() {
        assert!(Header::query().is_valid());
        assert!(Header::response().is_valid());

        let mut bad_opcode = Header::query();
        bad_opcode.opcode = 2;
        assert!(!bad_opcode.is_valid());

        let mut bad_rcode = Header::query();
        bad_rcode.response_code = 3;
        assert!(!bad_rcode.is_valid());

        let mut unauthoritative = Header::response();
        unauthoritative.authoritative_answer = false;
        assert!(!unauthoritative.is_valid());
    }
}
