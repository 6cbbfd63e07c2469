pub mod reader;
pub mod writer;

pub use reader::ReaderError;
pub use writer::WriterError;

use std::collections::HashMap;

/// Largest message this library will produce or accept. Multicast DNS
/// packets are bounded by the interface MTU rather than the 512 bytes of
/// classic DNS; 9000 covers jumbo frames.
pub const MAX_MESSAGE_SIZE: usize = 9000;

#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
#[derive(Clone)]
pub struct BytePacketBuffer {
    pub buf: [u8; MAX_MESSAGE_SIZE],
    pub pos: usize,
    /// Readable length. Reads past this fail even though the backing
    /// array is larger, so a truncated datagram errors instead of
    /// decoding trailing zeroes.
    end: usize,
    /// Offset of every label sequence already read, so that compression
    /// pointers resolve from the cache instead of re-walking the packet.
    reading_labels: HashMap<usize, String>,
    /// Lowercased name suffix to the offset where it was first written,
    /// consulted for tail compression.
    writing_labels: HashMap<String, usize>,
}

impl Default for BytePacketBuffer {
    /// This gives us a fresh buffer for holding the packet contents, and a
    /// field for keeping track of where we are.
    fn default() -> Self {
        BytePacketBuffer {
            buf: [0; MAX_MESSAGE_SIZE],
            pos: 0,
            end: MAX_MESSAGE_SIZE,
            reading_labels: HashMap::new(),
            writing_labels: HashMap::new(),
        }
    }
}

impl BytePacketBuffer {
    /// Current position within buffer
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Last readable position.
    pub(crate) fn limit(&self) -> usize {
        self.end.min(MAX_MESSAGE_SIZE)
    }

    /// Buffer preloaded with a received datagram, cursor at the start.
    pub fn from_datagram(data: &[u8]) -> Result<Self, ReaderError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ReaderError::EndOfBuffer);
        }
        let mut buffer = Self::default();
        buffer.buf[..data.len()].copy_from_slice(data);
        buffer.end = data.len();
        Ok(buffer)
    }

    /// The written portion of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}
