//! Unit of data flowing through a pipeline.

use std::fmt;

use bytes::BytesMut;

/// Which way a message travels relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque payload plus metadata.
///
/// The payload buffer moves from stage to stage; a stage that replaces it
/// hands the old buffer back to the pipeline's pool.
pub struct Message {
    sequence: u64,
    direction: Direction,
    payload: BytesMut,
}

impl Message {
    pub fn new(sequence: u64, direction: Direction, payload: BytesMut) -> Self {
        Self {
            sequence,
            direction,
            payload,
        }
    }

    /// Monotonic per direction.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current payload length in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Swaps in a new payload and returns the previous buffer.
    pub fn replace_payload(&mut self, payload: BytesMut) -> BytesMut {
        std::mem::replace(&mut self.payload, payload)
    }

    pub fn into_payload(self) -> BytesMut {
        self.payload
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sequence", &self.sequence)
            .field("direction", &self.direction)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_payload_returns_previous_buffer() {
        let mut msg = Message::new(7, Direction::Outgoing, BytesMut::from(&b"abc"[..]));
        assert_eq!(msg.size(), 3);
        let old = msg.replace_payload(BytesMut::from(&b"hello"[..]));
        assert_eq!(&old[..], b"abc");
        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.sequence(), 7);
        assert_eq!(format!("{msg:?}"), "Message { sequence: 7, direction: Outgoing, size: 5 }");
    }
}
