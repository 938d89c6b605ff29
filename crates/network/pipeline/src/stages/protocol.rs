//! Protocol framing stage.
//!
//! Header layout (14 bytes, big endian):
//! `[version: u8][reserved: u8][sequence: u64][length: u32]`
//!
//! The stage is stateful (last sequence per direction), so every connection
//! gets a fresh clone of the context's prototype.

use bytes::{Buf, BufMut};
use network_shared::config::ProtocolSettings;
use tracing::trace;

use crate::{
    message::Message,
    stage::{Flow, Stage, StageContext, StageError, StageKind},
};

pub const PROTOCOL_HEADER_LEN: usize = 14;

#[derive(Debug, Clone)]
pub struct ProtocolStage {
    version: u8,
    max_payload_bytes: u32,
    last_outgoing: Option<u64>,
    last_incoming: Option<u64>,
}

impl ProtocolStage {
    pub fn new(settings: &ProtocolSettings) -> Self {
        Self {
            version: settings.version,
            max_payload_bytes: settings.max_payload_bytes,
            last_outgoing: None,
            last_incoming: None,
        }
    }

    /// Clone with sequence state reset, for a new connection.
    pub fn fresh(&self) -> Self {
        Self {
            last_outgoing: None,
            last_incoming: None,
            ..self.clone()
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }
}

impl Stage for ProtocolStage {
    fn kind(&self) -> StageKind {
        StageKind::Protocol
    }

    fn outgoing(&mut self, mut msg: Message, cx: &mut StageContext<'_>) -> Result<Flow, StageError> {
        let len = msg.size();
        if len > self.max_payload_bytes as usize {
            cx.pool.release(msg.into_payload());
            return Err(StageError::encode(format!(
                "payload of {len} bytes exceeds max_payload_bytes {}",
                self.max_payload_bytes
            )));
        }
        let sequence = msg.sequence();
        if self.last_outgoing.is_some_and(|last| sequence <= last) {
            cx.pool.release(msg.into_payload());
            return Err(StageError::encode(format!("sequence {sequence} not increasing")));
        }

        let mut framed = cx.pool.acquire(PROTOCOL_HEADER_LEN + len);
        framed.put_u8(self.version);
        framed.put_u8(0);
        framed.put_u64(sequence);
        framed.put_u32(len as u32);
        framed.extend_from_slice(msg.payload());
        let old = msg.replace_payload(framed);
        cx.pool.release(old);

        self.last_outgoing = Some(sequence);
        trace!(target: "net::pipeline", conn = %cx.connection_id, sequence, len, "framed");
        Ok(Flow::Forward(msg))
    }

    fn incoming(&mut self, mut msg: Message, cx: &mut StageContext<'_>) -> Result<Message, StageError> {
        let header = match parse_header(msg.payload()) {
            Ok(header) => header,
            Err(err) => {
                cx.pool.release(msg.into_payload());
                return Err(err);
            }
        };

        let problem = if header.version != self.version {
            Some(format!("version {} (expected {})", header.version, self.version))
        } else if header.reserved != 0 {
            Some(format!("unknown flags {:#04x}", header.reserved))
        } else if header.length as usize != msg.size() - PROTOCOL_HEADER_LEN {
            Some(format!(
                "length field {} but {} payload bytes",
                header.length,
                msg.size() - PROTOCOL_HEADER_LEN
            ))
        } else if self.last_incoming.is_some_and(|last| header.sequence <= last) {
            Some(format!("stale sequence {}", header.sequence))
        } else {
            None
        };
        if let Some(detail) = problem {
            cx.pool.release(msg.into_payload());
            return Err(StageError::decode(detail));
        }

        msg.payload_mut().advance(PROTOCOL_HEADER_LEN);
        msg.set_sequence(header.sequence);
        self.last_incoming = Some(header.sequence);
        Ok(msg)
    }
}

struct Header {
    version: u8,
    reserved: u8,
    sequence: u64,
    length: u32,
}

fn parse_header(mut bytes: &[u8]) -> Result<Header, StageError> {
    if bytes.len() < PROTOCOL_HEADER_LEN {
        return Err(StageError::decode(format!(
            "frame of {} bytes shorter than header",
            bytes.len()
        )));
    }
    Ok(Header {
        version: bytes.get_u8(),
        reserved: bytes.get_u8(),
        sequence: bytes.get_u64(),
        length: bytes.get_u32(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::BytesMut;
    use network_shared::{BufferPool, ConnectionId};

    use super::*;
    use crate::{message::Direction, stage::StageErrorKind};

    fn outgoing(stage: &mut ProtocolStage, pool: &mut BufferPool, seq: u64, body: &[u8]) -> Message {
        let mut cx = StageContext {
            connection_id: ConnectionId::new(1),
            now: Instant::now(),
            pool,
        };
        let msg = Message::new(seq, Direction::Outgoing, BytesMut::from(body));
        match stage.outgoing(msg, &mut cx).unwrap() {
            Flow::Forward(msg) => msg,
            other => panic!("unexpected flow {other:?}"),
        }
    }

    fn incoming(stage: &mut ProtocolStage, pool: &mut BufferPool, raw: &[u8]) -> Result<Message, StageError> {
        let mut cx = StageContext {
            connection_id: ConnectionId::new(1),
            now: Instant::now(),
            pool,
        };
        stage.incoming(Message::new(0, Direction::Incoming, BytesMut::from(raw)), &mut cx)
    }

    #[test]
    fn frames_and_unframes() {
        let mut pool = BufferPool::default();
        let mut tx = ProtocolStage::new(&ProtocolSettings::default());
        let mut rx = tx.fresh();

        let framed = outgoing(&mut tx, &mut pool, 5, b"payload");
        assert_eq!(framed.size(), PROTOCOL_HEADER_LEN + 7);
        assert_eq!(&framed.payload()[2..10], &5u64.to_be_bytes());

        let msg = incoming(&mut rx, &mut pool, framed.payload()).unwrap();
        assert_eq!(msg.payload(), b"payload");
        assert_eq!(msg.sequence(), 5);
    }

    #[test]
    fn rejects_oversize_payload() {
        let mut pool = BufferPool::default();
        let mut stage = ProtocolStage::new(&ProtocolSettings {
            version: 1,
            max_payload_bytes: 4,
        });
        let mut cx = StageContext {
            connection_id: ConnectionId::new(1),
            now: Instant::now(),
            pool: &mut pool,
        };
        let msg = Message::new(1, Direction::Outgoing, BytesMut::from(&b"too long"[..]));
        let err = stage.outgoing(msg, &mut cx).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::EncodeError);
    }

    #[test]
    fn rejects_corrupt_headers() {
        let mut pool = BufferPool::default();
        let mut tx = ProtocolStage::new(&ProtocolSettings::default());
        let mut rx = tx.fresh();
        let framed = outgoing(&mut tx, &mut pool, 1, b"abc");

        // truncated
        assert!(incoming(&mut rx, &mut pool, &framed.payload()[..5]).is_err());

        // wrong version
        let mut bad = framed.payload().to_vec();
        bad[0] = 9;
        assert!(incoming(&mut rx, &mut pool, &bad).is_err());

        // unknown flags
        let mut bad = framed.payload().to_vec();
        bad[1] = 0x80;
        assert!(incoming(&mut rx, &mut pool, &bad).is_err());

        // length mismatch
        let mut bad = framed.payload().to_vec();
        bad.push(0);
        let err = incoming(&mut rx, &mut pool, &bad).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::DecodeError);

        // none of the failures advanced the sequence state
        assert!(incoming(&mut rx, &mut pool, framed.payload()).is_ok());
    }

    #[test]
    fn sequence_must_increase_but_may_skip() {
        let mut pool = BufferPool::default();
        let mut tx = ProtocolStage::new(&ProtocolSettings::default());
        let mut rx = tx.fresh();
        let first = outgoing(&mut tx, &mut pool, 1, b"a");
        let third = outgoing(&mut tx, &mut pool, 3, b"c");

        assert!(incoming(&mut rx, &mut pool, first.payload()).is_ok());
        assert!(incoming(&mut rx, &mut pool, third.payload()).is_ok());
        let replay = incoming(&mut rx, &mut pool, first.payload()).unwrap_err();
        assert!(replay.detail.contains("stale sequence"));
    }
}
