//! The three-way stream lifecycle envelope.
//!
//! A logical stream rides on the single `Data` event of its call: every
//! `Data` payload is a [`StreamEvent`] encoded as a 1-byte discriminant plus
//! an optional payload. `Complete` carries no payload and decoding it never
//! reads one.

use bytes::{BufMut, BytesMut};

use crate::{ErrorEnvelope, RpcError, SerializedPayload};

pub const STREAM_TAG_ELEMENT: u8 = 0;
pub const STREAM_TAG_COMPLETE: u8 = 1;
/// `-1` as a byte.
pub const STREAM_TAG_ERROR: u8 = 0xFF;

/// One lifecycle event of a logical stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Element(T),
    Complete,
    Error(ErrorEnvelope),
}

impl StreamEvent<SerializedPayload> {
    /// Encode into the payload of a `Data` frame.
    pub fn encode(&self) -> SerializedPayload {
        let mut buf = BytesMut::new();
        match self {
            StreamEvent::Element(payload) => {
                buf.reserve(1 + payload.len());
                buf.put_u8(STREAM_TAG_ELEMENT);
                buf.put_slice(payload.as_bytes());
            }
            StreamEvent::Complete => buf.put_u8(STREAM_TAG_COMPLETE),
            StreamEvent::Error(envelope) => {
                let payload = envelope.encode();
                buf.reserve(1 + payload.len());
                buf.put_u8(STREAM_TAG_ERROR);
                buf.put_slice(payload.as_bytes());
            }
        }
        SerializedPayload::new(buf.freeze())
    }

    /// Decode from the payload of a `Data` frame.
    pub fn decode(payload: &SerializedPayload) -> Result<Self, RpcError> {
        let bytes = payload.as_bytes();
        let Some((&tag, rest)) = bytes.split_first() else {
            return Err(RpcError::ProtocolViolation(
                "empty stream event payload".into(),
            ));
        };
        match tag {
            STREAM_TAG_ELEMENT => Ok(StreamEvent::Element(SerializedPayload::from(
                rest.to_vec(),
            ))),
            STREAM_TAG_COMPLETE => Ok(StreamEvent::Complete),
            STREAM_TAG_ERROR => {
                let envelope = ErrorEnvelope::decode(&SerializedPayload::from(rest.to_vec()));
                Ok(StreamEvent::Error(envelope))
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "unknown stream event tag {other:#04x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn element_round_trips_byte_identically() {
        let event = StreamEvent::Element(SerializedPayload::from(b"payload".to_vec()));
        let encoded = event.encode();
        assert_eq!(encoded.as_bytes()[0], STREAM_TAG_ELEMENT);
        assert_eq!(StreamEvent::decode(&encoded).unwrap(), event);
        assert_eq!(StreamEvent::decode(&encoded).unwrap().encode(), encoded);
    }

    #[test]
    fn complete_is_a_single_byte() {
        let encoded = StreamEvent::Complete.encode();
        assert_eq!(encoded.as_bytes(), [STREAM_TAG_COMPLETE]);
        assert_eq!(StreamEvent::decode(&encoded).unwrap(), StreamEvent::Complete);
    }

    #[test]
    fn error_round_trips() {
        let event = StreamEvent::Error(ErrorEnvelope::new(ErrorKind::InternalServer, "boom"));
        let encoded = event.encode();
        assert_eq!(encoded.as_bytes()[0], STREAM_TAG_ERROR);
        assert_eq!(StreamEvent::decode(&encoded).unwrap(), event);
    }

    #[test]
    fn empty_element_still_decodes() {
        let event = StreamEvent::Element(SerializedPayload::empty());
        let encoded = event.encode();
        assert_eq!(encoded.len(), 1);
        assert_eq!(StreamEvent::decode(&encoded).unwrap(), event);
    }

    #[test]
    fn unknown_tag_is_a_violation() {
        let payload = SerializedPayload::from(vec![0x7Fu8]);
        assert!(matches!(
            StreamEvent::decode(&payload),
            Err(RpcError::ProtocolViolation(_))
        ));
    }
}
