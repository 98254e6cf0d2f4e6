//! The payload codec boundary.
//!
//! The protocol core moves [`SerializedPayload`]s around without ever looking
//! inside them; implementations and generated clients use a codec at the edges.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{RpcError, SerializedPayload};

/// Pluggable serializer for call payloads.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<SerializedPayload, RpcError>;
    fn decode<T: DeserializeOwned>(&self, payload: &SerializedPayload) -> Result<T, RpcError>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<SerializedPayload, RpcError> {
        serde_json::to_vec(value)
            .map(SerializedPayload::from)
            .map_err(|e| RpcError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &SerializedPayload) -> Result<T, RpcError> {
        serde_json::from_slice(payload.as_bytes()).map_err(|e| RpcError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let payload = codec.encode(&vec![1i32, 2, 3]).unwrap();
        let back: Vec<i32> = codec.decode(&payload).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn decode_failure_is_a_codec_error() {
        let codec = JsonCodec;
        let payload = SerializedPayload::from(b"garbage".to_vec());
        assert!(matches!(
            codec.decode::<i32>(&payload),
            Err(RpcError::Codec(_))
        ));
    }
}
