//! Frame types: call identity and the frame envelope itself.

use core::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{DownstreamEvent, RpcEvent, UpstreamEvent};

/// Per-connection call identifier.
///
/// Allocated by a monotonically increasing counter that wraps at the integer
/// boundary. Unique among currently-open calls of one direction table.
pub type CallReference = u32;

/// Identifies which registered implementation an `Open` frame targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceCallIdentifier {
    pub service_id: String,
    pub call_id: String,
}

impl ServiceCallIdentifier {
    pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for ServiceCallIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.call_id)
    }
}

/// Opaque serialized payload.
///
/// The protocol core never interprets these bytes; only the configured
/// [`PayloadCodec`](crate::PayloadCodec) does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPayload(Bytes);

impl SerializedPayload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SerializedPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for SerializedPayload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// One multiplexed protocol frame: a call reference plus an event.
///
/// Any payload lives inside the event variant itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFrame {
    pub call_reference: CallReference,
    pub event: RpcEvent,
}

impl RpcFrame {
    pub fn upstream(call_reference: CallReference, event: UpstreamEvent) -> Self {
        Self {
            call_reference,
            event: RpcEvent::Upstream(event),
        }
    }

    pub fn downstream(call_reference: CallReference, event: DownstreamEvent) -> Self {
        Self {
            call_reference,
            event: RpcEvent::Downstream(event),
        }
    }
}
