//! The two wire event families.
//!
//! Event names are part of the wire contract and must round-trip
//! byte-identically across implementations, including the dotted
//! `StreamOperation.*` names. The serde renames below carry them.

use serde::{Deserialize, Serialize};

use crate::{SerializedPayload, ServiceCallIdentifier};

/// A frame event, tagged with the direction it travels in.
///
/// `Upstream` events flow client to server, `Downstream` events server to
/// client. The dispatcher routes frames to the matching call table by family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", content = "event")]
pub enum RpcEvent {
    Upstream(UpstreamEvent),
    Downstream(DownstreamEvent),
}

impl RpcEvent {
    /// The catalogue name of the inner event, for logs and violation reports.
    pub fn wire_name(&self) -> &'static str {
        match self {
            RpcEvent::Upstream(e) => e.wire_name(),
            RpcEvent::Downstream(e) => e.wire_name(),
        }
    }

    /// True if this event is an `Error` of either family.
    ///
    /// Error frames referencing a dead call are dropped instead of answered,
    /// so two peers can never get stuck in an error-reply loop.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RpcEvent::Upstream(UpstreamEvent::Error(_))
                | RpcEvent::Downstream(DownstreamEvent::Error(_))
        )
    }

    /// True for `StreamOperation.Close` of either family.
    pub fn is_stream_close(&self) -> bool {
        matches!(
            self,
            RpcEvent::Upstream(UpstreamEvent::StreamOperationClose)
                | RpcEvent::Downstream(DownstreamEvent::StreamOperationClose)
        )
    }
}

/// Events a client sends to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum UpstreamEvent {
    Open {
        service_call: ServiceCallIdentifier,
        payload: SerializedPayload,
    },
    Data(SerializedPayload),
    #[serde(rename = "StreamOperation.Start")]
    StreamOperationStart,
    #[serde(rename = "StreamOperation.Close")]
    StreamOperationClose,
    Error(SerializedPayload),
    Warning(SerializedPayload),
    Cancel,
}

impl UpstreamEvent {
    pub fn wire_name(&self) -> &'static str {
        match self {
            UpstreamEvent::Open { .. } => "Open",
            UpstreamEvent::Data(_) => "Data",
            UpstreamEvent::StreamOperationStart => "StreamOperation.Start",
            UpstreamEvent::StreamOperationClose => "StreamOperation.Close",
            UpstreamEvent::Error(_) => "Error",
            UpstreamEvent::Warning(_) => "Warning",
            UpstreamEvent::Cancel => "Cancel",
        }
    }
}

/// Events a server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum DownstreamEvent {
    Opened,
    Data(SerializedPayload),
    Response(SerializedPayload),
    #[serde(rename = "StreamOperation.Start")]
    StreamOperationStart,
    #[serde(rename = "StreamOperation.Close")]
    StreamOperationClose,
    Error(SerializedPayload),
    Warning(SerializedPayload),
    /// Millis the sender waited before giving up on a cold stream.
    Timeout(u64),
}

impl DownstreamEvent {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DownstreamEvent::Opened => "Opened",
            DownstreamEvent::Data(_) => "Data",
            DownstreamEvent::Response(_) => "Response",
            DownstreamEvent::StreamOperationStart => "StreamOperation.Start",
            DownstreamEvent::StreamOperationClose => "StreamOperation.Close",
            DownstreamEvent::Error(_) => "Error",
            DownstreamEvent::Warning(_) => "Warning",
            DownstreamEvent::Timeout(_) => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_operation_names_round_trip() {
        let start = serde_json::to_string(&UpstreamEvent::StreamOperationStart).unwrap();
        assert!(start.contains("\"StreamOperation.Start\""), "{start}");

        let close = serde_json::to_string(&DownstreamEvent::StreamOperationClose).unwrap();
        assert!(close.contains("\"StreamOperation.Close\""), "{close}");

        let back: UpstreamEvent = serde_json::from_str(&start).unwrap();
        assert_eq!(back, UpstreamEvent::StreamOperationStart);
    }

    #[test]
    fn data_events_keep_their_family() {
        let frame = crate::RpcFrame::upstream(
            7,
            UpstreamEvent::Data(SerializedPayload::new(&b"x"[..])),
        );
        let json = serde_json::to_string(&frame).unwrap();
        let back: crate::RpcFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
        assert!(matches!(back.event, RpcEvent::Upstream(UpstreamEvent::Data(_))));
    }

    #[test]
    fn wire_names_match_catalogue() {
        assert_eq!(UpstreamEvent::Cancel.wire_name(), "Cancel");
        assert_eq!(DownstreamEvent::Timeout(60_000).wire_name(), "Timeout");
        assert_eq!(
            UpstreamEvent::Open {
                service_call: ServiceCallIdentifier::new("Svc", "call"),
                payload: SerializedPayload::empty(),
            }
            .wire_name(),
            "Open"
        );
    }
}
