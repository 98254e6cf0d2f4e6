//! Error taxonomy and the serialized error envelope.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{CallReference, SerializedPayload, ServiceCallIdentifier};

/// Transport-level errors. Fatal for the connection, never for a single call.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
    Frame(serde_json::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Frame(e) => write!(f, "frame codec error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Frame(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Everything that can go wrong with a single call.
#[derive(Debug)]
pub enum RpcError {
    /// A frame arrived that is illegal for the call's current state or kind.
    ProtocolViolation(String),
    /// An `Open` referenced an unregistered `ServiceCallIdentifier`.
    NotFound(ServiceCallIdentifier),
    /// A frame referenced a call with no live actor.
    UnknownReference(CallReference),
    /// A cold stream was opened but never started within the start window.
    StreamTimeout,
    /// The call was cancelled before completing.
    Cancelled,
    /// An application-level failure inside an implementation.
    InternalServer(String),
    /// The underlying connection failed or closed.
    Transport(TransportError),
    /// The payload codec rejected a value.
    Codec(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::NotFound(id) => write!(f, "no call registered for {id}"),
            Self::UnknownReference(reference) => {
                write!(f, "unknown call reference {reference}")
            }
            Self::StreamTimeout => write!(f, "cold stream was not started in time"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InternalServer(msg) => write!(f, "internal server error: {msg}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Error kind carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ProtocolViolation,
    NotFound,
    UnknownReference,
    StreamTimeout,
    Cancelled,
    InternalServer,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProtocolViolation => "protocol violation",
            Self::NotFound => "not found",
            Self::UnknownReference => "unknown reference",
            Self::StreamTimeout => "stream timeout",
            Self::Cancelled => "cancelled",
            Self::InternalServer => "internal server error",
        };
        f.write_str(name)
    }
}

/// Serialized form of an error, carried by `Error` and `Warning` frames and by
/// the `Error` variant of a [`StreamEvent`](crate::StreamEvent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_call: Option<ServiceCallIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<CallReference>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            service_call: None,
            reference: None,
        }
    }

    pub fn not_found(service_call: ServiceCallIdentifier) -> Self {
        Self {
            message: format!("no call registered for {service_call}"),
            kind: ErrorKind::NotFound,
            service_call: Some(service_call),
            reference: None,
        }
    }

    pub fn unknown_reference(reference: CallReference) -> Self {
        Self {
            kind: ErrorKind::UnknownReference,
            message: format!("no live call for reference {reference}"),
            service_call: None,
            reference: Some(reference),
        }
    }

    pub fn from_error(error: &RpcError) -> Self {
        match error {
            RpcError::ProtocolViolation(msg) => {
                Self::new(ErrorKind::ProtocolViolation, msg.clone())
            }
            RpcError::NotFound(id) => Self::not_found(id.clone()),
            RpcError::UnknownReference(reference) => Self::unknown_reference(*reference),
            RpcError::StreamTimeout => Self::new(ErrorKind::StreamTimeout, error.to_string()),
            RpcError::Cancelled => Self::new(ErrorKind::Cancelled, error.to_string()),
            // Transport and codec failures are local concerns; the peer only
            // needs to know the call failed.
            RpcError::InternalServer(_) | RpcError::Transport(_) | RpcError::Codec(_) => {
                Self::new(ErrorKind::InternalServer, error.to_string())
            }
        }
    }

    pub fn into_error(self) -> RpcError {
        match self.kind {
            ErrorKind::ProtocolViolation => RpcError::ProtocolViolation(self.message),
            ErrorKind::NotFound => match self.service_call {
                Some(id) => RpcError::NotFound(id),
                None => RpcError::InternalServer(self.message),
            },
            ErrorKind::UnknownReference => {
                RpcError::UnknownReference(self.reference.unwrap_or_default())
            }
            ErrorKind::StreamTimeout => RpcError::StreamTimeout,
            ErrorKind::Cancelled => RpcError::Cancelled,
            ErrorKind::InternalServer => RpcError::InternalServer(self.message),
        }
    }

    /// Serialize for an Error/Warning frame payload.
    pub fn encode(&self) -> SerializedPayload {
        match serde_json::to_vec(self) {
            Ok(bytes) => SerializedPayload::from(bytes),
            Err(e) => {
                // Serializing a plain struct of strings cannot realistically
                // fail; fall back to an empty envelope rather than panic.
                tracing::error!(error = %e, "failed to encode error envelope");
                SerializedPayload::empty()
            }
        }
    }

    /// Decode an Error/Warning frame payload.
    ///
    /// A payload that does not parse still yields a usable envelope so that a
    /// malformed error from the peer cannot mask the failure itself.
    pub fn decode(payload: &SerializedPayload) -> Self {
        serde_json::from_slice(payload.as_bytes()).unwrap_or_else(|e| {
            Self::new(
                ErrorKind::InternalServer,
                format!("malformed error payload: {e}"),
            )
        })
    }
}
