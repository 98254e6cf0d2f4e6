//! ascension: connection-level multiplexer for the Ascension RPC protocol.
//!
//! One [`AscensionRpcProtocol`] owns one [`Connection`] and runs many
//! concurrent calls over it: unary, client-streaming, server-streaming, and
//! bidirectional-streaming. Streams are cold: no data flows until the
//! consuming side signals `StreamOperation.Start`, and a peer that never does
//! so within the start window is timed out and torn down.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ascension::{AscensionRpcProtocol, Connection, ServiceCallIdentifier, ServiceRegistry};
//!
//! let registry = Arc::new(ServiceRegistry::new());
//! registry.register_single(
//!     ServiceCallIdentifier::new("Hello", "hello"),
//!     |payload| Box::pin(async move { Ok(payload) }) as ascension::BoxFuture<_>,
//! );
//!
//! let (client_side, server_side) = Connection::mem_pair();
//! let server = AscensionRpcProtocol::new(server_side, registry.clone());
//! let client = AscensionRpcProtocol::new(client_side, Arc::new(ServiceRegistry::new()));
//!
//! let reply = client
//!     .single_call(ServiceCallIdentifier::new("Hello", "hello"), request_payload)
//!     .await?;
//! ```

mod calls;
mod pending;
mod protocol;
mod tracker;

pub use protocol::AscensionRpcProtocol;

pub use ascension_core::{
    CallReference, Connection, DownstreamEvent, ErrorEnvelope, ErrorKind, JsonCodec, PayloadCodec,
    RpcError, RpcEvent, RpcFrame, SerializedPayload, ServiceCallIdentifier, StreamEvent,
    TransportError, UpstreamEvent,
};
pub use ascension_registry::{
    BiStreamHandler, BoxFuture, CallImplementation, ClientStreamHandler, PayloadStream,
    ServerStreamHandler, ServiceRegistry, SingleCallHandler,
};

// Re-export StreamExt so callers can consume the returned payload streams
// without naming futures themselves.
pub use futures::StreamExt;
