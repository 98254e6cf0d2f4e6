//! ascension-core: Core types for the Ascension RPC protocol.
//!
//! This crate defines:
//! - The wire vocabulary ([`RpcFrame`], [`UpstreamEvent`], [`DownstreamEvent`])
//! - Call identity ([`CallReference`], [`ServiceCallIdentifier`])
//! - The stream lifecycle envelope ([`StreamEvent`])
//! - The error taxonomy ([`RpcError`], [`TransportError`], [`ErrorEnvelope`])
//! - Connection backends ([`Connection`], in-memory pairs and byte streams)
//! - The payload codec boundary ([`PayloadCodec`], [`JsonCodec`])

mod codec;
mod connection;
mod error;
mod event;
mod frame;
mod stream_event;

pub use codec::*;
pub use connection::*;
pub use error::*;
pub use event::*;
pub use frame::*;
pub use stream_event::*;
