//! ascension-registry: maps a [`ServiceCallIdentifier`] to a callable
//! implementation.
//!
//! Implementations come in the four call shapes the protocol supports. All of
//! them work at the payload level; decoding requests and encoding results is
//! the implementation's business (normally via generated code and a
//! [`PayloadCodec`](ascension_core::PayloadCodec)).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;
use parking_lot::Mutex;

use ascension_core::{RpcError, SerializedPayload, ServiceCallIdentifier};

/// Boxed future, the registry's callable currency.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A logical stream of opaque payloads, either direction.
pub type PayloadStream = BoxStream<'static, Result<SerializedPayload, RpcError>>;

/// Unary call: one request payload, one response payload.
pub trait SingleCallHandler: Send + Sync {
    fn perform(&self, payload: SerializedPayload) -> BoxFuture<Result<SerializedPayload, RpcError>>;
}

/// Client-streaming call: a request payload plus a cold inbound stream,
/// yielding a single response.
pub trait ClientStreamHandler: Send + Sync {
    fn perform(
        &self,
        payload: SerializedPayload,
        requests: PayloadStream,
    ) -> BoxFuture<Result<SerializedPayload, RpcError>>;
}

/// Server-streaming call: a request payload, yielding a stream of responses.
pub trait ServerStreamHandler: Send + Sync {
    fn perform(&self, payload: SerializedPayload) -> BoxFuture<Result<PayloadStream, RpcError>>;
}

/// Bidirectional-streaming call: a request payload plus a cold inbound
/// stream, yielding a stream of responses.
pub trait BiStreamHandler: Send + Sync {
    fn perform(
        &self,
        payload: SerializedPayload,
        requests: PayloadStream,
    ) -> BoxFuture<Result<PayloadStream, RpcError>>;
}

/// A registered implementation, tagged with its call shape.
///
/// The shape decides which callee state machine the dispatcher builds when an
/// `Open` frame targets it.
#[derive(Clone)]
pub enum CallImplementation {
    Single(Arc<dyn SingleCallHandler>),
    ClientStream(Arc<dyn ClientStreamHandler>),
    ServerStream(Arc<dyn ServerStreamHandler>),
    BiStream(Arc<dyn BiStreamHandler>),
}

impl CallImplementation {
    pub fn kind(&self) -> &'static str {
        match self {
            CallImplementation::Single(_) => "single",
            CallImplementation::ClientStream(_) => "client-stream",
            CallImplementation::ServerStream(_) => "server-stream",
            CallImplementation::BiStream(_) => "bi-stream",
        }
    }
}

/// Lookup table consumed by the protocol dispatcher on every `Open`.
#[derive(Default)]
pub struct ServiceRegistry {
    calls: Mutex<HashMap<ServiceCallIdentifier, CallImplementation>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under an identifier, replacing any previous
    /// registration for it.
    pub fn register(&self, id: ServiceCallIdentifier, implementation: CallImplementation) {
        let kind = implementation.kind();
        let replaced = self.calls.lock().insert(id.clone(), implementation);
        if replaced.is_some() {
            tracing::warn!(service_call = %id, kind, "replacing registered call");
        } else {
            tracing::debug!(service_call = %id, kind, "registered call");
        }
    }

    pub fn register_single(
        &self,
        id: ServiceCallIdentifier,
        handler: impl SingleCallHandler + 'static,
    ) {
        self.register(id, CallImplementation::Single(Arc::new(handler)));
    }

    pub fn register_client_stream(
        &self,
        id: ServiceCallIdentifier,
        handler: impl ClientStreamHandler + 'static,
    ) {
        self.register(id, CallImplementation::ClientStream(Arc::new(handler)));
    }

    pub fn register_server_stream(
        &self,
        id: ServiceCallIdentifier,
        handler: impl ServerStreamHandler + 'static,
    ) {
        self.register(id, CallImplementation::ServerStream(Arc::new(handler)));
    }

    pub fn register_bi_stream(
        &self,
        id: ServiceCallIdentifier,
        handler: impl BiStreamHandler + 'static,
    ) {
        self.register(id, CallImplementation::BiStream(Arc::new(handler)));
    }

    /// Resolve an identifier, or `None` when nothing is registered for it.
    pub fn get_call_by_id(&self, id: &ServiceCallIdentifier) -> Option<CallImplementation> {
        self.calls.lock().get(id).cloned()
    }
}

// Closures are the lightest way to stand up an implementation; the blanket
// impls below let tests and examples skip the struct boilerplate.

impl<F> SingleCallHandler for F
where
    F: Fn(SerializedPayload) -> BoxFuture<Result<SerializedPayload, RpcError>> + Send + Sync,
{
    fn perform(&self, payload: SerializedPayload) -> BoxFuture<Result<SerializedPayload, RpcError>> {
        self(payload)
    }
}

impl<F> ClientStreamHandler for F
where
    F: Fn(SerializedPayload, PayloadStream) -> BoxFuture<Result<SerializedPayload, RpcError>>
        + Send
        + Sync,
{
    fn perform(
        &self,
        payload: SerializedPayload,
        requests: PayloadStream,
    ) -> BoxFuture<Result<SerializedPayload, RpcError>> {
        self(payload, requests)
    }
}

impl<F> ServerStreamHandler for F
where
    F: Fn(SerializedPayload) -> BoxFuture<Result<PayloadStream, RpcError>> + Send + Sync,
{
    fn perform(&self, payload: SerializedPayload) -> BoxFuture<Result<PayloadStream, RpcError>> {
        self(payload)
    }
}

impl<F> BiStreamHandler for F
where
    F: Fn(SerializedPayload, PayloadStream) -> BoxFuture<Result<PayloadStream, RpcError>>
        + Send
        + Sync,
{
    fn perform(
        &self,
        payload: SerializedPayload,
        requests: PayloadStream,
    ) -> BoxFuture<Result<PayloadStream, RpcError>> {
        self(payload, requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_finds_registered_single_call() {
        let registry = ServiceRegistry::new();
        let id = ServiceCallIdentifier::new("Echo", "echo");
        registry.register_single(id.clone(), |payload: SerializedPayload| {
            Box::pin(async move { Ok(payload) }) as BoxFuture<_>
        });

        let implementation = registry.get_call_by_id(&id).expect("registered");
        assert_eq!(implementation.kind(), "single");

        let CallImplementation::Single(handler) = implementation else {
            panic!("wrong shape");
        };
        let payload = SerializedPayload::from(b"x".to_vec());
        let result = handler.perform(payload.clone()).await.unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn unknown_identifier_resolves_to_none() {
        let registry = ServiceRegistry::new();
        assert!(registry
            .get_call_by_id(&ServiceCallIdentifier::new("Nope", "missing"))
            .is_none());
    }
}
