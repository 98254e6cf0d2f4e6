//! ascension-testkit: shared fixtures for exercising the protocol engine.
//!
//! Provides a connected engine pair over the in-memory transport, a standard
//! `HelloService` registry covering all four call kinds, and JSON payload
//! helpers so tests stay about protocol behavior rather than serialization.
//!
//! # Usage
//!
//! ```ignore
//! let (client, _server) = ascension_testkit::connected_pair(ascension_testkit::hello_registry());
//! let reply = client.single_call(ascension_testkit::hello_id(), encode(&())).await?;
//! assert_eq!(decode::<String>(&reply), "Hello world!");
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use ascension::{
    AscensionRpcProtocol, BoxFuture, Connection, JsonCodec, PayloadCodec, PayloadStream, RpcError,
    SerializedPayload, ServiceCallIdentifier, ServiceRegistry,
};

type UnaryFuture = BoxFuture<Result<SerializedPayload, RpcError>>;
type StreamFuture = BoxFuture<Result<PayloadStream, RpcError>>;

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// JSON-encode a test payload, panicking on failure.
pub fn encode<T: Serialize>(value: &T) -> SerializedPayload {
    JsonCodec.encode(value).expect("encode test payload")
}

/// JSON-decode a test payload, panicking on failure.
pub fn decode<T: DeserializeOwned>(payload: &SerializedPayload) -> T {
    JsonCodec.decode(payload).expect("decode test payload")
}

/// A finite stream of JSON-encoded integers.
pub fn int_stream(values: Vec<i64>) -> PayloadStream {
    Box::pin(futures::stream::iter(
        values.into_iter().map(|value| JsonCodec.encode(&value)),
    ))
}

pub fn empty_stream() -> PayloadStream {
    Box::pin(futures::stream::empty())
}

/// Collect a payload stream of JSON strings, panicking on any stream error.
pub async fn collect_strings(mut stream: PayloadStream) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.push(decode::<String>(&item.expect("stream element")));
    }
    out
}

pub fn hello_id() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new("HelloService", "hello")
}

pub fn fold_id() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new("HelloService", "fold")
}

pub fn fold_first_two_id() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new("HelloService", "foldFirstTwo")
}

pub fn counter_id() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new("HelloService", "counter")
}

pub fn stringify_id() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new("HelloService", "stringify")
}

/// The standard test registry: one implementation per call kind.
///
/// - `hello`: unary, answers `"Hello world!"`.
/// - `fold`: client-streaming, sums the integer stream into `"Hello {sum}"`.
/// - `foldFirstTwo`: like `fold` but only pulls the first two elements.
/// - `counter`: server-streaming, yields `"1"` through `"{n}"`.
/// - `stringify`: bidirectional, maps each integer to its string form.
pub fn hello_registry() -> Arc<ServiceRegistry> {
    let registry = ServiceRegistry::new();

    registry.register_single(hello_id(), |_payload: SerializedPayload| -> UnaryFuture {
        Box::pin(async { JsonCodec.encode(&"Hello world!") })
    });

    registry.register_client_stream(
        fold_id(),
        |_payload: SerializedPayload, requests: PayloadStream| -> UnaryFuture {
            Box::pin(fold_sum(requests))
        },
    );

    registry.register_client_stream(
        fold_first_two_id(),
        |_payload: SerializedPayload, requests: PayloadStream| -> UnaryFuture {
            Box::pin(fold_sum(Box::pin(requests.take(2))))
        },
    );

    registry.register_server_stream(counter_id(), |payload: SerializedPayload| -> StreamFuture {
        Box::pin(async move {
            let n: u32 = JsonCodec.decode(&payload)?;
            let stream =
                futures::stream::iter(1..=n).map(|i| JsonCodec.encode(&i.to_string()));
            Ok(Box::pin(stream) as PayloadStream)
        })
    });

    registry.register_bi_stream(
        stringify_id(),
        |_payload: SerializedPayload, requests: PayloadStream| -> StreamFuture {
            Box::pin(async move {
                let stream = requests.map(|item| {
                    let value: i64 = JsonCodec.decode(&item?)?;
                    JsonCodec.encode(&value.to_string())
                });
                Ok(Box::pin(stream) as PayloadStream)
            })
        },
    );

    Arc::new(registry)
}

async fn fold_sum(mut requests: PayloadStream) -> Result<SerializedPayload, RpcError> {
    let mut sum: i64 = 0;
    while let Some(item) = requests.next().await {
        sum += JsonCodec.decode::<i64>(&item?)?;
    }
    JsonCodec.encode(&format!("Hello {sum}"))
}

/// Register a `counter` implementation that bumps `probe` once per produced
/// element, for asserting that cold streams do no work until started.
pub fn register_counting_counter(registry: &ServiceRegistry, probe: Arc<AtomicUsize>) {
    registry.register_server_stream(
        counter_id(),
        move |payload: SerializedPayload| -> StreamFuture {
            let probe = Arc::clone(&probe);
            Box::pin(async move {
                let n: u32 = JsonCodec.decode(&payload)?;
                let stream = futures::stream::iter(1..=n).map(move |i| {
                    probe.fetch_add(1, Ordering::SeqCst);
                    JsonCodec.encode(&i.to_string())
                });
                Ok(Box::pin(stream) as PayloadStream)
            })
        },
    );
}

/// A client/server engine pair over an in-memory connection. The first
/// engine is the client (empty registry), the second serves `registry`.
pub fn connected_pair(registry: Arc<ServiceRegistry>) -> (AscensionRpcProtocol, AscensionRpcProtocol) {
    let (client_side, server_side) = Connection::mem_pair();
    let server = AscensionRpcProtocol::new(server_side, registry);
    let client = AscensionRpcProtocol::new(client_side, Arc::new(ServiceRegistry::new()));
    (client, server)
}
