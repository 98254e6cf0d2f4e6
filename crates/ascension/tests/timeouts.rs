//! Start-window timeout behavior, run on paused time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ascension::{
    AscensionRpcProtocol, BoxFuture, JsonCodec, PayloadCodec, PayloadStream, RpcError,
    SerializedPayload, ServiceCallIdentifier, ServiceRegistry, StreamExt,
};
use ascension_testkit::{
    connected_pair, counter_id, decode, encode, init_tracing, int_stream,
    register_counting_counter,
};

const WINDOW: Duration = Duration::from_secs(60);

async fn drained(engine: &AscensionRpcProtocol) {
    for _ in 0..200 {
        if engine.open_client_calls() == 0 && engine.open_server_calls() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "calls never drained: client={} server={}",
        engine.open_client_calls(),
        engine.open_server_calls()
    );
}

#[tokio::test(start_paused = true)]
async fn server_stream_never_started_times_out() {
    init_tracing();
    let registry = ServiceRegistry::new();
    let probe = Arc::new(AtomicUsize::new(0));
    register_counting_counter(&registry, Arc::clone(&probe));
    let (client, server) = connected_pair(Arc::new(registry));

    let mut responses = client
        .server_stream(counter_id(), encode(&5u32))
        .await
        .expect("counter call");

    // Hold the stream without ever polling it; the callee gives up after
    // the start window.
    tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
    drained(&server).await;
    assert_eq!(probe.load(Ordering::SeqCst), 0, "elements were produced");

    let error = responses
        .next()
        .await
        .expect("failure element")
        .expect_err("stream should have timed out");
    assert!(matches!(error, RpcError::StreamTimeout), "{error}");
    assert!(responses.next().await.is_none());

    drained(&client).await;
}

#[tokio::test(start_paused = true)]
async fn client_stream_never_started_times_out() {
    init_tracing();
    let registry = ServiceRegistry::new();
    // Answers right away but parks the request stream forever without
    // subscribing, so the caller's start window is the only way out.
    registry.register_client_stream(
        ServiceCallIdentifier::new("HelloService", "hoarder"),
        |_payload: SerializedPayload,
         requests: PayloadStream|
         -> BoxFuture<Result<SerializedPayload, RpcError>> {
            Box::pin(async move {
                tokio::spawn(async move {
                    let _hold = requests;
                    futures::future::pending::<()>().await;
                });
                JsonCodec.encode(&"early")
            })
        },
    );
    let (client, server) = connected_pair(Arc::new(registry));

    let reply = client
        .client_stream(
            ServiceCallIdentifier::new("HelloService", "hoarder"),
            encode(&()),
            int_stream(vec![1, 2, 3]),
        )
        .await
        .expect("hoarder call");
    assert_eq!(decode::<String>(&reply), "early");

    // The response arrived, but the request stream was never started; the
    // caller abandons it after the window and both halves unwind.
    tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
    drained(&client).await;
    drained(&server).await;
}

#[tokio::test(start_paused = true)]
async fn bi_stream_with_unread_requests_still_completes() {
    init_tracing();
    let registry = ServiceRegistry::new();
    // Produces responses without ever touching the request stream. The
    // caller's start window is the only thing that ends the inbound
    // direction, and the call must unwind on both sides afterwards.
    registry.register_bi_stream(
        ServiceCallIdentifier::new("HelloService", "deaf"),
        |_payload: SerializedPayload,
         requests: PayloadStream|
         -> BoxFuture<Result<PayloadStream, RpcError>> {
            Box::pin(async move {
                tokio::spawn(async move {
                    let _hold = requests;
                    futures::future::pending::<()>().await;
                });
                let responses = async_stream::stream! {
                    yield Ok(encode(&"a"));
                    yield Ok(encode(&"b"));
                };
                Ok(Box::pin(responses) as PayloadStream)
            })
        },
    );
    let (client, server) = connected_pair(Arc::new(registry));

    let responses = client
        .bi_stream(
            ServiceCallIdentifier::new("HelloService", "deaf"),
            encode(&()),
            int_stream(vec![1, 2, 3]),
        )
        .await
        .expect("deaf call");
    let values = ascension_testkit::collect_strings(responses).await;
    assert_eq!(values, ["a", "b"]);

    // The responses arrived, but the request stream was never subscribed;
    // past the window the caller abandons it and the callee's half must
    // complete even though its implementation still holds the stream.
    tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
    drained(&client).await;
    drained(&server).await;
}

#[tokio::test(start_paused = true)]
async fn started_stream_does_not_time_out() {
    init_tracing();
    let (client, server) = connected_pair(ascension_testkit::hello_registry());

    let responses = client
        .server_stream(counter_id(), encode(&3u32))
        .await
        .expect("counter call");
    let values = ascension_testkit::collect_strings(responses).await;
    assert_eq!(values, ["1", "2", "3"]);

    // Well past the window, nothing is left to fire.
    tokio::time::sleep(WINDOW * 2).await;
    drained(&client).await;
    drained(&server).await;
}
