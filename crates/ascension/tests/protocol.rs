//! End-to-end tests: two engines over an in-memory connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ascension::{
    AscensionRpcProtocol, BoxFuture, JsonCodec, PayloadCodec, PayloadStream, RpcError,
    SerializedPayload, ServiceCallIdentifier, ServiceRegistry, StreamExt,
};
use ascension_testkit::{
    collect_strings, connected_pair, counter_id, decode, empty_stream, encode, fold_first_two_id,
    fold_id, hello_id, hello_registry, init_tracing, int_stream, register_counting_counter,
    stringify_id,
};

/// Wait for both call tables of an engine to empty out; deregistration runs
/// after the last frame of a call, so give it a moment.
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

#[tokio::test]
async fn single_call_returns_hello_world() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let reply = client
        .single_call(hello_id(), encode(&()))
        .await
        .expect("single call");
    assert_eq!(decode::<String>(&reply), "Hello world!");

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn concurrent_single_calls_pair_responses() {
    init_tracing();
    let registry = ServiceRegistry::new();
    registry.register_single(
        ServiceCallIdentifier::new("EchoService", "echo"),
        |payload: SerializedPayload| -> BoxFuture<Result<SerializedPayload, RpcError>> {
            Box::pin(async move { Ok(payload) })
        },
    );
    let (client, server) = connected_pair(Arc::new(registry));

    let calls = (0..32i64).map(|i| {
        let client = client.clone();
        async move {
            let reply = client
                .single_call(ServiceCallIdentifier::new("EchoService", "echo"), encode(&i))
                .await
                .expect("echo call");
            (i, decode::<i64>(&reply))
        }
    });
    for (sent, received) in futures::future::join_all(calls).await {
        assert_eq!(sent, received);
    }

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn client_stream_folds_the_input() {
    init_tracing();
    let (client, _server) = connected_pair(hello_registry());

    let reply = client
        .client_stream(fold_id(), encode(&()), int_stream(vec![1, 2, 3, 4, 5]))
        .await
        .expect("fold call");
    assert_eq!(decode::<String>(&reply), "Hello 15");
}

#[tokio::test]
async fn client_stream_with_empty_input() {
    init_tracing();
    let (client, _server) = connected_pair(hello_registry());

    let reply = client
        .client_stream(fold_id(), encode(&()), empty_stream())
        .await
        .expect("fold call");
    assert_eq!(decode::<String>(&reply), "Hello 0");
}

#[tokio::test]
async fn client_stream_callee_may_stop_early() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let reply = client
        .client_stream(
            fold_first_two_id(),
            encode(&()),
            int_stream(vec![1, 2, 3, 4, 5]),
        )
        .await
        .expect("fold call");
    assert_eq!(decode::<String>(&reply), "Hello 3");

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn client_stream_never_subscribed_still_answers() {
    init_tracing();
    let registry = ServiceRegistry::new();
    registry.register_client_stream(
        ServiceCallIdentifier::new("HelloService", "ignoring"),
        |_payload: SerializedPayload,
         requests: PayloadStream|
         -> BoxFuture<Result<SerializedPayload, RpcError>> {
            Box::pin(async move {
                drop(requests);
                JsonCodec.encode(&"ignored")
            })
        },
    );
    let (client, server) = connected_pair(Arc::new(registry));

    let polled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&polled);
    let requests: PayloadStream = Box::pin(async_stream::stream! {
        flag.store(true, Ordering::SeqCst);
        for value in 1..=5i64 {
            yield JsonCodec.encode(&value);
        }
    });

    let reply = client
        .client_stream(
            ServiceCallIdentifier::new("HelloService", "ignoring"),
            encode(&()),
            requests,
        )
        .await
        .expect("ignoring call");
    assert_eq!(decode::<String>(&reply), "ignored");
    assert!(
        !polled.load(Ordering::SeqCst),
        "request stream was subscribed even though the callee ignored it"
    );

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn server_stream_counts() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let responses = client
        .server_stream(counter_id(), encode(&5u32))
        .await
        .expect("counter call");
    assert_eq!(collect_strings(responses).await, ["1", "2", "3", "4", "5"]);

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn server_stream_with_zero_elements() {
    init_tracing();
    let (client, _server) = connected_pair(hello_registry());

    let responses = client
        .server_stream(counter_id(), encode(&0u32))
        .await
        .expect("counter call");
    assert!(collect_strings(responses).await.is_empty());
}

#[tokio::test]
async fn server_stream_partial_consumption() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let responses = client
        .server_stream(counter_id(), encode(&2u32))
        .await
        .expect("counter call");
    let first_two = collect_strings(Box::pin(responses.take(2))).await;
    assert_eq!(first_two, ["1", "2"]);

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn server_stream_abandoned_mid_way() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let responses = client
        .server_stream(counter_id(), encode(&5u32))
        .await
        .expect("counter call");
    let first_two = collect_strings(Box::pin(responses.take(2))).await;
    assert_eq!(first_two, ["1", "2"]);

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn server_stream_is_cold_until_polled() {
    init_tracing();
    let registry = ServiceRegistry::new();
    let probe = Arc::new(AtomicUsize::new(0));
    register_counting_counter(&registry, Arc::clone(&probe));
    let (client, _server) = connected_pair(Arc::new(registry));

    let responses = client
        .server_stream(counter_id(), encode(&5u32))
        .await
        .expect("counter call");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.load(Ordering::SeqCst), 0, "stream produced eagerly");

    assert_eq!(collect_strings(responses).await.len(), 5);
    assert_eq!(probe.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn bi_stream_maps_integers_to_strings() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let responses = client
        .bi_stream(stringify_id(), encode(&()), int_stream(vec![1, 2, 3, 4, 5]))
        .await
        .expect("stringify call");
    assert_eq!(collect_strings(responses).await, ["1", "2", "3", "4", "5"]);

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn bi_stream_with_empty_input() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let responses = client
        .bi_stream(stringify_id(), encode(&()), empty_stream())
        .await
        .expect("stringify call");
    assert!(collect_strings(responses).await.is_empty());

    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    init_tracing();
    let (client, server) = connected_pair(hello_registry());

    let error = client
        .single_call(ServiceCallIdentifier::new("NoSuch", "call"), encode(&()))
        .await
        .expect_err("call should fail");
    assert!(
        matches!(error, RpcError::NotFound(ref id) if id.service_id == "NoSuch"),
        "unexpected error: {error}"
    );
    assert_eq!(server.open_server_calls(), 0);
}

#[tokio::test]
async fn failing_implementation_reaches_the_caller() {
    init_tracing();
    let registry = ServiceRegistry::new();
    registry.register_single(
        ServiceCallIdentifier::new("HelloService", "broken"),
        |_payload: SerializedPayload| -> BoxFuture<Result<SerializedPayload, RpcError>> {
            Box::pin(async { Err(RpcError::InternalServer("boom".into())) })
        },
    );
    let (client, _server) = connected_pair(Arc::new(registry));

    let error = client
        .single_call(ServiceCallIdentifier::new("HelloService", "broken"), encode(&()))
        .await
        .expect_err("call should fail");
    assert!(
        matches!(error, RpcError::InternalServer(ref message) if message.contains("boom")),
        "unexpected error: {error}"
    );
}

#[tokio::test]
async fn cancelled_call_unwinds_both_halves() {
    init_tracing();
    let registry = ServiceRegistry::new();
    let reached = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reached);
    // Never answers; dropping the in-flight call is the only way out.
    registry.register_single(
        ServiceCallIdentifier::new("SlowService", "stall"),
        move |_payload: SerializedPayload| -> BoxFuture<Result<SerializedPayload, RpcError>> {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                futures::future::pending::<Result<SerializedPayload, RpcError>>().await
            })
        },
    );
    let (client, server) = connected_pair(Arc::new(registry));

    let issuer = client.clone();
    let call = tokio::spawn(async move {
        issuer
            .single_call(ServiceCallIdentifier::new("SlowService", "stall"), encode(&()))
            .await
    });

    // Let the call reach the implementation before tearing it down.
    for _ in 0..200 {
        if reached.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(reached.load(Ordering::SeqCst), "implementation never invoked");

    call.abort();
    let join_error = call.await.expect_err("call should be aborted");
    assert!(join_error.is_cancelled());

    // The dropped call sends Cancel upstream and the callee half is torn
    // down without a response ever crossing the wire.
    drained(&client).await;
    drained(&server).await;
}

#[tokio::test]
async fn stream_error_fails_the_consumer() {
    init_tracing();
    let registry = ServiceRegistry::new();
    registry.register_server_stream(
        ServiceCallIdentifier::new("HelloService", "flaky"),
        |_payload: SerializedPayload| -> BoxFuture<Result<PayloadStream, RpcError>> {
            Box::pin(async {
                let stream = futures::stream::iter(vec![
                    JsonCodec.encode(&"1"),
                    Err(RpcError::InternalServer("flaky".into())),
                ]);
                Ok(Box::pin(stream) as PayloadStream)
            })
        },
    );
    let (client, _server) = connected_pair(Arc::new(registry));

    let mut responses = client
        .server_stream(ServiceCallIdentifier::new("HelloService", "flaky"), encode(&()))
        .await
        .expect("flaky call");
    let first = responses.next().await.expect("first element").expect("ok");
    assert_eq!(decode::<String>(&first), "1");
    let error = responses
        .next()
        .await
        .expect("second element")
        .expect_err("stream should fail");
    assert!(matches!(error, RpcError::InternalServer(_)), "{error}");
    assert!(responses.next().await.is_none());
}
