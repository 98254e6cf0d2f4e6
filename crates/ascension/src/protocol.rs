//! Connection-level dispatcher.
//!
//! One [`AscensionRpcProtocol`] per connection. It allocates call
//! references, keeps the two live-call tables (calls we initiated, calls the
//! peer opened on us), runs the single inbound read loop, and exposes the
//! four call-initiation entry points.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ascension_core::{
    CallReference, Connection, DownstreamEvent, ErrorEnvelope, RpcError, RpcEvent, RpcFrame,
    SerializedPayload, ServiceCallIdentifier, TransportError, UpstreamEvent,
};
use ascension_registry::{CallImplementation, PayloadStream, ServiceRegistry};

use crate::calls::bistream::{ColdBistreamCallee, ColdBistreamCaller};
use crate::calls::downstream::{ColdDownstreamCallee, ColdDownstreamCaller};
use crate::calls::single::{SingleCallCallee, SingleCallCaller};
use crate::calls::upstream::{ColdUpstreamCallee, ColdUpstreamCaller};
use crate::pending::{
    cold_consumer_stream, spawn_call, CallContext, CallInput, CallSide, StreamDirection,
};

type CallTable = Mutex<HashMap<CallReference, mpsc::UnboundedSender<CallInput>>>;

/// The protocol engine for one connection.
///
/// Cheap to share: clones refer to the same connection and call tables.
#[derive(Clone)]
pub struct AscensionRpcProtocol {
    shared: Arc<ProtocolShared>,
}

struct ProtocolShared {
    connection: Connection,
    registry: Arc<ServiceRegistry>,
    next_reference: AtomicU32,
    /// Calls this side initiated, keyed by our own references.
    client_calls: CallTable,
    /// Calls the peer opened on us, keyed by the peer's references.
    server_calls: CallTable,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl AscensionRpcProtocol {
    /// Start the engine on an established connection. The inbound read loop
    /// runs until the connection closes or [`close`](Self::close) is called.
    pub fn new(connection: Connection, registry: Arc<ServiceRegistry>) -> Self {
        let shared = Arc::new(ProtocolShared {
            connection,
            registry,
            next_reference: AtomicU32::new(0),
            client_calls: Mutex::new(HashMap::new()),
            server_calls: Mutex::new(HashMap::new()),
            read_task: Mutex::new(None),
        });
        let task = tokio::spawn(ProtocolShared::read_loop(Arc::clone(&shared)));
        *shared.read_task.lock() = Some(task);
        Self { shared }
    }

    /// Unary call: send the request, await the single response.
    pub async fn single_call(
        &self,
        service_call: ServiceCallIdentifier,
        payload: SerializedPayload,
    ) -> Result<SerializedPayload, RpcError> {
        let (response_tx, response_rx) = oneshot::channel();
        let (input, reference) = self
            .shared
            .register_caller(|_| SingleCallCaller::new(response_tx));
        self.open(reference, service_call, payload, &input).await?;
        await_response(response_rx, input).await
    }

    /// Client-streaming call: the request stream is forwarded only once the
    /// callee asks for it; the response may arrive before, during, or after.
    pub async fn client_stream(
        &self,
        service_call: ServiceCallIdentifier,
        payload: SerializedPayload,
        requests: PayloadStream,
    ) -> Result<SerializedPayload, RpcError> {
        let (response_tx, response_rx) = oneshot::channel();
        let (input, reference) = self
            .shared
            .register_caller(|_| ColdUpstreamCaller::new(requests, response_tx));
        self.open(reference, service_call, payload, &input).await?;
        await_response(response_rx, input).await
    }

    /// Server-streaming call: returns a cold stream. No data flows, and the
    /// callee does no forwarding work, until the stream is first polled.
    pub async fn server_stream(
        &self,
        service_call: ServiceCallIdentifier,
        payload: SerializedPayload,
    ) -> Result<PayloadStream, RpcError> {
        let (elements_tx, elements_rx) = mpsc::unbounded_channel();
        let (input, reference) = self
            .shared
            .register_caller(|_| ColdDownstreamCaller::new(elements_tx));
        let responses = cold_consumer_stream(input.clone(), elements_rx, StreamDirection::Down);
        self.open(reference, service_call, payload, &input).await?;
        Ok(responses)
    }

    /// Bidirectional call: a cold response stream, plus a request stream the
    /// callee pulls on its own schedule.
    pub async fn bi_stream(
        &self,
        service_call: ServiceCallIdentifier,
        payload: SerializedPayload,
        requests: PayloadStream,
    ) -> Result<PayloadStream, RpcError> {
        let (elements_tx, elements_rx) = mpsc::unbounded_channel();
        let (input, reference) = self.shared.register_caller(|ctx| {
            let window = ctx.arm_start_window(StreamDirection::Up);
            ColdBistreamCaller::new(requests, elements_tx, window)
        });
        let responses = cold_consumer_stream(input.clone(), elements_rx, StreamDirection::Down);
        self.open(reference, service_call, payload, &input).await?;
        Ok(responses)
    }

    async fn open(
        &self,
        reference: CallReference,
        service_call: ServiceCallIdentifier,
        payload: SerializedPayload,
        input: &mpsc::UnboundedSender<CallInput>,
    ) -> Result<(), RpcError> {
        let frame = RpcFrame {
            call_reference: reference,
            event: RpcEvent::Upstream(UpstreamEvent::Open {
                service_call,
                payload,
            }),
        };
        if let Err(error) = self.shared.connection.send(frame).await {
            // The actor is already registered; unwind it.
            let _ = input.send(CallInput::Cancelled);
            return Err(RpcError::from(error));
        }
        Ok(())
    }

    /// Number of calls this side initiated that are still live.
    pub fn open_client_calls(&self) -> usize {
        self.shared.client_calls.lock().len()
    }

    /// Number of peer-opened calls that are still live.
    pub fn open_server_calls(&self) -> usize {
        self.shared.server_calls.lock().len()
    }

    pub fn is_active(&self) -> bool {
        self.shared.connection.is_active()
    }

    /// Stop the read loop and close the connection. Live calls observe the
    /// closed transport on their next send.
    pub async fn close(&self) {
        let task = self.shared.read_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.shared.connection.close();
    }

    /// Wait for the read loop to finish naturally (peer closed the
    /// connection).
    pub async fn join(&self) {
        let task = self.shared.read_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn await_response(
    response_rx: oneshot::Receiver<Result<SerializedPayload, RpcError>>,
    input: mpsc::UnboundedSender<CallInput>,
) -> Result<SerializedPayload, RpcError> {
    let mut guard = CancelGuard {
        input: Some(input),
    };
    let outcome = response_rx.await;
    guard.disarm();
    match outcome {
        Ok(result) => result,
        // The actor went away without resolving: the transport died.
        Err(_) => Err(RpcError::Transport(TransportError::Closed)),
    }
}

/// Dropped mid-await (the caller's future was cancelled): tell the actor so
/// it can send `Cancel` and unwind the server half.
struct CancelGuard {
    input: Option<mpsc::UnboundedSender<CallInput>>,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.input = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(input) = self.input.take() {
            let _ = input.send(CallInput::Cancelled);
        }
    }
}

impl ProtocolShared {
    /// Allocate the next reference not currently in use by a call we
    /// initiated, register the actor under it, and spawn its drain task.
    fn register_caller<M, F>(
        self: &Arc<Self>,
        build: F,
    ) -> (mpsc::UnboundedSender<CallInput>, CallReference)
    where
        M: crate::pending::CallStateMachine,
        F: FnOnce(&CallContext) -> M,
    {
        let (input, inputs) = mpsc::unbounded_channel();
        let reference = {
            let mut calls = self.client_calls.lock();
            loop {
                let reference = self.next_reference.fetch_add(1, Ordering::Relaxed);
                if let Entry::Vacant(slot) = calls.entry(reference) {
                    slot.insert(input.clone());
                    break reference;
                }
            }
        };
        let ctx = CallContext::new(
            reference,
            CallSide::Caller,
            self.connection.clone(),
            input.clone(),
        );
        let machine = build(&ctx);
        let shared = Arc::clone(self);
        spawn_call(machine, ctx, inputs, move || {
            shared.client_calls.lock().remove(&reference);
        });
        (input, reference)
    }

    async fn read_loop(shared: Arc<Self>) {
        loop {
            match shared.connection.receive().await {
                Ok(frame) => shared.route(frame).await,
                Err(TransportError::Closed) => {
                    tracing::debug!("connection closed, stopping read loop");
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "transport failure, stopping read loop");
                    break;
                }
            }
        }
    }

    async fn route(self: &Arc<Self>, frame: RpcFrame) {
        match &frame.event {
            RpcEvent::Downstream(_) => {
                let entry = self.client_calls.lock().get(&frame.call_reference).cloned();
                match entry {
                    Some(input) => {
                        let _ = input.send(CallInput::Frame(frame));
                    }
                    None => self.unknown_reference(frame).await,
                }
            }
            RpcEvent::Upstream(event) => {
                let entry = self.server_calls.lock().get(&frame.call_reference).cloned();
                if let Some(input) = entry {
                    let _ = input.send(CallInput::Frame(frame));
                } else if matches!(event, UpstreamEvent::Open { .. }) {
                    self.open_callee(frame).await;
                } else {
                    self.unknown_reference(frame).await;
                }
            }
        }
    }

    /// `Open` for a fresh reference: resolve the implementation and bring up
    /// the matching callee actor, or answer NotFound without registering
    /// anything.
    async fn open_callee(self: &Arc<Self>, frame: RpcFrame) {
        let RpcEvent::Upstream(UpstreamEvent::Open { service_call, .. }) = &frame.event else {
            return;
        };
        let Some(implementation) = self.registry.get_call_by_id(service_call) else {
            tracing::warn!(
                %service_call,
                reference = frame.call_reference,
                "no implementation registered"
            );
            let envelope = ErrorEnvelope::not_found(service_call.clone());
            self.reply(
                frame.call_reference,
                RpcEvent::Downstream(DownstreamEvent::Error(envelope.encode())),
            )
            .await;
            return;
        };
        tracing::debug!(
            %service_call,
            reference = frame.call_reference,
            kind = implementation.kind(),
            "incoming call"
        );
        let (input, inputs) = mpsc::unbounded_channel();
        self.server_calls
            .lock()
            .insert(frame.call_reference, input.clone());
        let ctx = CallContext::new(
            frame.call_reference,
            CallSide::Callee,
            self.connection.clone(),
            input.clone(),
        );
        let shared = Arc::clone(self);
        let reference = frame.call_reference;
        let on_remove = move || {
            shared.server_calls.lock().remove(&reference);
        };
        match implementation {
            CallImplementation::Single(handler) => {
                spawn_call(SingleCallCallee::new(handler), ctx, inputs, on_remove);
            }
            CallImplementation::ClientStream(handler) => {
                spawn_call(ColdUpstreamCallee::new(handler), ctx, inputs, on_remove);
            }
            CallImplementation::ServerStream(handler) => {
                spawn_call(ColdDownstreamCallee::new(handler), ctx, inputs, on_remove);
            }
            CallImplementation::BiStream(handler) => {
                spawn_call(ColdBistreamCallee::new(handler), ctx, inputs, on_remove);
            }
        }
        let _ = input.send(CallInput::Frame(frame));
    }

    /// A frame referenced a call with no live actor. Answered with an
    /// `Error`, except when the frame itself is one, so two engines can
    /// never trade unknown-reference errors forever.
    async fn unknown_reference(&self, frame: RpcFrame) {
        if frame.event.is_error() {
            tracing::debug!(
                reference = frame.call_reference,
                "dropping error frame for unknown call reference"
            );
            return;
        }
        if frame.event.is_stream_close() {
            // A Close for a call that already finished and deregistered.
            // Benign protocol skew, answered with a warning.
            tracing::warn!(
                reference = frame.call_reference,
                "StreamOperation.Close for unknown call reference"
            );
            let envelope = ErrorEnvelope::unknown_reference(frame.call_reference);
            let event = match frame.event {
                RpcEvent::Upstream(_) => {
                    RpcEvent::Downstream(DownstreamEvent::Warning(envelope.encode()))
                }
                RpcEvent::Downstream(_) => {
                    RpcEvent::Upstream(UpstreamEvent::Warning(envelope.encode()))
                }
            };
            self.reply(frame.call_reference, event).await;
            return;
        }
        tracing::warn!(
            reference = frame.call_reference,
            event = frame.event.wire_name(),
            "frame for unknown call reference"
        );
        let envelope = ErrorEnvelope::unknown_reference(frame.call_reference);
        let event = match frame.event {
            RpcEvent::Upstream(_) => RpcEvent::Downstream(DownstreamEvent::Error(envelope.encode())),
            RpcEvent::Downstream(_) => RpcEvent::Upstream(UpstreamEvent::Error(envelope.encode())),
        };
        self.reply(frame.call_reference, event).await;
    }

    async fn reply(&self, reference: CallReference, event: RpcEvent) {
        let frame = RpcFrame {
            call_reference: reference,
            event,
        };
        if let Err(error) = self.connection.send(frame).await {
            tracing::debug!(reference, %error, "could not send reply");
        }
    }
}
