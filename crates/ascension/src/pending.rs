//! Per-call machinery shared by every call kind.
//!
//! Each live call is an actor: one unbounded input queue, one dedicated drain
//! task, and a state machine that processes inputs strictly in arrival order.
//! Inputs are inbound frames plus the call's own internal signals (a cold
//! stream was first polled, a forwarding task finished, a start window
//! elapsed). Tasks spawned on behalf of the call are tracked by the call's
//! [`CompletionTracker`] and cancelled as a unit at teardown.

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use ascension_core::{
    Connection, DownstreamEvent, ErrorEnvelope, ErrorKind, RpcError, RpcEvent, RpcFrame,
    SerializedPayload, UpstreamEvent,
};
use ascension_registry::PayloadStream;

use crate::tracker::{CompletionTracker, TaskScope};

pub(crate) const DEFAULT_STREAM_START_TIMEOUT_MS: u64 = 60_000;

/// How long a cold stream may sit between "you may start" and
/// `StreamOperation.Start` before the waiting side gives up.
pub(crate) fn stream_start_timeout_ms() -> u64 {
    std::env::var("ASCENSION_STREAM_START_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_STREAM_START_TIMEOUT_MS)
}

/// Which half of a call this context drives. Decides the event family of
/// every frame it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallSide {
    Caller,
    Callee,
}

/// A logical stream direction: `Up` is client to server, `Down` is server to
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamDirection {
    Up,
    Down,
}

impl StreamDirection {
    pub(crate) fn label(self) -> &'static str {
        match self {
            StreamDirection::Up => "up",
            StreamDirection::Down => "down",
        }
    }
}

/// What an implementation task produced.
pub(crate) enum ImplementationOutcome {
    /// A unary or client-streaming implementation returned its response.
    Response(Result<SerializedPayload, RpcError>),
    /// A server- or bidirectional-streaming implementation returned its
    /// output stream.
    Stream(Result<PayloadStream, RpcError>),
}

/// One unit of input for a call actor, processed strictly in arrival order.
pub(crate) enum CallInput {
    /// An inbound frame routed by the dispatcher.
    Frame(RpcFrame),
    /// A locally exposed cold stream was polled for the first time.
    ConsumerStarted(StreamDirection),
    /// The local consumer of a cold stream finished or was dropped.
    ConsumerFinished(StreamDirection),
    /// A forwarding task for the given direction ran to completion.
    ForwardingDone(StreamDirection),
    /// The implementation task finished.
    ImplementationReady(ImplementationOutcome),
    /// A start window elapsed without the peer starting the stream.
    StartWindowElapsed(StreamDirection),
    /// The local caller abandoned the call.
    Cancelled,
}

impl CallInput {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            CallInput::Frame(frame) => frame.event.wire_name(),
            CallInput::ConsumerStarted(_) => "consumer-started",
            CallInput::ConsumerFinished(_) => "consumer-finished",
            CallInput::ForwardingDone(_) => "forwarding-done",
            CallInput::ImplementationReady(_) => "implementation-ready",
            CallInput::StartWindowElapsed(_) => "start-window-elapsed",
            CallInput::Cancelled => "cancelled",
        }
    }
}

/// What the state machine wants next.
pub(crate) enum Flow {
    Continue,
    /// Terminal condition reached; deregister once outstanding work drains.
    Finished,
}

/// One call kind's state machine. `handle` is never called concurrently.
pub(crate) trait CallStateMachine: Send + 'static {
    fn kind(&self) -> &'static str;

    fn handle(
        &mut self,
        input: CallInput,
        ctx: &CallContext,
    ) -> impl std::future::Future<Output = Result<Flow, RpcError>> + Send;
}

/// Per-call handle to everything a state machine and its spawned tasks need:
/// the connection, the call's own input queue, and the completion tracker.
#[derive(Clone)]
pub(crate) struct CallContext {
    reference: u32,
    side: CallSide,
    connection: Connection,
    input: mpsc::UnboundedSender<CallInput>,
    tracker: CompletionTracker,
    scope: TaskScope,
}

impl CallContext {
    pub(crate) fn new(
        reference: u32,
        side: CallSide,
        connection: Connection,
        input: mpsc::UnboundedSender<CallInput>,
    ) -> Self {
        Self {
            reference,
            side,
            connection,
            input,
            tracker: CompletionTracker::new(),
            scope: TaskScope::default(),
        }
    }

    pub(crate) fn reference(&self) -> u32 {
        self.reference
    }

    pub(crate) fn input_sender(&self) -> mpsc::UnboundedSender<CallInput> {
        self.input.clone()
    }

    /// Feed the call's own queue. Silently ignored after teardown.
    pub(crate) fn push(&self, input: CallInput) {
        let _ = self.input.send(input);
    }

    pub(crate) fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub(crate) fn abort_children(&self) {
        self.scope.abort_all();
    }

    pub(crate) async fn send_event(&self, event: RpcEvent) -> Result<(), RpcError> {
        self.connection
            .send(RpcFrame {
                call_reference: self.reference,
                event,
            })
            .await
            .map_err(RpcError::from)
    }

    /// Send a `Data` frame in this side's event family.
    pub(crate) async fn send_data(&self, payload: SerializedPayload) -> Result<(), RpcError> {
        let event = match self.side {
            CallSide::Caller => RpcEvent::Upstream(UpstreamEvent::Data(payload)),
            CallSide::Callee => RpcEvent::Downstream(DownstreamEvent::Data(payload)),
        };
        self.send_event(event).await
    }

    pub(crate) async fn send_stream_start(&self) -> Result<(), RpcError> {
        let event = match self.side {
            CallSide::Caller => RpcEvent::Upstream(UpstreamEvent::StreamOperationStart),
            CallSide::Callee => RpcEvent::Downstream(DownstreamEvent::StreamOperationStart),
        };
        self.send_event(event).await
    }

    pub(crate) async fn send_stream_close(&self) -> Result<(), RpcError> {
        let event = match self.side {
            CallSide::Caller => RpcEvent::Upstream(UpstreamEvent::StreamOperationClose),
            CallSide::Callee => RpcEvent::Downstream(DownstreamEvent::StreamOperationClose),
        };
        self.send_event(event).await
    }

    /// Report a call failure to the peer as an `Error` frame.
    pub(crate) async fn send_error(&self, error: &RpcError) -> Result<(), RpcError> {
        let payload = ErrorEnvelope::from_error(error).encode();
        let event = match self.side {
            CallSide::Caller => RpcEvent::Upstream(UpstreamEvent::Error(payload)),
            CallSide::Callee => RpcEvent::Downstream(DownstreamEvent::Error(payload)),
        };
        self.send_event(event).await
    }

    /// Send a non-fatal `Warning` frame.
    pub(crate) async fn send_warning(&self, envelope: ErrorEnvelope) -> Result<(), RpcError> {
        let payload = envelope.encode();
        let event = match self.side {
            CallSide::Caller => RpcEvent::Upstream(UpstreamEvent::Warning(payload)),
            CallSide::Callee => RpcEvent::Downstream(DownstreamEvent::Warning(payload)),
        };
        self.send_event(event).await
    }

    /// Best-effort `Cancel` on caller teardown; the transport may already be
    /// gone, in which case there is nobody left to tell.
    pub(crate) async fn send_cancel(&self) {
        if let Err(error) = self.send_event(RpcEvent::Upstream(UpstreamEvent::Cancel)).await {
            tracing::debug!(reference = self.reference, error = %error, "could not send Cancel");
        }
    }

    /// Log a protocol violation and inform the peer with an `Error` frame.
    /// Whether the call terminates is the state machine's decision.
    pub(crate) async fn reject_as_protocol_violation(&self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(
            reference = self.reference,
            side = ?self.side,
            detail = detail.as_str(),
            "protocol violation"
        );
        let error = RpcError::ProtocolViolation(detail);
        if let Err(send_error) = self.send_error(&error).await {
            tracing::debug!(
                reference = self.reference,
                error = %send_error,
                "could not report protocol violation"
            );
        }
    }

    /// Spawn a task owned by this call: counted by the completion tracker and
    /// aborted at teardown.
    pub(crate) fn spawn_tracked(
        &self,
        future: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> AbortHandle {
        let token = self.tracker.acquire();
        self.scope.spawn(async move {
            let _token = token;
            future.await;
        })
    }

    /// Arm a start window for a cold stream: after the timeout the actor gets
    /// a `StartWindowElapsed` input. Abort the returned handle when the peer
    /// starts in time.
    pub(crate) fn arm_start_window(&self, direction: StreamDirection) -> AbortHandle {
        let ctx = self.clone();
        let millis = stream_start_timeout_ms();
        self.spawn_tracked(async move {
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            tracing::debug!(
                reference = ctx.reference,
                direction = direction.label(),
                millis,
                "cold stream start window elapsed"
            );
            ctx.push(CallInput::StartWindowElapsed(direction));
        })
    }
}

/// Spawn the drain task for one call.
///
/// The task processes inputs one at a time until the machine reports
/// `Finished` (or fails), then waits for the completion tracker to go idle,
/// deregisters the call, and aborts any children that are still running.
pub(crate) fn spawn_call<M: CallStateMachine>(
    mut machine: M,
    ctx: CallContext,
    mut inputs: mpsc::UnboundedReceiver<CallInput>,
    on_remove: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        let kind = machine.kind();
        let mut finished = false;
        loop {
            tokio::select! {
                biased;
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    if finished {
                        if let CallInput::Frame(frame) = input {
                            late_frame(&ctx, kind, &frame).await;
                        }
                        continue;
                    }
                    tracing::trace!(
                        reference = ctx.reference(),
                        kind,
                        input = input.describe(),
                        "handling call input"
                    );
                    match machine.handle(input, &ctx).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Finished) => finished = true,
                        Err(error) => {
                            tracing::warn!(
                                reference = ctx.reference(),
                                kind,
                                error = %error,
                                "call failed"
                            );
                            if let Err(send_error) = ctx.send_error(&error).await {
                                tracing::debug!(
                                    reference = ctx.reference(),
                                    error = %send_error,
                                    "could not report call failure"
                                );
                            }
                            ctx.abort_children();
                            finished = true;
                        }
                    }
                }
                _ = ctx.tracker().wait_idle(), if finished => break,
            }
        }
        on_remove();
        ctx.abort_children();
        tracing::debug!(reference = ctx.reference(), kind, "call deregistered");
    });
}

/// A frame arrived for an actor that already reached its terminal state.
async fn late_frame(ctx: &CallContext, kind: &'static str, frame: &RpcFrame) {
    let event = frame.event.wire_name();
    if frame.event.is_error() {
        tracing::debug!(
            reference = ctx.reference(),
            kind,
            "dropping error frame for finished call"
        );
        return;
    }
    if frame.event.is_stream_close() {
        // Duplicate close of an already torn-down stream is benign protocol
        // skew; answer with a warning rather than an error.
        tracing::warn!(
            reference = ctx.reference(),
            kind,
            "duplicate StreamOperation.Close for finished call"
        );
        let envelope = ErrorEnvelope::new(
            ErrorKind::ProtocolViolation,
            format!("{event} for already-completed call"),
        );
        if let Err(error) = ctx.send_warning(envelope).await {
            tracing::debug!(reference = ctx.reference(), error = %error, "could not send warning");
        }
        return;
    }
    ctx.reject_as_protocol_violation(format!("{event} for already-completed call"))
        .await;
}

/// Guard that reports the fate of a locally exposed cold stream back to its
/// call actor. Fires `ConsumerFinished` exactly once, on drop at the latest,
/// so an abandoned (even never-polled) stream still closes its direction.
pub(crate) struct ConsumerGuard {
    input: mpsc::UnboundedSender<CallInput>,
    direction: StreamDirection,
    finished: bool,
}

impl ConsumerGuard {
    pub(crate) fn new(input: mpsc::UnboundedSender<CallInput>, direction: StreamDirection) -> Self {
        Self {
            input,
            direction,
            finished: false,
        }
    }

    pub(crate) fn start(&self) {
        let _ = self.input.send(CallInput::ConsumerStarted(self.direction));
    }

    pub(crate) fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.input.send(CallInput::ConsumerFinished(self.direction));
        }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Build the cold consumer-facing stream for one direction of a call.
///
/// The stream is genuinely lazy: nothing happens until it is first polled,
/// when the actor learns `ConsumerStarted` and (on the caller side) emits
/// `StreamOperation.Start`. When the consumer stops, whether by exhaustion,
/// error, or drop, the actor learns `ConsumerFinished`.
pub(crate) fn cold_consumer_stream(
    input: mpsc::UnboundedSender<CallInput>,
    mut elements: mpsc::UnboundedReceiver<Result<SerializedPayload, RpcError>>,
    direction: StreamDirection,
) -> PayloadStream {
    let mut guard = ConsumerGuard::new(input, direction);
    Box::pin(async_stream::stream! {
        guard.start();
        while let Some(item) = elements.recv().await {
            let failed = item.is_err();
            yield item;
            if failed {
                break;
            }
        }
        guard.finish();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn consumer_stream_signals_start_and_finish() {
        let (input, mut inputs) = mpsc::unbounded_channel();
        let (elements, inbound) = mpsc::unbounded_channel();
        let mut stream = cold_consumer_stream(input, inbound, StreamDirection::Down);

        // Cold: no signal before the first poll.
        assert!(inputs.try_recv().is_err());

        elements.send(Ok(SerializedPayload::empty())).unwrap();
        drop(elements);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            inputs.recv().await,
            Some(CallInput::ConsumerStarted(StreamDirection::Down))
        ));

        assert!(stream.next().await.is_none());
        assert!(matches!(
            inputs.recv().await,
            Some(CallInput::ConsumerFinished(StreamDirection::Down))
        ));
    }

    #[tokio::test]
    async fn dropping_an_unpolled_stream_still_reports_finished() {
        let (input, mut inputs) = mpsc::unbounded_channel();
        let (_elements, inbound) =
            mpsc::unbounded_channel::<Result<SerializedPayload, RpcError>>();
        let stream = cold_consumer_stream(input, inbound, StreamDirection::Up);
        drop(stream);
        assert!(matches!(
            inputs.recv().await,
            Some(CallInput::ConsumerFinished(StreamDirection::Up))
        ));
    }
}
