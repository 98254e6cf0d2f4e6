//! The four call-kind state machines, callee and caller halves each.
//!
//! Streaming kinds are built out of two reusable halves. A [`ConsumerHalf`]
//! owns the receiving end of one stream direction: it issues the
//! `StreamOperation.Start` / `StreamOperation.Close` handshake on behalf of
//! the local consumer and feeds decoded `StreamEvent`s into the channel
//! backing the consumer's cold stream. A [`ProducerHalf`] owns the callee's
//! producing direction: it announces the stream with `Opened`, waits out the
//! start window, and forwards the implementation's output as `Data` frames
//! once the peer starts it.
//!
//! Direction closing rule: the consumer of a stream sends
//! `StreamOperation.Close` exactly once when it stops consuming, whether the
//! stream ended naturally or was abandoned. The producer holds its direction
//! open until that `Close` arrives, so both sides agree on when a direction
//! is finished.

use std::mem;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use ascension_core::{
    DownstreamEvent, ErrorEnvelope, RpcError, RpcEvent, SerializedPayload, StreamEvent,
};
use ascension_registry::PayloadStream;
use futures::StreamExt;

use crate::pending::{stream_start_timeout_ms, CallContext, CallInput, StreamDirection};

pub(crate) mod bistream;
pub(crate) mod downstream;
pub(crate) mod single;
pub(crate) mod upstream;

/// Spawn the forwarding task for a producing direction: drain the
/// application stream and send each item as a `Data` frame carrying a
/// `StreamEvent`, ending with `Complete` (or `Error` if the stream fails).
pub(crate) fn spawn_producer(
    ctx: &CallContext,
    direction: StreamDirection,
    mut stream: PayloadStream,
) -> AbortHandle {
    let forward = ctx.clone();
    ctx.spawn_tracked(async move {
        loop {
            let event = match stream.next().await {
                Some(Ok(payload)) => StreamEvent::Element(payload),
                Some(Err(error)) => StreamEvent::Error(ErrorEnvelope::from_error(&error)),
                None => StreamEvent::Complete,
            };
            let terminal = !matches!(event, StreamEvent::Element(_));
            if let Err(error) = forward.send_data(event.encode()).await {
                tracing::warn!(
                    reference = forward.reference(),
                    direction = direction.label(),
                    error = %error,
                    "stopping stream forwarding"
                );
                break;
            }
            if terminal {
                break;
            }
        }
        forward.push(CallInput::ForwardingDone(direction));
    })
}

fn decoded_error(payload: &SerializedPayload) -> RpcError {
    ErrorEnvelope::decode(payload).into_error()
}

fn log_peer_warning(ctx: &CallContext, payload: &SerializedPayload) {
    let envelope = ErrorEnvelope::decode(payload);
    tracing::warn!(
        reference = ctx.reference(),
        kind = %envelope.kind,
        message = envelope.message.as_str(),
        "peer warning"
    );
}

/// Receiving end of one stream direction.
pub(crate) struct ConsumerHalf {
    elements: Option<mpsc::UnboundedSender<Result<SerializedPayload, RpcError>>>,
    direction: StreamDirection,
    started: bool,
    peer_gone: bool,
    closed: bool,
}

impl ConsumerHalf {
    pub(crate) fn new(
        elements: mpsc::UnboundedSender<Result<SerializedPayload, RpcError>>,
        direction: StreamDirection,
    ) -> Self {
        Self {
            elements: Some(elements),
            direction,
            started: false,
            peer_gone: false,
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// The local consumer polled the cold stream for the first time: ask the
    /// peer to start producing.
    pub(crate) async fn consumer_started(&mut self, ctx: &CallContext) -> Result<(), RpcError> {
        if self.started || self.closed || self.peer_gone {
            return Ok(());
        }
        self.started = true;
        tracing::trace!(
            reference = ctx.reference(),
            direction = self.direction.label(),
            "requesting stream start"
        );
        ctx.send_stream_start().await
    }

    /// An inbound `Data` frame for this direction.
    pub(crate) async fn data(
        &mut self,
        ctx: &CallContext,
        payload: &SerializedPayload,
    ) -> Result<(), RpcError> {
        let Some(elements) = &self.elements else {
            ctx.reject_as_protocol_violation("Data after stream already completed")
                .await;
            return Ok(());
        };
        match StreamEvent::decode(payload)? {
            StreamEvent::Element(element) => {
                let _ = elements.send(Ok(element));
            }
            StreamEvent::Complete => {
                self.elements = None;
            }
            StreamEvent::Error(envelope) => {
                let _ = elements.send(Err(envelope.into_error()));
                self.elements = None;
            }
        }
        Ok(())
    }

    /// The local consumer stopped, by draining the stream or dropping it.
    pub(crate) async fn consumer_finished(&mut self, ctx: &CallContext) -> Result<(), RpcError> {
        self.elements = None;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.peer_gone {
            return Ok(());
        }
        ctx.send_stream_close().await
    }

    /// Fail the consumer-facing stream; the peer already abandoned this
    /// direction, so no `Close` will be sent for it.
    pub(crate) fn fail(&mut self, error: RpcError) {
        if let Some(elements) = self.elements.take() {
            let _ = elements.send(Err(error));
        }
        self.peer_gone = true;
    }

    /// Terminal form of [`fail`](Self::fail): the direction is finished for
    /// good, so the call must not wait for the local consumer to notice.
    pub(crate) fn abandoned(&mut self, error: RpcError) {
        self.fail(error);
        self.closed = true;
    }
}

pub(crate) enum ProducerState {
    Idle,
    Invoking { start_requested: bool },
    Opened { stream: PayloadStream, window: AbortHandle },
    Forwarding { job: AbortHandle },
    Closed,
}

/// Callee-side producing direction: `Opened` announcement, start window,
/// forwarding job.
pub(crate) struct ProducerHalf {
    state: ProducerState,
}

impl ProducerHalf {
    pub(crate) fn new() -> Self {
        Self {
            state: ProducerState::Idle,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, ProducerState::Idle)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, ProducerState::Closed)
    }

    pub(crate) fn begin_invoking(&mut self) {
        self.state = ProducerState::Invoking {
            start_requested: false,
        };
    }

    /// The implementation produced its output stream: announce it with
    /// `Opened` and either start forwarding right away (the peer already
    /// asked) or wait out the start window.
    pub(crate) async fn ready(
        &mut self,
        ctx: &CallContext,
        stream: PayloadStream,
    ) -> Result<(), RpcError> {
        let start_requested = matches!(
            self.state,
            ProducerState::Invoking {
                start_requested: true
            }
        );
        ctx.send_event(RpcEvent::Downstream(DownstreamEvent::Opened))
            .await?;
        if start_requested {
            self.start(ctx, stream);
        } else {
            let window = ctx.arm_start_window(StreamDirection::Down);
            self.state = ProducerState::Opened { stream, window };
        }
        Ok(())
    }

    fn start(&mut self, ctx: &CallContext, stream: PayloadStream) {
        let job = spawn_producer(ctx, StreamDirection::Down, stream);
        self.state = ProducerState::Forwarding { job };
    }

    /// Peer sent `StreamOperation.Start` for this direction.
    pub(crate) async fn start_frame(&mut self, ctx: &CallContext) {
        match mem::replace(&mut self.state, ProducerState::Closed) {
            ProducerState::Invoking { .. } => {
                // The output stream is not ready yet; remember the request.
                self.state = ProducerState::Invoking {
                    start_requested: true,
                };
            }
            ProducerState::Opened { stream, window } => {
                window.abort();
                self.start(ctx, stream);
            }
            other => {
                self.state = other;
                ctx.reject_as_protocol_violation("StreamOperation.Start for an already-started stream")
                    .await;
            }
        }
    }

    /// Peer sent `StreamOperation.Close` for this direction: the consumer is
    /// done, whether or not forwarding ran or finished.
    pub(crate) fn close_frame(&mut self) {
        match mem::replace(&mut self.state, ProducerState::Closed) {
            ProducerState::Opened { window, .. } => window.abort(),
            ProducerState::Forwarding { job, .. } => job.abort(),
            _ => {}
        }
    }

    /// The start window elapsed with the stream still unstarted.
    pub(crate) async fn window_elapsed(&mut self, ctx: &CallContext) -> Result<(), RpcError> {
        if !matches!(self.state, ProducerState::Opened { .. }) {
            return Ok(());
        }
        self.state = ProducerState::Closed;
        tracing::warn!(
            reference = ctx.reference(),
            "peer never started the output stream, discarding it"
        );
        ctx.send_event(RpcEvent::Downstream(DownstreamEvent::Timeout(
            stream_start_timeout_ms(),
        )))
        .await
    }

    /// All elements are on the wire; the direction stays open until the
    /// consumer's `StreamOperation.Close` arrives.
    pub(crate) fn forwarding_done(&self, ctx: &CallContext) {
        tracing::trace!(reference = ctx.reference(), "output stream fully forwarded");
    }
}
