//! Bidirectional-streaming calls.
//!
//! Two independent direction machines run under one call: the callee
//! consumes the client-to-server stream exactly like a client-streaming
//! callee, and produces the server-to-client stream exactly like a
//! server-streaming callee. The call is finished only once both directions
//! have reached a terminal state, and closing one direction never tears down
//! the other.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use ascension_core::{
    DownstreamEvent, ErrorEnvelope, ErrorKind, RpcError, RpcEvent, RpcFrame, SerializedPayload,
    UpstreamEvent,
};
use ascension_registry::{BiStreamHandler, PayloadStream};

use crate::pending::{
    cold_consumer_stream, CallContext, CallInput, CallStateMachine, Flow, ImplementationOutcome,
    StreamDirection,
};

use super::{decoded_error, log_peer_warning, spawn_producer, ConsumerHalf, ProducerHalf};

pub(crate) struct ColdBistreamCallee {
    handler: Arc<dyn BiStreamHandler>,
    consumer: Option<ConsumerHalf>,
    producer: ProducerHalf,
}

impl ColdBistreamCallee {
    pub(crate) fn new(handler: Arc<dyn BiStreamHandler>) -> Self {
        Self {
            handler,
            consumer: None,
            producer: ProducerHalf::new(),
        }
    }

    fn flow(&self) -> Flow {
        let inbound_closed = self.consumer.as_ref().is_some_and(ConsumerHalf::is_closed);
        if inbound_closed && self.producer.is_closed() {
            Flow::Finished
        } else {
            Flow::Continue
        }
    }

    fn consumer(&mut self) -> Result<&mut ConsumerHalf, RpcError> {
        self.consumer
            .as_mut()
            .ok_or_else(|| RpcError::ProtocolViolation("stream event before Open".into()))
    }

    async fn frame(&mut self, frame: RpcFrame, ctx: &CallContext) -> Result<Flow, RpcError> {
        let RpcEvent::Upstream(event) = frame.event else {
            return Err(RpcError::ProtocolViolation(
                "downstream event received by callee".into(),
            ));
        };
        match event {
            UpstreamEvent::Open { payload, .. } if self.consumer.is_none() => {
                let (elements, inbound) = mpsc::unbounded_channel();
                self.consumer = Some(ConsumerHalf::new(elements, StreamDirection::Up));
                self.producer.begin_invoking();
                let requests =
                    cold_consumer_stream(ctx.input_sender(), inbound, StreamDirection::Up);
                let handler = Arc::clone(&self.handler);
                let actor = ctx.clone();
                ctx.spawn_tracked(async move {
                    let outcome = handler.perform(payload, requests).await;
                    actor.push(CallInput::ImplementationReady(
                        ImplementationOutcome::Stream(outcome),
                    ));
                });
                Ok(Flow::Continue)
            }
            UpstreamEvent::Open { .. } => {
                Err(RpcError::ProtocolViolation("duplicate Open".into()))
            }
            UpstreamEvent::Data(payload) => {
                self.consumer()?.data(ctx, &payload).await?;
                Ok(Flow::Continue)
            }
            // Start/Close from the caller govern the producing direction
            // only; the inbound direction is driven by the implementation's
            // own consumption.
            UpstreamEvent::StreamOperationStart => {
                self.producer.start_frame(ctx).await;
                Ok(Flow::Continue)
            }
            UpstreamEvent::StreamOperationClose => {
                self.producer.close_frame();
                Ok(self.flow())
            }
            UpstreamEvent::Error(payload) => {
                let error = decoded_error(&payload);
                tracing::debug!(reference = ctx.reference(), %error, "caller failed the call");
                if let Some(consumer) = &mut self.consumer {
                    consumer.fail(error);
                }
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            UpstreamEvent::Warning(payload) => {
                // The caller abandoning its request stream arrives as a
                // warning so the response direction survives it.
                let envelope = ErrorEnvelope::decode(&payload);
                if envelope.kind == ErrorKind::StreamTimeout {
                    tracing::warn!(
                        reference = ctx.reference(),
                        "caller abandoned the request stream"
                    );
                    // Terminal for the inbound direction even if the
                    // implementation never polls the request stream.
                    if let Some(consumer) = &mut self.consumer {
                        consumer.abandoned(RpcError::StreamTimeout);
                    }
                    Ok(self.flow())
                } else {
                    log_peer_warning(ctx, &payload);
                    Ok(Flow::Continue)
                }
            }
            UpstreamEvent::Cancel => {
                ctx.abort_children();
                Ok(Flow::Finished)
            }
        }
    }
}

impl CallStateMachine for ColdBistreamCallee {
    fn kind(&self) -> &'static str {
        "bi-stream-callee"
    }

    async fn handle(&mut self, input: CallInput, ctx: &CallContext) -> Result<Flow, RpcError> {
        match input {
            CallInput::Frame(frame) => self.frame(frame, ctx).await,
            CallInput::ConsumerStarted(StreamDirection::Up) => {
                self.consumer()?.consumer_started(ctx).await?;
                Ok(Flow::Continue)
            }
            CallInput::ConsumerFinished(StreamDirection::Up) => {
                self.consumer()?.consumer_finished(ctx).await?;
                Ok(self.flow())
            }
            CallInput::ImplementationReady(ImplementationOutcome::Stream(Ok(stream))) => {
                self.producer.ready(ctx, stream).await?;
                Ok(Flow::Continue)
            }
            CallInput::ImplementationReady(ImplementationOutcome::Stream(Err(error))) => Err(error),
            CallInput::ImplementationReady(ImplementationOutcome::Response(_)) => {
                Err(RpcError::InternalServer(
                    "bidirectional implementation produced a unary response".into(),
                ))
            }
            CallInput::StartWindowElapsed(StreamDirection::Down) => {
                self.producer.window_elapsed(ctx).await?;
                Ok(self.flow())
            }
            CallInput::ForwardingDone(StreamDirection::Down) => {
                self.producer.forwarding_done(ctx);
                Ok(Flow::Continue)
            }
            CallInput::Cancelled => {
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }
}

/// Caller half: a producing machine for the request stream and a consuming
/// machine for the response stream, joined only at the finish condition.
pub(crate) struct ColdBistreamCaller {
    outbound: Option<PayloadStream>,
    window: Option<AbortHandle>,
    job: Option<AbortHandle>,
    up_closed: bool,
    consumer: ConsumerHalf,
}

impl ColdBistreamCaller {
    pub(crate) fn new(
        outbound: PayloadStream,
        elements: mpsc::UnboundedSender<Result<SerializedPayload, RpcError>>,
        window: AbortHandle,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            window: Some(window),
            job: None,
            up_closed: false,
            consumer: ConsumerHalf::new(elements, StreamDirection::Down),
        }
    }

    fn close_up(&mut self) {
        if let Some(window) = self.window.take() {
            window.abort();
        }
        if let Some(job) = self.job.take() {
            job.abort();
        }
        self.outbound = None;
        self.up_closed = true;
    }

    fn flow(&self) -> Flow {
        if self.up_closed && self.consumer.is_closed() {
            Flow::Finished
        } else {
            Flow::Continue
        }
    }

    async fn frame(&mut self, frame: RpcFrame, ctx: &CallContext) -> Result<Flow, RpcError> {
        let RpcEvent::Downstream(event) = frame.event else {
            return Err(RpcError::ProtocolViolation(
                "upstream event received by caller".into(),
            ));
        };
        match event {
            DownstreamEvent::Opened => {
                tracing::trace!(reference = ctx.reference(), "response stream opened");
                Ok(Flow::Continue)
            }
            DownstreamEvent::Data(payload) => {
                self.consumer.data(ctx, &payload).await?;
                Ok(Flow::Continue)
            }
            DownstreamEvent::StreamOperationStart => {
                if let Some(window) = self.window.take() {
                    window.abort();
                }
                match self.outbound.take() {
                    Some(stream) => {
                        self.job = Some(spawn_producer(ctx, StreamDirection::Up, stream));
                    }
                    None => {
                        ctx.reject_as_protocol_violation(
                            "StreamOperation.Start for an already-started stream",
                        )
                        .await;
                    }
                }
                Ok(Flow::Continue)
            }
            DownstreamEvent::StreamOperationClose => {
                self.close_up();
                Ok(self.flow())
            }
            DownstreamEvent::Timeout(millis) => {
                tracing::warn!(
                    reference = ctx.reference(),
                    millis,
                    "callee timed out waiting for the response stream to start"
                );
                self.consumer.abandoned(RpcError::StreamTimeout);
                Ok(self.flow())
            }
            DownstreamEvent::Error(payload) => {
                self.consumer.fail(decoded_error(&payload));
                self.close_up();
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            DownstreamEvent::Warning(payload) => {
                log_peer_warning(ctx, &payload);
                Ok(Flow::Continue)
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "{} is illegal for a bidirectional call",
                other.wire_name()
            ))),
        }
    }
}

impl CallStateMachine for ColdBistreamCaller {
    fn kind(&self) -> &'static str {
        "bi-stream-caller"
    }

    async fn handle(&mut self, input: CallInput, ctx: &CallContext) -> Result<Flow, RpcError> {
        match input {
            CallInput::Frame(frame) => self.frame(frame, ctx).await,
            CallInput::ConsumerStarted(StreamDirection::Down) => {
                self.consumer.consumer_started(ctx).await?;
                Ok(Flow::Continue)
            }
            CallInput::ConsumerFinished(StreamDirection::Down) => {
                self.consumer.consumer_finished(ctx).await?;
                Ok(self.flow())
            }
            CallInput::ForwardingDone(StreamDirection::Up) => {
                self.job = None;
                Ok(Flow::Continue)
            }
            CallInput::StartWindowElapsed(StreamDirection::Up) => {
                if self.outbound.is_none() {
                    return Ok(Flow::Continue);
                }
                tracing::warn!(
                    reference = ctx.reference(),
                    "callee never started the request stream, abandoning it"
                );
                self.close_up();
                // A warning rather than an error: the response direction may
                // still be live.
                ctx.send_warning(ErrorEnvelope::from_error(&RpcError::StreamTimeout))
                    .await?;
                Ok(self.flow())
            }
            CallInput::Cancelled => {
                ctx.send_cancel().await;
                self.consumer.fail(RpcError::Cancelled);
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }
}
