//! Client-streaming calls: a cold client-to-server stream plus one
//! `Response` frame.
//!
//! The response and the stream are independent in time. The callee may
//! answer before draining the stream (or without touching it at all), so the
//! call is only finished once the response has been delivered and the
//! upstream direction has closed.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use ascension_core::{
    DownstreamEvent, RpcError, RpcEvent, RpcFrame, SerializedPayload, UpstreamEvent,
};
use ascension_registry::{ClientStreamHandler, PayloadStream};

use crate::pending::{
    cold_consumer_stream, CallContext, CallInput, CallStateMachine, Flow, ImplementationOutcome,
    StreamDirection,
};

use super::{decoded_error, log_peer_warning, spawn_producer, ConsumerHalf};

pub(crate) struct ColdUpstreamCallee {
    handler: Arc<dyn ClientStreamHandler>,
    consumer: Option<ConsumerHalf>,
    response_sent: bool,
}

impl ColdUpstreamCallee {
    pub(crate) fn new(handler: Arc<dyn ClientStreamHandler>) -> Self {
        Self {
            handler,
            consumer: None,
            response_sent: false,
        }
    }

    fn flow(&self) -> Flow {
        let inbound_closed = self.consumer.as_ref().is_some_and(ConsumerHalf::is_closed);
        if self.response_sent && inbound_closed {
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
                let requests =
                    cold_consumer_stream(ctx.input_sender(), inbound, StreamDirection::Up);
                let handler = Arc::clone(&self.handler);
                let actor = ctx.clone();
                ctx.spawn_tracked(async move {
                    let outcome = handler.perform(payload, requests).await;
                    actor.push(CallInput::ImplementationReady(
                        ImplementationOutcome::Response(outcome),
                    ));
                });
                Ok(Flow::Continue)
            }
            UpstreamEvent::Data(payload) => {
                self.consumer()?.data(ctx, &payload).await?;
                Ok(Flow::Continue)
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
                log_peer_warning(ctx, &payload);
                Ok(Flow::Continue)
            }
            UpstreamEvent::Cancel => {
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "{} is illegal for a client-streaming call",
                other.wire_name()
            ))),
        }
    }
}

impl CallStateMachine for ColdUpstreamCallee {
    fn kind(&self) -> &'static str {
        "client-stream-callee"
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
            CallInput::ImplementationReady(ImplementationOutcome::Response(Ok(payload))) => {
                ctx.send_event(RpcEvent::Downstream(DownstreamEvent::Response(payload)))
                    .await?;
                self.response_sent = true;
                Ok(self.flow())
            }
            CallInput::ImplementationReady(ImplementationOutcome::Response(Err(error))) => {
                Err(error)
            }
            CallInput::ImplementationReady(ImplementationOutcome::Stream(_)) => {
                Err(RpcError::InternalServer(
                    "client-streaming implementation produced a stream".into(),
                ))
            }
            CallInput::Cancelled => {
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }
}

/// Caller half. Holds the application's request stream until the callee asks
/// for it, forwards it once started, and abandons it if the callee never asks
/// within the start window after the response arrived.
pub(crate) struct ColdUpstreamCaller {
    response: Option<oneshot::Sender<Result<SerializedPayload, RpcError>>>,
    outbound: Option<PayloadStream>,
    window: Option<AbortHandle>,
    job: Option<AbortHandle>,
    response_seen: bool,
    up_closed: bool,
}

impl ColdUpstreamCaller {
    pub(crate) fn new(
        outbound: PayloadStream,
        response: oneshot::Sender<Result<SerializedPayload, RpcError>>,
    ) -> Self {
        Self {
            response: Some(response),
            outbound: Some(outbound),
            window: None,
            job: None,
            response_seen: false,
            up_closed: false,
        }
    }

    fn resolve(&mut self, result: Result<SerializedPayload, RpcError>) {
        if let Some(response) = self.response.take() {
            let _ = response.send(result);
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
        if self.response_seen && self.up_closed {
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
            DownstreamEvent::Response(payload) => {
                self.resolve(Ok(payload));
                self.response_seen = true;
                if !self.up_closed && self.job.is_none() && self.window.is_none() {
                    // The callee has answered but not started the stream.
                    // Give it one window before abandoning the stream.
                    self.window = Some(ctx.arm_start_window(StreamDirection::Up));
                }
                Ok(self.flow())
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
            DownstreamEvent::Error(payload) => {
                self.resolve(Err(decoded_error(&payload)));
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            DownstreamEvent::Warning(payload) => {
                log_peer_warning(ctx, &payload);
                Ok(Flow::Continue)
            }
            other => {
                let violation = format!(
                    "{} is illegal for a client-streaming call",
                    other.wire_name()
                );
                self.resolve(Err(RpcError::ProtocolViolation(violation.clone())));
                Err(RpcError::ProtocolViolation(violation))
            }
        }
    }
}

impl CallStateMachine for ColdUpstreamCaller {
    fn kind(&self) -> &'static str {
        "client-stream-caller"
    }

    async fn handle(&mut self, input: CallInput, ctx: &CallContext) -> Result<Flow, RpcError> {
        match input {
            CallInput::Frame(frame) => self.frame(frame, ctx).await,
            CallInput::ForwardingDone(StreamDirection::Up) => {
                // The elements are all sent; the direction closes once the
                // callee acknowledges with StreamOperation.Close.
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
                ctx.send_error(&RpcError::StreamTimeout).await?;
                Ok(self.flow())
            }
            CallInput::Cancelled => {
                self.resolve(Err(RpcError::Cancelled));
                ctx.send_cancel().await;
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }
}
