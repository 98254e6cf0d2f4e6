//! Server-streaming calls: one request payload, a cold server-to-client
//! stream of responses.
//!
//! The stream the caller receives is genuinely cold. The caller sends
//! `StreamOperation.Start` only when something polls it, and the callee does
//! no forwarding work until that frame arrives.

use std::sync::Arc;

use tokio::sync::mpsc;

use ascension_core::{
    DownstreamEvent, RpcError, RpcEvent, RpcFrame, SerializedPayload, UpstreamEvent,
};
use ascension_registry::ServerStreamHandler;

use crate::pending::{
    CallContext, CallInput, CallStateMachine, Flow, ImplementationOutcome, StreamDirection,
};

use super::{decoded_error, log_peer_warning, ConsumerHalf, ProducerHalf};

pub(crate) struct ColdDownstreamCallee {
    handler: Arc<dyn ServerStreamHandler>,
    producer: ProducerHalf,
}

impl ColdDownstreamCallee {
    pub(crate) fn new(handler: Arc<dyn ServerStreamHandler>) -> Self {
        Self {
            handler,
            producer: ProducerHalf::new(),
        }
    }

    async fn frame(&mut self, frame: RpcFrame, ctx: &CallContext) -> Result<Flow, RpcError> {
        let RpcEvent::Upstream(event) = frame.event else {
            return Err(RpcError::ProtocolViolation(
                "downstream event received by callee".into(),
            ));
        };
        match event {
            UpstreamEvent::Open { payload, .. } if self.producer.is_idle() => {
                self.producer.begin_invoking();
                let handler = Arc::clone(&self.handler);
                let actor = ctx.clone();
                ctx.spawn_tracked(async move {
                    let outcome = handler.perform(payload).await;
                    actor.push(CallInput::ImplementationReady(
                        ImplementationOutcome::Stream(outcome),
                    ));
                });
                Ok(Flow::Continue)
            }
            UpstreamEvent::StreamOperationStart => {
                self.producer.start_frame(ctx).await;
                Ok(Flow::Continue)
            }
            UpstreamEvent::StreamOperationClose => {
                self.producer.close_frame();
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            UpstreamEvent::Error(payload) => {
                tracing::debug!(
                    reference = ctx.reference(),
                    error = %decoded_error(&payload),
                    "caller failed the call"
                );
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
                "{} is illegal for a server-streaming call",
                other.wire_name()
            ))),
        }
    }
}

impl CallStateMachine for ColdDownstreamCallee {
    fn kind(&self) -> &'static str {
        "server-stream-callee"
    }

    async fn handle(&mut self, input: CallInput, ctx: &CallContext) -> Result<Flow, RpcError> {
        match input {
            CallInput::Frame(frame) => self.frame(frame, ctx).await,
            CallInput::ImplementationReady(ImplementationOutcome::Stream(Ok(stream))) => {
                self.producer.ready(ctx, stream).await?;
                Ok(Flow::Continue)
            }
            CallInput::ImplementationReady(ImplementationOutcome::Stream(Err(error))) => {
                // Never-opened stream: the failure replaces Opened entirely.
                Err(error)
            }
            CallInput::ImplementationReady(ImplementationOutcome::Response(_)) => {
                Err(RpcError::InternalServer(
                    "server-streaming implementation produced a unary response".into(),
                ))
            }
            CallInput::StartWindowElapsed(StreamDirection::Down) => {
                self.producer.window_elapsed(ctx).await?;
                if self.producer.is_closed() {
                    Ok(Flow::Finished)
                } else {
                    Ok(Flow::Continue)
                }
            }
            CallInput::ForwardingDone(StreamDirection::Down) => {
                // All elements sent; hold the call open until the caller
                // acknowledges with StreamOperation.Close.
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

/// Caller half: owns the channel behind the cold stream handed to the
/// application and answers its start/stop signals with the handshake frames.
pub(crate) struct ColdDownstreamCaller {
    consumer: ConsumerHalf,
}

impl ColdDownstreamCaller {
    pub(crate) fn new(elements: mpsc::UnboundedSender<Result<SerializedPayload, RpcError>>) -> Self {
        Self {
            consumer: ConsumerHalf::new(elements, StreamDirection::Down),
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
            DownstreamEvent::Timeout(millis) => {
                tracing::warn!(
                    reference = ctx.reference(),
                    millis,
                    "callee timed out waiting for the stream to start"
                );
                self.consumer.abandoned(RpcError::StreamTimeout);
                Ok(Flow::Finished)
            }
            DownstreamEvent::Error(payload) => {
                self.consumer.abandoned(decoded_error(&payload));
                Ok(Flow::Finished)
            }
            DownstreamEvent::Warning(payload) => {
                log_peer_warning(ctx, &payload);
                Ok(Flow::Continue)
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "{} is illegal for a server-streaming call",
                other.wire_name()
            ))),
        }
    }
}

impl CallStateMachine for ColdDownstreamCaller {
    fn kind(&self) -> &'static str {
        "server-stream-caller"
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
                Ok(Flow::Finished)
            }
            CallInput::Cancelled => {
                ctx.send_cancel().await;
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }
}
