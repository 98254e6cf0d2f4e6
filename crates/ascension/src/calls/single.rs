//! Unary calls: one request payload, one `Response` frame.

use std::sync::Arc;

use tokio::sync::oneshot;

use ascension_core::{
    DownstreamEvent, RpcError, RpcEvent, RpcFrame, SerializedPayload, UpstreamEvent,
};
use ascension_registry::SingleCallHandler;

use crate::pending::{CallContext, CallInput, CallStateMachine, Flow, ImplementationOutcome};

use super::{decoded_error, log_peer_warning};

pub(crate) struct SingleCallCallee {
    handler: Arc<dyn SingleCallHandler>,
    invoked: bool,
}

impl SingleCallCallee {
    pub(crate) fn new(handler: Arc<dyn SingleCallHandler>) -> Self {
        Self {
            handler,
            invoked: false,
        }
    }

    async fn frame(&mut self, frame: RpcFrame, ctx: &CallContext) -> Result<Flow, RpcError> {
        let RpcEvent::Upstream(event) = frame.event else {
            return Err(RpcError::ProtocolViolation(
                "downstream event received by callee".into(),
            ));
        };
        match event {
            UpstreamEvent::Open { payload, .. } if !self.invoked => {
                self.invoked = true;
                let handler = Arc::clone(&self.handler);
                let actor = ctx.clone();
                ctx.spawn_tracked(async move {
                    let outcome = handler.perform(payload).await;
                    actor.push(CallInput::ImplementationReady(
                        ImplementationOutcome::Response(outcome),
                    ));
                });
                Ok(Flow::Continue)
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
                tracing::debug!(reference = ctx.reference(), "caller cancelled the call");
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "{} is illegal for a unary call",
                other.wire_name()
            ))),
        }
    }
}

impl CallStateMachine for SingleCallCallee {
    fn kind(&self) -> &'static str {
        "single-callee"
    }

    async fn handle(&mut self, input: CallInput, ctx: &CallContext) -> Result<Flow, RpcError> {
        match input {
            CallInput::Frame(frame) => self.frame(frame, ctx).await,
            CallInput::ImplementationReady(ImplementationOutcome::Response(Ok(payload))) => {
                ctx.send_event(RpcEvent::Downstream(DownstreamEvent::Response(payload)))
                    .await?;
                Ok(Flow::Finished)
            }
            CallInput::ImplementationReady(ImplementationOutcome::Response(Err(error))) => {
                Err(error)
            }
            CallInput::ImplementationReady(ImplementationOutcome::Stream(_)) => Err(
                RpcError::InternalServer("unary implementation produced a stream".into()),
            ),
            CallInput::Cancelled => {
                ctx.abort_children();
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }
}

pub(crate) struct SingleCallCaller {
    response: Option<oneshot::Sender<Result<SerializedPayload, RpcError>>>,
}

impl SingleCallCaller {
    pub(crate) fn new(response: oneshot::Sender<Result<SerializedPayload, RpcError>>) -> Self {
        Self {
            response: Some(response),
        }
    }

    fn resolve(&mut self, result: Result<SerializedPayload, RpcError>) {
        if let Some(response) = self.response.take() {
            let _ = response.send(result);
        }
    }
}

impl CallStateMachine for SingleCallCaller {
    fn kind(&self) -> &'static str {
        "single-caller"
    }

    async fn handle(&mut self, input: CallInput, ctx: &CallContext) -> Result<Flow, RpcError> {
        let frame = match input {
            CallInput::Frame(frame) => frame,
            CallInput::Cancelled => {
                self.resolve(Err(RpcError::Cancelled));
                ctx.send_cancel().await;
                ctx.abort_children();
                return Ok(Flow::Finished);
            }
            _ => return Ok(Flow::Continue),
        };
        let RpcEvent::Downstream(event) = frame.event else {
            return Err(RpcError::ProtocolViolation(
                "upstream event received by caller".into(),
            ));
        };
        match event {
            DownstreamEvent::Response(payload) => {
                self.resolve(Ok(payload));
                Ok(Flow::Finished)
            }
            DownstreamEvent::Error(payload) => {
                self.resolve(Err(decoded_error(&payload)));
                Ok(Flow::Finished)
            }
            DownstreamEvent::Warning(payload) => {
                log_peer_warning(ctx, &payload);
                Ok(Flow::Continue)
            }
            other => {
                let violation = format!("{} is illegal for a unary call", other.wire_name());
                self.resolve(Err(RpcError::ProtocolViolation(violation.clone())));
                Err(RpcError::ProtocolViolation(violation))
            }
        }
    }
}
