//! Inbound event routing.
//!
//! Each event runs in its own task so a slow handler never blocks the
//! connection, and a panicking one is contained: the caller still gets a
//! server-error envelope.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::cipher::PayloadCipher;
use super::envelope::{respond, Reply, ResponseKind, UNKNOWN_ERROR};
use super::events::{EventParseError, GatewayEvent};
use super::handlers::{self, Dispatch, HandlerResult, ERROR_CHANNEL};
use super::GatewayContext;

/// Parse, run and answer one event.
pub async fn route(ctx: Arc<GatewayContext>, name: String, data: Value, reply: Arc<dyn Reply>) {
    let event = match GatewayEvent::parse(&name, data) {
        Ok(event) => event,
        Err(EventParseError::Unknown(event)) => {
            tracing::debug!(target: "gateway", event = %event, "unknown event");
            // Only a caller waiting on an ack would notice silence.
            if reply.is_direct() {
                respond(
                    reply.as_ref(),
                    &ctx.cipher,
                    ResponseKind::ClientError,
                    ERROR_CHANNEL,
                    Value::Null,
                    Some(&format!("Unknown event: {}", event)),
                );
            }
            return;
        }
        Err(err) => {
            respond(
                reply.as_ref(),
                &ctx.cipher,
                ResponseKind::ClientError,
                ERROR_CHANNEL,
                Value::Null,
                Some(&err.to_string()),
            );
            return;
        }
    };

    let event_name = event.name();
    tracing::debug!(target: "gateway", event = event_name, "dispatching");
    let task_ctx = ctx.clone();
    answer(
        reply.as_ref(),
        &ctx.cipher,
        event_name,
        async move { handlers::handle_event(event, &task_ctx).await },
    )
    .await;
}

/// Run `work` in its own task and deliver whatever it produced.
async fn answer<F>(reply: &dyn Reply, cipher: &PayloadCipher, event_name: &str, work: F)
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    let outcome = tokio::spawn(work).await;
    if let Err(e) = cipher.prepare().await {
        tracing::warn!(target: "gateway", error = %e, "failed to derive payload key ahead of time");
    }
    match outcome {
        Ok(Ok(Dispatch::Reply {
            channel,
            kind,
            data,
            message,
        })) => respond(reply, cipher, kind, channel, data, message.as_deref()),
        Ok(Ok(Dispatch::Silent)) => {}
        Ok(Err(shape)) => respond(
            reply,
            cipher,
            shape.kind,
            shape.channel,
            Value::Null,
            Some(&shape.message),
        ),
        Err(join_err) => {
            tracing::error!(
                target: "gateway",
                event = event_name,
                error = %join_err,
                "handler failed"
            );
            respond(
                reply,
                cipher,
                ResponseKind::ServerError,
                ERROR_CHANNEL,
                Value::Null,
                Some(UNKNOWN_ERROR),
            );
        }
    }
}
