//! Outgoing messages, chunked attachment uploads and reactions.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;

use super::*;
use crate::bridge::{OutgoingMessage, QueueItem, QueueService, ReactionMatchToken, Tapback};
use crate::gateway::chunks::{
    normalize_offset, AssembledTransfer, ChunkOutcome, CompletionSink, TransferSidecar,
};
use crate::gateway::events::{SendMessageChunkParams, SendMessageParams, SendReactionParams};

fn missing_group_chat(guid: &str) -> ErrorShape {
    client_error(format!("Chat with GUID, \"{}\" does not exist", guid))
}

/// Group chats must already exist; one-to-one guids are created on send.
async fn ensure_group_exists(ctx: &GatewayContext, guid: &str) -> Result<(), ErrorShape> {
    if Chat::is_group_guid(guid) && find_chat(ctx, guid).await?.is_none() {
        return Err(missing_group_chat(guid));
    }
    Ok(())
}

fn decode_base64(data: &str) -> Result<Vec<u8>, ErrorShape> {
    STANDARD
        .decode(data)
        .map_err(|_| client_error("Invalid attachment data"))
}

pub(super) async fn handle_send(params: SendMessageParams, ctx: &GatewayContext) -> HandlerResult {
    let guid = require(&params.guid, "No chat GUID provided")?;
    ensure_group_exists(ctx, guid).await?;

    let temp_guid = params.temp_guid.filter(|t| !t.is_empty());
    let text = params.message.filter(|m| !m.is_empty());
    if temp_guid.is_some() != text.is_some() {
        return Err(client_error("No temporary GUID provided with message"));
    }

    let attachment = match params.attachment.as_deref().filter(|a| !a.is_empty()) {
        Some(data) => {
            let named = params.attachment_name.as_deref().is_some_and(|n| !n.is_empty());
            let identified = params.attachment_guid.as_deref().is_some_and(|g| !g.is_empty());
            if !named || !identified {
                return Err(client_error("No attachment name or GUID provided"));
            }
            Some(decode_base64(data)?)
        }
        None => None,
    };

    let outgoing = OutgoingMessage {
        chat_guid: guid.to_string(),
        temp_guid,
        text,
        attachment_guid: params.attachment_guid,
        attachment_name: params.attachment_name,
        attachment,
    };
    ctx.collaborators
        .actions
        .send_message(outgoing)
        .await
        .map_err(|e| server_error("send-message-error", e.to_string()))?;
    Ok(Dispatch::ok("message-sent", Value::Null))
}

/// Hands a fully assembled upload to the send queue.
struct QueueSink<'a> {
    queue: &'a dyn QueueService,
    temp_guid: &'a str,
    chat_guid: &'a str,
    message: &'a str,
    attachment_guid: &'a str,
}

#[async_trait]
impl CompletionSink for QueueSink<'_> {
    async fn complete(&self, transfer: AssembledTransfer) -> Result<(), BridgeError> {
        self.queue
            .enqueue(QueueItem::SendAttachment {
                temp_guid: self.temp_guid.to_string(),
                chat_guid: self.chat_guid.to_string(),
                message: self.message.to_string(),
                attachment_guid: Some(self.attachment_guid.to_string()),
                attachment_name: Some(transfer.transfer_name),
                data: Some(transfer.bytes),
            })
            .await
    }
}

/// One piece of a message whose attachment arrives in pieces. The message
/// is queued when the last piece lands; earlier pieces are acknowledged
/// with `message-chunk-saved`.
pub(super) async fn handle_send_chunk(
    params: SendMessageChunkParams,
    ctx: &GatewayContext,
) -> HandlerResult {
    let guid = require(&params.guid, "No chat GUID provided")?;
    let temp_guid = require(&params.temp_guid, "No temporary GUID provided")?;
    let is_final = !params.has_more.unwrap_or(false);
    let message = params.message.as_deref().unwrap_or("");

    if is_final {
        ensure_group_exists(ctx, guid).await?;
    }

    let Some(attachment_guid) = params.attachment_guid.as_deref().filter(|g| !g.is_empty()) else {
        if !is_final {
            return Ok(Dispatch::ok("message-chunk-saved", Value::Null));
        }
        ctx.collaborators
            .queue
            .enqueue(QueueItem::SendAttachment {
                temp_guid: temp_guid.to_string(),
                chat_guid: guid.to_string(),
                message: message.to_string(),
                attachment_guid: None,
                attachment_name: None,
                data: None,
            })
            .await
            .map_err(|e| server_error("send-message-error", e.to_string()))?;
        return Ok(Dispatch::ok("message-sent", Value::Null));
    };

    let bytes = match params.attachment_data.as_deref() {
        Some(data) => decode_base64(data)?,
        None => Vec::new(),
    };
    let offset = normalize_offset(&params.attachment_chunk_start);
    let sidecar = TransferSidecar {
        transfer_name: params.attachment_name.clone(),
        correlation_id: Some(temp_guid.to_string()),
        carries_message: true,
    };
    let sink = QueueSink {
        queue: ctx.collaborators.queue.as_ref(),
        temp_guid,
        chat_guid: guid,
        message,
        attachment_guid,
    };

    let outcome = ctx
        .chunks
        .ingest(
            attachment_guid,
            offset,
            &bytes,
            params.has_more.map(|more| !more),
            &sidecar,
            &sink,
        )
        .await;
    match outcome {
        Ok(ChunkOutcome::Saved) => Ok(Dispatch::ok("message-chunk-saved", Value::Null)),
        Ok(ChunkOutcome::Completed) => Ok(Dispatch::ok("message-sent", Value::Null)),
        Err(e) if e.is_client_error() => Err(client_error(e.to_string())),
        Err(e) => Err(server_error("send-message-error", e.to_string())),
    }
}

pub(super) async fn handle_reaction(params: SendReactionParams, ctx: &GatewayContext) -> HandlerResult {
    let chat_guid = require(&params.chat_guid, "No chat GUID provided!")?;
    let message = params
        .message
        .ok_or_else(|| client_error("No message provided!"))?;
    let action_message = params
        .action_message
        .ok_or_else(|| client_error("No action message provided!"))?;
    let tapback: Tapback = params
        .tapback
        .as_deref()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| client_error("Invalid tapback descriptor provided!"))?;

    let token = ReactionMatchToken {
        temp_guid: message.guid.unwrap_or_default(),
        chat_guid: chat_guid.to_string(),
        date_created: Utc::now(),
        text: message.text.unwrap_or_default(),
    };
    ctx.collaborators
        .queue
        .save_reaction_match(token)
        .await
        .map_err(|e| server_error("send-tapback-error", e.to_string()))?;

    ctx.collaborators
        .actions
        .toggle_tapback(
            chat_guid,
            action_message.text.as_deref().unwrap_or(""),
            tapback,
        )
        .await
        .map_err(|e| server_error("send-tapback-error", e.to_string()))?;
    Ok(Dispatch::no_data("tapback-sent"))
}
