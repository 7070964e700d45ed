//! Events that fan out or enqueue work without answering the caller.

use serde_json::json;

use super::*;
use crate::bridge::QueueItem;
use crate::gateway::events::{OpenChatParams, ToggleReadParams};

pub(super) fn handle_toggle_read(params: ToggleReadParams, ctx: &GatewayContext) -> HandlerResult {
    let chat_guid = require(&params.chat_guid, "No chat GUID provided!")?;
    let status = match params.status {
        Some(status) if !status.is_null() => status,
        _ => return Err(client_error("No chat status provided!")),
    };

    let reached = ctx.connections.broadcast(
        "chat-read-status-changed",
        &json!({ "chatGuid": chat_guid, "status": status }),
    );
    tracing::debug!(target: "gateway", chat = chat_guid, reached, "read status broadcast");
    Ok(Dispatch::Silent)
}

pub(super) async fn handle_open_chat(params: OpenChatParams, ctx: &GatewayContext) -> HandlerResult {
    let chat_guid = require(&params.chat_guid, "No chat GUID provided!")?;
    ctx.collaborators
        .queue
        .enqueue(QueueItem::OpenChat {
            chat_guid: chat_guid.to_string(),
        })
        .await
        .map_err(bridge_error)?;
    Ok(Dispatch::Silent)
}
