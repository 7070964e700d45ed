//! Chat creation and membership.

use super::*;
use crate::gateway::events::{ParticipantParams, Participants, RenameGroupParams, StartChatParams};
use crate::gateway::fallback::{first_success, Strategy};

const DEFAULT_SERVICE: &str = "iMessage";
const CREATE_FAILED: &str = "Failed to create chat! Check server logs!";
const NOT_CONFIGURED: &str =
    "iMessage/iCloud is not configured on your macOS device! Configure it, then rescan your QRCode";

pub(super) async fn handle_start_chat(params: StartChatParams, ctx: &GatewayContext) -> HandlerResult {
    let participants = match params.participants {
        None => return Err(client_error("No participants specified")),
        Some(Participants::Many(list)) => list,
        Some(Participants::One(single)) if single.trim().is_empty() => {
            return Err(client_error("No participants specified"));
        }
        Some(Participants::One(single)) => vec![single],
        Some(Participants::Other(_)) => {
            return Err(client_error("Participant list must be an array"));
        }
    };
    if participants.is_empty() {
        return Err(client_error("No participants specified"));
    }

    let service = params.service.as_deref().unwrap_or(DEFAULT_SERVICE);
    let message = params.message.as_deref();
    let temp_guid = params.temp_guid.as_deref();
    let actions = ctx.collaborators.actions.as_ref();

    let mut strategies = vec![Strategy::new("universal", || {
        actions.create_universal_chat(&participants, service, message, temp_guid)
    })];
    if let (1, Some(text), Some(temp)) = (
        participants.len(),
        message.filter(|m| !m.is_empty()),
        temp_guid.filter(|t| !t.is_empty()),
    ) {
        let participant = participants[0].as_str();
        strategies.push(Strategy::new("single-service", move || {
            actions.create_single_chat(participant, service, text, temp)
        }));
    }

    let chat_guid = match first_success(strategies).await {
        Some(Ok(guid)) => guid,
        Some(Err(e)) => return Err(client_error(e.to_string())),
        None => return Err(client_error(CREATE_FAILED)),
    };
    if chat_guid.is_empty() {
        return Err(client_error(CREATE_FAILED));
    }

    let lookup = ctx
        .collaborators
        .query
        .get_chats(ChatQuery::by_guid(&chat_guid))
        .await;
    match lookup {
        Ok(chats) => match chats.into_iter().next() {
            Some(chat) => Ok(Dispatch::ok("chat-started", to_data(&chat)?)),
            None => Err(server_error("start-chat-failed", "Chat does not exist")),
        },
        Err(e) => {
            let text = e.to_string();
            let message = if text.to_lowercase().contains("rowid") {
                NOT_CONFIGURED.to_string()
            } else {
                text
            };
            Err(server_error("start-chat-failed", message))
        }
    }
}

pub(super) async fn handle_rename(params: RenameGroupParams, ctx: &GatewayContext) -> HandlerResult {
    let identifier = require(&params.identifier, "No chat identifier provided")?;
    let new_name = require(&params.new_name, "No new group name provided")?;

    ctx.collaborators
        .actions
        .rename_group_chat(identifier, new_name)
        .await
        .map_err(|e| server_error("rename-group-error", e.to_string()))?;

    match find_chat(ctx, identifier).await {
        Ok(Some(chat)) => Ok(Dispatch::ok("group-renamed", to_data(&chat)?)),
        Ok(None) => Err(server_error("rename-group-error", "Chat does not exist")),
        Err(shape) => Err(server_error("rename-group-error", shape.message)),
    }
}

#[derive(Clone, Copy)]
enum Membership {
    Add,
    Remove,
}

impl Membership {
    fn error_channel(self) -> &'static str {
        match self {
            Membership::Add => "add-participant-error",
            Membership::Remove => "remove-participant-error",
        }
    }

    fn success_channel(self) -> &'static str {
        match self {
            Membership::Add => "participant-added",
            Membership::Remove => "participant-removed",
        }
    }
}

async fn change_membership(
    params: ParticipantParams,
    ctx: &GatewayContext,
    op: Membership,
) -> HandlerResult {
    let identifier = require(&params.identifier, "No chat identifier provided")?;
    let address = require(&params.address, "No participant address specified")?;

    let actions = &ctx.collaborators.actions;
    let result = match op {
        Membership::Add => actions.add_participant(identifier, address).await,
        Membership::Remove => actions.remove_participant(identifier, address).await,
    }
    .map_err(|e| server_error(op.error_channel(), e.to_string()))?;
    if result.trim() != "success" {
        return Err(client_error_on(op.error_channel(), result));
    }

    match find_chat(ctx, identifier).await {
        Ok(Some(chat)) => Ok(Dispatch::ok(op.success_channel(), to_data(&chat)?)),
        Ok(None) => Err(server_error(op.error_channel(), "Chat does not exist")),
        Err(shape) => Err(server_error(op.error_channel(), shape.message)),
    }
}

pub(super) async fn handle_add(params: ParticipantParams, ctx: &GatewayContext) -> HandlerResult {
    change_membership(params, ctx, Membership::Add).await
}

pub(super) async fn handle_remove(params: ParticipantParams, ctx: &GatewayContext) -> HandlerResult {
    change_membership(params, ctx, Membership::Remove).await
}
