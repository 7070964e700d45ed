//! Chat and message queries.

use super::*;
use crate::bridge::{MessageQuery, SortOrder};
use crate::gateway::events::{ChatIdentifierParams, GetChatParams, GetChatsParams, MessageWindowParams};

const DEFAULT_MESSAGE_LIMIT: u64 = 100;

pub(super) async fn handle_get_chats(params: GetChatsParams, ctx: &GatewayContext) -> HandlerResult {
    let query = ChatQuery {
        chat_guid: None,
        with_participants: params.with_participants.unwrap_or(true),
        with_archived: params.with_archived.unwrap_or(false),
        with_sms: params.with_sms.unwrap_or(false),
        limit: params.limit,
        offset: params.offset.unwrap_or(0),
    };
    let chats = ctx
        .collaborators
        .query
        .get_chats(query)
        .await
        .map_err(bridge_error)?;
    Ok(Dispatch::ok("chats", to_data(&chats)?))
}

pub(super) async fn handle_get_chat(params: GetChatParams, ctx: &GatewayContext) -> HandlerResult {
    let guid = require(&params.chat_guid, "No chat GUID provided")?;
    let query = ChatQuery {
        with_participants: params.with_participants.unwrap_or(true),
        ..ChatQuery::by_guid(guid)
    };
    let chats = ctx
        .collaborators
        .query
        .get_chats(query)
        .await
        .map_err(bridge_error)?;
    match chats.first() {
        Some(chat) => Ok(Dispatch::ok("chat", to_data(chat)?)),
        None => Err(client_error("Chat does not exist!")),
    }
}

pub(super) async fn handle_chat_messages(
    params: MessageWindowParams,
    ctx: &GatewayContext,
) -> HandlerResult {
    let identifier = require(&params.identifier, "No chat identifier provided")?;
    if find_chat(ctx, identifier).await?.is_none() {
        return Err(client_error("Chat does not exist"));
    }

    let query = MessageQuery {
        chat_guid: Some(identifier.to_string()),
        offset: params.offset.unwrap_or(0),
        limit: params.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT),
        after: params.after,
        before: params.before,
        with_chats: params.with_chats.unwrap_or(false),
        with_attachments: params.with_attachments.unwrap_or(true),
        with_handle: params.with_handle.unwrap_or(true),
        with_sms: params.with_sms.unwrap_or(false),
        with_blurhash: params.with_blurhash.unwrap_or(false),
        sort: params.sort.unwrap_or(SortOrder::Desc),
        where_clauses: params.where_clauses.unwrap_or_default(),
    };
    let messages = ctx
        .collaborators
        .query
        .get_messages(query)
        .await
        .map_err(bridge_error)?;
    Ok(Dispatch::ok("chat-messages", to_data(&messages)?))
}

/// Messages across chats. Needs a lower time bound or a limit.
pub(super) async fn handle_messages(params: MessageWindowParams, ctx: &GatewayContext) -> HandlerResult {
    if params.after.is_none() && params.limit.is_none() {
        return Err(client_error("No `after` date or `limit` provided!"));
    }

    let chat_guid = params.chat_guid.filter(|g| !g.is_empty());
    if let Some(guid) = &chat_guid {
        if find_chat(ctx, guid).await?.is_none() {
            return Err(client_error("Chat does not exist"));
        }
    }

    let query = MessageQuery {
        chat_guid,
        offset: params.offset.unwrap_or(0),
        limit: params.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT),
        after: params.after,
        before: params.before,
        with_chats: params.with_chats.unwrap_or(true),
        with_attachments: params.with_attachments.unwrap_or(true),
        with_handle: params.with_handle.unwrap_or(true),
        with_sms: params.with_sms.unwrap_or(false),
        with_blurhash: params.with_blurhash.unwrap_or(true),
        sort: params.sort.unwrap_or(SortOrder::Asc),
        where_clauses: params.where_clauses.unwrap_or_default(),
    };
    let messages = ctx
        .collaborators
        .query
        .get_messages(query)
        .await
        .map_err(bridge_error)?;
    Ok(Dispatch::ok("messages", to_data(&messages)?))
}

pub(super) async fn handle_last_message(
    params: ChatIdentifierParams,
    ctx: &GatewayContext,
) -> HandlerResult {
    let identifier = require(&params.identifier, "No chat identifier provided")?;
    if find_chat(ctx, identifier).await?.is_none() {
        return Err(client_error("Chat does not exist"));
    }

    let query = MessageQuery {
        chat_guid: Some(identifier.to_string()),
        limit: 1,
        sort: SortOrder::Desc,
        ..MessageQuery::default()
    };
    let messages = ctx
        .collaborators
        .query
        .get_messages(query)
        .await
        .map_err(bridge_error)?;
    match messages.first() {
        Some(message) => Ok(Dispatch::ok("last-chat-message", to_data(message)?)),
        None => Ok(Dispatch::no_data("last-chat-message")),
    }
}

pub(super) async fn handle_participants(
    params: ChatIdentifierParams,
    ctx: &GatewayContext,
) -> HandlerResult {
    let identifier = require(&params.identifier, "No chat identifier provided")?;
    match find_chat(ctx, identifier).await? {
        Some(chat) => Ok(Dispatch::ok("participants", to_data(&chat.participants)?)),
        None => Err(client_error("Chat does not exist")),
    }
}
