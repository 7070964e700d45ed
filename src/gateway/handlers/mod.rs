//! Event handlers.
//!
//! A handler takes its typed parameters and the shared context and returns
//! a [`Dispatch`] describing the single reply to send, or an [`ErrorShape`].
//! Handlers never touch the connection; the router owns delivery.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::envelope::ResponseKind;
use super::events::GatewayEvent;
use super::GatewayContext;
use crate::bridge::{BridgeError, Chat, ChatQuery};

mod attachments;
mod chats;
mod contacts;
mod messages;
mod notifications;
mod participants;
mod server;

/// Channel used for client errors with no dedicated error channel.
pub const ERROR_CHANNEL: &str = "error";

/// What a successful handler wants sent back.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Reply {
        channel: &'static str,
        kind: ResponseKind,
        data: Value,
        message: Option<String>,
    },
    /// Nothing goes back to the caller.
    Silent,
}

impl Dispatch {
    pub fn ok(channel: &'static str, data: Value) -> Self {
        Dispatch::Reply {
            channel,
            kind: ResponseKind::Success,
            data,
            message: None,
        }
    }

    pub fn ok_with_message(channel: &'static str, data: Value, message: &str) -> Self {
        Dispatch::Reply {
            channel,
            kind: ResponseKind::Success,
            data,
            message: Some(message.to_string()),
        }
    }

    pub fn no_data(channel: &'static str) -> Self {
        Dispatch::Reply {
            channel,
            kind: ResponseKind::NoData,
            data: Value::Null,
            message: None,
        }
    }
}

/// A failed handler: the error kind, the channel it goes to and the text.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorShape {
    pub kind: ResponseKind,
    pub channel: &'static str,
    pub message: String,
}

pub type HandlerResult = Result<Dispatch, ErrorShape>;

pub fn client_error(message: impl Into<String>) -> ErrorShape {
    client_error_on(ERROR_CHANNEL, message)
}

pub fn client_error_on(channel: &'static str, message: impl Into<String>) -> ErrorShape {
    ErrorShape {
        kind: ResponseKind::ClientError,
        channel,
        message: message.into(),
    }
}

pub fn server_error(channel: &'static str, message: impl Into<String>) -> ErrorShape {
    ErrorShape {
        kind: ResponseKind::ServerError,
        channel,
        message: message.into(),
    }
}

/// Collaborator failure with no dedicated error channel.
fn bridge_error(err: BridgeError) -> ErrorShape {
    server_error(ERROR_CHANNEL, err.to_string())
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, ErrorShape> {
    serde_json::to_value(value).map_err(|e| server_error(ERROR_CHANNEL, e.to_string()))
}

/// A required, non-empty string parameter.
fn require<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str, ErrorShape> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| client_error(message))
}

/// Look a chat up by guid, including SMS chats.
async fn find_chat(ctx: &GatewayContext, guid: &str) -> Result<Option<Chat>, ErrorShape> {
    let chats = ctx
        .collaborators
        .query
        .get_chats(ChatQuery::by_guid(guid))
        .await
        .map_err(bridge_error)?;
    Ok(chats.into_iter().next())
}

/// Run the handler for `event`.
pub async fn handle_event(event: GatewayEvent, ctx: &Arc<GatewayContext>) -> HandlerResult {
    use GatewayEvent as E;
    match event {
        E::GetServerMetadata => server::handle_metadata().await,
        E::GetServerConfig => server::handle_config(ctx),
        E::AddFcmDevice(p) => server::handle_add_device(p, ctx).await,
        E::GetFcmClient => server::handle_fcm_client(ctx).await,
        E::GetLogs(p) => server::handle_logs(p),
        E::GetChats(p) => chats::handle_get_chats(p, ctx).await,
        E::GetChat(p) => chats::handle_get_chat(p, ctx).await,
        E::GetChatMessages(p) => chats::handle_chat_messages(p, ctx).await,
        E::GetMessages(p) => chats::handle_messages(p, ctx).await,
        E::GetLastChatMessage(p) => chats::handle_last_message(p, ctx).await,
        E::GetParticipants(p) => chats::handle_participants(p, ctx).await,
        E::GetAttachment(p) => attachments::handle_get_attachment(p, ctx).await,
        E::GetAttachmentChunk(p) => attachments::handle_attachment_chunk(p, ctx).await,
        E::SendMessage(p) => messages::handle_send(p, ctx).await,
        E::SendMessageChunk(p) => messages::handle_send_chunk(p, ctx).await,
        E::SendReaction(p) => messages::handle_reaction(p, ctx).await,
        E::StartChat(p) => participants::handle_start_chat(p, ctx).await,
        E::RenameGroup(p) => participants::handle_rename(p, ctx).await,
        E::AddParticipant(p) => participants::handle_add(p, ctx).await,
        E::RemoveParticipant(p) => participants::handle_remove(p, ctx).await,
        E::GetContactsFromDb(handles) => contacts::handle_from_db(handles, ctx).await,
        E::GetContactsFromVcf => contacts::handle_from_vcf(ctx).await,
        E::ToggleChatReadStatus(p) => notifications::handle_toggle_read(p, ctx),
        E::OpenChat(p) => notifications::handle_open_chat(p, ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_rejects_empty() {
        assert_eq!(require(&Some("a".into()), "missing").unwrap(), "a");
        let err = require(&Some(String::new()), "missing").unwrap_err();
        assert_eq!(err, client_error("missing"));
        assert_eq!(err.channel, ERROR_CHANNEL);
        assert!(require(&None, "missing").is_err());
    }

    #[test]
    fn test_no_data_has_null_payload() {
        match Dispatch::no_data("tapback-sent") {
            Dispatch::Reply { kind, data, .. } => {
                assert_eq!(kind, ResponseKind::NoData);
                assert_eq!(data, Value::Null);
            }
            Dispatch::Silent => panic!("expected reply"),
        }
    }
}
