//! Inbound event catalogue.
//!
//! Every event a client may send is a variant of [`GatewayEvent`], carrying a
//! typed parameter record. Optional fields stay `Option` so each handler can
//! apply its own defaults.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::bridge::SortOrder;

#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("Unknown event: {0}")]
    Unknown(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddDeviceParams {
    pub device_name: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GetLogsParams {
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetChatsParams {
    pub with_participants: Option<bool>,
    pub with_archived: Option<bool>,
    #[serde(rename = "withSMS")]
    pub with_sms: Option<bool>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetChatParams {
    pub chat_guid: Option<String>,
    pub with_participants: Option<bool>,
}

/// Shared by `get-chat-messages` (keyed by `identifier`) and `get-messages`
/// (keyed by `chatGuid`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageWindowParams {
    pub identifier: Option<String>,
    pub chat_guid: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub with_chats: Option<bool>,
    pub with_attachments: Option<bool>,
    pub with_handle: Option<bool>,
    #[serde(rename = "withSMS")]
    pub with_sms: Option<bool>,
    pub with_blurhash: Option<bool>,
    pub sort: Option<SortOrder>,
    #[serde(rename = "where")]
    pub where_clauses: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetAttachmentParams {
    pub identifier: Option<String>,
    pub with_messages: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetAttachmentChunkParams {
    pub identifier: Option<String>,
    /// Coerced with [`super::chunks::normalize_offset`].
    pub start: Value,
    pub chunk_size: Option<u64>,
    pub compress: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatIdentifierParams {
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendMessageParams {
    pub guid: Option<String>,
    pub temp_guid: Option<String>,
    pub message: Option<String>,
    /// Base64 attachment bytes.
    pub attachment: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_guid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendMessageChunkParams {
    pub guid: Option<String>,
    pub temp_guid: Option<String>,
    pub message: Option<String>,
    pub attachment_guid: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_chunk_start: Value,
    /// Base64 bytes of this piece.
    pub attachment_data: Option<String>,
    pub has_more: Option<bool>,
}

/// `participants` may be a single address or a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Participants {
    One(String),
    Many(Vec<String>),
    Other(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartChatParams {
    pub participants: Option<Participants>,
    pub service: Option<String>,
    pub message: Option<String>,
    pub temp_guid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenameGroupParams {
    pub identifier: Option<String>,
    pub new_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParticipantParams {
    pub identifier: Option<String>,
    pub address: Option<String>,
}

/// A message as referenced by a reaction request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessageRef {
    pub guid: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendReactionParams {
    pub chat_guid: Option<String>,
    /// The client's local copy, used to correlate the echo.
    pub message: Option<MessageRef>,
    /// The message being reacted to, as the host knows it.
    pub action_message: Option<MessageRef>,
    pub tapback: Option<String>,
}

/// A client handle to decorate with contact names. Unknown fields round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactHandle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToggleReadParams {
    pub chat_guid: Option<String>,
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OpenChatParams {
    pub chat_guid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    GetServerMetadata,
    GetServerConfig,
    AddFcmDevice(AddDeviceParams),
    GetFcmClient,
    GetLogs(GetLogsParams),
    GetChats(GetChatsParams),
    GetChat(GetChatParams),
    GetChatMessages(MessageWindowParams),
    GetMessages(MessageWindowParams),
    GetAttachment(GetAttachmentParams),
    GetAttachmentChunk(GetAttachmentChunkParams),
    GetLastChatMessage(ChatIdentifierParams),
    GetParticipants(ChatIdentifierParams),
    SendMessage(SendMessageParams),
    SendMessageChunk(SendMessageChunkParams),
    StartChat(StartChatParams),
    RenameGroup(RenameGroupParams),
    AddParticipant(ParticipantParams),
    RemoveParticipant(ParticipantParams),
    SendReaction(SendReactionParams),
    GetContactsFromDb(Vec<ContactHandle>),
    GetContactsFromVcf,
    ToggleChatReadStatus(ToggleReadParams),
    OpenChat(OpenChatParams),
}

/// Every event name clients may send.
pub const EVENT_NAMES: &[&str] = &[
    "get-server-metadata",
    "get-server-config",
    "add-fcm-device",
    "get-fcm-client",
    "get-logs",
    "get-chats",
    "get-chat",
    "get-chat-messages",
    "get-messages",
    "get-attachment",
    "get-attachment-chunk",
    "get-last-chat-message",
    "get-participants",
    "send-message",
    "send-message-chunk",
    "start-chat",
    "rename-group",
    "add-participant",
    "remove-participant",
    "send-reaction",
    "get-contacts-from-db",
    "get-contacts-from-vcf",
    "toggle-chat-read-status",
    "open-chat",
];

fn params<T: DeserializeOwned + Default>(data: Value) -> Result<T, EventParseError> {
    match data {
        Value::Null => Ok(T::default()),
        other => {
            serde_json::from_value(other).map_err(|e| EventParseError::InvalidParams(e.to_string()))
        }
    }
}

/// Entries that are not handle objects are skipped instead of failing the
/// whole batch.
fn contact_handles(data: Value) -> Result<Vec<ContactHandle>, EventParseError> {
    let entries: Vec<Value> = params(data)?;
    Ok(entries
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

impl GatewayEvent {
    /// Resolve an event name and its raw `data` into a typed event.
    pub fn parse(name: &str, data: Value) -> Result<Self, EventParseError> {
        use GatewayEvent as E;
        Ok(match name {
            "get-server-metadata" => E::GetServerMetadata,
            "get-server-config" => E::GetServerConfig,
            "add-fcm-device" => E::AddFcmDevice(params(data)?),
            "get-fcm-client" => E::GetFcmClient,
            "get-logs" => E::GetLogs(params(data)?),
            "get-chats" => E::GetChats(params(data)?),
            "get-chat" => E::GetChat(params(data)?),
            "get-chat-messages" => E::GetChatMessages(params(data)?),
            "get-messages" => E::GetMessages(params(data)?),
            "get-attachment" => E::GetAttachment(params(data)?),
            "get-attachment-chunk" => E::GetAttachmentChunk(params(data)?),
            "get-last-chat-message" => E::GetLastChatMessage(params(data)?),
            "get-participants" => E::GetParticipants(params(data)?),
            "send-message" => E::SendMessage(params(data)?),
            "send-message-chunk" => E::SendMessageChunk(params(data)?),
            "start-chat" => E::StartChat(params(data)?),
            "rename-group" => E::RenameGroup(params(data)?),
            "add-participant" => E::AddParticipant(params(data)?),
            "remove-participant" => E::RemoveParticipant(params(data)?),
            "send-reaction" => E::SendReaction(params(data)?),
            "get-contacts-from-db" => E::GetContactsFromDb(contact_handles(data)?),
            "get-contacts-from-vcf" => E::GetContactsFromVcf,
            "toggle-chat-read-status" => E::ToggleChatReadStatus(params(data)?),
            "open-chat" => E::OpenChat(params(data)?),
            other => return Err(EventParseError::Unknown(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        use GatewayEvent as E;
        match self {
            E::GetServerMetadata => "get-server-metadata",
            E::GetServerConfig => "get-server-config",
            E::AddFcmDevice(_) => "add-fcm-device",
            E::GetFcmClient => "get-fcm-client",
            E::GetLogs(_) => "get-logs",
            E::GetChats(_) => "get-chats",
            E::GetChat(_) => "get-chat",
            E::GetChatMessages(_) => "get-chat-messages",
            E::GetMessages(_) => "get-messages",
            E::GetAttachment(_) => "get-attachment",
            E::GetAttachmentChunk(_) => "get-attachment-chunk",
            E::GetLastChatMessage(_) => "get-last-chat-message",
            E::GetParticipants(_) => "get-participants",
            E::SendMessage(_) => "send-message",
            E::SendMessageChunk(_) => "send-message-chunk",
            E::StartChat(_) => "start-chat",
            E::RenameGroup(_) => "rename-group",
            E::AddParticipant(_) => "add-participant",
            E::RemoveParticipant(_) => "remove-participant",
            E::SendReaction(_) => "send-reaction",
            E::GetContactsFromDb(_) => "get-contacts-from-db",
            E::GetContactsFromVcf => "get-contacts-from-vcf",
            E::ToggleChatReadStatus(_) => "toggle-chat-read-status",
            E::OpenChat(_) => "open-chat",
        }
    }
}
