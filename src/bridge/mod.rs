//! Collaborator contracts.
//!
//! The gateway never touches the message store or the host automation layer
//! directly. Everything it needs goes through the traits below, which the
//! process wires up once in a [`crate::gateway::Collaborators`] bundle.

pub mod convert;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Uniform type identifier of the host's proprietary audio container.
pub const CORE_AUDIO_UTI: &str = "com.apple.coreaudio-format";

/// Errors reported by collaborators.
///
/// The display text is what clients see in the error envelope, so it carries
/// the collaborator's message verbatim.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Action(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Store records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handle {
    pub address: String,
    pub service: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub guid: String,
    pub chat_identifier: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub service: String,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub participants: Vec<Handle>,
}

impl Chat {
    /// Group chats carry `;+;` in their guid.
    pub fn is_group_guid(guid: &str) -> bool {
        guid.contains(";+;")
    }

    pub fn is_sms(&self) -> bool {
        self.service.eq_ignore_ascii_case("sms")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub guid: String,
    #[serde(default)]
    pub uti: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub transfer_name: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blurhash: Option<String>,
}

impl Attachment {
    pub fn is_core_audio(&self) -> bool {
        self.uti.as_deref() == Some(CORE_AUDIO_UTI)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub guid: String,
    #[serde(default)]
    pub text: Option<String>,
    pub chat_guid: String,
    #[serde(default)]
    pub handle: Option<Handle>,
    pub date_created: i64,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chats: Vec<Chat>,
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter for [`QueryService::get_chats`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatQuery {
    pub chat_guid: Option<String>,
    pub with_participants: bool,
    pub with_archived: bool,
    pub with_sms: bool,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl ChatQuery {
    /// Exact lookup of one chat, SMS included.
    pub fn by_guid(guid: &str) -> Self {
        Self {
            chat_guid: Some(guid.to_string()),
            with_participants: true,
            with_archived: true,
            with_sms: true,
            limit: None,
            offset: 0,
        }
    }
}

/// Filter for [`QueryService::get_messages`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageQuery {
    pub chat_guid: Option<String>,
    pub offset: u64,
    pub limit: u64,
    /// Epoch milliseconds, exclusive.
    pub after: Option<i64>,
    /// Epoch milliseconds, exclusive.
    pub before: Option<i64>,
    pub with_chats: bool,
    pub with_attachments: bool,
    pub with_handle: bool,
    pub with_sms: bool,
    pub with_blurhash: bool,
    pub sort: SortOrder,
    /// Store-specific filter clauses, passed through untouched.
    pub where_clauses: Vec<Value>,
}

// ============================================================================
// Actions
// ============================================================================

/// The six reaction kinds the host supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tapback {
    Love,
    Like,
    Laugh,
    Dislike,
    Question,
    Emphasize,
}

impl Tapback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tapback::Love => "love",
            Tapback::Like => "like",
            Tapback::Laugh => "laugh",
            Tapback::Dislike => "dislike",
            Tapback::Question => "question",
            Tapback::Emphasize => "emphasize",
        }
    }
}

impl FromStr for Tapback {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "love" => Ok(Tapback::Love),
            "like" => Ok(Tapback::Like),
            "laugh" => Ok(Tapback::Laugh),
            "dislike" => Ok(Tapback::Dislike),
            "question" => Ok(Tapback::Question),
            "emphasize" => Ok(Tapback::Emphasize),
            _ => Err(()),
        }
    }
}

/// A message handed to the automation layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutgoingMessage {
    pub chat_guid: String,
    pub temp_guid: Option<String>,
    pub text: Option<String>,
    pub attachment_guid: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment: Option<Vec<u8>>,
}

/// Work handed to the asynchronous queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    SendAttachment {
        temp_guid: String,
        chat_guid: String,
        message: String,
        attachment_guid: Option<String>,
        attachment_name: Option<String>,
        data: Option<Vec<u8>>,
    },
    OpenChat {
        chat_guid: String,
    },
}

/// Written before a reaction is toggled so the echo can be matched back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionMatchToken {
    pub temp_guid: String,
    pub chat_guid: String,
    pub date_created: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub identifier: String,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

// ============================================================================
// Contracts
// ============================================================================

/// Read-only access to chats, messages and attachments.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn get_chats(&self, query: ChatQuery) -> Result<Vec<Chat>, BridgeError>;

    async fn get_messages(&self, query: MessageQuery) -> Result<Vec<Message>, BridgeError>;

    async fn get_attachment(
        &self,
        guid: &str,
        with_messages: bool,
    ) -> Result<Option<Attachment>, BridgeError>;
}

/// Host-side operations. Each call resolves once the host has accepted it.
#[async_trait]
pub trait ActionService: Send + Sync {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), BridgeError>;

    /// Create a chat that may span services. Returns the new chat guid.
    async fn create_universal_chat(
        &self,
        participants: &[String],
        service: &str,
        message: Option<&str>,
        temp_guid: Option<&str>,
    ) -> Result<String, BridgeError>;

    /// Create a one-to-one chat on a single service. Returns the new chat guid.
    async fn create_single_chat(
        &self,
        participant: &str,
        service: &str,
        message: &str,
        temp_guid: &str,
    ) -> Result<String, BridgeError>;

    async fn rename_group_chat(&self, chat_guid: &str, new_name: &str) -> Result<(), BridgeError>;

    /// Returns the host's result text; anything but `success` is a refusal.
    async fn add_participant(&self, chat_guid: &str, address: &str) -> Result<String, BridgeError>;

    /// Returns the host's result text; anything but `success` is a refusal.
    async fn remove_participant(
        &self,
        chat_guid: &str,
        address: &str,
    ) -> Result<String, BridgeError>;

    async fn toggle_tapback(
        &self,
        chat_guid: &str,
        message_text: &str,
        tapback: Tapback,
    ) -> Result<(), BridgeError>;

    /// Write `AddressBook.vcf` into `dest_dir`.
    async fn export_contacts(&self, dest_dir: &Path) -> Result<(), BridgeError>;
}

/// Push-notification device registry.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Insert or refresh a device by name. Returns `true` when newly created.
    async fn upsert(&self, name: &str, identifier: &str) -> Result<bool, BridgeError>;

    /// Drop devices inactive for longer than `max_age`. Returns how many went.
    async fn purge_old(&self, max_age: Duration) -> Result<usize, BridgeError>;
}

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> Result<(), BridgeError>;

    async fn save_reaction_match(&self, token: ReactionMatchToken) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait ContactsService: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn contact_by_address(&self, address: &str) -> Result<Option<Contact>, BridgeError>;
}

/// One-off media conversion (host audio container to a portable one).
#[async_trait]
pub trait MediaConverter: Send + Sync {
    async fn convert(&self, source: &Path, dest: &Path) -> Result<(), BridgeError>;
}
