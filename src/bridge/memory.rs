//! In-memory collaborators.
//!
//! Backs the binary when it runs without a host store, and gives tests a
//! store they can seed and inspect. Individual operations can be told to
//! fail with [`MemoryBridge::fail`].

use super::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    chats: Vec<Chat>,
    messages: Vec<Message>,
    attachments: HashMap<String, Attachment>,
    devices: HashMap<String, Device>,
    contacts: HashMap<String, Contact>,
    contacts_connected: bool,
    sent: Vec<OutgoingMessage>,
    queue: Vec<QueueItem>,
    reaction_matches: Vec<ReactionMatchToken>,
    tapbacks: Vec<(String, String, Tapback)>,
    failures: HashMap<&'static str, String>,
    participant_results: HashMap<&'static str, String>,
}

/// Implements every collaborator contract over plain in-process state.
pub struct MemoryBridge {
    state: RwLock<MemoryState>,
}

impl Default for MemoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                contacts_connected: true,
                ..MemoryState::default()
            }),
        }
    }

    pub fn insert_chat(&self, chat: Chat) {
        self.state.write().chats.push(chat);
    }

    pub fn insert_message(&self, message: Message) {
        self.state.write().messages.push(message);
    }

    pub fn insert_attachment(&self, attachment: Attachment) {
        self.state
            .write()
            .attachments
            .insert(attachment.guid.clone(), attachment);
    }

    pub fn insert_device(&self, device: Device) {
        self.state.write().devices.insert(device.name.clone(), device);
    }

    pub fn insert_contact(&self, address: &str, contact: Contact) {
        self.state
            .write()
            .contacts
            .insert(address.to_string(), contact);
    }

    pub fn set_contacts_connected(&self, connected: bool) {
        self.state.write().contacts_connected = connected;
    }

    /// Make `operation` (a trait method name) fail with `message`.
    pub fn fail(&self, operation: &'static str, message: impl Into<String>) {
        self.state.write().failures.insert(operation, message.into());
    }

    /// Override the result text of `add_participant` / `remove_participant`.
    pub fn set_participant_result(&self, operation: &'static str, result: impl Into<String>) {
        self.state
            .write()
            .participant_results
            .insert(operation, result.into());
    }

    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.state.read().sent.clone()
    }

    pub fn queued(&self) -> Vec<QueueItem> {
        self.state.read().queue.clone()
    }

    pub fn reaction_matches(&self) -> Vec<ReactionMatchToken> {
        self.state.read().reaction_matches.clone()
    }

    pub fn tapbacks(&self) -> Vec<(String, String, Tapback)> {
        self.state.read().tapbacks.clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.state.read().devices.values().cloned().collect()
    }

    pub fn chat(&self, guid: &str) -> Option<Chat> {
        self.state.read().chats.iter().find(|c| c.guid == guid).cloned()
    }

    fn injected(&self, operation: &'static str) -> Result<(), BridgeError> {
        match self.state.read().failures.get(operation) {
            Some(message) => Err(BridgeError::Action(message.clone())),
            None => Ok(()),
        }
    }

    fn insert_created_chat(&self, guid: &str, service: &str, participants: &[String]) {
        let chat = Chat {
            guid: guid.to_string(),
            chat_identifier: guid.rsplit(';').next().unwrap_or(guid).to_string(),
            display_name: None,
            service: service.to_string(),
            is_archived: false,
            participants: participants
                .iter()
                .map(|address| Handle {
                    address: address.clone(),
                    service: service.to_string(),
                    country: None,
                })
                .collect(),
        };
        self.state.write().chats.push(chat);
    }
}

fn paginate<T>(items: Vec<T>, offset: u64, limit: Option<u64>) -> Vec<T> {
    let iter = items.into_iter().skip(offset as usize);
    match limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

#[async_trait]
impl QueryService for MemoryBridge {
    async fn get_chats(&self, query: ChatQuery) -> Result<Vec<Chat>, BridgeError> {
        self.injected("get_chats")?;
        let state = self.state.read();
        let chats: Vec<Chat> = state
            .chats
            .iter()
            .filter(|chat| match &query.chat_guid {
                Some(guid) => &chat.guid == guid,
                None => true,
            })
            .filter(|chat| query.with_archived || !chat.is_archived)
            .filter(|chat| query.with_sms || !chat.is_sms())
            .cloned()
            .map(|mut chat| {
                if !query.with_participants {
                    chat.participants.clear();
                }
                chat
            })
            .collect();
        Ok(paginate(chats, query.offset, query.limit))
    }

    async fn get_messages(&self, query: MessageQuery) -> Result<Vec<Message>, BridgeError> {
        self.injected("get_messages")?;
        if !query.where_clauses.is_empty() {
            tracing::debug!(
                clauses = query.where_clauses.len(),
                "memory store ignores where clauses"
            );
        }
        let state = self.state.read();
        let chat_for = |guid: &str| state.chats.iter().find(|c| c.guid == guid);

        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| match &query.chat_guid {
                Some(guid) => &m.chat_guid == guid,
                None => true,
            })
            .filter(|m| query.after.is_none_or(|after| m.date_created > after))
            .filter(|m| query.before.is_none_or(|before| m.date_created < before))
            .filter(|m| query.with_sms || !chat_for(&m.chat_guid).is_some_and(Chat::is_sms))
            .cloned()
            .collect();

        match query.sort {
            SortOrder::Asc => messages.sort_by_key(|m| m.date_created),
            SortOrder::Desc => messages.sort_by_key(|m| std::cmp::Reverse(m.date_created)),
        }

        let mut messages = paginate(messages, query.offset, Some(query.limit));
        for message in &mut messages {
            if !query.with_attachments {
                message.attachments.clear();
            } else if !query.with_blurhash {
                for attachment in &mut message.attachments {
                    attachment.blurhash = None;
                }
            }
            if !query.with_handle {
                message.handle = None;
            }
            if query.with_chats {
                message.chats = chat_for(&message.chat_guid).cloned().into_iter().collect();
            }
        }
        Ok(messages)
    }

    async fn get_attachment(
        &self,
        guid: &str,
        _with_messages: bool,
    ) -> Result<Option<Attachment>, BridgeError> {
        self.injected("get_attachment")?;
        Ok(self.state.read().attachments.get(guid).cloned())
    }
}

#[async_trait]
impl ActionService for MemoryBridge {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), BridgeError> {
        self.injected("send_message")?;
        self.state.write().sent.push(message);
        Ok(())
    }

    async fn create_universal_chat(
        &self,
        participants: &[String],
        service: &str,
        message: Option<&str>,
        temp_guid: Option<&str>,
    ) -> Result<String, BridgeError> {
        self.injected("create_universal_chat")?;
        let guid = if participants.len() > 1 {
            format!("{};+;chat{}", service, Uuid::new_v4().simple())
        } else {
            format!("{};-;{}", service, participants.first().map_or("", String::as_str))
        };
        self.insert_created_chat(&guid, service, participants);
        if let Some(text) = message.filter(|m| !m.is_empty()) {
            self.state.write().sent.push(OutgoingMessage {
                chat_guid: guid.clone(),
                temp_guid: temp_guid.map(str::to_string),
                text: Some(text.to_string()),
                ..OutgoingMessage::default()
            });
        }
        Ok(guid)
    }

    async fn create_single_chat(
        &self,
        participant: &str,
        service: &str,
        message: &str,
        temp_guid: &str,
    ) -> Result<String, BridgeError> {
        self.injected("create_single_chat")?;
        let guid = format!("{};-;{}", service, participant);
        self.insert_created_chat(&guid, service, &[participant.to_string()]);
        self.state.write().sent.push(OutgoingMessage {
            chat_guid: guid.clone(),
            temp_guid: Some(temp_guid.to_string()),
            text: Some(message.to_string()),
            ..OutgoingMessage::default()
        });
        Ok(guid)
    }

    async fn rename_group_chat(&self, chat_guid: &str, new_name: &str) -> Result<(), BridgeError> {
        self.injected("rename_group_chat")?;
        let mut state = self.state.write();
        let chat = state
            .chats
            .iter_mut()
            .find(|c| c.guid == chat_guid)
            .ok_or_else(|| BridgeError::NotFound("Chat does not exist".to_string()))?;
        chat.display_name = Some(new_name.to_string());
        Ok(())
    }

    async fn add_participant(&self, chat_guid: &str, address: &str) -> Result<String, BridgeError> {
        self.injected("add_participant")?;
        let mut state = self.state.write();
        if let Some(result) = state.participant_results.get("add_participant") {
            return Ok(result.clone());
        }
        let chat = state
            .chats
            .iter_mut()
            .find(|c| c.guid == chat_guid)
            .ok_or_else(|| BridgeError::NotFound("Chat does not exist".to_string()))?;
        let service = chat.service.clone();
        chat.participants.push(Handle {
            address: address.to_string(),
            service,
            country: None,
        });
        Ok("success".to_string())
    }

    async fn remove_participant(
        &self,
        chat_guid: &str,
        address: &str,
    ) -> Result<String, BridgeError> {
        self.injected("remove_participant")?;
        let mut state = self.state.write();
        if let Some(result) = state.participant_results.get("remove_participant") {
            return Ok(result.clone());
        }
        let chat = state
            .chats
            .iter_mut()
            .find(|c| c.guid == chat_guid)
            .ok_or_else(|| BridgeError::NotFound("Chat does not exist".to_string()))?;
        chat.participants.retain(|h| h.address != address);
        Ok("success".to_string())
    }

    async fn toggle_tapback(
        &self,
        chat_guid: &str,
        message_text: &str,
        tapback: Tapback,
    ) -> Result<(), BridgeError> {
        self.injected("toggle_tapback")?;
        self.state
            .write()
            .tapbacks
            .push((chat_guid.to_string(), message_text.to_string(), tapback));
        Ok(())
    }

    async fn export_contacts(&self, dest_dir: &Path) -> Result<(), BridgeError> {
        self.injected("export_contacts")?;
        let vcf = {
            let state = self.state.read();
            let mut entries: Vec<_> = state.contacts.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries
                .into_iter()
                .map(|(address, contact)| {
                    format!(
                        "BEGIN:VCARD\nVERSION:3.0\nN:{};{}\nTEL:{}\nEND:VCARD\n",
                        contact.last_name.as_deref().unwrap_or(""),
                        contact.first_name.as_deref().unwrap_or(""),
                        address
                    )
                })
                .collect::<String>()
        };
        tokio::fs::create_dir_all(dest_dir).await?;
        tokio::fs::write(dest_dir.join("AddressBook.vcf"), vcf).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for MemoryBridge {
    async fn upsert(&self, name: &str, identifier: &str) -> Result<bool, BridgeError> {
        self.injected("upsert")?;
        let mut state = self.state.write();
        let now = Utc::now();
        match state.devices.get_mut(name) {
            Some(device) => {
                device.identifier = identifier.to_string();
                device.last_active = now;
                Ok(false)
            }
            None => {
                state.devices.insert(
                    name.to_string(),
                    Device {
                        name: name.to_string(),
                        identifier: identifier.to_string(),
                        last_active: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn purge_old(&self, max_age: Duration) -> Result<usize, BridgeError> {
        self.injected("purge_old")?;
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| BridgeError::Action(e.to_string()))?;
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.write();
        let before = state.devices.len();
        state.devices.retain(|_, d| d.last_active >= cutoff);
        Ok(before - state.devices.len())
    }
}

#[async_trait]
impl QueueService for MemoryBridge {
    async fn enqueue(&self, item: QueueItem) -> Result<(), BridgeError> {
        self.injected("enqueue")?;
        self.state.write().queue.push(item);
        Ok(())
    }

    async fn save_reaction_match(&self, token: ReactionMatchToken) -> Result<(), BridgeError> {
        self.injected("save_reaction_match")?;
        self.state.write().reaction_matches.push(token);
        Ok(())
    }
}

#[async_trait]
impl ContactsService for MemoryBridge {
    fn is_connected(&self) -> bool {
        self.state.read().contacts_connected
    }

    async fn contact_by_address(&self, address: &str) -> Result<Option<Contact>, BridgeError> {
        self.injected("contact_by_address")?;
        Ok(self.state.read().contacts.get(address).cloned())
    }
}
