//! In-memory authority for conversations and messages within a tab.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{
        ClearableField, Contact, ContactPatch, Conversation, ConversationPatch, LastMessage,
        Message, MessageDirection, MessageId, MessagePatch, MessageStatus, CLIENT_MESSAGE_ID_KEY,
    },
    ConversationId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        self != Self::Unchanged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStore {
    own_phone: Option<String>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    read_through: HashMap<ConversationId, DateTime<Utc>>,
    active: Option<ConversationId>,
}

pub fn last_message_patch(message: &Message) -> ConversationPatch {
    let mut patch = ConversationPatch::new(message.conversation_id.clone());
    patch.last_message = Some(LastMessage::of(message));
    patch.last_message_at = Some(message.created_at);
    patch
}

impl ConversationStore {
    /// `own_phone` decides which participant of an id is the customer.
    pub fn new(own_phone: Option<String>) -> Self {
        Self {
            own_phone,
            ..Self::default()
        }
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn messages(&self, id: &ConversationId) -> &[Message] {
        self.messages.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn message(&self, id: &ConversationId, message_id: &MessageId) -> Option<&Message> {
        self.messages(id).iter().find(|message| &message.id == message_id)
    }

    pub fn messages_held(&self, id: &ConversationId) -> bool {
        self.messages.get(id).is_some_and(|list| !list.is_empty())
    }

    pub fn read_through(&self, id: &ConversationId) -> Option<DateTime<Utc>> {
        self.read_through.get(id).copied()
    }

    pub fn conversations_by_recency(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.values().collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn active_id(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.conversations.get(id))
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .keys()
            .map(|id| self.compute_unread_count(id))
            .sum()
    }

    /// Only fields named in `patch.clear` are cleared.
    pub fn upsert(&mut self, patch: ConversationPatch) -> UpsertOutcome {
        let created = self.ensure_conversation(&patch.id);
        let Some(conversation) = self.conversations.get_mut(&patch.id) else {
            return UpsertOutcome::Unchanged;
        };
        let before = conversation.clone();
        merge_conversation(conversation, patch);

        if created {
            UpsertOutcome::Created
        } else if *conversation != before {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Unchanged
        }
    }

    /// Skips known ids and optimistic copies that were already settled.
    pub fn add_message(
        &mut self,
        conversation_id: &ConversationId,
        mut message: Message,
    ) -> AddOutcome {
        self.ensure_conversation(conversation_id);
        message.conversation_id = conversation_id.clone();

        let list = self.messages.entry(conversation_id.clone()).or_default();
        let settled = |existing: &Message| {
            message.id.is_local() && existing.client_message_id().as_ref() == Some(&message.id)
        };
        if list
            .iter()
            .any(|existing| existing.id == message.id || settled(existing))
        {
            return AddOutcome::Duplicate;
        }

        if let Some(watermark) = self.read_through.get(conversation_id) {
            if message.direction == MessageDirection::Inbound && message.created_at <= *watermark {
                message.status = MessageStatus::Read;
            }
        }

        let position = list.partition_point(|existing| existing.sort_key() < message.sort_key());
        list.insert(position, message);
        AddOutcome::Added
    }

    /// Status only advances; metadata is merged key by key.
    pub fn update_message(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> bool {
        let Some(message) = self
            .messages
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|message| &message.id == message_id))
        else {
            return false;
        };
        apply_message_patch(message, patch)
    }

    /// Swaps an optimistic local message for the server copy.
    pub fn acknowledge(
        &mut self,
        conversation_id: &ConversationId,
        local_id: &MessageId,
        mut server_message: Message,
    ) -> bool {
        let local = self.messages.get_mut(conversation_id).and_then(|list| {
            let index = list.iter().position(|message| &message.id == local_id)?;
            Some(list.remove(index))
        });

        if let Some(local) = &local {
            if let Some(conversation) = self.conversations.get_mut(conversation_id) {
                let summarizes_local = conversation
                    .last_message
                    .as_ref()
                    .is_some_and(|summary| &summary.message_id == local_id);
                if summarizes_local {
                    conversation.last_message = Some(LastMessage::of(&server_message));
                }
            }
            server_message.direction = local.direction;
            if local.status != MessageStatus::Failed
                && server_message.status.can_advance_to(local.status)
            {
                server_message.status = local.status;
            }
            for (key, value) in &local.metadata {
                server_message
                    .metadata
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        server_message
            .metadata
            .entry(CLIENT_MESSAGE_ID_KEY)
            .or_insert_with(|| Value::String(local_id.0.clone()));
        let added = self.add_message(conversation_id, server_message) == AddOutcome::Added;
        local.is_some() || added
    }

    /// Held messages win over the server counter.
    pub fn compute_unread_count(&self, conversation_id: &ConversationId) -> u32 {
        match self.messages.get(conversation_id) {
            Some(list) if !list.is_empty() => {
                list.iter().filter(|message| message.is_unread_inbound()).count() as u32
            }
            _ => self
                .conversations
                .get(conversation_id)
                .map(|conversation| conversation.unread_count)
                .unwrap_or(0),
        }
    }

    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> Vec<MessageId> {
        let latest_inbound = self
            .messages(conversation_id)
            .iter()
            .filter(|message| message.direction == MessageDirection::Inbound)
            .map(|message| message.created_at)
            .max();
        self.apply_read_through(conversation_id, latest_inbound)
    }

    /// Marks inbound messages at or before `read_through` as read and zeroes
    /// the counter. The watermark never moves backwards.
    pub fn apply_read_through(
        &mut self,
        conversation_id: &ConversationId,
        read_through: Option<DateTime<Utc>>,
    ) -> Vec<MessageId> {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        conversation.unread_count = 0;

        let watermark = match (self.read_through.get(conversation_id).copied(), read_through) {
            (Some(current), Some(next)) => Some(current.max(next)),
            (current, next) => current.or(next),
        };
        let Some(watermark) = watermark else {
            return Vec::new();
        };
        self.read_through.insert(conversation_id.clone(), watermark);

        let mut newly_read = Vec::new();
        if let Some(list) = self.messages.get_mut(conversation_id) {
            for message in list.iter_mut() {
                if message.is_unread_inbound() && message.created_at <= watermark {
                    message.status = MessageStatus::Read;
                    newly_read.push(message.id.clone());
                }
            }
        }
        newly_read
    }

    pub fn set_active(&mut self, conversation_id: Option<ConversationId>) -> bool {
        if let Some(id) = &conversation_id {
            self.ensure_conversation(id);
        }
        if self.active == conversation_id {
            return false;
        }
        self.active = conversation_id;
        true
    }

    fn ensure_conversation(&mut self, id: &ConversationId) -> bool {
        if self.conversations.contains_key(id) {
            return false;
        }
        self.conversations.insert(
            id.clone(),
            Conversation::placeholder(id.clone(), self.own_phone.as_deref()),
        );
        true
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn merge_conversation(conversation: &mut Conversation, patch: ConversationPatch) {
    let mut identified = false;

    if let Some(name) = non_empty(patch.customer_name) {
        conversation.customer_name = name;
        identified = true;
    }
    if let Some(phone) = non_empty(patch.customer_phone) {
        conversation.customer_phone = phone;
    }
    if let Some(contact) = patch.contact {
        identified |= merge_contact(conversation, contact);
    }
    if let Some(status) = patch.status {
        conversation.status = status;
    }
    if let Some(priority) = patch.priority {
        conversation.priority = priority;
    }
    if let Some(assignee) = non_empty(patch.assigned_to) {
        conversation.assigned_to = Some(assignee);
    }
    if let Some(tags) = patch.tags {
        let tags: Vec<String> = tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        if !tags.is_empty() {
            conversation.tags = tags.into_iter().collect();
        }
    }
    if let Some(last_message) = patch.last_message {
        let newer = conversation.last_message.as_ref().map_or(true, |current| {
            (last_message.at, last_message.message_id.as_str())
                >= (current.at, current.message_id.as_str())
        });
        if newer {
            conversation.last_message = Some(last_message);
        }
    }
    if let Some(at) = patch.last_message_at {
        conversation.last_message_at = Some(
            conversation
                .last_message_at
                .map_or(at, |current| current.max(at)),
        );
    }
    if let Some(count) = patch.unread_count {
        conversation.unread_count = count;
    }
    match patch.needs_contact_data {
        Some(flag) => conversation.needs_contact_data = flag,
        None if identified => conversation.needs_contact_data = false,
        None => {}
    }

    for field in patch.clear {
        match field {
            ClearableField::AssignedTo => conversation.assigned_to = None,
            ClearableField::Tags => conversation.tags.clear(),
            ClearableField::ContactName => {
                if let Some(contact) = conversation.contact.as_mut() {
                    contact.name = None;
                }
            }
            ClearableField::ContactAvatar => {
                if let Some(contact) = conversation.contact.as_mut() {
                    contact.avatar = None;
                }
            }
            ClearableField::LastMessage => {
                conversation.last_message = None;
                conversation.last_message_at = None;
            }
        }
    }
}

fn merge_contact(conversation: &mut Conversation, patch: ContactPatch) -> bool {
    let phone = conversation.customer_phone.clone();
    let contact = conversation
        .contact
        .get_or_insert_with(|| Contact::from_phone(&phone));

    let named = match non_empty(patch.name) {
        Some(name) => {
            contact.name = Some(name);
            true
        }
        None => false,
    };
    if let Some(phone) = non_empty(patch.phone) {
        contact.phone = phone;
    }
    if let Some(channel) = patch.channel {
        contact.channel = channel;
    }
    if let Some(avatar) = non_empty(patch.avatar) {
        contact.avatar = Some(avatar);
    }
    named
}

fn apply_message_patch(message: &mut Message, patch: MessagePatch) -> bool {
    let mut changed = false;

    if let Some(status) = patch.status {
        if message.status.can_advance_to(status) {
            message.status = status;
            changed = true;
        }
    }
    if let Some(content) = non_empty(patch.content) {
        if content != message.content {
            message.content = content;
            changed = true;
        }
    }
    for (key, value) in patch.metadata {
        if message.metadata.get(&key) != Some(&value) {
            message.metadata.insert(key, value);
            changed = true;
        }
    }
    if let Some(at) = patch.updated_at {
        if message.updated_at.map_or(true, |current| at > current) {
            message.updated_at = Some(at);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
