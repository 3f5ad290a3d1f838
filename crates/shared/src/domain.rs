use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation_id::ConversationId;

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id_newtype!(MessageId);
string_id_newtype!(TabId);

impl MessageId {
    /// Id given to optimistic sends before the server assigns its own.
    pub fn local() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }
}

impl TabId {
    pub fn generate() -> Self {
        Self(format!("tab-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Open,
    Closed,
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactChannel {
    #[default]
    Whatsapp,
    Sms,
    Email,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Document,
    Location,
    Template,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Received,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Sent | Self::Failed => 0,
            Self::Delivered => 1,
            Self::Received => 2,
            Self::Read => 3,
        }
    }

    /// Statuses never regress, and `failed` can only replace `sent`.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (current, next) if current == next => false,
            (Self::Sent, Self::Failed) => true,
            (_, Self::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub phone: String,
    #[serde(default)]
    pub channel: ContactChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Contact {
    pub fn from_phone(phone: &str) -> Self {
        Self {
            name: None,
            phone: phone.to_string(),
            channel: ContactChannel::default(),
            avatar: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: MessageId,
    pub content: String,
    pub direction: MessageDirection,
    pub at: DateTime<Utc>,
}

impl LastMessage {
    pub fn of(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            content: message.content.clone(),
            direction: message.direction,
            at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub needs_contact_data: bool,
}

impl Conversation {
    pub fn placeholder(id: ConversationId, own_phone: Option<&str>) -> Self {
        let customer_phone = id.counterpart(own_phone).to_string();
        Self {
            id,
            customer_name: customer_phone.clone(),
            customer_phone,
            contact: None,
            status: ConversationStatus::Open,
            priority: Priority::Normal,
            assigned_to: None,
            tags: BTreeSet::new(),
            last_message: None,
            last_message_at: None,
            unread_count: 0,
            needs_contact_data: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub direction: MessageDirection,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Metadata key carrying the optimistic id an outbound message settles.
pub const CLIENT_MESSAGE_ID_KEY: &str = "clientMessageId";

impl Message {
    pub fn client_message_id(&self) -> Option<MessageId> {
        self.metadata
            .get(CLIENT_MESSAGE_ID_KEY)
            .and_then(Value::as_str)
            .map(MessageId::from)
    }

    pub fn is_unread_inbound(&self) -> bool {
        self.direction == MessageDirection::Inbound && self.status != MessageStatus::Read
    }

    /// Keeps per-conversation lists independent of arrival order.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClearableField {
    AssignedTo,
    Tags,
    ContactName,
    ContactAvatar,
    LastMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ContactChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Empty values carry no information; clearing requires naming the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_contact_data: Option<bool>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub clear: HashSet<ClearableField>,
}

impl ConversationPatch {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            customer_name: None,
            customer_phone: None,
            contact: None,
            status: None,
            priority: None,
            assigned_to: None,
            tags: None,
            last_message: None,
            last_message_at: None,
            unread_count: None,
            needs_contact_data: None,
            clear: HashSet::new(),
        }
    }

    pub fn clearing(mut self, field: ClearableField) -> Self {
        self.clear.insert(field);
        self
    }
}

impl From<Conversation> for ConversationPatch {
    fn from(conversation: Conversation) -> Self {
        Self {
            customer_name: Some(conversation.customer_name),
            customer_phone: Some(conversation.customer_phone),
            contact: conversation.contact.map(|contact| ContactPatch {
                name: contact.name,
                phone: Some(contact.phone),
                channel: Some(contact.channel),
                avatar: contact.avatar,
            }),
            status: Some(conversation.status),
            priority: Some(conversation.priority),
            assigned_to: conversation.assigned_to,
            tags: Some(conversation.tags.into_iter().collect()),
            last_message: conversation.last_message,
            last_message_at: conversation.last_message_at,
            unread_count: Some(conversation.unread_count),
            needs_contact_data: Some(conversation.needs_contact_data),
            ..Self::new(conversation.id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
