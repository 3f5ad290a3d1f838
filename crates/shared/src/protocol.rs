use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    conversation_id::ConversationId,
    domain::{ConversationPatch, Message, MessageId, MessageKind, MessagePatch, TabId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PushEventName {
    NewMessage,
    MessageRead,
    ConversationJoined,
    ConversationLeft,
    StateSynced,
    ConversationEvent,
    WebhookConversationCreated,
    WebhookNewMessage,
}

impl PushEventName {
    pub const ALL: [PushEventName; 8] = [
        Self::NewMessage,
        Self::MessageRead,
        Self::ConversationJoined,
        Self::ConversationLeft,
        Self::StateSynced,
        Self::ConversationEvent,
        Self::WebhookConversationCreated,
        Self::WebhookNewMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new-message",
            Self::MessageRead => "message-read",
            Self::ConversationJoined => "conversation-joined",
            Self::ConversationLeft => "conversation-left",
            Self::StateSynced => "state-synced",
            Self::ConversationEvent => "conversation-event",
            Self::WebhookConversationCreated => "webhook:conversation-created",
            Self::WebhookNewMessage => "webhook:new-message",
        }
    }
}

impl fmt::Display for PushEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown push event `{0}`")]
pub struct UnknownPushEvent(pub String);

impl FromStr for PushEventName {
    type Err = UnknownPushEvent;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == value)
            .ok_or_else(|| UnknownPushEvent(value.to_string()))
    }
}

impl Serialize for PushEventName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PushEventName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A raw frame on the push transport: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    NewMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(rename = "type")]
        kind: MessageKind,
        client_message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MarkRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new-message",
            Self::MarkRead { .. } => "mark-read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum BroadcastPayload {
    ConversationUpserted(ConversationPatch),
    #[serde(rename_all = "camelCase")]
    MessageAdded {
        conversation_id: ConversationId,
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    },
    #[serde(rename_all = "camelCase")]
    MessageAcknowledged {
        conversation_id: ConversationId,
        local_id: MessageId,
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    ConversationRead {
        conversation_id: ConversationId,
        read_through: Option<DateTime<Utc>>,
    },
    Focus,
    Blur,
    TabClosed,
}

impl BroadcastPayload {
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::Focus | Self::Blur)
    }
}

/// Wire shape: `{type, data, timestamp, tabId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(flatten)]
    pub payload: BroadcastPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "tabId")]
    pub origin_tab_id: TabId,
}

impl BroadcastEnvelope {
    pub fn new(origin_tab_id: TabId, payload: BroadcastPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            origin_tab_id,
        }
    }
}
