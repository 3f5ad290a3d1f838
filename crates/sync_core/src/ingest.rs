use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use shared::{
    conversation_id::canonicalize,
    domain::{
        ConversationPatch, Message, MessageDirection, MessageId, MessageKind, MessagePatch,
        MessageStatus, CLIENT_MESSAGE_ID_KEY,
    },
    protocol::PushEventName,
    ConversationId, InvalidFormat,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{last_message_patch, AddOutcome, ConversationStore, UpsertOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{field}` is not a valid timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error(transparent)]
    InvalidConversationId(#[from] InvalidFormat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Socket,
    Webhook,
}

impl IngestSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub content: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub recipient: Option<String>,
    pub kind: MessageKind,
    pub status: Option<MessageStatus>,
    pub client_message_id: Option<MessageId>,
    pub customer_name: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(IncomingMessage),
    WebhookNewMessage(IncomingMessage),
    MessageRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    ConversationJoined {
        conversation_id: ConversationId,
    },
    ConversationLeft {
        conversation_id: ConversationId,
    },
    StateSynced {
        conversations: Vec<ConversationPatch>,
    },
    ConversationEvent {
        kind: String,
        patch: ConversationPatch,
    },
    WebhookConversationCreated(ConversationPatch),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Added,
    Acknowledged { local_id: MessageId },
    Duplicate,
}

/// What an ingested event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestReport {
    Message {
        message: Message,
        outcome: ApplyOutcome,
    },
    MessagesRead {
        conversation_id: ConversationId,
        updated: Vec<MessageId>,
    },
    Joined(ConversationId),
    Left(ConversationId),
    Synced(Vec<(ConversationPatch, UpsertOutcome)>),
    ConversationChanged {
        kind: Option<String>,
        patch: ConversationPatch,
        outcome: UpsertOutcome,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MessageIngestPipeline {
    own_phone: Option<String>,
}

impl MessageIngestPipeline {
    pub fn new(own_phone: Option<String>) -> Self {
        Self { own_phone }
    }

    /// `webhook:new-message` payloads may nest the message under `message`.
    pub fn validate(&self, payload: &Value) -> Result<IncomingMessage, ValidationError> {
        let outer = payload.as_object().ok_or(ValidationError::NotAnObject)?;
        let body = match outer.get("message") {
            Some(Value::Object(inner)) => inner,
            _ => outer,
        };
        let lookup = |names: &[&str]| field(body, names).or_else(|| field(outer, names));

        let conversation_id =
            conversation_id_field(lookup(&["conversationId", "conversation_id"]))?;
        let message_id = id_field("messageId", lookup(&["messageId", "id", "message_id"]))?;
        let content = match lookup(&["content", "body", "text"]) {
            None => return Err(ValidationError::MissingField("content")),
            Some(Value::String(content)) => content.clone(),
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: "content",
                    expected: "a string",
                })
            }
        };
        let sender = string_field("senderId", lookup(&["senderId", "from", "sender"]))?;
        let timestamp =
            timestamp_field("timestamp", lookup(&["timestamp", "createdAt", "sentAt"]))?;

        let recipient =
            optional_string("recipientId", lookup(&["recipientId", "to", "recipient"]))?;
        let kind = match lookup(&["type", "kind"]) {
            None => MessageKind::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                ValidationError::WrongType {
                    field: "type",
                    expected: "a known message type",
                }
            })?,
        };
        let status = match lookup(&["status"]) {
            None => None,
            Some(value) => Some(serde_json::from_value(value.clone()).map_err(|_| {
                ValidationError::WrongType {
                    field: "status",
                    expected: "a known message status",
                }
            })?),
        };
        let metadata = match lookup(&["metadata"]) {
            None => Map::new(),
            Some(Value::Object(metadata)) => metadata.clone(),
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: "metadata",
                    expected: "an object",
                })
            }
        };
        let client_message_id = match lookup(&[CLIENT_MESSAGE_ID_KEY])
            .or_else(|| metadata.get(CLIENT_MESSAGE_ID_KEY).filter(|v| !v.is_null()))
        {
            None => None,
            Some(value) => Some(id_field(CLIENT_MESSAGE_ID_KEY, Some(value))?),
        };
        let customer_name =
            optional_string("customerName", lookup(&["customerName", "profileName"]))?;

        Ok(IncomingMessage {
            conversation_id,
            message_id,
            content,
            sender,
            timestamp,
            recipient,
            kind,
            status,
            client_message_id,
            customer_name,
            metadata,
        })
    }

    /// Messages whose sender is not the business phone are inbound.
    pub fn transform(&self, incoming: IncomingMessage, source: IngestSource) -> Message {
        let direction = match &self.own_phone {
            Some(own) if same_phone(own, &incoming.sender) => MessageDirection::Outbound,
            _ => MessageDirection::Inbound,
        };
        let status = incoming.status.unwrap_or(match direction {
            MessageDirection::Inbound => MessageStatus::Received,
            MessageDirection::Outbound => MessageStatus::Delivered,
        });

        let mut metadata = incoming.metadata;
        metadata.insert("source".into(), Value::String(source.as_str().into()));
        metadata.insert("sender".into(), Value::String(incoming.sender.clone()));
        if let Some(client_id) = &incoming.client_message_id {
            metadata.insert(
                CLIENT_MESSAGE_ID_KEY.into(),
                Value::String(client_id.0.clone()),
            );
        }

        Message {
            id: incoming.message_id,
            conversation_id: incoming.conversation_id,
            content: incoming.content,
            direction,
            kind: incoming.kind,
            status,
            sender: incoming.sender,
            recipient: incoming.recipient,
            created_at: incoming.timestamp,
            updated_at: None,
            metadata,
        }
    }

    /// Unread state is left to the store; only an explicit read resets it.
    pub fn apply(&self, store: &mut ConversationStore, message: Message) -> ApplyOutcome {
        let conversation_id = message.conversation_id.clone();
        let summary = last_message_patch(&message);

        let pending_local = message
            .client_message_id()
            .filter(|local_id| store.message(&conversation_id, local_id).is_some());

        let outcome = match pending_local {
            Some(local_id) => {
                store.acknowledge(&conversation_id, &local_id, message);
                ApplyOutcome::Acknowledged { local_id }
            }
            None => match store.add_message(&conversation_id, message) {
                AddOutcome::Added => ApplyOutcome::Added,
                AddOutcome::Duplicate => ApplyOutcome::Duplicate,
            },
        };

        if outcome != ApplyOutcome::Duplicate {
            store.upsert(summary);
        }
        outcome
    }

    pub fn parse(
        &self,
        name: PushEventName,
        payload: &Value,
    ) -> Result<InboundEvent, ValidationError> {
        match name {
            PushEventName::NewMessage => Ok(InboundEvent::NewMessage(self.validate(payload)?)),
            PushEventName::WebhookNewMessage => {
                Ok(InboundEvent::WebhookNewMessage(self.validate(payload)?))
            }
            PushEventName::MessageRead => {
                let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;
                let conversation_id =
                    conversation_id_field(field(object, &["conversationId", "conversation_id"]))?;
                let message_ids = match field(object, &["messageIds", "message_ids"]) {
                    Some(Value::Array(ids)) => ids
                        .iter()
                        .map(|id| id_field("messageIds", Some(id)))
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => {
                        return Err(ValidationError::WrongType {
                            field: "messageIds",
                            expected: "an array",
                        })
                    }
                    None => vec![id_field("messageIds", field(object, &["messageId"]))?],
                };
                Ok(InboundEvent::MessageRead {
                    conversation_id,
                    message_ids,
                })
            }
            PushEventName::ConversationJoined => Ok(InboundEvent::ConversationJoined {
                conversation_id: room_id(payload)?,
            }),
            PushEventName::ConversationLeft => Ok(InboundEvent::ConversationLeft {
                conversation_id: room_id(payload)?,
            }),
            PushEventName::StateSynced => {
                let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;
                let entries = match field(object, &["conversations"]) {
                    None => Vec::new(),
                    Some(Value::Array(entries)) => entries.clone(),
                    Some(_) => {
                        return Err(ValidationError::WrongType {
                            field: "conversations",
                            expected: "an array",
                        })
                    }
                };
                let conversations = entries
                    .into_iter()
                    .filter_map(|entry| match conversation_patch(entry) {
                        Ok(patch) => Some(patch),
                        Err(err) => {
                            warn!(error = %err, "ingest: skipping invalid conversation in state sync");
                            None
                        }
                    })
                    .collect();
                Ok(InboundEvent::StateSynced { conversations })
            }
            PushEventName::ConversationEvent => {
                let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;
                let conversation_id =
                    conversation_id_field(field(object, &["conversationId", "conversation_id"]))?;
                let kind = string_field("event", field(object, &["event", "type"]))?;
                let mut data = match field(object, &["data", "changes"]) {
                    None => Map::new(),
                    Some(Value::Object(data)) => data.clone(),
                    Some(_) => {
                        return Err(ValidationError::WrongType {
                            field: "data",
                            expected: "an object",
                        })
                    }
                };
                data.insert("id".into(), Value::String(conversation_id.to_string()));
                Ok(InboundEvent::ConversationEvent {
                    kind,
                    patch: conversation_patch(Value::Object(data))?,
                })
            }
            PushEventName::WebhookConversationCreated => {
                let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;
                let mut data = match object.get("conversation") {
                    Some(Value::Object(inner)) => inner.clone(),
                    _ => object.clone(),
                };
                if field(&data, &["id"]).is_none() {
                    let id = field(&data, &["conversationId"])
                        .or_else(|| field(object, &["conversationId"]))
                        .cloned()
                        .ok_or(ValidationError::MissingField("conversationId"))?;
                    data.insert("id".into(), id);
                }
                Ok(InboundEvent::WebhookConversationCreated(conversation_patch(
                    Value::Object(data),
                )?))
            }
        }
    }

    pub fn ingest(
        &self,
        store: &mut ConversationStore,
        name: PushEventName,
        payload: &Value,
    ) -> Result<IngestReport, ValidationError> {
        let event = self.parse(name, payload).map_err(|err| {
            warn!(event = %name, error = %err, "ingest: dropping invalid payload");
            err
        })?;
        Ok(self.apply_event(store, event))
    }

    pub fn apply_event(&self, store: &mut ConversationStore, event: InboundEvent) -> IngestReport {
        match event {
            InboundEvent::NewMessage(incoming) => {
                self.apply_incoming(store, incoming, IngestSource::Socket)
            }
            InboundEvent::WebhookNewMessage(incoming) => {
                self.apply_incoming(store, incoming, IngestSource::Webhook)
            }
            InboundEvent::MessageRead {
                conversation_id,
                message_ids,
            } => {
                let updated = message_ids
                    .into_iter()
                    .filter(|message_id| {
                        store.update_message(
                            &conversation_id,
                            message_id,
                            MessagePatch::status(MessageStatus::Read),
                        )
                    })
                    .collect();
                IngestReport::MessagesRead {
                    conversation_id,
                    updated,
                }
            }
            InboundEvent::ConversationJoined { conversation_id } => {
                IngestReport::Joined(conversation_id)
            }
            InboundEvent::ConversationLeft { conversation_id } => {
                IngestReport::Left(conversation_id)
            }
            InboundEvent::StateSynced { conversations } => IngestReport::Synced(
                conversations
                    .into_iter()
                    .map(|patch| {
                        let outcome = store.upsert(patch.clone());
                        (patch, outcome)
                    })
                    .collect(),
            ),
            InboundEvent::ConversationEvent { kind, patch } => {
                debug!(event = %kind, conversation_id = %patch.id, "ingest: conversation event");
                let outcome = store.upsert(patch.clone());
                IngestReport::ConversationChanged {
                    kind: Some(kind),
                    patch,
                    outcome,
                }
            }
            InboundEvent::WebhookConversationCreated(patch) => {
                let outcome = store.upsert(patch.clone());
                IngestReport::ConversationChanged {
                    kind: None,
                    patch,
                    outcome,
                }
            }
        }
    }

    fn apply_incoming(
        &self,
        store: &mut ConversationStore,
        incoming: IncomingMessage,
        source: IngestSource,
    ) -> IngestReport {
        let customer_name = incoming.customer_name.clone();
        let message = self.transform(incoming, source);

        let outcome = self.apply(store, message.clone());
        if message.direction == MessageDirection::Inbound {
            if let Some(name) = customer_name {
                let needs_name = store
                    .conversation(&message.conversation_id)
                    .is_some_and(|conversation| conversation.needs_contact_data);
                if needs_name {
                    let mut patch = ConversationPatch::new(message.conversation_id.clone());
                    patch.customer_name = Some(name);
                    store.upsert(patch);
                }
            }
        }
        if outcome == ApplyOutcome::Duplicate {
            debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                "ingest: message already present"
            );
        }
        IngestReport::Message { message, outcome }
    }
}

fn same_phone(left: &str, right: &str) -> bool {
    left.trim().trim_start_matches('+') == right.trim().trim_start_matches('+')
}

fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find(|value| !value.is_null())
}

fn string_field(name: &'static str, value: Option<&Value>) -> Result<String, ValidationError> {
    match value {
        None => Err(ValidationError::MissingField(name)),
        Some(Value::String(text)) if text.trim().is_empty() => {
            Err(ValidationError::MissingField(name))
        }
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(ValidationError::WrongType {
            field: name,
            expected: "a string",
        }),
    }
}

fn optional_string(
    name: &'static str,
    value: Option<&Value>,
) -> Result<Option<String>, ValidationError> {
    match value {
        None => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ValidationError::WrongType {
            field: name,
            expected: "a string",
        }),
    }
}

fn id_field(name: &'static str, value: Option<&Value>) -> Result<MessageId, ValidationError> {
    match value {
        Some(Value::Number(number)) => Ok(MessageId(number.to_string())),
        other => string_field(name, other).map(MessageId),
    }
}

fn conversation_id_field(value: Option<&Value>) -> Result<ConversationId, ValidationError> {
    let raw = string_field("conversationId", value)?;
    Ok(canonicalize(&raw)?)
}

fn room_id(payload: &Value) -> Result<ConversationId, ValidationError> {
    match payload {
        Value::String(raw) => Ok(canonicalize(raw)?),
        Value::Object(object) => {
            conversation_id_field(field(object, &["conversationId", "conversation_id", "room"]))
        }
        _ => Err(ValidationError::NotAnObject),
    }
}

/// RFC 3339, or unix epoch in ms above 1e11 and seconds otherwise.
fn timestamp_field(
    name: &'static str,
    value: Option<&Value>,
) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |value: &Value| ValidationError::InvalidTimestamp {
        field: name,
        value: value.to_string(),
    };
    let Some(value) = value else {
        return Err(ValidationError::MissingField(name));
    };
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|_| invalid(value)),
        Value::Number(number) => {
            let epoch = number.as_i64().ok_or_else(|| invalid(value))?;
            let parsed = if epoch.abs() > 100_000_000_000 {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            };
            parsed.ok_or_else(|| invalid(value))
        }
        _ => Err(ValidationError::WrongType {
            field: name,
            expected: "a string or number",
        }),
    }
}

fn conversation_patch(value: Value) -> Result<ConversationPatch, ValidationError> {
    if let Some(raw) = value.get("id").and_then(Value::as_str) {
        canonicalize(raw)?;
    }
    serde_json::from_value(value).map_err(|err| ValidationError::Malformed {
        field: "conversation",
        reason: err.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
