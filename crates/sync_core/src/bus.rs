use std::time::Duration;

use shared::{
    domain::{MessageId, TabId},
    protocol::{PushEventName, Visibility},
    ConversationId,
};
use tokio::sync::broadcast;

use crate::{store::UpsertOutcome, transport::ConnectionSignal};

/// Topics published by a [`crate::SyncClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConversationChanged {
        conversation_id: ConversationId,
        outcome: UpsertOutcome,
    },
    MessageAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageAcknowledged {
        conversation_id: ConversationId,
        local_id: MessageId,
        message_id: MessageId,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread: u32,
    },
    ActiveChanged(Option<ConversationId>),
    RateLimited {
        retry_after: Duration,
    },
    PayloadRejected {
        event: PushEventName,
        reason: String,
    },
    RoomJoined(ConversationId),
    RoomLeft(ConversationId),
    Presence {
        tab_id: TabId,
        visibility: Option<Visibility>,
    },
    Connection(ConnectionSignal),
    InitialSyncCompleted {
        conversations: usize,
    },
    Teardown,
}

#[derive(Debug, Clone)]
pub struct SyncBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for SyncBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
