use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    domain::{ConversationPatch, MessageId, TabId},
    protocol::{BroadcastEnvelope, BroadcastPayload, Visibility},
    ConversationId,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{last_message_patch, AddOutcome, ConversationStore, UpsertOutcome};

pub trait TabChannel: Send + Sync {
    fn publish(&self, envelope: BroadcastEnvelope);
    fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope>;
}

/// In-process channel shared by every tab of one origin.
#[derive(Debug, Clone)]
pub struct LocalTabHub {
    origin: String,
    sender: broadcast::Sender<BroadcastEnvelope>,
}

impl LocalTabHub {
    pub fn new(origin: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            origin: origin.into(),
            sender,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl TabChannel for LocalTabHub {
    fn publish(&self, envelope: BroadcastEnvelope) {
        let _ = self.sender.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaleBroadcast {
    #[error("tab {0} already closed")]
    ClosedTab(TabId),
    #[error("broadcast from tab {tab} is {age_ms} ms old")]
    Expired { tab: TabId, age_ms: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    OwnOrigin,
    Conversation {
        conversation_id: ConversationId,
        outcome: UpsertOutcome,
    },
    MessageAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
        added: bool,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        changed: bool,
    },
    MessageAcknowledged {
        conversation_id: ConversationId,
        local_id: MessageId,
        message_id: MessageId,
        changed: bool,
    },
    Read {
        conversation_id: ConversationId,
        newly_read: Vec<MessageId>,
    },
    Presence {
        tab_id: TabId,
        visibility: Visibility,
    },
    TabClosed(TabId),
}

/// Least recently heard tabs are forgotten first.
pub const MAX_TRACKED_TABS: usize = 64;

pub struct CrossTabBroadcaster {
    tab_id: TabId,
    channel: Arc<dyn TabChannel>,
    max_age: ChronoDuration,
    // Closed tab -> when it said goodbye. Anything it sent before then
    // expires on age once the entry is pruned.
    closed_tabs: HashMap<TabId, DateTime<Utc>>,
    presence: HashMap<TabId, (Visibility, DateTime<Utc>)>,
}

impl CrossTabBroadcaster {
    pub fn new(tab_id: TabId, channel: Arc<dyn TabChannel>, max_age: Duration) -> Self {
        Self {
            tab_id,
            channel,
            max_age: ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX),
            closed_tabs: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope> {
        self.channel.subscribe()
    }

    pub fn broadcast(&self, payload: BroadcastPayload) -> BroadcastEnvelope {
        let envelope = BroadcastEnvelope::new(self.tab_id.clone(), payload);
        self.channel.publish(envelope.clone());
        envelope
    }

    pub fn visibility(&self, tab_id: &TabId) -> Option<Visibility> {
        self.presence.get(tab_id).map(|(visibility, _)| *visibility)
    }

    pub fn tracked_tabs(&self) -> usize {
        self.presence.len()
    }

    pub fn closed_tabs(&self) -> usize {
        self.closed_tabs.len()
    }

    pub fn receive(
        &mut self,
        store: &mut ConversationStore,
        envelope: BroadcastEnvelope,
    ) -> Result<MergeOutcome, StaleBroadcast> {
        self.receive_at(store, envelope, Utc::now())
    }

    pub fn receive_at(
        &mut self,
        store: &mut ConversationStore,
        envelope: BroadcastEnvelope,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, StaleBroadcast> {
        if envelope.origin_tab_id == self.tab_id {
            return Ok(MergeOutcome::OwnOrigin);
        }
        self.prune_closed(now);
        if let Err(stale) = self.check_fresh(&envelope, now) {
            debug!(
                tab_id = %envelope.origin_tab_id,
                reason = %stale,
                "tab_sync: ignoring stale broadcast"
            );
            return Err(stale);
        }

        let tab_id = envelope.origin_tab_id;
        let sent_at = envelope.timestamp;
        let outcome = match envelope.payload {
            BroadcastPayload::Focus => self.record_presence(tab_id, Visibility::Visible, sent_at),
            BroadcastPayload::Blur => self.record_presence(tab_id, Visibility::Hidden, sent_at),
            BroadcastPayload::TabClosed => {
                self.presence.remove(&tab_id);
                self.closed_tabs.insert(tab_id.clone(), sent_at);
                MergeOutcome::TabClosed(tab_id)
            }
            BroadcastPayload::ConversationUpserted(patch) => {
                let conversation_id = patch.id.clone();
                MergeOutcome::Conversation {
                    conversation_id,
                    outcome: store.upsert(patch),
                }
            }
            BroadcastPayload::MessageAdded {
                conversation_id,
                message,
            } => {
                let message_id = message.id.clone();
                let summary = last_message_patch(&message);
                let added = store.add_message(&conversation_id, message) == AddOutcome::Added;
                if added {
                    store.upsert(summary);
                }
                MergeOutcome::MessageAdded {
                    conversation_id,
                    message_id,
                    added,
                }
            }
            BroadcastPayload::MessageUpdated {
                conversation_id,
                message_id,
                patch,
            } => {
                let changed = store.update_message(&conversation_id, &message_id, patch);
                MergeOutcome::MessageUpdated {
                    conversation_id,
                    message_id,
                    changed,
                }
            }
            BroadcastPayload::MessageAcknowledged {
                conversation_id,
                local_id,
                message,
            } => {
                let message_id = message.id.clone();
                let summary = last_message_patch(&message);
                let changed = store.acknowledge(&conversation_id, &local_id, message);
                store.upsert(summary);
                MergeOutcome::MessageAcknowledged {
                    conversation_id,
                    local_id,
                    message_id,
                    changed,
                }
            }
            BroadcastPayload::ConversationRead {
                conversation_id,
                read_through,
            } => {
                store.upsert(ConversationPatch::new(conversation_id.clone()));
                let newly_read = store.apply_read_through(&conversation_id, read_through);
                MergeOutcome::Read {
                    conversation_id,
                    newly_read,
                }
            }
        };
        Ok(outcome)
    }

    fn check_fresh(
        &self,
        envelope: &BroadcastEnvelope,
        now: DateTime<Utc>,
    ) -> Result<(), StaleBroadcast> {
        if self.closed_tabs.contains_key(&envelope.origin_tab_id) {
            return Err(StaleBroadcast::ClosedTab(envelope.origin_tab_id.clone()));
        }
        let age = now.signed_duration_since(envelope.timestamp);
        if age > self.max_age {
            return Err(StaleBroadcast::Expired {
                tab: envelope.origin_tab_id.clone(),
                age_ms: age.num_milliseconds(),
            });
        }
        Ok(())
    }

    fn prune_closed(&mut self, now: DateTime<Utc>) {
        let max_age = self.max_age;
        self.closed_tabs
            .retain(|_, closed_at| now.signed_duration_since(*closed_at) <= max_age);
    }

    fn record_presence(
        &mut self,
        tab_id: TabId,
        visibility: Visibility,
        seen_at: DateTime<Utc>,
    ) -> MergeOutcome {
        if !self.presence.contains_key(&tab_id) && self.presence.len() >= MAX_TRACKED_TABS {
            let quietest = self
                .presence
                .iter()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(tab, _)| tab.clone());
            if let Some(quietest) = quietest {
                debug!(tab_id = %quietest, "tab_sync: forgetting quietest tab");
                self.presence.remove(&quietest);
            }
        }
        self.presence.insert(tab_id.clone(), (visibility, seen_at));
        MergeOutcome::Presence { tab_id, visibility }
    }
}

#[cfg(test)]
#[path = "tests/tab_sync_tests.rs"]
mod tests;
