use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Map, Value};
use shared::{
    conversation_id::decode_from_transport,
    domain::{
        ConversationPatch, Message, MessageDirection, MessageId, MessageKind, MessagePatch,
        MessageStatus, TabId, CLIENT_MESSAGE_ID_KEY,
    },
    protocol::{BroadcastEnvelope, BroadcastPayload, OutboundEvent, PushEventName, Visibility},
    ConversationId, InvalidFormat,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

pub mod bus;
pub mod config;
pub mod ingest;
pub mod lifecycle;
pub mod rate_limit;
pub mod rest;
pub mod store;
pub mod tab_sync;
pub mod transport;

pub use bus::{SyncBus, SyncEvent};
pub use config::{load_settings, SyncSettings};
pub use ingest::{ApplyOutcome, IngestReport, MessageIngestPipeline, ValidationError};
pub use lifecycle::{HandlerTable, Registration, SyncLifecycleManager, SyncPhase};
pub use rate_limit::{OutboundRateLimiter, RateLimited};
pub use rest::{ConversationApi, HttpConversationApi, MissingConversationApi, Page, PageRequest};
pub use store::{last_message_patch, AddOutcome, ConversationStore, UpsertOutcome};
pub use tab_sync::{CrossTabBroadcaster, LocalTabHub, MergeOutcome, StaleBroadcast, TabChannel};
pub use transport::{
    ConnectionSignal, EventHandler, LoopbackTransport, PushTransport, TransportError,
    WsPushTransport,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error(transparent)]
    InvalidConversationId(#[from] InvalidFormat),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("outbox is full ({0} queued)")]
    OutboxFull(usize),
    #[error("sync client is closed")]
    Closed,
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Per-tab composition root; all state changes go through the store it owns.
pub struct SyncClient {
    settings: SyncSettings,
    tab_id: TabId,
    own_phone: Option<String>,
    store: RwLock<ConversationStore>,
    pipeline: MessageIngestPipeline,
    lifecycle: Arc<SyncLifecycleManager>,
    limiter: Mutex<OutboundRateLimiter>,
    broadcaster: Mutex<CrossTabBroadcaster>,
    transport: Arc<dyn PushTransport>,
    api: Arc<dyn ConversationApi>,
    bus: SyncBus,
    outbox: Mutex<VecDeque<OutboundEvent>>,
    joined_rooms: Mutex<JoinedRooms>,
    closed: AtomicBool,
}

/// Rooms joined since teardown number `epoch`.
#[derive(Default)]
struct JoinedRooms {
    epoch: usize,
    rooms: HashSet<ConversationId>,
}

impl SyncClient {
    pub fn new(
        settings: SyncSettings,
        transport: Arc<dyn PushTransport>,
        api: Arc<dyn ConversationApi>,
        channel: Arc<dyn TabChannel>,
    ) -> Arc<Self> {
        Self::with_tab_id(settings, TabId::generate(), transport, api, channel)
    }

    pub fn with_tab_id(
        settings: SyncSettings,
        tab_id: TabId,
        transport: Arc<dyn PushTransport>,
        api: Arc<dyn ConversationApi>,
        channel: Arc<dyn TabChannel>,
    ) -> Arc<Self> {
        let own_phone = settings.business_phone.clone();
        let bus = SyncBus::default();
        let lifecycle = SyncLifecycleManager::new(
            settings.stability_delay(),
            settings.resync_window(),
            bus.clone(),
        );
        let limiter = OutboundRateLimiter::new(
            settings.rate_limit_max_requests,
            settings.rate_limit_window(),
        );
        let broadcaster =
            CrossTabBroadcaster::new(tab_id.clone(), channel, settings.broadcast_max_age());

        Arc::new(Self {
            tab_id,
            store: RwLock::new(ConversationStore::new(own_phone.clone())),
            pipeline: MessageIngestPipeline::new(own_phone.clone()),
            own_phone,
            lifecycle,
            limiter: Mutex::new(limiter),
            broadcaster: Mutex::new(broadcaster),
            transport,
            api,
            bus,
            outbox: Mutex::new(VecDeque::new()),
            joined_rooms: Mutex::new(JoinedRooms::default()),
            closed: AtomicBool::new(false),
            settings,
        })
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe()
    }

    pub fn lifecycle(&self) -> &Arc<SyncLifecycleManager> {
        &self.lifecycle
    }

    pub async fn snapshot(&self) -> ConversationStore {
        self.store.read().await.clone()
    }

    pub async fn read<R>(&self, query: impl FnOnce(&ConversationStore) -> R) -> R {
        query(&*self.store.read().await)
    }

    pub async fn joined_rooms(&self) -> HashSet<ConversationId> {
        self.current_rooms().await.rooms.clone()
    }

    async fn current_rooms(&self) -> MutexGuard<'_, JoinedRooms> {
        let mut joined = self.joined_rooms.lock().await;
        let epoch = self.lifecycle.teardown_count();
        if joined.epoch != epoch {
            if !joined.rooms.is_empty() {
                debug!(
                    rooms = joined.rooms.len(),
                    "sync: forgetting rooms joined before teardown"
                );
            }
            joined.rooms.clear();
            joined.epoch = epoch;
        }
        joined
    }

    pub async fn outbox_len(&self) -> usize {
        self.outbox.lock().await.len()
    }

    pub async fn attach(self: &Arc<Self>) -> Result<Registration, SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        self.lifecycle.register_instance().await;
        if self.lifecycle.claim_background().await {
            self.spawn_background().await;
        }
        Ok(self.register_listeners().await)
    }

    /// Returns whether this call tore the session down.
    pub async fn detach(&self) -> bool {
        self.lifecycle.unregister_instance().await
    }

    async fn register_listeners(self: &Arc<Self>) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel::<(PushEventName, Value)>();
        let handlers: HandlerTable = PushEventName::ALL
            .into_iter()
            .map(|event| {
                let tx = tx.clone();
                let handler: EventHandler = Arc::new(move |payload: Value| {
                    let _ = tx.send((event, payload));
                });
                (event, handler)
            })
            .collect();

        let registration = self
            .lifecycle
            .request_listener_registration(Arc::clone(&self.transport), handlers)
            .await;
        if let Registration::Bound(_) = registration {
            let client = Arc::downgrade(self);
            let pump = tokio::spawn(pump_push_events(client, rx));
            self.lifecycle.adopt_task(pump).await;
        }
        registration
    }

    async fn spawn_background(self: &Arc<Self>) {
        let mut signals = self.transport.subscribe_connection();
        let client = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: connection signals lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(client) = client.upgrade() else { break };
                client.bus.publish(SyncEvent::Connection(signal));
                if signal != ConnectionSignal::Disconnected {
                    client.on_transport_reconnected().await;
                }
            }
        });

        let mut envelopes = BroadcastStream::new(self.broadcaster.lock().await.subscribe());
        let client = Arc::downgrade(self);
        let receiver = tokio::spawn(async move {
            while let Some(item) = envelopes.next().await {
                match item {
                    Ok(envelope) => {
                        let Some(client) = client.upgrade() else { break };
                        client.handle_broadcast(envelope).await;
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: cross-tab broadcasts lagged");
                    }
                }
            }
        });

        self.lifecycle.adopt_task(watcher).await;
        self.lifecycle.adopt_task(receiver).await;
    }

    pub async fn on_transport_reconnected(self: &Arc<Self>) {
        if self.lifecycle.active_instances().await > 0 {
            let registration = self.register_listeners().await;
            debug!(?registration, "sync: listener registration after reconnect");
        }
        let flushed = self.flush_outbox().await;
        if flushed > 0 {
            info!(flushed, "sync: outbox flushed");
        }
        if let Err(err) = self.resync().await {
            warn!(error = %err, "sync: resync after reconnect failed");
        }
    }

    pub async fn handle_push(&self, event: PushEventName, payload: Value) -> Option<IngestReport> {
        let result = {
            let mut store = self.store.write().await;
            self.pipeline.ingest(&mut store, event, &payload)
        };
        match result {
            Ok(report) => {
                self.publish_report(&report).await;
                Some(report)
            }
            Err(err) => {
                self.bus.publish(SyncEvent::PayloadRejected {
                    event,
                    reason: err.to_string(),
                });
                None
            }
        }
    }

    async fn publish_report(&self, report: &IngestReport) {
        match report {
            IngestReport::Message { message, outcome } => {
                let conversation_id = message.conversation_id.clone();
                let payload = match outcome {
                    ApplyOutcome::Duplicate => return,
                    ApplyOutcome::Added => {
                        self.bus.publish(SyncEvent::MessageAdded {
                            conversation_id: conversation_id.clone(),
                            message_id: message.id.clone(),
                        });
                        BroadcastPayload::MessageAdded {
                            conversation_id: conversation_id.clone(),
                            message: message.clone(),
                        }
                    }
                    ApplyOutcome::Acknowledged { local_id } => {
                        self.bus.publish(SyncEvent::MessageAcknowledged {
                            conversation_id: conversation_id.clone(),
                            local_id: local_id.clone(),
                            message_id: message.id.clone(),
                        });
                        BroadcastPayload::MessageAcknowledged {
                            conversation_id: conversation_id.clone(),
                            local_id: local_id.clone(),
                            message: message.clone(),
                        }
                    }
                };
                self.broadcast(payload).await;
                self.publish_unread(&conversation_id).await;
            }
            IngestReport::MessagesRead {
                conversation_id,
                updated,
            } => {
                for message_id in updated {
                    self.bus.publish(SyncEvent::MessageUpdated {
                        conversation_id: conversation_id.clone(),
                        message_id: message_id.clone(),
                    });
                    self.broadcast(BroadcastPayload::MessageUpdated {
                        conversation_id: conversation_id.clone(),
                        message_id: message_id.clone(),
                        patch: MessagePatch::status(MessageStatus::Read),
                    })
                    .await;
                }
                if !updated.is_empty() {
                    self.publish_unread(conversation_id).await;
                }
            }
            IngestReport::Joined(conversation_id) => {
                self.current_rooms().await.rooms.insert(conversation_id.clone());
                self.bus.publish(SyncEvent::RoomJoined(conversation_id.clone()));
            }
            IngestReport::Left(conversation_id) => {
                self.current_rooms().await.rooms.remove(conversation_id);
                self.bus.publish(SyncEvent::RoomLeft(conversation_id.clone()));
            }
            IngestReport::Synced(entries) => {
                for (patch, outcome) in entries {
                    self.publish_conversation(patch, *outcome).await;
                }
                if !self.lifecycle.initial_sync_done().await {
                    self.lifecycle.mark_initial_sync_done().await;
                    let conversations = self.store.read().await.len();
                    info!(conversations, "sync: initial state synced");
                    self.bus
                        .publish(SyncEvent::InitialSyncCompleted { conversations });
                }
            }
            IngestReport::ConversationChanged { patch, outcome, .. } => {
                self.publish_conversation(patch, *outcome).await;
            }
        }
    }

    async fn publish_conversation(&self, patch: &ConversationPatch, outcome: UpsertOutcome) {
        if !outcome.changed() {
            return;
        }
        self.bus.publish(SyncEvent::ConversationChanged {
            conversation_id: patch.id.clone(),
            outcome,
        });
        self.broadcast(BroadcastPayload::ConversationUpserted(patch.clone()))
            .await;
    }

    async fn publish_unread(&self, conversation_id: &ConversationId) {
        let unread = self.store.read().await.compute_unread_count(conversation_id);
        self.bus.publish(SyncEvent::UnreadChanged {
            conversation_id: conversation_id.clone(),
            unread,
        });
    }

    async fn broadcast(&self, payload: BroadcastPayload) -> BroadcastEnvelope {
        self.broadcaster.lock().await.broadcast(payload)
    }

    pub async fn handle_broadcast(&self, envelope: BroadcastEnvelope) -> Option<MergeOutcome> {
        let result = {
            let mut store = self.store.write().await;
            let mut broadcaster = self.broadcaster.lock().await;
            broadcaster.receive(&mut store, envelope)
        };
        let outcome = result.ok()?;

        match &outcome {
            MergeOutcome::OwnOrigin => {}
            MergeOutcome::Conversation {
                conversation_id,
                outcome,
            } => {
                if outcome.changed() {
                    self.bus.publish(SyncEvent::ConversationChanged {
                        conversation_id: conversation_id.clone(),
                        outcome: *outcome,
                    });
                }
            }
            MergeOutcome::MessageAdded {
                conversation_id,
                message_id,
                added,
            } => {
                if *added {
                    self.bus.publish(SyncEvent::MessageAdded {
                        conversation_id: conversation_id.clone(),
                        message_id: message_id.clone(),
                    });
                    self.publish_unread(conversation_id).await;
                }
            }
            MergeOutcome::MessageUpdated {
                conversation_id,
                message_id,
                changed,
            } => {
                if *changed {
                    self.bus.publish(SyncEvent::MessageUpdated {
                        conversation_id: conversation_id.clone(),
                        message_id: message_id.clone(),
                    });
                    self.publish_unread(conversation_id).await;
                }
            }
            MergeOutcome::MessageAcknowledged {
                conversation_id,
                local_id,
                message_id,
                changed,
            } => {
                if *changed {
                    self.bus.publish(SyncEvent::MessageAcknowledged {
                        conversation_id: conversation_id.clone(),
                        local_id: local_id.clone(),
                        message_id: message_id.clone(),
                    });
                }
            }
            MergeOutcome::Read {
                conversation_id, ..
            } => self.publish_unread(conversation_id).await,
            MergeOutcome::Presence { tab_id, visibility } => {
                self.bus.publish(SyncEvent::Presence {
                    tab_id: tab_id.clone(),
                    visibility: Some(*visibility),
                });
            }
            MergeOutcome::TabClosed(tab_id) => {
                self.bus.publish(SyncEvent::Presence {
                    tab_id: tab_id.clone(),
                    visibility: None,
                });
            }
        }
        Some(outcome)
    }

    pub async fn load_conversations(&self) -> Result<usize, SyncError> {
        let mut page = PageRequest::first(self.settings.page_size);
        let mut applied = 0;

        for _ in 0..self.settings.max_seed_pages.max(1) {
            let result = self
                .api
                .list_conversations(page)
                .await
                .with_context(|| format!("failed to load conversations page {}", page.page))?;

            let mut changed = Vec::new();
            {
                let mut store = self.store.write().await;
                for conversation in result.items {
                    let patch = ConversationPatch::from(conversation);
                    let conversation_id = patch.id.clone();
                    let outcome = store.upsert(patch);
                    if outcome.changed() {
                        changed.push((conversation_id, outcome));
                    }
                    applied += 1;
                }
            }
            for (conversation_id, outcome) in changed {
                self.bus.publish(SyncEvent::ConversationChanged {
                    conversation_id,
                    outcome,
                });
            }

            if !result.has_more {
                break;
            }
            page = page.next();
        }

        info!(applied, "sync: conversations loaded");
        Ok(applied)
    }

    pub async fn load_messages(&self, conversation_id: &ConversationId) -> Result<usize, SyncError> {
        let mut page = PageRequest::first(self.settings.page_size);
        let mut added = Vec::new();

        for _ in 0..self.settings.max_seed_pages.max(1) {
            let result = self
                .api
                .list_messages(conversation_id, page)
                .await
                .with_context(|| format!("failed to load messages for {conversation_id}"))?;
            {
                let mut store = self.store.write().await;
                for message in result.items {
                    let summary = last_message_patch(&message);
                    let message_id = message.id.clone();
                    if store.add_message(conversation_id, message) == AddOutcome::Added {
                        store.upsert(summary);
                        added.push(message_id);
                    }
                }
            }
            if !result.has_more {
                break;
            }
            page = page.next();
        }

        for message_id in &added {
            self.bus.publish(SyncEvent::MessageAdded {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
            });
        }
        self.publish_unread(conversation_id).await;
        debug!(conversation_id = %conversation_id, added = added.len(), "sync: messages loaded");
        Ok(added.len())
    }

    /// Full reload, collapsed to one call per resync window. Returns whether
    /// a reload actually ran.
    pub async fn resync(&self) -> Result<bool, SyncError> {
        if !self.lifecycle.can_sync().await {
            return Ok(false);
        }
        self.load_conversations().await?;
        Ok(true)
    }

    /// A refused emission marks the optimistic message failed.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let local_id = MessageId::local();
        let mut metadata = Map::new();
        metadata.insert("source".into(), Value::String("local".into()));
        metadata.insert(
            CLIENT_MESSAGE_ID_KEY.into(),
            Value::String(local_id.0.clone()),
        );
        let mut message = Message {
            id: local_id.clone(),
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            direction: MessageDirection::Outbound,
            kind,
            status: MessageStatus::Sent,
            sender: self.own_phone.clone().unwrap_or_default(),
            recipient: Some(
                conversation_id
                    .counterpart(self.own_phone.as_deref())
                    .to_string(),
            ),
            created_at: Utc::now(),
            updated_at: None,
            metadata,
        };

        {
            let mut store = self.store.write().await;
            store.add_message(conversation_id, message.clone());
            store.upsert(last_message_patch(&message));
        }
        self.bus.publish(SyncEvent::MessageAdded {
            conversation_id: conversation_id.clone(),
            message_id: local_id.clone(),
        });
        self.broadcast(BroadcastPayload::MessageAdded {
            conversation_id: conversation_id.clone(),
            message: message.clone(),
        })
        .await;

        let accepted = self.limiter.lock().await.make_request(|| OutboundEvent::NewMessage {
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            kind,
            client_message_id: local_id.clone(),
        });
        let error = match accepted {
            Ok(event) => match self.emit_or_queue(event).await {
                Ok(()) => return Ok(message),
                Err(err) => err,
            },
            Err(limited) => {
                self.bus.publish(SyncEvent::RateLimited {
                    retry_after: limited.retry_after,
                });
                limited.into()
            }
        };

        let patch = MessagePatch::status(MessageStatus::Failed);
        self.store
            .write()
            .await
            .update_message(conversation_id, &local_id, patch.clone());
        message.status = MessageStatus::Failed;
        self.bus.publish(SyncEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message_id: local_id.clone(),
        });
        self.broadcast(BroadcastPayload::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message_id: local_id,
            patch,
        })
        .await;
        Err(error)
    }

    /// The only path that zeroes unread state.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageId>, SyncError> {
        let (has_unread, will_emit) = {
            let store = self.store.read().await;
            let will_emit = store
                .messages(conversation_id)
                .iter()
                .any(Message::is_unread_inbound);
            (store.compute_unread_count(conversation_id) > 0, will_emit)
        };
        if !has_unread {
            return Ok(Vec::new());
        }

        // Only a mark-read emission costs a slot.
        if will_emit {
            if let Err(limited) = self.limiter.lock().await.try_acquire() {
                self.bus.publish(SyncEvent::RateLimited {
                    retry_after: limited.retry_after,
                });
                return Err(limited.into());
            }
        }

        let (newly_read, read_through) = {
            let mut store = self.store.write().await;
            let newly_read = store.mark_read(conversation_id);
            (newly_read, store.read_through(conversation_id))
        };
        self.publish_unread(conversation_id).await;
        self.broadcast(BroadcastPayload::ConversationRead {
            conversation_id: conversation_id.clone(),
            read_through,
        })
        .await;

        if !newly_read.is_empty() {
            let emitted = self
                .emit_or_queue(OutboundEvent::MarkRead {
                    conversation_id: conversation_id.clone(),
                    message_ids: newly_read.clone(),
                })
                .await;
            if let Err(err) = emitted {
                // Local read state stands; the server catches up on resync.
                warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "sync: read receipt not queued"
                );
            }
        }
        Ok(newly_read)
    }

    pub async fn set_active(&self, conversation_id: Option<ConversationId>) -> bool {
        let changed = self.store.write().await.set_active(conversation_id.clone());
        if changed {
            self.bus.publish(SyncEvent::ActiveChanged(conversation_id));
        }
        changed
    }

    pub async fn open_conversation(&self, raw: &str) -> Result<ConversationId, SyncError> {
        let conversation_id = decode_from_transport(raw)?;
        self.set_active(Some(conversation_id.clone())).await;
        Ok(conversation_id)
    }

    /// Local first; a failed request keeps the local change.
    pub async fn update_conversation(
        &self,
        patch: ConversationPatch,
    ) -> Result<UpsertOutcome, SyncError> {
        let conversation_id = patch.id.clone();
        let outcome = self.store.write().await.upsert(patch.clone());
        self.publish_conversation(&patch, outcome).await;

        match self.api.update_conversation(&conversation_id, &patch).await {
            Ok(record) => {
                let confirmed = ConversationPatch::from(record);
                let server_outcome = self.store.write().await.upsert(confirmed.clone());
                self.publish_conversation(&confirmed, server_outcome).await;
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "sync: conversation update failed; keeping local change"
                );
                Err(err.into())
            }
        }
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> bool {
        let payload = match visibility {
            Visibility::Visible => BroadcastPayload::Focus,
            Visibility::Hidden => BroadcastPayload::Blur,
        };
        self.broadcast(payload).await;

        if visibility != Visibility::Visible {
            return false;
        }
        match self.resync().await {
            Ok(ran) => ran,
            Err(err) => {
                warn!(error = %err, "sync: resync on focus failed");
                false
            }
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broadcast(BroadcastPayload::TabClosed).await;
        self.lifecycle.shutdown().await;
        info!(tab_id = %self.tab_id, "sync: tab closed");
    }

    async fn emit_or_queue(&self, event: OutboundEvent) -> Result<(), SyncError> {
        let mut outbox = self.outbox.lock().await;
        if outbox.is_empty() {
            match self.transport.emit(&event).await {
                Ok(()) => return Ok(()),
                Err(TransportError::Unavailable) => {}
                Err(err) => {
                    warn!(event = event.name(), error = %err, "sync: dropping outbound event");
                    return Ok(());
                }
            }
        }
        if outbox.len() >= self.settings.max_outbox {
            warn!(
                event = event.name(),
                queued = outbox.len(),
                "sync: outbox full, refusing outbound event"
            );
            return Err(SyncError::OutboxFull(outbox.len()));
        }
        info!(
            event = event.name(),
            queued = outbox.len() + 1,
            "sync: transport unavailable, queueing"
        );
        outbox.push_back(event);
        Ok(())
    }

    pub async fn flush_outbox(&self) -> usize {
        let mut outbox = self.outbox.lock().await;
        let mut sent = 0;
        while let Some(event) = outbox.front() {
            match self.transport.emit(event).await {
                Ok(()) => sent += 1,
                Err(TransportError::Unavailable) => break,
                Err(err) => {
                    warn!(event = event.name(), error = %err, "sync: dropping outbound event");
                }
            }
            outbox.pop_front();
        }
        sent
    }
}

async fn pump_push_events(
    client: Weak<SyncClient>,
    mut events: mpsc::UnboundedReceiver<(PushEventName, Value)>,
) {
    while let Some((event, payload)) = events.recv().await {
        let Some(client) = client.upgrade() else { break };
        client.handle_push(event, payload).await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
