//! Reference-counted push-handler registration and resync pacing.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use shared::protocol::PushEventName;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    bus::{SyncBus, SyncEvent},
    transport::{EventHandler, PushTransport},
};

pub type HandlerTable = BTreeMap<PushEventName, EventHandler>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Initializing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Bound(usize),
    AlreadyBound,
    /// The transport was disconnected; retry on its reconnect signal.
    Deferred,
}

struct SyncState {
    phase: SyncPhase,
    listeners_registered: bool,
    initial_sync_done: bool,
    active_instances: usize,
    last_sync: Option<Instant>,
    background_claimed: bool,
    generation: u64,
    stability_timer: Option<JoinHandle<()>>,
    bound: Vec<PushEventName>,
    transport: Option<Arc<dyn PushTransport>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            listeners_registered: false,
            initial_sync_done: false,
            active_instances: 0,
            last_sync: None,
            background_claimed: false,
            generation: 0,
            stability_timer: None,
            bound: Vec::new(),
            transport: None,
            tasks: Vec::new(),
        }
    }
}

pub struct SyncLifecycleManager {
    stability_delay: Duration,
    resync_window: Duration,
    bus: SyncBus,
    state: Mutex<SyncState>,
    teardowns: AtomicUsize,
}

impl SyncLifecycleManager {
    pub fn new(stability_delay: Duration, resync_window: Duration, bus: SyncBus) -> Arc<Self> {
        Arc::new(Self {
            stability_delay,
            resync_window,
            bus,
            state: Mutex::new(SyncState::new()),
            teardowns: AtomicUsize::new(0),
        })
    }

    pub async fn phase(&self) -> SyncPhase {
        self.state.lock().await.phase
    }

    pub async fn active_instances(&self) -> usize {
        self.state.lock().await.active_instances
    }

    pub async fn listeners_registered(&self) -> bool {
        self.state.lock().await.listeners_registered
    }

    pub async fn initial_sync_done(&self) -> bool {
        self.state.lock().await.initial_sync_done
    }

    pub async fn mark_initial_sync_done(&self) {
        self.state.lock().await.initial_sync_done = true;
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub async fn register_instance(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock().await;
        state.active_instances += 1;

        if state.phase == SyncPhase::Uninitialized {
            state.phase = SyncPhase::Initializing;
            state.generation += 1;
            let generation = state.generation;
            let manager: Weak<Self> = Arc::downgrade(self);
            let delay = self.stability_delay;
            state.stability_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(manager) = manager.upgrade() {
                    manager.on_stability_elapsed(generation).await;
                }
            }));
            debug!(delay_ms = delay.as_millis() as u64, "lifecycle: initializing");
        }

        debug!(instances = state.active_instances, "lifecycle: instance registered");
        state.active_instances
    }

    /// Returns whether this call tore everything down.
    pub async fn unregister_instance(&self) -> bool {
        let mut state = self.state.lock().await;
        state.active_instances = state.active_instances.saturating_sub(1);
        debug!(instances = state.active_instances, "lifecycle: instance unregistered");

        if state.active_instances > 0 {
            return false;
        }
        if state.phase != SyncPhase::Stable {
            debug!(phase = ?state.phase, "lifecycle: teardown deferred until stable");
            return false;
        }
        self.teardown(&mut state).await;
        true
    }

    pub async fn request_listener_registration(
        &self,
        transport: Arc<dyn PushTransport>,
        handlers: HandlerTable,
    ) -> Registration {
        let mut state = self.state.lock().await;
        if state.listeners_registered {
            debug!("lifecycle: listeners already registered");
            return Registration::AlreadyBound;
        }
        if !transport.is_connected() {
            info!("lifecycle: transport unavailable, deferring listener registration");
            return Registration::Deferred;
        }

        for (event, handler) in handlers {
            transport.bind(event, handler).await;
            state.bound.push(event);
        }
        state.listeners_registered = true;
        state.transport = Some(transport);
        info!(events = state.bound.len(), "lifecycle: listeners registered");
        Registration::Bound(state.bound.len())
    }

    /// True at most once per resync window.
    pub async fn can_sync(&self) -> bool {
        self.can_sync_at(Instant::now()).await
    }

    pub async fn can_sync_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_sync {
            if now.saturating_duration_since(last) < self.resync_window {
                debug!("lifecycle: resync throttled");
                return false;
            }
        }
        state.last_sync = Some(now);
        true
    }

    pub async fn claim_background(&self) -> bool {
        let mut state = self.state.lock().await;
        !std::mem::replace(&mut state.background_claimed, true)
    }

    pub async fn adopt_task(&self, handle: JoinHandle<()>) {
        self.state.lock().await.tasks.push(handle);
    }

    /// Unconditional teardown, used when the tab itself goes away.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.active_instances = 0;
        if state.phase == SyncPhase::Uninitialized
            && !state.listeners_registered
            && state.tasks.is_empty()
        {
            return;
        }
        self.teardown(&mut state).await;
    }

    async fn on_stability_elapsed(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.phase != SyncPhase::Initializing {
            return;
        }
        state.phase = SyncPhase::Stable;
        state.stability_timer = None;
        info!(instances = state.active_instances, "lifecycle: stable");

        if state.active_instances == 0 {
            self.teardown(&mut state).await;
        }
    }

    async fn teardown(&self, state: &mut SyncState) {
        if let Some(timer) = state.stability_timer.take() {
            timer.abort();
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(transport) = state.transport.take() {
            for event in state.bound.drain(..) {
                transport.unbind(event).await;
            }
        }
        state.bound.clear();

        let generation = state.generation;
        *state = SyncState::new();
        state.generation = generation;

        let total = self.teardowns.fetch_add(1, Ordering::SeqCst) + 1;
        info!(teardowns = total, "lifecycle: teardown");
        self.bus.publish(SyncEvent::Teardown);
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
