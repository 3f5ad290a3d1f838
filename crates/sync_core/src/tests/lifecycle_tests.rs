use super::*;
use crate::transport::LoopbackTransport;
use tokio::sync::oneshot;

const STABILITY: Duration = Duration::from_millis(30);

fn manager() -> Arc<SyncLifecycleManager> {
    SyncLifecycleManager::new(STABILITY, Duration::from_millis(2000), SyncBus::default())
}

fn handlers() -> HandlerTable {
    PushEventName::ALL
        .into_iter()
        .map(|event| {
            let handler: EventHandler = Arc::new(|_payload: serde_json::Value| {});
            (event, handler)
        })
        .collect()
}

async fn wait_until_stable() {
    tokio::time::sleep(STABILITY * 4).await;
}

#[tokio::test]
async fn balanced_instances_tear_down_exactly_once() {
    let manager = manager();
    for _ in 0..3 {
        manager.register_instance().await;
    }
    wait_until_stable().await;
    assert_eq!(manager.phase().await, SyncPhase::Stable);

    assert!(!manager.unregister_instance().await);
    assert!(!manager.unregister_instance().await);
    assert!(manager.unregister_instance().await);
    assert_eq!(manager.teardown_count(), 1);
    assert_eq!(manager.phase().await, SyncPhase::Uninitialized);

    assert!(!manager.unregister_instance().await);
    assert_eq!(manager.teardown_count(), 1);
}

#[tokio::test]
async fn churn_before_stable_defers_teardown_to_timer() {
    let manager = manager();
    manager.register_instance().await;
    assert!(!manager.unregister_instance().await);
    assert_eq!(manager.teardown_count(), 0);
    assert_eq!(manager.phase().await, SyncPhase::Initializing);

    wait_until_stable().await;
    assert_eq!(manager.teardown_count(), 1);
    assert_eq!(manager.phase().await, SyncPhase::Uninitialized);
}

#[tokio::test]
async fn remount_during_initialization_keeps_sync_alive() {
    let manager = manager();
    manager.register_instance().await;
    manager.unregister_instance().await;
    manager.register_instance().await;

    wait_until_stable().await;
    assert_eq!(manager.teardown_count(), 0);
    assert_eq!(manager.phase().await, SyncPhase::Stable);
    assert_eq!(manager.active_instances().await, 1);
}

#[tokio::test]
async fn listeners_bind_once_per_event() {
    let manager = manager();
    let transport = LoopbackTransport::new(true);

    let first = manager
        .request_listener_registration(transport.clone(), handlers())
        .await;
    let second = manager
        .request_listener_registration(transport.clone(), handlers())
        .await;

    assert_eq!(first, Registration::Bound(PushEventName::ALL.len()));
    assert_eq!(second, Registration::AlreadyBound);
    for event in PushEventName::ALL {
        assert_eq!(transport.bind_count(event).await, 1, "{event}");
    }
    assert!(manager.listeners_registered().await);
}

#[tokio::test]
async fn registration_is_deferred_while_disconnected() {
    let manager = manager();
    let transport = LoopbackTransport::new(false);

    let deferred = manager
        .request_listener_registration(transport.clone(), handlers())
        .await;
    assert_eq!(deferred, Registration::Deferred);
    assert!(transport.bound_events().await.is_empty());
    assert!(!manager.listeners_registered().await);

    transport.set_connected(true);
    let bound = manager
        .request_listener_registration(transport.clone(), handlers())
        .await;
    assert_eq!(bound, Registration::Bound(PushEventName::ALL.len()));
}

#[tokio::test]
async fn teardown_unbinds_and_aborts_adopted_tasks() {
    let manager = manager();
    let transport = LoopbackTransport::new(true);
    manager.register_instance().await;
    manager
        .request_listener_registration(transport.clone(), handlers())
        .await;

    let (keepalive, closed) = oneshot::channel::<()>();
    manager
        .adopt_task(tokio::spawn(async move {
            let _keepalive = keepalive;
            std::future::pending::<()>().await;
        }))
        .await;

    wait_until_stable().await;
    assert!(manager.unregister_instance().await);

    assert!(transport.bound_events().await.is_empty());
    assert!(!manager.listeners_registered().await);
    let dropped = tokio::time::timeout(Duration::from_secs(1), closed)
        .await
        .expect("task aborted");
    assert!(dropped.is_err());
}

#[tokio::test]
async fn teardown_is_published_on_the_bus() {
    let bus = SyncBus::default();
    let mut events = bus.subscribe();
    let manager = SyncLifecycleManager::new(STABILITY, Duration::from_secs(2), bus);
    manager.register_instance().await;
    wait_until_stable().await;
    manager.unregister_instance().await;

    assert_eq!(events.recv().await.expect("event"), SyncEvent::Teardown);
}

#[tokio::test]
async fn can_sync_collapses_requests_within_window() {
    let manager = manager();
    let start = Instant::now();
    assert!(manager.can_sync_at(start).await);
    assert!(!manager.can_sync_at(start + Duration::from_millis(500)).await);
    assert!(!manager.can_sync_at(start + Duration::from_millis(1999)).await);
    assert!(manager.can_sync_at(start + Duration::from_millis(2000)).await);
}

#[tokio::test]
async fn background_is_claimed_once_per_session() {
    let manager = manager();
    manager.register_instance().await;
    assert!(manager.claim_background().await);
    assert!(!manager.claim_background().await);

    manager.shutdown().await;
    assert_eq!(manager.teardown_count(), 1);
    assert!(manager.claim_background().await);
}
