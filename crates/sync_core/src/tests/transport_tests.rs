use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use shared::{
    domain::{MessageId, MessageKind},
    ConversationId,
};
use std::sync::atomic::AtomicUsize;
use tokio::{net::TcpListener, time::timeout};

const CONVERSATION: &str = "conv_+5214773790184_+5214793176502";

#[derive(Clone)]
struct WsServerState {
    connections: Arc<AtomicUsize>,
    received: mpsc::UnboundedSender<String>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsServerState) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    let frame = json!({
        "event": "new-message",
        "data": { "conversationId": CONVERSATION, "messageId": format!("wamid-{connection}") }
    });
    if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let _ = state.received.send(text);
            if connection == 0 {
                // First connection drops after one exchange to force a reconnect.
                return;
            }
        }
    }
}

async fn spawn_ws_server() -> Result<(String, mpsc::UnboundedReceiver<String>)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (received, rx) = mpsc::unbounded_channel();
    let state = WsServerState {
        connections: Arc::new(AtomicUsize::new(0)),
        received,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), rx))
}

fn capture(tx: mpsc::UnboundedSender<Value>) -> EventHandler {
    Arc::new(move |payload: Value| {
        let _ = tx.send(payload);
    })
}

fn send_event(content: &str) -> OutboundEvent {
    OutboundEvent::NewMessage {
        conversation_id: CONVERSATION.parse::<ConversationId>().expect("id"),
        content: content.into(),
        kind: MessageKind::Text,
        client_message_id: MessageId::from("local-1"),
    }
}

#[test]
fn ws_url_switches_scheme_and_adds_tab() {
    let url = ws_url_from_server("https://chat.example.com/api/", "tab-1").expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.com/api/ws?tabId=tab-1");

    let url = ws_url_from_server("http://127.0.0.1:8080", "tab-2").expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws?tabId=tab-2");

    assert!(ws_url_from_server("ftp://example.com", "tab").is_err());
}

#[tokio::test]
async fn loopback_dispatches_to_bound_handler_only() {
    let transport = LoopbackTransport::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.bind(PushEventName::NewMessage, capture(tx)).await;

    assert!(transport.deliver(PushEventName::NewMessage, json!({ "n": 1 })).await);
    assert!(!transport.deliver(PushEventName::MessageRead, json!({})).await);
    assert_eq!(rx.recv().await, Some(json!({ "n": 1 })));

    transport.unbind(PushEventName::NewMessage).await;
    assert!(!transport.deliver(PushEventName::NewMessage, json!({})).await);
}

#[tokio::test]
async fn loopback_frames_route_by_event_name() {
    let transport = LoopbackTransport::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .bind(PushEventName::WebhookNewMessage, capture(tx))
        .await;

    transport
        .deliver_frame(r#"{"event":"webhook:new-message","data":{"x":1}}"#)
        .await;
    transport.deliver_frame(r#"{"event":"unknown","data":{}}"#).await;
    transport.deliver_frame("not json").await;

    assert_eq!(rx.recv().await, Some(json!({ "x": 1 })));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn loopback_emit_requires_connection_and_signals_changes() {
    let transport = LoopbackTransport::new(false);
    let mut signals = transport.subscribe_connection();

    assert_eq!(
        transport.emit(&send_event("hola")).await,
        Err(TransportError::Unavailable)
    );
    transport.set_connected(true);
    transport.emit(&send_event("hola")).await.expect("emit");

    assert_eq!(signals.recv().await.expect("signal"), ConnectionSignal::Reconnected);
    assert_eq!(transport.emitted().await, vec![send_event("hola")]);
}

#[tokio::test]
async fn websocket_transport_dispatches_emits_and_reconnects() {
    let (server_url, mut received) = spawn_ws_server().await.expect("spawn server");
    let url = ws_url_from_server(&server_url, "tab-test").expect("url");
    let transport = WsPushTransport::new(url, Duration::from_millis(20));
    let mut signals = transport.subscribe_connection();

    let (tx, mut pushed) = mpsc::unbounded_channel();
    transport.bind(PushEventName::NewMessage, capture(tx)).await;
    transport.connect().await.expect("connect");
    assert!(transport.is_connected());

    let first = timeout(Duration::from_secs(5), pushed.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(first["messageId"], "wamid-0");

    transport.emit(&send_event("hola")).await.expect("emit");
    let text = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("emit in time")
        .expect("text");
    let wire: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(wire["event"], "new-message");
    assert_eq!(wire["data"]["clientMessageId"], "local-1");

    assert_eq!(signals.recv().await.expect("signal"), ConnectionSignal::Connected);
    let disconnected = timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("disconnect in time")
        .expect("signal");
    assert_eq!(disconnected, ConnectionSignal::Disconnected);
    let reconnected = timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("reconnect in time")
        .expect("signal");
    assert_eq!(reconnected, ConnectionSignal::Reconnected);

    let second = timeout(Duration::from_secs(5), pushed.recv())
        .await
        .expect("push after reconnect")
        .expect("push");
    assert_eq!(second["messageId"], "wamid-1");

    transport.shutdown().await;
    assert!(!transport.is_connected());
}
