use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::{OutboundEvent, PushEventName, PushFrame};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connected,
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("push transport is not connected")]
    Unavailable,
    #[error("failed to encode outbound event: {0}")]
    Encode(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Replaces any handler already bound to `event`.
    async fn bind(&self, event: PushEventName, handler: EventHandler);
    async fn unbind(&self, event: PushEventName);
    async fn emit(&self, event: &OutboundEvent) -> Result<(), TransportError>;
    fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionSignal>;
}

#[derive(Default)]
struct HandlerRegistry {
    handlers: RwLock<HashMap<PushEventName, EventHandler>>,
}

impl HandlerRegistry {
    async fn bind(&self, event: PushEventName, handler: EventHandler) {
        self.handlers.write().await.insert(event, handler);
    }

    async fn unbind(&self, event: PushEventName) {
        self.handlers.write().await.remove(&event);
    }

    async fn dispatch(&self, event: PushEventName, payload: Value) -> bool {
        let handler = self.handlers.read().await.get(&event).cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    async fn dispatch_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<PushFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "transport: ignoring malformed frame");
                return;
            }
        };
        match frame.event.parse::<PushEventName>() {
            Ok(event) => {
                if !self.dispatch(event, frame.data).await {
                    debug!(event = %event, "transport: no handler bound");
                }
            }
            Err(err) => debug!(error = %err, "transport: ignoring unknown event"),
        }
    }
}

fn encode(event: &OutboundEvent) -> Result<String, TransportError> {
    serde_json::to_string(event).map_err(|err| TransportError::Encode(err.to_string()))
}

/// In-process transport. Delivery is driven by the caller.
pub struct LoopbackTransport {
    connected: AtomicBool,
    handlers: HandlerRegistry,
    bind_counts: Mutex<HashMap<PushEventName, usize>>,
    emitted: Mutex<Vec<OutboundEvent>>,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl LoopbackTransport {
    pub fn new(connected: bool) -> Arc<Self> {
        let (signals, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            handlers: HandlerRegistry::default(),
            bind_counts: Mutex::new(HashMap::new()),
            emitted: Mutex::new(Vec::new()),
            signals,
        })
    }

    pub async fn deliver(&self, event: PushEventName, payload: Value) -> bool {
        self.handlers.dispatch(event, payload).await
    }

    pub async fn deliver_frame(&self, text: &str) {
        self.handlers.dispatch_frame(text).await;
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        let signal = match (was, connected) {
            (false, true) => ConnectionSignal::Reconnected,
            (true, false) => ConnectionSignal::Disconnected,
            _ => return,
        };
        let _ = self.signals.send(signal);
    }

    pub async fn emitted(&self) -> Vec<OutboundEvent> {
        self.emitted.lock().await.clone()
    }

    pub async fn bind_count(&self, event: PushEventName) -> usize {
        self.bind_counts
            .lock()
            .await
            .get(&event)
            .copied()
            .unwrap_or(0)
    }

    pub async fn bound_events(&self) -> Vec<PushEventName> {
        let mut events: Vec<_> = self.handlers.handlers.read().await.keys().copied().collect();
        events.sort();
        events
    }
}

#[async_trait]
impl PushTransport for LoopbackTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn bind(&self, event: PushEventName, handler: EventHandler) {
        *self.bind_counts.lock().await.entry(event).or_insert(0) += 1;
        self.handlers.bind(event, handler).await;
    }

    async fn unbind(&self, event: PushEventName) {
        self.handlers.unbind(event).await;
    }

    async fn emit(&self, event: &OutboundEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable);
        }
        encode(event)?;
        self.emitted.lock().await.push(event.clone());
        Ok(())
    }

    fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }
}

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Derives `ws(s)://host/ws?tabId=...` from an `http(s)://` server URL.
pub fn ws_url_from_server(server_url: &str, tab_id: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to switch {server_url} to {scheme}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server url cannot be a base: {server_url}"))?
        .pop_if_empty()
        .push("ws");
    url.query_pairs_mut().clear().append_pair("tabId", tab_id);
    Ok(url)
}

/// Frames are `{"event": name, "data": payload}`; reconnects on its own.
pub struct WsPushTransport {
    url: Url,
    reconnect_delay: Duration,
    connected: AtomicBool,
    handlers: HandlerRegistry,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl WsPushTransport {
    pub fn new(url: Url, reconnect_delay: Duration) -> Arc<Self> {
        let (signals, _) = broadcast::channel(64);
        Arc::new(Self {
            url,
            reconnect_delay,
            connected: AtomicBool::new(false),
            handlers: HandlerRegistry::default(),
            outgoing: Mutex::new(None),
            supervisor: Mutex::new(None),
            signals,
        })
    }

    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let reader = self.open().await?;
        let _ = self.signals.send(ConnectionSignal::Connected);
        info!(url = %self.url, "transport: connected");

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move { transport.supervise(reader).await });
        if let Some(previous) = self.supervisor.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        self.outgoing.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn open(&self) -> Result<WsReader> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (mut sink, reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(error = %err, "transport: websocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });
        *self.outgoing.lock().await = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(reader)
    }

    async fn pump(&self, mut reader: WsReader) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handlers.dispatch_frame(&text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "transport: websocket receive failed");
                    break;
                }
            }
        }
    }

    async fn supervise(self: Arc<Self>, mut reader: WsReader) {
        loop {
            self.pump(reader).await;
            self.connected.store(false, Ordering::SeqCst);
            self.outgoing.lock().await.take();
            let _ = self.signals.send(ConnectionSignal::Disconnected);
            info!(url = %self.url, "transport: disconnected");

            reader = loop {
                tokio::time::sleep(self.reconnect_delay).await;
                match self.open().await {
                    Ok(reader) => break reader,
                    Err(err) => warn!(error = %err, "transport: reconnect attempt failed"),
                }
            };
            let _ = self.signals.send(ConnectionSignal::Reconnected);
            info!(url = %self.url, "transport: reconnected");
        }
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn bind(&self, event: PushEventName, handler: EventHandler) {
        self.handlers.bind(event, handler).await;
    }

    async fn unbind(&self, event: PushEventName) {
        self.handlers.unbind(event).await;
    }

    async fn emit(&self, event: &OutboundEvent) -> Result<(), TransportError> {
        let text = encode(event)?;
        let guard = self.outgoing.lock().await;
        let sender = guard.as_ref().ok_or(TransportError::Unavailable)?;
        sender.send(text).map_err(|_| TransportError::Unavailable)
    }

    fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
