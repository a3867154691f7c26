use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use sync_core::errors::ClientError;
use sync_core::protocol::{RealtimeEvent, Request, Response};
use sync_core::SyncResult;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Abstracts HTTP vs. WebSocket delivery so the sync engine never depends
/// on a concrete wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> SyncResult<Response>;
}

/// `reqwest`-backed transport against `POST /sync`. Stateless: every call
/// opens (or reuses, via the client's own pool) a connection and returns.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: format!("{}/sync", base_url.into()) }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> SyncResult<Response> {
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Transport(format!("server returned {}", response.status())).into());
        }

        response.json::<Response>().await.map_err(|e| ClientError::Transport(e.to_string()).into())
    }
}

/// `tokio-tungstenite`-backed transport over `GET /sync/ws`. In addition to
/// request/response framing it surfaces unsolicited `RealtimeEvent`s to the
/// engine's subscription loop via `realtime_events()`.
pub struct WebSocketTransport {
    write: Mutex<futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>>,
    pending: Mutex<mpsc::Receiver<Response>>,
    realtime_rx: Mutex<mpsc::Receiver<RealtimeEvent>>,
}

impl WebSocketTransport {
    pub async fn connect(ws_url: &str) -> SyncResult<Self> {
        let (stream, _) = connect_async(ws_url).await.map_err(|e| ClientError::Transport(e.to_string()))?;
        let (write, mut read) = stream.split();

        let (response_tx, response_rx) = mpsc::channel(64);
        let (realtime_tx, realtime_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(Ok(Message::Text(text))) = read.next().await {
                if let Ok(response) = serde_json::from_str::<Response>(&text) {
                    if response_tx.send(response).await.is_err() {
                        break;
                    }
                    continue;
                }
                if let Ok(event) = serde_json::from_str::<RealtimeEvent>(&text) {
                    if realtime_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self { write: Mutex::new(write), pending: Mutex::new(response_rx), realtime_rx: Mutex::new(realtime_rx) })
    }

    /// Drains any realtime events received since the last call, without
    /// blocking if none are pending.
    pub async fn poll_realtime_events(&self) -> Vec<RealtimeEvent> {
        let mut rx = self.realtime_rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, request: Request) -> SyncResult<Response> {
        let json = serde_json::to_string(&request).map_err(sync_core::SyncError::Serialization)?;
        self.write
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        self.pending
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ClientError::ConnectionLost.into())
    }
}
