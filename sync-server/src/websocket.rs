use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use sync_core::broadcaster::should_suppress_echo;
use sync_core::protocol::Request;
use uuid::Uuid;

use crate::AppState;

/// `GET /sync/ws` — a long-lived connection that accepts a stream of
/// envelopes and pushes responses plus unsolicited realtime `commit`
/// events as they arrive from the broadcaster, giving a connected client
/// push-driven wake-ups in addition to its own pull cadence.
pub async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    if let Some(ref monitoring) = state.monitoring {
        monitoring.log_client_connected(&connection_id.to_string()).await;
    }

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<String>(100);
    let own_client_id = Arc::new(std::sync::Mutex::new(None::<Uuid>));

    let mut realtime_rx = state.broadcaster.subscribe(&state.partition_id);
    let realtime_tx = out_tx.clone();
    let realtime_client_id = own_client_id.clone();
    let realtime_task = tokio::spawn(async move {
        while let Ok(event) = realtime_rx.recv().await {
            let suppress = realtime_client_id
                .lock()
                .expect("own_client_id mutex poisoned")
                .map(|id| should_suppress_echo(&event, id))
                .unwrap_or(false);
            if suppress {
                continue;
            }
            if let Ok(json) = serde_json::to_string(&event) {
                if realtime_tx.send(json).await.is_err() {
                    break;
                }
            }
        }
    });

    let forward_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(Message::Text(text))) = receiver.next().await {
        match serde_json::from_str::<Request>(&text) {
            Ok(request) => {
                *own_client_id.lock().expect("own_client_id mutex poisoned") = Some(request.client_id);
                if let Some(ref monitoring) = state.monitoring {
                    monitoring.log_request_received(&connection_id.to_string(), &request).await;
                }
                match crate::sync_handler::handle_request(&state, request).await {
                    Ok(response) => {
                        if let Some(ref monitoring) = state.monitoring {
                            monitoring.log_response_sent(&connection_id.to_string(), &response).await;
                        }
                        if let Ok(json) = serde_json::to_string(&response) {
                            let _ = out_tx.send(json).await;
                        }
                    }
                    Err(err) => {
                        tracing::error!(?err, "failed to handle sync request over websocket");
                        if let Some(ref monitoring) = state.monitoring {
                            monitoring.log_error(err.to_string()).await;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(?err, "invalid envelope received over websocket");
            }
        }
    }

    realtime_task.abort();
    forward_task.abort();

    if let Some(ref monitoring) = state.monitoring {
        monitoring.log_client_disconnected(&connection_id.to_string()).await;
    }
}
