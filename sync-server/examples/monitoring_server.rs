use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use sync_core::ScopeEngine;
use sync_server::{api, database::ServerDatabase, monitoring::MonitoringLayer, websocket::handle_websocket, AppState};

/// Runs the same router as the main binary, but with the monitoring
/// sidecar enabled so every request and realtime event prints to stdout.
/// Useful when chasing down a client that reports a stuck pull loop.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("sync_server=debug").init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/sync_db".to_string());
    let db = Arc::new(ServerDatabase::new(&database_url).await?);
    db.init_schema().await?;

    let mut app_state = AppState::new(db, "default".to_string(), ScopeEngine::new());

    let (log_tx, log_rx) = tokio::sync::mpsc::channel(1000);
    app_state.monitoring = Some(MonitoringLayer::new(log_tx));
    sync_server::monitoring::spawn_monitoring_display(log_rx).await;

    let app_state = Arc::new(app_state);

    let app = Router::new()
        .route("/sync", post(api::sync))
        .route("/sync/ws", get(websocket_handler))
        .route("/health", get(api::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    println!("monitoring server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}
