use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use sync_core::errors::ApiError;
use sync_core::protocol::{Request, Response};

use crate::AppState;

/// `POST /sync` — stateless request/response, one envelope in, one out.
/// Rate-limited per caller key (defaults to `client_id`).
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Request>,
) -> Result<Json<Response>, ApiError> {
    let decision = state.push_limiter.check(&request.client_id.to_string(), now_ms());
    if !decision.allowed {
        return Err(ApiError::RateLimited { retry_after_ms: decision.retry_after_ms });
    }

    let response = crate::sync_handler::handle_request(&state, request).await?;
    Ok(Json(response))
}

pub async fn health() -> &'static str {
    "OK"
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as u64
}
