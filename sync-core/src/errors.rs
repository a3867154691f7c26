use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

/// Error kinds distinguished by the sync core.
///
/// The variant chosen here drives retry policy on the client (see
/// `SyncError::is_retryable`) and the HTTP status mapping on the server.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("conflict on {table}/{row_id}: expected base_version {expected:?}, actual {actual}")]
    Conflict {
        table: String,
        row_id: String,
        expected: Option<i64>,
        actual: i64,
    },

    #[error("schema mismatch: server expects {server_version}, client sent {client_version}")]
    SchemaMismatch {
        server_version: i64,
        client_version: i64,
    },

    #[error("duplicate row {row_id} in commit for table {table}")]
    DuplicateRowInCommit { table: String, row_id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown scope pattern: {0}")]
    UnknownScope(String),

    #[error("subscription not found: {0}")]
    NotFound(Uuid),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invariant violation: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("uuid parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SyncError {
    /// Whether a client should retry this error with backoff rather than
    /// surfacing it to the consumer as a terminal failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("engine halted: {0}")]
    Halted(String),

    #[error("local database error: {0}")]
    Database(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("{0}")]
    InternalServerError(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("conflict on {len} row(s)", len = .0.len())]
    Conflict(Vec<crate::protocol::Conflict>),
    #[error("schema mismatch: server={server_version}, client={client_version}")]
    SchemaMismatch { server_version: i64, client_version: i64 },
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalServerError(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(serde::Serialize)]
        struct ErrorBody {
            message: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            conflicts: Option<Vec<crate::protocol::Conflict>>,
        }

        let (status, body) = match self {
            ApiError::InternalServerError(message) => {
                tracing::warn!("internal server error: {message}");
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody { message, conflicts: None })
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, ErrorBody { message, conflicts: None })
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, ErrorBody { message, conflicts: None })
            }
            ApiError::Conflict(conflicts) => (
                StatusCode::CONFLICT,
                ErrorBody { message: "conflict".to_string(), conflicts: Some(conflicts) },
            ),
            ApiError::SchemaMismatch { server_version, client_version } => (
                StatusCode::PRECONDITION_FAILED,
                ErrorBody {
                    message: format!(
                        "schema mismatch: server={server_version}, client={client_version}"
                    ),
                    conflicts: None,
                },
            ),
            ApiError::RateLimited { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    message: format!("rate limited, retry after {retry_after_ms}ms"),
                    conflicts: None,
                },
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Conflict { row_id, actual, expected, .. } => {
                ApiError::Conflict(vec![crate::protocol::Conflict {
                    row_id,
                    expected_base_version: expected,
                    actual_row_version: actual,
                }])
            }
            SyncError::SchemaMismatch { server_version, client_version } => {
                ApiError::SchemaMismatch { server_version, client_version }
            }
            SyncError::RateLimited { retry_after_ms } => ApiError::RateLimited { retry_after_ms },
            SyncError::Validation(m) | SyncError::UnknownScope(m) => ApiError::BadRequest(m),
            SyncError::DuplicateRowInCommit { table, row_id } => {
                ApiError::BadRequest(format!("duplicate row {row_id} in commit for table {table}"))
            }
            SyncError::NotFound(id) => ApiError::NotFound(format!("subscription not found: {id}")),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
