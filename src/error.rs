use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid_api_key")]
    AuthRejected,

    #[error("no_healthy_account")]
    PoolExhausted,

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("proxy already running on port {0}")]
    AlreadyRunning(u16),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("account store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Network(#[from] reqwest::Error),
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::AuthRejected => StatusCode::UNAUTHORIZED,
            AppError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::RefreshFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyRunning(_)
            | AppError::Store(_)
            | AppError::Io(_)
            | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Upstream(_) | AppError::Network(_) => StatusCode::BAD_GATEWAY,
        }
    }

    // The 503/401 bodies are part of the client contract; everything else
    // carries the display string.
    fn body(&self) -> String {
        match self {
            AppError::AuthRejected => "invalid_api_key".to_string(),
            AppError::PoolExhausted => "no_healthy_account".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody { error: self.body() };
        (status, Json(body)).into_response()
    }
}
