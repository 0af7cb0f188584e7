//! Inbound API-key authentication.
//!
//! When no key is configured, the proxy surface is open. Rejections are
//! answered locally (the pool is never touched) and leave a telemetry row.

use crate::error::AppError;
use crate::proxy::logs::RequestLogRecord;
use crate::proxy::server::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

fn provided_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or(Some(s)))
        .or_else(|| headers.get("x-api-key").and_then(|h| h.to_str().ok()))
        .map(str::trim)
}

pub(crate) fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    provided_api_key(headers)
        .map(|candidate| constant_time_str_eq(candidate, expected))
        .unwrap_or(false)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.effective_api_key() else {
        return next.run(request).await;
    };
    if is_authorized(request.headers(), expected) {
        return next.run(request).await;
    }

    let record = RequestLogRecord {
        timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        method: request.method().to_string(),
        path: request
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        status: 401,
        duration_ms: 0,
        account_id: String::new(),
        error: Some("missing or invalid api key".to_string()),
        ..Default::default()
    };
    if let Err(e) = state.sink.append(record) {
        tracing::warn!("[Proxy] failed to log auth rejection: {}", e);
    }
    AppError::AuthRejected.into_response()
}

/// Admin routes require the key unconditionally; an unset key denies rather
/// than opens them.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.effective_api_key() else {
        tracing::warn!("[Admin] api_key is empty; denying admin request");
        return AppError::AuthRejected.into_response();
    };
    if is_authorized(request.headers(), expected) {
        return next.run(request).await;
    }
    AppError::AuthRejected.into_response()
}
