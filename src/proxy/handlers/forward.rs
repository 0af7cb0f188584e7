//! The forwarding path: one inbound request, one leased account, one
//! upstream round trip (plus at most one transparent retry after a 401).
//!
//! Bodies stream back to the client; when logging is enabled the response
//! body is teed into a bounded buffer and the telemetry row is finalized
//! when the stream ends, including the case where the client disconnects
//! mid-stream.

use crate::constants::{
    upstream_base_url, CODEX_CLIENT_VERSION, CODEX_OPENAI_BETA, CODEX_ORIGINATOR,
    CODEX_USER_AGENT, MODELS_CLIENT_VERSION,
};
use crate::error::AppError;
use crate::proxy::logs::{
    extract_model, extract_usage, sanitize_headers, truncate_body, LogSink, RequestLogRecord,
    MAX_LOG_BODY_BYTES,
};
use crate::proxy::pool::{Lease, LeaseOutcome};
use crate::proxy::server::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

const MAX_INBOUND_BODY_BYTES: usize = 16 * 1024 * 1024;
/// Bodies above this are not replayed; a 401 then surfaces verbatim.
const REPLAY_MAX_BODY_BYTES: usize = 1024 * 1024;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Hop-by-hop and auth headers never forwarded upstream.
fn skip_request_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "authorization"
            | "x-api-key"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Headers never relayed back to the client.
fn skip_response_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "proxy-authenticate"
            | "content-length"
    )
}

/// Join the upstream base with the inbound path+query, collapsing the
/// CLI-style `/v1` prefix when the base already points at the codex backend.
pub(crate) fn build_upstream_url(path_and_query: &str) -> String {
    let base = upstream_base_url();
    let base = base.trim_end_matches('/');
    if base.contains("/backend-api/codex") && path_and_query.starts_with("/v1/") {
        format!("{base}{}", path_and_query.trim_start_matches("/v1"))
    } else if base.ends_with("/v1") && path_and_query.starts_with("/v1") {
        format!("{}{}", base.trim_end_matches("/v1"), path_and_query)
    } else {
        format!("{base}{path_and_query}")
    }
}

/// `/v1/models` requires a `client_version` query parameter upstream; add
/// one when the caller did not.
pub(crate) fn normalize_models_path(path: &str) -> String {
    let is_models_path = path == "/v1/models" || path.starts_with("/v1/models?");
    if !is_models_path {
        return path.to_string();
    }
    let has_client_version = path
        .split_once('?')
        .map(|(_, query)| {
            query.split('&').any(|part| {
                part.split('=')
                    .next()
                    .map(|key| key.eq_ignore_ascii_case("client_version"))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    if has_client_version {
        return path.to_string();
    }
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}client_version={MODELS_CLIENT_VERSION}")
}

fn is_ban_indicator(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    text.contains("account_deactivated")
        || text.contains("deactivated")
        || text.contains("suspended")
        || text.contains("banned")
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Request-side telemetry, captured before the upstream round trip.
struct RequestContext {
    request_id: u64,
    method: String,
    path: String,
    target: String,
    started: Instant,
    timestamp: String,
    request_headers: Option<String>,
    request_body: Option<String>,
    model: Option<String>,
}

impl RequestContext {
    fn base_record(&self, status: u16, account_id: &str) -> RequestLogRecord {
        RequestLogRecord {
            timestamp: self.timestamp.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            account_id: account_id.to_string(),
            model: self.model.clone(),
            request_headers: self.request_headers.clone(),
            request_body: self.request_body.clone(),
            ..Default::default()
        }
    }
}

fn log_failure(sink: &LogSink, ctx: &RequestContext, status: u16, account_id: &str, error: String) {
    let mut record = ctx.base_record(status, account_id);
    record.error = Some(error);
    if let Err(e) = sink.append(record) {
        tracing::warn!("[Proxy] failed to append log record: {}", e);
    }
}

pub async fn forward(State(state): State<AppState>, req: Request<Body>) -> Response {
    let request_id = REQUEST_SEQ.fetch_add(1, Ordering::SeqCst);
    let method = req.method().clone();
    let raw_path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let path = normalize_models_path(&raw_path);
    let target = build_upstream_url(&path);

    let inbound_headers = req.headers().clone();
    if let Some(len) = inbound_headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        if len > MAX_INBOUND_BODY_BYTES as u64 {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    }
    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_INBOUND_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let capture = state.sink.is_enabled();
    let ctx = RequestContext {
        request_id,
        method: method.to_string(),
        path: path.clone(),
        target: target.clone(),
        started: Instant::now(),
        timestamp: now_iso(),
        request_headers: if capture {
            sanitize_headers(
                inbound_headers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_bytes())),
            )
        } else {
            None
        },
        request_body: if capture && !body_bytes.is_empty() {
            Some(truncate_body(&body_bytes))
        } else {
            None
        },
        model: extract_model(&body_bytes),
    };
    tracing::debug!(
        "[Proxy] req#{} {} {} -> {}",
        ctx.request_id,
        ctx.method,
        ctx.path,
        ctx.target
    );

    let lease = match state.pool.pick().await {
        Ok(lease) => lease,
        Err(e) => {
            let status = match &e {
                AppError::PoolExhausted => 503,
                AppError::RefreshFailed(_) => 502,
                _ => 500,
            };
            log_failure(&state.sink, &ctx, status, "", e.to_string());
            return e.into_response();
        }
    };

    let upstream = send_upstream(&state, &method, &ctx.target, &inbound_headers, &lease, &body_bytes).await;
    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            let timed_out = e.is_timeout();
            state.pool.report(lease, LeaseOutcome::TransportError);
            let (status, err) = if timed_out {
                (504, AppError::UpstreamTimeout(e.to_string()))
            } else {
                (502, AppError::Network(e))
            };
            log_failure(&state.sink, &ctx, status, "", err.to_string());
            return err.into_response();
        }
    };

    let status = upstream.status().as_u16();
    tracing::debug!("[Proxy] req#{} upstream status {}", ctx.request_id, status);

    if status == 401 {
        if body_bytes.len() <= REPLAY_MAX_BODY_BYTES {
            match state.pool.refresh_account(lease.account_id()).await {
                Ok(_) => {
                    state.pool.report(lease, LeaseOutcome::Recovered);
                    return retry_once(state, ctx, method, inbound_headers, body_bytes).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "[Proxy] req#{} refresh after 401 failed: {}",
                        ctx.request_id,
                        e
                    );
                    let account = lease.account_id().to_string();
                    state.pool.report(lease, LeaseOutcome::Status(401));
                    return relay(state, ctx, upstream, account).await;
                }
            }
        }
        // Body too large to replay; surface the 401 verbatim.
        let account = lease.account_id().to_string();
        state.pool.report(lease, LeaseOutcome::Status(401));
        return relay(state, ctx, upstream, account).await;
    }

    observe_and_relay(state, ctx, upstream, lease).await
}

async fn retry_once(
    state: AppState,
    ctx: RequestContext,
    method: axum::http::Method,
    inbound_headers: axum::http::HeaderMap,
    body_bytes: Bytes,
) -> Response {
    let lease = match state.pool.pick().await {
        Ok(lease) => lease,
        Err(e) => {
            log_failure(&state.sink, &ctx, 503, "", e.to_string());
            return e.into_response();
        }
    };
    tracing::debug!(
        "[Proxy] req#{} retrying once on account {}",
        ctx.request_id,
        lease.account_id()
    );
    match send_upstream(&state, &method, &ctx.target, &inbound_headers, &lease, &body_bytes).await {
        Ok(resp) => observe_and_relay(state, ctx, resp, lease).await,
        Err(e) => {
            state.pool.report(lease, LeaseOutcome::TransportError);
            let err = AppError::Network(e);
            log_failure(&state.sink, &ctx, 502, "", err.to_string());
            err.into_response()
        }
    }
}

/// Report the observed status, then stream the response back.
async fn observe_and_relay(
    state: AppState,
    ctx: RequestContext,
    upstream: reqwest::Response,
    lease: Lease,
) -> Response {
    let status = upstream.status().as_u16();
    let account = lease.account_id().to_string();

    if status == 403 {
        // Buffer the body so the ban indicator can be inspected.
        let headers = upstream.headers().clone();
        let bytes = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => {
                state.pool.report(lease, LeaseOutcome::TransportError);
                let err = AppError::Network(e);
                log_failure(&state.sink, &ctx, 502, &account, err.to_string());
                return err.into_response();
            }
        };
        let outcome = if is_ban_indicator(&bytes) {
            LeaseOutcome::Banned
        } else {
            LeaseOutcome::Status(403)
        };
        state.pool.report(lease, outcome);

        if state.sink.is_enabled() {
            let mut record = ctx.base_record(status, &account);
            record.response_headers =
                sanitize_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_bytes())));
            record.response_body = Some(truncate_body(&bytes));
            if let Err(e) = state.sink.append(record) {
                tracing::warn!("[Proxy] failed to append log record: {}", e);
            }
        }
        return build_response_from_bytes(StatusCode::FORBIDDEN, &headers, bytes);
    }

    state.pool.report(lease, LeaseOutcome::Status(status));
    relay(state, ctx, upstream, account).await
}

/// Stream the upstream response to the client, teeing the body into the log
/// sink when capture is on.
async fn relay(
    state: AppState,
    ctx: RequestContext,
    upstream: reqwest::Response,
    account_id: String,
) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = upstream.headers().clone();

    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if skip_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }

    let body = if state.sink.is_enabled() {
        let mut record = ctx.base_record(status.as_u16(), &account_id);
        record.response_headers =
            sanitize_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_bytes())));
        let pending = PendingLog {
            sink: state.sink.clone(),
            record,
            started: ctx.started,
        };
        Body::from_stream(LogTee {
            inner: Box::pin(upstream.bytes_stream()),
            captured: Vec::new(),
            pending: Some(pending),
        })
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap()
    })
}

fn build_response_from_bytes(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: Bytes,
) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if skip_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap()
    })
}

async fn send_upstream(
    state: &AppState,
    method: &axum::http::Method,
    target: &str,
    inbound_headers: &axum::http::HeaderMap,
    lease: &Lease,
    body: &Bytes,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound_headers.iter() {
        if skip_request_header(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(n, v);
        }
    }

    let bearer = format!("Bearer {}", lease.access_token);
    if let Ok(v) = reqwest::header::HeaderValue::from_str(&bearer) {
        headers.insert(reqwest::header::AUTHORIZATION, v);
    }
    if let Some(upstream_id) = &lease.upstream_account_id {
        if let Ok(v) = reqwest::header::HeaderValue::from_str(upstream_id) {
            headers.insert(
                reqwest::header::HeaderName::from_static("chatgpt-account-id"),
                v,
            );
        }
    }
    if !body.is_empty() && !headers.contains_key(reqwest::header::CONTENT_TYPE) {
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
    }
    headers.insert(
        reqwest::header::HeaderName::from_static("version"),
        reqwest::header::HeaderValue::from_static(CODEX_CLIENT_VERSION),
    );
    headers.insert(
        reqwest::header::HeaderName::from_static("openai-beta"),
        reqwest::header::HeaderValue::from_static(CODEX_OPENAI_BETA),
    );
    headers.insert(
        reqwest::header::HeaderName::from_static("originator"),
        reqwest::header::HeaderValue::from_static(CODEX_ORIGINATOR),
    );
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static(CODEX_USER_AGENT),
    );

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    state
        .client
        .request(method, target)
        .headers(headers)
        .body(body.clone())
        .send()
        .await
}

/// Telemetry row waiting on body completion.
struct PendingLog {
    sink: Arc<LogSink>,
    record: RequestLogRecord,
    started: Instant,
}

impl PendingLog {
    fn finalize(mut self, captured: &[u8], error: Option<String>) {
        self.record.duration_ms = self.started.elapsed().as_millis() as u64;
        if !captured.is_empty() {
            self.record.response_body = Some(truncate_body(captured));
            let (input, output) = extract_usage(captured);
            self.record.input_tokens = input;
            self.record.output_tokens = output;
        }
        if self.record.error.is_none() {
            self.record.error = error;
        }
        if let Err(e) = self.sink.append(self.record) {
            tracing::warn!("[Proxy] failed to append log record: {}", e);
        }
    }
}

/// Pass-through stream capturing a bounded prefix of the body. The pending
/// record is finalized on completion, on stream error, and on drop (client
/// disconnect), so every relayed response yields exactly one row.
struct LogTee {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    captured: Vec<u8>,
    pending: Option<PendingLog>,
}

impl Stream for LogTee {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.captured.len() < MAX_LOG_BODY_BYTES {
                    let room = MAX_LOG_BODY_BYTES - this.captured.len();
                    let take = room.min(chunk.len());
                    this.captured.extend_from_slice(&chunk[..take]);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(pending) = this.pending.take() {
                    pending.finalize(&this.captured, Some(format!("upstream body error: {e}")));
                }
                Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                ))))
            }
            Poll::Ready(None) => {
                if let Some(pending) = this.pending.take() {
                    pending.finalize(&this.captured, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LogTee {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.finalize(
                &self.captured,
                Some("client disconnected before body completed".to_string()),
            );
        }
    }
}
