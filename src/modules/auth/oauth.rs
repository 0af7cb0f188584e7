//! Refresh-token exchange against the upstream identity provider.
//!
//! This module performs the raw exchange only. Per-account single-flight
//! serialization lives in the account pool, which is the sole caller during
//! proxy operation.

use crate::constants::{token_url, OAUTH_CLIENT_ID};
use crate::models::{StoredAuth, StoredTokens};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The stored refresh token was rejected outright. Not retryable; the
    /// account must be blocked until the user re-authenticates.
    #[error("refresh token rejected ({status}): {body}")]
    InvalidGrant { status: u16, body: String },

    /// The endpoint answered with a non-success status that does not
    /// implicate the refresh token itself.
    #[error("token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("token endpoint unreachable: {0}")]
    Transport(String),
}

impl RefreshError {
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, RefreshError::InvalidGrant { .. })
    }
}

pub async fn refresh_access_token(refresh_token: &str) -> Result<TokenResponse, RefreshError> {
    let client = reqwest::Client::builder()
        .timeout(REFRESH_TIMEOUT)
        .build()
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let params = [
        ("grant_type", "refresh_token"),
        ("client_id", OAUTH_CLIENT_ID),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(token_url())
        .form(&params)
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<TokenResponse>()
            .await
            .map_err(|e| RefreshError::Transport(format!("malformed token response: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() && looks_like_invalid_grant(status.as_u16(), &body) {
        tracing::warn!("[OAuth] refresh token rejected: {} {}", status, body);
        return Err(RefreshError::InvalidGrant {
            status: status.as_u16(),
            body,
        });
    }
    Err(RefreshError::Endpoint {
        status: status.as_u16(),
        body,
    })
}

// 400/401 answers carrying invalid_grant (or an equivalent marker) mean the
// refresh token is dead, not that the request failed transiently.
fn looks_like_invalid_grant(status: u16, body: &str) -> bool {
    if status != 400 && status != 401 && status != 403 {
        return false;
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("invalid_grant")
        || lower.contains("invalid_request")
        || lower.contains("expired")
        || lower.contains("revoked")
        || status == 401
}

/// Merge a successful exchange into an existing record: rotated fields are
/// replaced, everything the endpoint omitted is carried over.
pub fn apply_refresh(existing: &StoredAuth, response: &TokenResponse) -> StoredAuth {
    let now_iso = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    StoredAuth {
        tokens: StoredTokens {
            access_token: response.access_token.clone(),
            id_token: response
                .id_token
                .clone()
                .unwrap_or_else(|| existing.tokens.id_token.clone()),
            refresh_token: response
                .refresh_token
                .clone()
                .unwrap_or_else(|| existing.tokens.refresh_token.clone()),
            account_id: existing.tokens.account_id.clone(),
        },
        last_refresh: Some(now_iso),
        openai_api_key: existing.openai_api_key.clone(),
    }
}
