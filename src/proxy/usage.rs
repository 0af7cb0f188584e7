//! Rate-limit window introspection for one account.
//!
//! Calls the upstream usage endpoint with a fresh token obtained through the
//! pool (which refreshes when stale) and maps the response into a flat
//! snapshot: two windows plus a derived availability.

use crate::constants::usage_url;
use crate::error::{AppError, AppResult};
use crate::proxy::pool::AccountPool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const USAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUsage {
    pub account_id: String,
    // primary window (short, ~5 hours)
    pub used_percent: Option<f64>,
    pub window_minutes: Option<u64>,
    pub resets_at: Option<i64>,
    // secondary window (long, ~7 days)
    pub secondary_used_percent: Option<f64>,
    pub secondary_window_minutes: Option<u64>,
    pub secondary_resets_at: Option<i64>,
    /// "available" | "unavailable" | "primary_window_available_only" | "unknown"
    pub availability: String,
    /// Unix seconds when this snapshot was taken.
    pub captured_at: i64,
}

pub async fn get_usage(pool: &AccountPool, account_id: &str) -> AppResult<AccountUsage> {
    let (access_token, upstream_account_id) = pool.fresh_token(account_id).await?;

    let client = reqwest::Client::builder()
        .timeout(USAGE_TIMEOUT)
        .build()?;
    let mut request = client
        .get(usage_url())
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Content-Type", "application/json");
    if let Some(id) = upstream_account_id {
        request = request.header("chatgpt-account-id", id);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Upstream(format!(
            "usage endpoint returned {status}: {body}"
        )));
    }
    let json: Value = response.json().await?;
    Ok(snapshot_from_payload(account_id, &json))
}

/// Pure mapping from the upstream payload to the snapshot shape.
pub(crate) fn snapshot_from_payload(account_id: &str, json: &Value) -> AccountUsage {
    let pw = json.pointer("/rate_limit/primary_window");
    let sw = json.pointer("/rate_limit/secondary_window");

    let used_percent = pw.and_then(|v| v.get("used_percent")).and_then(Value::as_f64);
    let window_minutes = pw
        .and_then(|v| v.get("limit_window_seconds"))
        .and_then(Value::as_u64)
        .map(|s| (s + 59) / 60);
    let resets_at = pw.and_then(|v| v.get("reset_at")).and_then(Value::as_i64);

    let secondary_used_percent = sw.and_then(|v| v.get("used_percent")).and_then(Value::as_f64);
    let secondary_window_minutes = sw
        .and_then(|v| v.get("limit_window_seconds"))
        .and_then(Value::as_u64)
        .map(|s| (s + 59) / 60);
    let secondary_resets_at = sw.and_then(|v| v.get("reset_at")).and_then(Value::as_i64);

    AccountUsage {
        account_id: account_id.to_string(),
        used_percent,
        window_minutes,
        resets_at,
        secondary_used_percent,
        secondary_window_minutes,
        secondary_resets_at,
        availability: derive_availability(used_percent, secondary_used_percent).to_string(),
        captured_at: chrono::Utc::now().timestamp(),
    }
}

fn derive_availability(primary: Option<f64>, secondary: Option<f64>) -> &'static str {
    match (primary, secondary) {
        (None, _) => "unknown",
        (Some(p), _) if p >= 100.0 => "unavailable",
        (Some(_), None) => "primary_window_available_only",
        (Some(_), Some(s)) if s >= 100.0 => "unavailable",
        _ => "available",
    }
}
