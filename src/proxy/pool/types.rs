use crate::models::StoredAuth;
use crate::modules::auth::claims;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Active,
    Refreshing,
    Cooldown,
    Blocked,
}

/// In-memory scheduling shadow of one stored account.
#[derive(Debug, Clone)]
pub struct PooledAccount {
    pub account_id: String,
    /// Upstream-side account id carried in the `chatgpt-account-id` header.
    pub upstream_account_id: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access-token expiry in ms since epoch; 0 when the claim is absent,
    /// which disables proactive refresh for the entry (the 401 path covers it).
    pub expires_at_ms: i64,
    pub state: AccountState,
    pub cooldown_until: Option<Instant>,
    pub consecutive_failures: u32,
    /// Consecutive 429 outcomes, drives the doubling cooldown backoff.
    pub rate_limit_strikes: u32,
    pub in_flight: u32,
}

impl PooledAccount {
    pub fn from_record(id: &str, record: &StoredAuth) -> Self {
        let derived = claims::derive_claims(&record.tokens.id_token, &record.tokens.access_token);
        Self {
            account_id: id.to_string(),
            upstream_account_id: Some(record.tokens.account_id.clone())
                .filter(|v| !v.is_empty()),
            access_token: record.tokens.access_token.clone(),
            refresh_token: Some(record.tokens.refresh_token.clone()).filter(|v| !v.is_empty()),
            expires_at_ms: derived.expires_at_ms,
            state: AccountState::Active,
            cooldown_until: None,
            consecutive_failures: 0,
            rate_limit_strikes: 0,
            in_flight: 0,
        }
    }

    /// Replace token material in place, keeping scheduling state. Used by
    /// hot reload so in-flight leases and health history survive.
    pub fn adopt_tokens(&mut self, record: &StoredAuth) {
        let derived = claims::derive_claims(&record.tokens.id_token, &record.tokens.access_token);
        self.upstream_account_id =
            Some(record.tokens.account_id.clone()).filter(|v| !v.is_empty());
        self.access_token = record.tokens.access_token.clone();
        self.refresh_token = Some(record.tokens.refresh_token.clone()).filter(|v| !v.is_empty());
        self.expires_at_ms = derived.expires_at_ms;
    }
}

/// Outcome of one leased request, as observed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Plain upstream status observation.
    Status(u16),
    /// 403 carrying an explicit account-ban marker in the body.
    Banned,
    /// Upstream 401 that a successful token refresh answered; the account
    /// goes straight back to rotation.
    Recovered,
    /// Connection-level failure before a status was observed.
    TransportError,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub account_count: usize,
    pub active: usize,
    pub cooldown: usize,
    pub blocked: usize,
}
