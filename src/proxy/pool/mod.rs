//! Account pool: round-robin selection over per-account health states.
//!
//! Locking discipline: `PoolInner` sits behind a plain mutex with short
//! critical sections (selection math, state transitions, reload reconcile).
//! No I/O happens while it is held; token refreshes run with the lock
//! released under a per-account async mutex that serializes them.

pub mod types;


use crate::error::{AppError, AppResult};
use crate::modules::auth::{claims, oauth, store::Store};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use types::{AccountState, LeaseOutcome, PoolStatus, PooledAccount};

/// Tokens expiring within this window are refreshed before use.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);
/// Base 429 cooldown; doubles per consecutive 429.
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);
const RATE_LIMIT_COOLDOWN_CEILING: Duration = Duration::from_secs(600);
/// Failure cooldown applied once `FAILURES_BEFORE_COOLDOWN` is reached.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
const FAILURES_BEFORE_COOLDOWN: u32 = 3;
const FAILURES_BEFORE_BLOCK: u32 = 10;
/// Cadence of the background cooldown-promotion sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

struct PoolInner {
    entries: Vec<PooledAccount>,
    cursor: usize,
}

enum Candidate {
    /// Nothing selectable and nothing refreshing.
    None,
    /// Nothing selectable right now, but this account's refresh may free up.
    AwaitRefresh(String),
    Picked {
        account_id: String,
        stale: bool,
    },
}

impl PoolInner {
    fn promote_elapsed(&mut self, now: Instant) {
        for entry in &mut self.entries {
            if entry.state == AccountState::Cooldown {
                let elapsed = entry.cooldown_until.map(|u| now >= u).unwrap_or(true);
                if elapsed {
                    entry.state = AccountState::Active;
                    entry.cooldown_until = None;
                }
            }
        }
    }

    fn find_mut(&mut self, account_id: &str) -> Option<&mut PooledAccount> {
        self.entries
            .iter_mut()
            .find(|e| e.account_id == account_id)
    }

    /// One round-robin walk. Cooldowns must have been promoted already;
    /// `attempted` holds accounts that already failed during this pick and
    /// must not be offered again.
    fn select(&mut self, now_ms: i64, attempted: &HashSet<String>) -> Candidate {
        let n = self.entries.len();
        if n == 0 {
            return Candidate::None;
        }
        let start = self.cursor % n;
        for i in 0..n {
            let idx = (start + i) % n;
            let entry = &mut self.entries[idx];
            if entry.state != AccountState::Active || attempted.contains(&entry.account_id) {
                continue;
            }
            self.cursor = (idx + 1) % n;
            let stale =
                entry.expires_at_ms > 0 && entry.expires_at_ms <= now_ms + EXPIRY_SKEW.as_millis() as i64;
            if stale {
                entry.state = AccountState::Refreshing;
            } else {
                entry.in_flight += 1;
            }
            return Candidate::Picked {
                account_id: entry.account_id.clone(),
                stale,
            };
        }
        match self
            .entries
            .iter()
            .find(|e| e.state == AccountState::Refreshing)
        {
            Some(e) => Candidate::AwaitRefresh(e.account_id.clone()),
            None => Candidate::None,
        }
    }

    fn finish(&mut self, account_id: &str, outcome: &LeaseOutcome) {
        // The account may have been dropped by a reload mid-flight; the lease
        // stays valid but there is no state left to update.
        let Some(entry) = self.find_mut(account_id) else {
            return;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        match outcome {
            LeaseOutcome::Status(status) if (200..400).contains(status) => {
                entry.state = AccountState::Active;
                entry.cooldown_until = None;
                entry.consecutive_failures = 0;
                entry.rate_limit_strikes = 0;
            }
            LeaseOutcome::Recovered => {
                if entry.state != AccountState::Blocked {
                    entry.state = AccountState::Active;
                }
            }
            LeaseOutcome::Status(429) => {
                entry.rate_limit_strikes += 1;
                let exponent = entry.rate_limit_strikes.saturating_sub(1).min(8);
                let backoff = RATE_LIMIT_COOLDOWN
                    .saturating_mul(1u32 << exponent)
                    .min(RATE_LIMIT_COOLDOWN_CEILING);
                entry.state = AccountState::Cooldown;
                entry.cooldown_until = Some(Instant::now() + backoff);
                tracing::info!(
                    "[Pool] account {} rate limited, cooling down {}s",
                    account_id,
                    backoff.as_secs()
                );
            }
            LeaseOutcome::Status(401) => {
                // A 401 that reaches report means refresh was impossible or
                // failed; the credentials are unusable.
                entry.state = AccountState::Blocked;
                tracing::warn!("[Pool] account {} blocked after unrecovered 401", account_id);
            }
            LeaseOutcome::Banned => {
                entry.state = AccountState::Blocked;
                tracing::warn!("[Pool] account {} blocked by upstream ban", account_id);
            }
            LeaseOutcome::Status(status) if *status >= 500 => {
                record_failure(entry);
            }
            LeaseOutcome::TransportError => {
                record_failure(entry);
            }
            LeaseOutcome::Status(_) => {
                // Other 4xx are the caller's problem, not the account's.
                if entry.state == AccountState::Refreshing {
                    entry.state = AccountState::Active;
                }
            }
        }
    }
}

fn record_failure(entry: &mut PooledAccount) {
    entry.consecutive_failures += 1;
    if entry.consecutive_failures >= FAILURES_BEFORE_BLOCK {
        entry.state = AccountState::Blocked;
        tracing::warn!(
            "[Pool] account {} blocked after {} consecutive failures",
            entry.account_id,
            entry.consecutive_failures
        );
    } else if entry.consecutive_failures >= FAILURES_BEFORE_COOLDOWN {
        entry.state = AccountState::Cooldown;
        entry.cooldown_until = Some(Instant::now() + FAILURE_COOLDOWN);
    }
}

/// A transient assignment of one account to one in-flight request. Consumed
/// by `AccountPool::report`; a lease dropped without a report counts as a
/// transport failure so cancelled requests cannot leak `in_flight`.
pub struct Lease {
    account_id: String,
    pub upstream_account_id: Option<String>,
    pub access_token: String,
    inner: Arc<Mutex<PoolInner>>,
    reported: bool,
}

impl Lease {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            inner.finish(&self.account_id, &LeaseOutcome::TransportError);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

pub struct AccountPool {
    inner: Arc<Mutex<PoolInner>>,
    store: Arc<Store>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AccountPool {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                entries: Vec::new(),
                cursor: 0,
            })),
            store,
            refresh_locks: DashMap::new(),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load (or hot-reload) the pool from the token store. Existing entries
    /// keep their state and in-flight counts but adopt fresh token material;
    /// new ids enter Active; removed ids drop out.
    pub async fn reload(&self) -> AppResult<usize> {
        let credentials = self.store.credentials()?;
        let mut inner = self.lock_inner();
        let mut next = Vec::with_capacity(credentials.len());
        for (id, record) in &credentials {
            match inner.find_mut(id) {
                Some(existing) => {
                    existing.adopt_tokens(record);
                    next.push(existing.clone());
                }
                None => next.push(PooledAccount::from_record(id, record)),
            }
        }
        inner.entries = next;
        if !inner.entries.is_empty() {
            inner.cursor %= inner.entries.len();
        } else {
            inner.cursor = 0;
        }
        tracing::info!("[Pool] loaded {} account(s)", inner.entries.len());
        Ok(inner.entries.len())
    }

    /// Lease a healthy account, refreshing its token first when it is about
    /// to expire. A candidate whose refresh fails is skipped and the walk
    /// continues with the next account; the refresh error only surfaces when
    /// nothing else is selectable. Fails with `PoolExhausted` when no account
    /// is selectable at all.
    pub async fn pick(&self) -> AppResult<Lease> {
        let max_walks = {
            let inner = self.lock_inner();
            inner.entries.len() + 1
        };
        let mut attempted: HashSet<String> = HashSet::new();
        let mut last_refresh_err: Option<AppError> = None;
        for _ in 0..max_walks {
            let candidate = {
                let mut inner = self.lock_inner();
                inner.promote_elapsed(Instant::now());
                inner.select(chrono::Utc::now().timestamp_millis(), &attempted)
            };
            match candidate {
                Candidate::Picked { account_id, stale } => {
                    if !stale {
                        return self.lease_for(&account_id);
                    }
                    match self.refresh_account(&account_id).await {
                        Ok(_) => {
                            let leased = {
                                let mut inner = self.lock_inner();
                                match inner.find_mut(&account_id) {
                                    Some(e) if e.state == AccountState::Active => {
                                        e.in_flight += 1;
                                        true
                                    }
                                    _ => false,
                                }
                            };
                            if leased {
                                return self.lease_for(&account_id);
                            }
                            // Refresh raced a state change; try the walk again.
                        }
                        Err(e) => {
                            // refresh_account already settled the entry's
                            // state (Blocked or failure-counted); walk on to
                            // the next candidate.
                            tracing::warn!(
                                "[Pool] refresh for {} failed during pick: {}",
                                account_id,
                                e
                            );
                            attempted.insert(account_id);
                            last_refresh_err = Some(e);
                        }
                    }
                }
                Candidate::AwaitRefresh(account_id) => {
                    // Queue behind the in-progress refresh, then rewalk.
                    let lock = self.refresh_lock(&account_id);
                    drop(lock.lock().await);
                }
                Candidate::None => {
                    return Err(last_refresh_err.unwrap_or(AppError::PoolExhausted));
                }
            }
        }
        Err(last_refresh_err.unwrap_or(AppError::PoolExhausted))
    }

    fn lease_for(&self, account_id: &str) -> AppResult<Lease> {
        let inner = self.lock_inner();
        let entry = inner
            .entries
            .iter()
            .find(|e| e.account_id == account_id)
            .ok_or(AppError::PoolExhausted)?;
        Ok(Lease {
            account_id: entry.account_id.clone(),
            upstream_account_id: entry.upstream_account_id.clone(),
            access_token: entry.access_token.clone(),
            inner: self.inner.clone(),
            reported: false,
        })
    }

    /// Consume a lease with the observed upstream outcome. Exactly-once:
    /// the lease's drop guard is disarmed here.
    pub fn report(&self, mut lease: Lease, outcome: LeaseOutcome) {
        lease.reported = true;
        let mut inner = self.lock_inner();
        inner.finish(&lease.account_id, &outcome);
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Single-flight token refresh. Concurrent callers serialize on the
    /// per-account lock; losers observe the winner's token and return it
    /// without a second upstream call.
    pub async fn refresh_account(&self, account_id: &str) -> AppResult<String> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let (refresh_token, current_token, fresh) = {
            let mut inner = self.lock_inner();
            let entry = inner
                .find_mut(account_id)
                .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;
            let fresh = entry.expires_at_ms > now_ms + EXPIRY_SKEW.as_millis() as i64;
            if fresh && entry.state == AccountState::Refreshing {
                entry.state = AccountState::Active;
            }
            if !fresh {
                entry.state = AccountState::Refreshing;
            }
            (entry.refresh_token.clone(), entry.access_token.clone(), fresh)
        };
        if fresh {
            return Ok(current_token);
        }

        let Some(refresh_token) = refresh_token else {
            let mut inner = self.lock_inner();
            if let Some(entry) = inner.find_mut(account_id) {
                entry.state = AccountState::Blocked;
            }
            return Err(AppError::RefreshFailed(format!(
                "account {account_id} has no refresh token"
            )));
        };

        match oauth::refresh_access_token(&refresh_token).await {
            Ok(response) => {
                let existing = self.store.load(account_id).unwrap_or_else(|_| {
                    // Record vanished mid-refresh; persist what we know.
                    crate::models::StoredAuth {
                        tokens: crate::models::StoredTokens {
                            id_token: String::new(),
                            access_token: current_token.clone(),
                            refresh_token: refresh_token.clone(),
                            account_id: String::new(),
                        },
                        last_refresh: None,
                        openai_api_key: None,
                    }
                });
                let updated = oauth::apply_refresh(&existing, &response);
                if let Err(e) = self.store.save(account_id, &updated) {
                    tracing::warn!("[Pool] failed to persist refresh for {}: {}", account_id, e);
                }
                self.store.sync_cli_auth(&refresh_token, &updated);

                let derived =
                    claims::derive_claims(&updated.tokens.id_token, &updated.tokens.access_token);
                let expires_at_ms = if derived.expires_at_ms > 0 {
                    derived.expires_at_ms
                } else {
                    response
                        .expires_in
                        .map(|s| now_ms + s * 1000)
                        .unwrap_or(0)
                };

                let mut inner = self.lock_inner();
                if let Some(entry) = inner.find_mut(account_id) {
                    entry.adopt_tokens(&updated);
                    entry.expires_at_ms = expires_at_ms;
                    entry.state = AccountState::Active;
                }
                tracing::info!("[Pool] refreshed access token for {}", account_id);
                Ok(updated.tokens.access_token)
            }
            Err(e) if e.is_invalid_grant() => {
                let mut inner = self.lock_inner();
                if let Some(entry) = inner.find_mut(account_id) {
                    entry.state = AccountState::Blocked;
                }
                Err(AppError::RefreshFailed(e.to_string()))
            }
            Err(e) => {
                let mut inner = self.lock_inner();
                if let Some(entry) = inner.find_mut(account_id) {
                    entry.state = AccountState::Active;
                    record_failure(entry);
                }
                Err(AppError::RefreshFailed(e.to_string()))
            }
        }
    }

    /// Fresh bearer token for one account, refreshing when stale. Used by
    /// the usage reader.
    pub async fn fresh_token(&self, account_id: &str) -> AppResult<(String, Option<String>)> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (token, upstream_id, fresh) = {
            let inner = self.lock_inner();
            let entry = inner
                .entries
                .iter()
                .find(|e| e.account_id == account_id)
                .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;
            let fresh = entry.expires_at_ms == 0
                || entry.expires_at_ms > now_ms + EXPIRY_SKEW.as_millis() as i64;
            (
                entry.access_token.clone(),
                entry.upstream_account_id.clone(),
                fresh,
            )
        };
        if fresh {
            return Ok((token, upstream_id));
        }
        let token = self.refresh_account(account_id).await?;
        let upstream_id = {
            let inner = self.lock_inner();
            inner
                .entries
                .iter()
                .find(|e| e.account_id == account_id)
                .and_then(|e| e.upstream_account_id.clone())
        };
        Ok((token, upstream_id))
    }

    pub fn status(&self) -> PoolStatus {
        let mut inner = self.lock_inner();
        inner.promote_elapsed(Instant::now());
        let entries = &inner.entries;
        PoolStatus {
            account_count: entries.len(),
            active: entries
                .iter()
                .filter(|e| e.state == AccountState::Active)
                .count(),
            cooldown: entries
                .iter()
                .filter(|e| e.state == AccountState::Cooldown)
                .count(),
            blocked: entries
                .iter()
                .filter(|e| e.state == AccountState::Blocked)
                .count(),
        }
    }

    /// Background sweep promoting elapsed cooldowns so `status` and external
    /// observers converge even without pick traffic.
    pub fn start_sweeper(&self) {
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        if let Ok(mut inner) = inner.lock() {
                            inner.promote_elapsed(Instant::now());
                        }
                    }
                }
            }
        });
        let mut slot = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = {
            let mut slot = self
                .sweeper
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
    }

    // ---- test support ----------------------------------------------------

    #[cfg(test)]
    pub(crate) fn entry_for_test(&self, account_id: &str) -> Option<PooledAccount> {
        let inner = self.lock_inner();
        inner
            .entries
            .iter()
            .find(|e| e.account_id == account_id)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn mutate_entry_for_test<F: FnOnce(&mut PooledAccount)>(
        &self,
        account_id: &str,
        f: F,
    ) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.find_mut(account_id) {
            f(entry);
        }
    }
}
