//! Token Store: the single source of truth for account credentials on disk.
//!
//! Layout, shared with the upstream CLI:
//!   <codex_dir>/auth.json                 — the CLI's "current" account
//!   <codex_dir>/accounts/<id>/auth.json   — per-managed-account credentials
//!   <codex_dir>/accounts_meta.json        — id -> {label, added_at}
//!   <codex_dir>/config.toml               — opaque CLI config, read-only here

use crate::error::{AppError, AppResult};
use crate::models::{Account, MetaEntry, StoredAuth, StoredTokens};
use crate::modules::auth::claims;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct Store {
    codex_dir: PathBuf,
}

impl Store {
    pub fn new(codex_dir: PathBuf) -> Self {
        Self { codex_dir }
    }

    /// Store rooted at the CLI's own directory, `~/.codex`.
    pub fn default_location() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::new(home.join(".codex"))
    }

    fn accounts_dir(&self) -> PathBuf {
        self.codex_dir.join("accounts")
    }

    fn account_file(&self, id: &str) -> PathBuf {
        self.accounts_dir().join(id).join("auth.json")
    }

    fn auth_file(&self) -> PathBuf {
        self.codex_dir.join("auth.json")
    }

    fn meta_file(&self) -> PathBuf {
        self.codex_dir.join("accounts_meta.json")
    }

    /// Snapshot of all managed accounts with claim-derived fields.
    /// Corrupt records are logged and skipped; enumeration never aborts.
    pub fn list(&self) -> AppResult<Vec<Account>> {
        let accounts_dir = self.accounts_dir();
        if !accounts_dir.exists() {
            return Ok(Vec::new());
        }

        let meta = self.read_meta();
        let mut accounts = Vec::new();
        for entry in fs::read_dir(&accounts_dir)?.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            let path = entry.path().join("auth.json");
            if !path.exists() {
                continue;
            }
            match read_record(&path) {
                Ok(record) => accounts.push(account_from_record(&id, &record, meta.get(&id))),
                Err(e) => {
                    tracing::warn!("[Store] skipping corrupt record for {}: {}", id, e);
                }
            }
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    /// Credential records (token material included) for every managed account.
    /// Same skip-on-corruption policy as `list`.
    pub fn credentials(&self) -> AppResult<Vec<(String, StoredAuth)>> {
        let accounts_dir = self.accounts_dir();
        if !accounts_dir.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in fs::read_dir(&accounts_dir)?.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            let path = entry.path().join("auth.json");
            if !path.exists() {
                continue;
            }
            match read_record(&path) {
                Ok(record) if !record.tokens.access_token.is_empty() => out.push((id, record)),
                Ok(_) => tracing::warn!("[Store] account {} has no access token, skipping", id),
                Err(e) => tracing::warn!("[Store] skipping corrupt record for {}: {}", id, e),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn load(&self, id: &str) -> AppResult<StoredAuth> {
        let path = self.account_file(id);
        if !path.exists() {
            return Err(AppError::AccountNotFound(id.to_string()));
        }
        read_record(&path)
    }

    /// Atomic replace: the record is written to a temp file in the same
    /// directory and renamed over the destination.
    pub fn save(&self, id: &str, record: &StoredAuth) -> AppResult<()> {
        let path = self.account_file(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(record)
            .map_err(|e| AppError::store(format!("serialize record for {id}: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove an account's record and metadata. Idempotent.
    pub fn delete(&self, id: &str) -> AppResult<()> {
        let dir = self.accounts_dir().join(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let mut meta = self.read_meta();
        if meta.remove(id).is_some() {
            self.write_meta(&meta);
        }
        Ok(())
    }

    pub fn read_meta(&self) -> HashMap<String, MetaEntry> {
        let path = self.meta_file();
        if !path.exists() {
            return HashMap::new();
        }
        fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write_meta(&self, meta: &HashMap<String, MetaEntry>) {
        if let Ok(json) = serde_json::to_string_pretty(meta) {
            if let Err(e) = fs::write(self.meta_file(), json) {
                tracing::warn!("[Store] failed to write accounts_meta.json: {}", e);
            }
        }
    }

    /// Import the CLI's current `auth.json` as a managed account under a
    /// filesystem-safe slug derived from the stored account id.
    pub fn import_current(&self, label: Option<String>) -> AppResult<Account> {
        let auth_path = self.auth_file();
        if !auth_path.exists() {
            return Err(AppError::store(
                "no auth.json found; log in with the CLI first",
            ));
        }
        let record = read_record(&auth_path)?;
        let derived = claims::derive_claims(&record.tokens.id_token, &record.tokens.access_token);

        let raw_id = if !record.tokens.account_id.is_empty() {
            record.tokens.account_id.clone()
        } else if !derived.user_id.is_empty() {
            derived.user_id.clone()
        } else {
            "acc_tmp".to_string()
        };
        let safe_id = sanitize_id(&raw_id);

        self.save(&safe_id, &record)?;

        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let mut meta = self.read_meta();
        meta.insert(
            safe_id.clone(),
            MetaEntry {
                label,
                added_at: now_ms,
            },
        );
        self.write_meta(&meta);

        Ok(account_from_record(
            &safe_id,
            &record,
            meta.get(&safe_id),
        ))
    }

    /// Keep the CLI's `auth.json` in step after a refresh when it holds the
    /// same refresh token the managed record had.
    pub fn sync_cli_auth(&self, previous_refresh_token: &str, updated: &StoredAuth) {
        let auth_path = self.auth_file();
        let Ok(content) = fs::read_to_string(&auth_path) else {
            return;
        };
        let Ok(current) = serde_json::from_str::<Value>(&content) else {
            return;
        };
        let current_rt = current
            .pointer("/tokens/refresh_token")
            .or_else(|| current.get("refresh_token"))
            .and_then(|v| v.as_str());
        if current_rt == Some(previous_refresh_token) {
            if let Ok(payload) = serde_json::to_string_pretty(updated) {
                if let Err(e) = fs::write(&auth_path, payload) {
                    tracing::warn!("[Store] failed to sync CLI auth.json: {}", e);
                }
            }
        }
    }

    /// Raw passthrough of the CLI's `config.toml`; never parsed here.
    pub fn read_cli_config(&self) -> AppResult<String> {
        let path = self.codex_dir.join("config.toml");
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(path)?)
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_record(path: &Path) -> AppResult<StoredAuth> {
    let content = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| AppError::store(format!("{}: {e}", path.display())))?;
    parse_record(&value).ok_or_else(|| AppError::store(format!("{}: no token fields", path.display())))
}

/// Accept both the nested `tokens {}` layout and the legacy flat layout.
fn parse_record(value: &Value) -> Option<StoredAuth> {
    if !value.is_object() {
        return None;
    }
    let tokens = value.get("tokens");
    let field = |name: &str| -> String {
        tokens
            .and_then(|t| t.get(name))
            .or_else(|| value.get(name))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    let record = StoredAuth {
        tokens: StoredTokens {
            id_token: field("id_token"),
            access_token: field("access_token"),
            refresh_token: field("refresh_token"),
            account_id: field("account_id"),
        },
        last_refresh: value
            .get("last_refresh")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        openai_api_key: value
            .get("OPENAI_API_KEY")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    };

    let t = &record.tokens;
    if t.id_token.is_empty()
        && t.access_token.is_empty()
        && t.refresh_token.is_empty()
        && t.account_id.is_empty()
    {
        return None;
    }
    Some(record)
}

pub fn account_from_record(id: &str, record: &StoredAuth, meta: Option<&MetaEntry>) -> Account {
    let derived = claims::derive_claims(&record.tokens.id_token, &record.tokens.access_token);
    Account {
        id: id.to_string(),
        email: derived.email,
        plan: derived.plan,
        user_id: derived.user_id,
        expires_at: derived.expires_at_ms,
        last_refresh: record.last_refresh.clone(),
        has_refresh_token: !record.tokens.refresh_token.is_empty(),
        openai_api_key: record.openai_api_key.clone(),
        label: meta.and_then(|m| m.label.clone()),
        added_at: meta.map(|m| m.added_at).unwrap_or(0),
    }
}
