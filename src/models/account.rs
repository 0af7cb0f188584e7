use serde::{Deserialize, Serialize};

/// Subscription tier derived from the `chatgpt_plan_type` claim.
///
/// Unknown tiers are preserved verbatim so a newer upstream plan name
/// round-trips instead of collapsing to `free`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Plus,
    Pro,
    Ultra,
    #[serde(untagged)]
    Other(String),
}

impl Plan {
    pub fn from_claim(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "free" => Plan::Free,
            "plus" => Plan::Plus,
            "pro" => Plan::Pro,
            "ultra" => Plan::Ultra,
            other => Plan::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Plan::Free => "free",
            Plan::Plus => "plus",
            Plan::Pro => "pro",
            Plan::Ultra => "ultra",
            Plan::Other(s) => s.as_str(),
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        Plan::Free
    }
}

/// Token material as persisted inside an account's `auth.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTokens {
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub account_id: String,
}

/// On-disk account record. Writes always emit this nested form; the legacy
/// flat layout (token fields at the top level) is accepted on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAuth {
    pub tokens: StoredTokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    #[serde(
        rename = "OPENAI_API_KEY",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub openai_api_key: Option<String>,
}

/// Sidecar metadata kept in `accounts_meta.json`, keyed by account id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaEntry {
    pub label: Option<String>,
    #[serde(default)]
    pub added_at: u64,
}

/// An account as surfaced to callers: claim-derived fields plus metadata,
/// without the raw token material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub plan: Plan,
    pub user_id: String,
    /// Access-token expiry, milliseconds since epoch. 0 when the claim is absent.
    pub expires_at: i64,
    pub last_refresh: Option<String>,
    pub has_refresh_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub added_at: u64,
}
