//! Upstream and identity-provider constants.
//!
//! The OAuth client id and issuer identify the upstream's public CLI client;
//! they are not secrets. Base URLs can be overridden through environment
//! variables, which the test suite uses to point at mock servers.

/// Identity provider host for the refresh-token exchange.
pub const OAUTH_ISSUER_HOST: &str = "auth.openai.com";

/// Public OAuth client id of the upstream CLI.
pub const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
pub const DEFAULT_USAGE_URL: &str = "https://chatgpt.com/backend-api/wham/usage";

// Client identity headers the upstream expects on forwarded requests.
pub const CODEX_CLIENT_VERSION: &str = "0.101.0";
pub const CODEX_USER_AGENT: &str =
    "codex_cli_rs/0.101.0 (Mac OS 26.0.1; arm64) Apple_Terminal/464";
pub const CODEX_OPENAI_BETA: &str = "responses=experimental";
pub const CODEX_ORIGINATOR: &str = "codex_cli_rs";

/// `client_version` appended to `/v1/models` requests that lack one.
pub const MODELS_CLIENT_VERSION: &str = "0.98.0";

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn upstream_base_url() -> String {
    env_nonempty("CODEXMUX_UPSTREAM_BASE_URL")
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string())
}

pub fn token_url() -> String {
    env_nonempty("CODEXMUX_TOKEN_URL")
        .unwrap_or_else(|| format!("https://{OAUTH_ISSUER_HOST}/oauth/token"))
}

pub fn usage_url() -> String {
    env_nonempty("CODEXMUX_USAGE_URL").unwrap_or_else(|| DEFAULT_USAGE_URL.to_string())
}
