//! End-to-end scenarios: a real proxy instance on an ephemeral port, mock
//! upstream and identity servers bound to 127.0.0.1:0, and a plain reqwest
//! client on the inbound side.

use crate::models::config::ProxyConfig;
use crate::models::{StoredAuth, StoredTokens};
use crate::modules::auth::claims::encode_test_jwt;
use crate::modules::auth::store::Store;
use crate::proxy::logs::LogSink;
use crate::proxy::pool::{AccountPool, AccountState};
use crate::proxy::server::ProxyServer;
use crate::test_utils::EnvSandbox;
use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn plain_record(access_token: &str, refresh_token: &str, upstream_id: &str) -> StoredAuth {
    StoredAuth {
        tokens: StoredTokens {
            id_token: String::new(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            account_id: upstream_id.to_string(),
        },
        last_refresh: None,
        openai_api_key: None,
    }
}

/// Record whose access token is an expired JWT, forcing a refresh on pick.
fn stale_record(refresh_token: &str, upstream_id: &str) -> StoredAuth {
    let access_token = encode_test_jwt(&json!({ "exp": 1_000 }));
    StoredAuth {
        tokens: StoredTokens {
            id_token: String::new(),
            access_token,
            refresh_token: refresh_token.to_string(),
            account_id: upstream_id.to_string(),
        },
        last_refresh: None,
        openai_api_key: None,
    }
}

async fn start_server(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    (format!("http://{addr}"), handle)
}

struct Harness {
    _dir: TempDir,
    store: Arc<Store>,
    pool: Arc<AccountPool>,
    sink: Arc<LogSink>,
    server: ProxyServer,
    base: String,
}

async fn start_proxy(records: &[(&str, StoredAuth)], config: ProxyConfig) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(Store::new(dir.path().join(".codex")));
    for (id, record) in records {
        store.save(id, record).expect("save account");
    }
    let pool = Arc::new(AccountPool::new(store.clone()));
    pool.reload().await.expect("load pool");
    let sink = Arc::new(
        LogSink::in_memory(config.enable_logging, config.max_logs).expect("sink"),
    );
    let server = ProxyServer::new();
    let port = server
        .start(0, pool.clone(), sink.clone(), Arc::new(config))
        .await
        .expect("start proxy");
    Harness {
        _dir: dir,
        store,
        pool,
        sink,
        server,
        base: format!("http://127.0.0.1:{port}"),
    }
}

/// Upstream that answers `ok-<SUFFIX>` for bearer tokens of the form
/// `at-<suffix>`.
async fn bearer_suffix_echo(req: Request<Body>) -> Response {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match bearer.strip_prefix("Bearer at-") {
        Some(suffix) => (StatusCode::OK, format!("ok-{}", suffix.to_uppercase())).into_response(),
        None => (StatusCode::UNAUTHORIZED, "unknown bearer").into_response(),
    }
}

async fn bearer_full_echo(req: Request<Body>) -> Response {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    (StatusCode::OK, bearer).into_response()
}

#[tokio::test]
async fn three_accounts_round_robin_happy_path() {
    let env = EnvSandbox::take();
    let (upstream, upstream_task) = start_server(Router::new().fallback(any(bearer_suffix_echo))).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);

    let harness = start_proxy(
        &[
            ("a", plain_record("at-a", "rt-a", "up-a")),
            ("b", plain_record("at-b", "rt-b", "up-b")),
            ("c", plain_record("at-c", "rt-c", "up-c")),
        ],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    let mut bodies = Vec::new();
    for _ in 0..3 {
        let resp = client
            .get(format!("{}/v1/models", harness.base))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        bodies.push(resp.text().await.expect("body"));
    }
    assert_eq!(bodies, vec!["ok-A", "ok-B", "ok-C"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let logs = harness.sink.query("", false, 10, 0).expect("logs");
    assert_eq!(logs.len(), 3);
    let mut accounts: Vec<_> = logs.iter().map(|l| l.account_id.clone()).collect();
    accounts.sort();
    assert_eq!(accounts, vec!["a", "b", "c"]);
    assert!(logs.iter().all(|l| l.status == 200));

    harness.server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn invalid_api_key_is_rejected_locally() {
    let env = EnvSandbox::take();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = hits.clone();
    let upstream_app = Router::new().fallback(any(move || {
        let hits = hits_handler.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            "should not be reached"
        }
    }));
    let (upstream, upstream_task) = start_server(upstream_app).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);

    let config = ProxyConfig {
        api_key: Some("sk-test".into()),
        ..ProxyConfig::default()
    };
    let harness = start_proxy(&[("a", plain_record("at-a", "rt-a", "up-a"))], config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .header("authorization", "Bearer wrong-key")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_api_key");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "pool must stay untouched");

    let logs = harness.sink.query("", true, 10, 0).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, 401);

    // The right key goes through (x-api-key form).
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .header("x-api-key", "sk-test")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    harness.server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn upstream_401_triggers_refresh_and_single_transparent_retry() {
    let env = EnvSandbox::take();
    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = upstream_hits.clone();
    let upstream_app = Router::new().fallback(any(move |req: Request<Body>| {
        let hits = hits_handler.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            let bearer = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if bearer == "Bearer fresh-at" {
                (StatusCode::OK, "ok-after-refresh").into_response()
            } else {
                (StatusCode::UNAUTHORIZED, "expired").into_response()
            }
        }
    }));
    let (upstream, upstream_task) = start_server(upstream_app).await;

    let token_app = Router::new().route(
        "/oauth/token",
        post(|| async {
            Json(json!({ "access_token": "fresh-at", "expires_in": 3600 }))
        }),
    );
    let (token_base, token_task) = start_server(token_app).await;

    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);
    env.set("CODEXMUX_TOKEN_URL", &format!("{token_base}/oauth/token"));

    let harness = start_proxy(
        &[("a", plain_record("stale-at", "rt-a", "up-a"))],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/responses", harness.base))
        .json(&json!({ "model": "gpt-5.2-codex", "input": "hi" }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok-after-refresh");
    assert_eq!(upstream_hits.load(Ordering::SeqCst), 2, "exactly one retry");

    // Only the final attempt is logged.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let logs = harness.sink.query("", false, 10, 0).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, 200);
    assert_eq!(logs[0].model.as_deref(), Some("gpt-5.2-codex"));

    // The refreshed token was persisted.
    let saved = harness.store.load("a").expect("load");
    assert_eq!(saved.tokens.access_token, "fresh-at");

    harness.server.stop().await;
    upstream_task.abort();
    token_task.abort();
}

#[tokio::test]
async fn rate_limited_account_cools_down_and_rotation_continues() {
    let env = EnvSandbox::take();
    let upstream_app = Router::new().fallback(any(|req: Request<Body>| async move {
        let bearer = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match bearer.strip_prefix("Bearer at-") {
            Some("a") => (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response(),
            Some(suffix) => {
                (StatusCode::OK, format!("ok-{}", suffix.to_uppercase())).into_response()
            }
            None => (StatusCode::UNAUTHORIZED, "unknown").into_response(),
        }
    }));
    let (upstream, upstream_task) = start_server(upstream_app).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);

    let harness = start_proxy(
        &[
            ("a", plain_record("at-a", "rt-a", "up-a")),
            ("b", plain_record("at-b", "rt-b", "up-b")),
            ("c", plain_record("at-c", "rt-c", "up-c")),
        ],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    // First request lands on A, which is rate limited; the status passes
    // through verbatim.
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 429);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.pool.entry_for_test("a").expect("entry").state,
        AccountState::Cooldown
    );

    // The next two picks rotate over B then C.
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.text().await.expect("body"), "ok-B");
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.text().await.expect("body"), "ok-C");

    harness.server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn stale_token_is_refreshed_before_forwarding() {
    let env = EnvSandbox::take();
    let (upstream, upstream_task) =
        start_server(Router::new().fallback(any(bearer_full_echo))).await;
    let token_app = Router::new().route(
        "/oauth/token",
        post(|| async { Json(json!({ "access_token": "new", "expires_in": 3600 })) }),
    );
    let (token_base, token_task) = start_server(token_app).await;

    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);
    env.set("CODEXMUX_TOKEN_URL", &format!("{token_base}/oauth/token"));

    let harness = start_proxy(
        &[("a", stale_record("rt-a", "up-a"))],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "Bearer new");

    let saved = harness.store.load("a").expect("load");
    assert_eq!(saved.tokens.access_token, "new");
    assert!(saved.last_refresh.is_some());

    harness.server.stop().await;
    upstream_task.abort();
    token_task.abort();
}

#[tokio::test]
async fn invalid_refresh_blocks_the_account_until_reload() {
    let env = EnvSandbox::take();
    let (upstream, upstream_task) =
        start_server(Router::new().fallback(any(bearer_full_echo))).await;
    let token_app = Router::new().route(
        "/oauth/token",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_grant" })),
            )
        }),
    );
    let (token_base, token_task) = start_server(token_app).await;

    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);
    env.set("CODEXMUX_TOKEN_URL", &format!("{token_base}/oauth/token"));

    let harness = start_proxy(
        &[("a", stale_record("rt-dead", "up-a"))],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 502);

    assert_eq!(
        harness.pool.entry_for_test("a").expect("entry").state,
        AccountState::Blocked
    );

    // Blocked is terminal: the pool reports exhaustion from now on.
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "no_healthy_account");

    harness.server.stop().await;
    upstream_task.abort();
    token_task.abort();
}

#[tokio::test]
async fn ban_indicator_in_403_body_blocks_the_account() {
    let env = EnvSandbox::take();
    let upstream_app = Router::new().fallback(any(|| async {
        (
            StatusCode::FORBIDDEN,
            r#"{"error":"account_deactivated"}"#,
        )
    }));
    let (upstream, upstream_task) = start_server(upstream_app).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);

    let harness = start_proxy(
        &[("a", plain_record("at-a", "rt-a", "up-a"))],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/v1/models", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 403);
    assert_eq!(
        harness.pool.entry_for_test("a").expect("entry").state,
        AccountState::Blocked
    );

    harness.server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn hot_reload_mid_stream_keeps_the_original_lease_valid() {
    let env = EnvSandbox::take();
    let upstream_app = Router::new()
        .route(
            "/slow",
            get(|| async {
                let stream = futures::stream::unfold(0u8, |n| async move {
                    match n {
                        0 => Some((
                            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(
                                b"chunk-1",
                            )),
                            1,
                        )),
                        1 => {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            Some((Ok(bytes::Bytes::from_static(b"chunk-2")), 2))
                        }
                        _ => None,
                    }
                });
                Response::new(Body::from_stream(stream))
            }),
        )
        .fallback(any(bearer_full_echo));
    let (upstream, upstream_task) = start_server(upstream_app).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);

    let harness = start_proxy(
        &[("a", plain_record("at-a", "rt-a", "up-a"))],
        ProxyConfig::default(),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/slow", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let mut stream = resp;

    // First chunk arrives, then tokens rotate on disk and the pool reloads
    // while the stream is still open.
    let first = stream.chunk().await.expect("chunk").expect("some");
    assert_eq!(&first[..], b"chunk-1");

    harness
        .store
        .save("a", &plain_record("rotated-at", "rt-a", "up-a"))
        .expect("rotate");
    harness.pool.reload().await.expect("reload");

    let mut rest = Vec::new();
    while let Some(chunk) = stream.chunk().await.expect("chunk") {
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, b"chunk-2");

    // The next lease carries the rotated token.
    let resp = client
        .get(format!("{}/echo", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.text().await.expect("body"), "Bearer rotated-at");

    harness.server.stop().await;
    upstream_task.abort();
}

#[tokio::test]
async fn stop_is_graceful_and_idempotent() {
    let env = EnvSandbox::take();
    let (upstream, upstream_task) =
        start_server(Router::new().fallback(any(bearer_full_echo))).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);

    let harness = start_proxy(
        &[("a", plain_record("at-a", "rt-a", "up-a"))],
        ProxyConfig::default(),
    )
    .await;
    let base = harness.base.clone();

    let status = harness.server.status().await;
    assert!(status.running);
    assert_eq!(status.account_count, 1);

    assert!(harness.server.stop().await);
    assert!(!harness.server.stop().await, "second stop is a no-op");
    assert!(!harness.server.status().await.running);

    let result = reqwest::Client::new()
        .get(format!("{base}/v1/models"))
        .timeout(Duration::from_millis(500))
        .send()
        .await;
    assert!(result.is_err(), "stopped proxy must not accept connections");

    upstream_task.abort();
}

#[tokio::test]
async fn double_start_is_rejected() {
    let _env = EnvSandbox::take();
    let harness = start_proxy(
        &[("a", plain_record("at-a", "rt-a", "up-a"))],
        ProxyConfig::default(),
    )
    .await;
    let result = harness
        .server
        .start(
            0,
            harness.pool.clone(),
            harness.sink.clone(),
            Arc::new(ProxyConfig::default()),
        )
        .await;
    assert!(matches!(
        result,
        Err(crate::error::AppError::AlreadyRunning(_))
    ));
    harness.server.stop().await;
}

#[tokio::test]
async fn usage_reader_maps_rate_limit_windows() {
    let env = EnvSandbox::take();
    let usage_app = Router::new().route(
        "/wham/usage",
        get(|req: Request<Body>| async move {
            // The bearer and upstream account id must be forwarded.
            let bearer = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            assert_eq!(bearer, "Bearer at-a");
            assert_eq!(
                req.headers()
                    .get("chatgpt-account-id")
                    .and_then(|v| v.to_str().ok()),
                Some("up-a")
            );
            Json(json!({
                "rate_limit": {
                    "primary_window": {
                        "used_percent": 75.0,
                        "limit_window_seconds": 18000,
                        "reset_at": 1_900_000_000
                    },
                    "secondary_window": {
                        "used_percent": 20.0,
                        "limit_window_seconds": 604800,
                        "reset_at": 1_900_600_000
                    }
                }
            }))
        }),
    );
    let (usage_base, usage_task) = start_server(usage_app).await;
    env.set("CODEXMUX_USAGE_URL", &format!("{usage_base}/wham/usage"));

    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(Store::new(dir.path().join(".codex")));
    store
        .save("a", &plain_record("at-a", "rt-a", "up-a"))
        .expect("save");
    let pool = AccountPool::new(store);
    pool.reload().await.expect("reload");

    let usage = crate::proxy::usage::get_usage(&pool, "a")
        .await
        .expect("usage");
    assert_eq!(usage.account_id, "a");
    assert_eq!(usage.used_percent, Some(75.0));
    assert_eq!(usage.window_minutes, Some(300));
    assert_eq!(usage.secondary_used_percent, Some(20.0));
    assert_eq!(usage.availability, "available");

    usage_task.abort();
}

#[tokio::test]
async fn admin_api_exposes_status_and_logs_behind_the_key() {
    let env = EnvSandbox::take();
    let (upstream, upstream_task) =
        start_server(Router::new().fallback(any(bearer_full_echo))).await;
    env.set("CODEXMUX_UPSTREAM_BASE_URL", &upstream);
    env.set("CODEXMUX_ENABLE_ADMIN_API", "true");

    let config = ProxyConfig {
        api_key: Some("sk-admin".into()),
        ..ProxyConfig::default()
    };
    let harness = start_proxy(&[("a", plain_record("at-a", "rt-a", "up-a"))], config).await;
    let client = reqwest::Client::new();

    // No key: denied.
    let resp = client
        .get(format!("{}/api/status", harness.base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);

    // With key: status, logs, count, clear, reload, key generation.
    let resp = client
        .get(format!("{}/api/status", harness.base))
        .header("x-api-key", "sk-admin")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let status: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(status["running"], true);
    assert_eq!(status["account_count"], 1);

    let resp = client
        .get(format!("{}/api/logs?limit=10", harness.base))
        .header("x-api-key", "sk-admin")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{}/api/reload", harness.base))
        .header("x-api-key", "sk-admin")
        .send()
        .await
        .expect("request");
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["account_count"], 1);

    let resp = client
        .post(format!("{}/api/api-key/generate", harness.base))
        .header("x-api-key", "sk-admin")
        .send()
        .await
        .expect("request");
    let key: String = resp.json().await.expect("json");
    assert!(key.starts_with("sk-"));

    harness.server.stop().await;
    upstream_task.abort();
}
