pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;

use models::config::{load_proxy_config, log_db_path, ProxyConfig};
use modules::auth::store::Store;
use proxy::{AccountPool, LogSink, ProxyServer};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 8080;

fn init_tracing() {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,codexmux=info")
    } else if env.contains("codexmux") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},codexmux=info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn apply_env_overrides(config: &mut ProxyConfig, port: &mut u16) {
    for key in ["CODEXMUX_API_KEY", "API_KEY"] {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                info!("Using inbound API key from {key}");
                config.api_key = Some(value.trim().to_string());
                break;
            }
        }
    }

    if let Ok(value) = std::env::var("PORT") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    *port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("Ignoring invalid PORT value: {}", value),
            }
        }
    }
}

pub fn run() {
    init_tracing();

    let runtime = tokio::runtime::Runtime::new().expect("failed to create Tokio runtime");
    runtime.block_on(async {
        let mut config = load_proxy_config();
        let mut port = DEFAULT_PORT;
        apply_env_overrides(&mut config, &mut port);
        if config.effective_api_key().is_none() {
            warn!("No inbound API key configured; the proxy accepts unauthenticated callers");
        }

        let store = Arc::new(Store::default_location());
        let pool = Arc::new(AccountPool::new(store));
        match pool.reload().await {
            Ok(0) => warn!("No accounts found; the pool starts empty until reload"),
            Ok(n) => info!("Loaded {} account(s) into the pool", n),
            Err(e) => warn!("Failed to load accounts: {}", e),
        }
        pool.start_sweeper();

        let sink = match LogSink::open(&log_db_path(), config.enable_logging, config.max_logs) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                error!("Failed to open request log database: {}", e);
                std::process::exit(1);
            }
        };

        let server = ProxyServer::new();
        let config = Arc::new(config);
        if let Err(e) = server
            .start(port, pool.clone(), sink.clone(), config.clone())
            .await
        {
            error!("Failed to start proxy: {}", e);
            std::process::exit(1);
        }

        info!("Proxy is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        server.stop().await;
        pool.shutdown().await;
    });
}
