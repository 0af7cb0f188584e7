pub mod handlers;
pub mod logs;
pub mod middleware;
pub mod pool;
pub mod server;
pub mod usage;

pub use logs::LogSink;
pub use pool::AccountPool;
pub use server::{AppState, ProxyServer, ProxyStatus};

#[cfg(test)]
mod tests;
