//! Shared test fixtures.
//!
//! codexmux reads its runtime knobs from a fixed set of environment
//! variables: the upstream/token/usage endpoint overrides the mock servers
//! point at, the inbound API key, the listening port, and the admin-API
//! gate. `EnvSandbox` serializes env-dependent tests behind one global
//! lock, starts each of them from a cleared knob set, and restores the
//! previous values on drop.

#[cfg(test)]
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Every environment variable the crate reads at runtime.
#[cfg(test)]
const ENV_KNOBS: [&str; 7] = [
    "CODEXMUX_UPSTREAM_BASE_URL",
    "CODEXMUX_TOKEN_URL",
    "CODEXMUX_USAGE_URL",
    "CODEXMUX_ENABLE_ADMIN_API",
    "CODEXMUX_API_KEY",
    "API_KEY",
    "PORT",
];

#[cfg(test)]
fn sandbox_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[cfg(test)]
pub(crate) struct EnvSandbox {
    _serialized: MutexGuard<'static, ()>,
    saved: Vec<(&'static str, Option<String>)>,
}

#[cfg(test)]
impl EnvSandbox {
    /// Take exclusive ownership of the crate's env knobs, clearing them all
    /// so the test starts from the built-in defaults.
    pub(crate) fn take() -> Self {
        let guard = sandbox_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = ENV_KNOBS
            .iter()
            .map(|&key| {
                let original = std::env::var(key).ok();
                std::env::remove_var(key);
                (key, original)
            })
            .collect();
        Self {
            _serialized: guard,
            saved,
        }
    }

    /// Set one knob for the lifetime of the sandbox.
    pub(crate) fn set(&self, key: &'static str, value: &str) {
        assert!(
            ENV_KNOBS.contains(&key),
            "not a codexmux env knob: {key}"
        );
        std::env::set_var(key, value);
    }
}

#[cfg(test)]
impl Drop for EnvSandbox {
    fn drop(&mut self) {
        for (key, original) in self.saved.drain(..) {
            match original {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}
