//! Host configuration.

use std::time::Duration;

pub const ELECTION_TIMEOUT_ENV: &str = "ISOHELPER_ELECTION_TIMEOUT_MS";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "ISOHELPER_HANDSHAKE_TIMEOUT_MS";
pub const POOL_SIZE_ENV: &str = "ISOHELPER_POOL_SIZE";

/// Tunables shared by every coordinator created on a host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// How long a contender waits for the leader to broadcast its reference.
    pub election_timeout: Duration,
    /// How long `init` waits for a fresh context to acknowledge `Connect`.
    pub handshake_timeout: Duration,
    /// Pool size used when a pool is built without an explicit count.
    pub pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1000),
            handshake_timeout: Duration::from_millis(5000),
            pool_size: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

impl Config {
    /// Defaults overridden by `ISOHELPER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, ELECTION_TIMEOUT_ENV) {
            config.election_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, HANDSHAKE_TIMEOUT_ENV) {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, POOL_SIZE_ENV) {
            config.pool_size = n.max(1);
        }

        config
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}
