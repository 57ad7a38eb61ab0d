//! Runtime configuration.
//!
//! All tunable protocol numbers live here, built once at start-up and passed
//! down by value. Environment inputs (`STORJ_BRIDGE`, `STORJ_ALLOW_LOOPBACK`)
//! feed the constructor; nothing else reads the environment.

use std::time::Duration;

use crate::{DEFAULT_SHARD_SIZE, NONCE_EXPIRE_MS, RESPONSE_TIMEOUT_MS, TOKEN_TTL_MS};

/// Node-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bridge API base URL.
    pub bridge_url: String,
    /// Whether loopback contact addresses are allowed (testing only).
    pub allow_loopback: bool,
    /// Timeout for a single RPC round trip.
    pub response_timeout: Duration,
    /// Window within which an RPC nonce is accepted.
    pub nonce_expire: Duration,
    /// Lifetime of a data-channel token.
    pub token_ttl: Duration,
    /// Interval between tunneler availability announcements.
    pub tunnel_announce_interval: Duration,
    /// Interval between routing-table cleaning passes.
    pub router_clean_interval: Duration,
    /// Idle period after which the node re-runs the overlay join.
    pub reentry_idle: Duration,
    /// Retry cap for shard transfers before the farmer is excluded.
    pub transfer_retries: u32,
    /// Leaky-bucket capacity: requests tolerated per window per contact.
    pub rate_limit_capacity: u32,
    /// Leaky-bucket drain window.
    pub rate_limit_window: Duration,
    /// Shard size used by the file demuxer.
    pub shard_size: u64,
    /// Relay slots offered when acting as a tunneler (0 disables relaying).
    pub max_tunnel_slots: usize,
    /// Local storage capacity in bytes.
    pub max_capacity: u64,
}

impl Config {
    /// Builds the configuration from defaults plus environment inputs.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("STORJ_BRIDGE") {
            if !url.is_empty() {
                config.bridge_url = url;
            }
        }
        config.allow_loopback = std::env::var("STORJ_ALLOW_LOOPBACK")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_url: "https://api.storj.io".to_string(),
            allow_loopback: false,
            response_timeout: Duration::from_millis(RESPONSE_TIMEOUT_MS),
            nonce_expire: Duration::from_millis(NONCE_EXPIRE_MS as u64),
            token_ttl: Duration::from_millis(TOKEN_TTL_MS as u64),
            tunnel_announce_interval: Duration::from_secs(300),
            router_clean_interval: Duration::from_secs(3600),
            reentry_idle: Duration::from_secs(600),
            transfer_retries: 3,
            rate_limit_capacity: 60,
            rate_limit_window: Duration::from_secs(60),
            shard_size: DEFAULT_SHARD_SIZE,
            max_tunnel_slots: 0,
            max_capacity: 8 * 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.nonce_expire, Duration::from_secs(300));
        assert_eq!(config.token_ttl, Duration::from_secs(300));
        assert_eq!(config.router_clean_interval, Duration::from_secs(3600));
        assert_eq!(config.reentry_idle, Duration::from_secs(600));
        assert_eq!(config.transfer_retries, 3);
        assert_eq!(config.shard_size, 8 * 1024 * 1024);
        assert!(!config.allow_loopback);
    }
}
