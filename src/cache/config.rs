//! Cache configuration.
//!
//! Engine-wide defaults read from the `[cache]` table of `verbatim.toml`.
//! Per-route behaviour lives in [`CachePolicy`](super::CachePolicy).

use std::time::Duration;

use serde::Deserialize;

use super::freshness::FreshnessSpec;
use super::keys::DEFAULT_CALLBACK_PARAM;

const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SERVER_RETENTION_SECS: u64 = 300;
const DEFAULT_CLIENT_MAX_AGE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; when off every lookup misses and nothing is stored.
    pub enabled: bool,
    /// Interval (ms) of the background expiration sweep; 0 disables it.
    pub sweep_interval_ms: u64,
    /// Server-side retention for policies built from defaults.
    pub default_server_retention_secs: u64,
    /// Client `max-age` for policies built from defaults.
    pub default_client_max_age_secs: u64,
    /// Hash payloads for ETags instead of issuing random tokens.
    pub hash_content_for_etag: bool,
    /// Query parameter excluded from variant keys.
    pub callback_param: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            default_server_retention_secs: DEFAULT_SERVER_RETENTION_SECS,
            default_client_max_age_secs: DEFAULT_CLIENT_MAX_AGE_SECS,
            hash_content_for_etag: false,
            callback_param: DEFAULT_CALLBACK_PARAM.to_string(),
        }
    }
}

impl CacheConfig {
    /// Freshness used by policies that do not configure their own.
    pub fn default_freshness(&self) -> FreshnessSpec {
        FreshnessSpec::from_secs(
            self.default_server_retention_secs,
            self.default_client_max_age_secs,
        )
    }

    /// Sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.sweep_interval_ms, 60_000);
        assert_eq!(config.default_server_retention_secs, 300);
        assert_eq!(config.default_client_max_age_secs, 60);
        assert!(!config.hash_content_for_etag);
        assert_eq!(config.callback_param, "callback");
    }

    #[test]
    fn zero_interval_disables_sweeping() {
        let config = CacheConfig {
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.sweep_interval(), None);
    }

    #[test]
    fn default_freshness_uses_configured_spans() {
        let config = CacheConfig {
            default_server_retention_secs: 30,
            default_client_max_age_secs: 10,
            ..Default::default()
        };
        let spec = config.default_freshness();
        assert_eq!(spec.server_retention, Duration::from_secs(30));
        assert_eq!(spec.client_max_age, Duration::from_secs(10));
    }

    #[test]
    fn deserializes_partial_table() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"enabled": false, "callback_param": "jsonp"}"#)
                .expect("valid cache config");
        assert!(!config.enabled);
        assert_eq!(config.callback_param, "jsonp");
        assert_eq!(config.sweep_interval_ms, 60_000);
    }
}
