//! # Runtime Configuration Module
//!
//! Environment variable based configuration for the dispatch engine.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BRRTC_MAX_DISPATCH_DEPTH` | `16` | Maximum depth of nested forward/include/error dispatches |
//! | `BRRTC_DRAIN_MODE` | `drain` | `drain` waits for in-flight requests on stop, `fail-fast` cancels them |
//! | `BRRTC_DRAIN_TIMEOUT_MS` | `30000` | Upper bound on the drain wait |
//! | `BRRTC_RESOURCE_CACHE_SIZE` | `1024` | Entries in the resource presence cache, `0` disables it |
//! | `BRRTC_RESPONSE_BUFFER_SIZE` | `0x2000` | Bytes buffered before a response commits |
//! | `BRRTC_SLOW_DISPATCH_MS` | `250` | Dispatches slower than this are logged at warn |
//!
//! Sizes accept decimal (`8192`) or hexadecimal (`0x2000`) values.
//!
//! ```rust
//! use brrtcontainer::runtime_config::EngineConfig;
//!
//! let config = EngineConfig::from_env();
//! assert!(config.max_dispatch_depth > 0);
//! ```

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// What `stop()` does with requests that are still being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Wait for in-flight requests to finish, up to `timeout`.
    Drain { timeout: Duration },
    /// Signal cancellation to in-flight requests and return immediately.
    FailFast,
}

impl DrainPolicy {
    /// Parse a drain mode name; unknown names yield `None`.
    #[must_use]
    pub fn parse(mode: &str, timeout: Duration) -> Option<Self> {
        match mode.to_lowercase().as_str() {
            "drain" => Some(Self::Drain { timeout }),
            "fail-fast" | "fail_fast" | "failfast" => Some(Self::FailFast),
            _ => None,
        }
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self::Drain {
            timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }
}

const DEFAULT_MAX_DISPATCH_DEPTH: usize = 16;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RESOURCE_CACHE_SIZE: usize = 1024;
const DEFAULT_RESPONSE_BUFFER_SIZE: usize = 0x2000;
const DEFAULT_SLOW_DISPATCH_MS: u64 = 250;

/// Engine tuning shared by every application built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_dispatch_depth: usize,
    pub drain_policy: DrainPolicy,
    pub resource_cache_size: usize,
    pub response_buffer_size: usize,
    pub slow_dispatch: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dispatch_depth: DEFAULT_MAX_DISPATCH_DEPTH,
            drain_policy: DrainPolicy::default(),
            resource_cache_size: DEFAULT_RESOURCE_CACHE_SIZE,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER_SIZE,
            slow_dispatch: Duration::from_millis(DEFAULT_SLOW_DISPATCH_MS),
        }
    }
}

fn parse_size(val: &str) -> Option<usize> {
    if let Some(hex) = val.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        val.parse().ok()
    }
}

fn env_size(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| parse_size(v.trim()))
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let drain_timeout = Duration::from_millis(env_u64(
            "BRRTC_DRAIN_TIMEOUT_MS",
            DEFAULT_DRAIN_TIMEOUT_MS,
        ));
        let drain_policy = env::var("BRRTC_DRAIN_MODE")
            .ok()
            .and_then(|m| DrainPolicy::parse(&m, drain_timeout))
            .unwrap_or(DrainPolicy::Drain {
                timeout: drain_timeout,
            });

        let max_dispatch_depth =
            env_size("BRRTC_MAX_DISPATCH_DEPTH", DEFAULT_MAX_DISPATCH_DEPTH).max(1);

        EngineConfig {
            max_dispatch_depth,
            drain_policy,
            resource_cache_size: env_size("BRRTC_RESOURCE_CACHE_SIZE", DEFAULT_RESOURCE_CACHE_SIZE),
            response_buffer_size: env_size(
                "BRRTC_RESPONSE_BUFFER_SIZE",
                DEFAULT_RESPONSE_BUFFER_SIZE,
            ),
            slow_dispatch: Duration::from_millis(env_u64(
                "BRRTC_SLOW_DISPATCH_MS",
                DEFAULT_SLOW_DISPATCH_MS,
            )),
        }
    }

    /// Apply per-application overrides from a descriptor.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &EngineOverrides) -> Self {
        if let Some(depth) = overrides.max_dispatch_depth {
            self.max_dispatch_depth = depth.max(1);
        }
        let timeout = overrides
            .drain_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(match self.drain_policy {
                DrainPolicy::Drain { timeout } => timeout,
                DrainPolicy::FailFast => Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            });
        if let Some(mode) = &overrides.drain_mode {
            if let Some(policy) = DrainPolicy::parse(mode, timeout) {
                self.drain_policy = policy;
            }
        } else if let DrainPolicy::Drain { .. } = self.drain_policy {
            self.drain_policy = DrainPolicy::Drain { timeout };
        }
        if let Some(size) = overrides.resource_cache_size {
            self.resource_cache_size = size;
        }
        if let Some(size) = overrides.response_buffer_size {
            self.response_buffer_size = size;
        }
        self
    }
}

/// Optional engine settings carried by an application descriptor.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOverrides {
    pub max_dispatch_depth: Option<usize>,
    pub drain_mode: Option<String>,
    pub drain_timeout_ms: Option<u64>,
    pub resource_cache_size: Option<usize>,
    pub response_buffer_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_accepts_hex_and_decimal() {
        assert_eq!(parse_size("0x2000"), Some(8192));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_drain_policy_parse() {
        let t = Duration::from_secs(1);
        assert_eq!(
            DrainPolicy::parse("drain", t),
            Some(DrainPolicy::Drain { timeout: t })
        );
        assert_eq!(DrainPolicy::parse("FAIL-FAST", t), Some(DrainPolicy::FailFast));
        assert_eq!(DrainPolicy::parse("maybe", t), None);
    }

    #[test]
    fn test_overrides_replace_only_present_fields() {
        let base = EngineConfig::default();
        let overrides = EngineOverrides {
            max_dispatch_depth: Some(3),
            drain_mode: Some("fail-fast".into()),
            ..Default::default()
        };
        let cfg = base.with_overrides(&overrides);
        assert_eq!(cfg.max_dispatch_depth, 3);
        assert_eq!(cfg.drain_policy, DrainPolicy::FailFast);
        assert_eq!(cfg.resource_cache_size, base.resource_cache_size);
    }

    #[test]
    fn test_zero_depth_is_clamped() {
        let cfg = EngineConfig::default().with_overrides(&EngineOverrides {
            max_dispatch_depth: Some(0),
            ..Default::default()
        });
        assert_eq!(cfg.max_dispatch_depth, 1);
    }
}
