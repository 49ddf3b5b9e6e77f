//! Overlay driver configuration.
//!
//! Configuration covers:
//! - The VNI range handed to the in-process allocator
//! - Bridge interface naming inside network sandboxes
//! - The retry policy for optimistic-concurrency store writes
//! - Neighbor watcher error backoff

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};
use crate::idm::{VNI_MAX, VNI_MIN};

/// Linux limits interface names to 15 bytes plus NUL.
const MAX_IFACE_NAME_LEN: usize = 15;

/// Inclusive range of VXLAN ids this host may allocate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VniRange {
    /// First id of the range.
    pub start: u32,
    /// Last id of the range.
    pub end: u32,
}

impl Default for VniRange {
    fn default() -> Self {
        Self {
            start: VNI_MIN,
            end: VNI_MAX,
        }
    }
}

/// Bounded retry with jittered exponential backoff for store conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum read-modify-write attempts before giving up.
    pub max_attempts: u32,
    /// Backoff before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep after `attempt` (1-based) failed with a conflict.
    ///
    /// Full jitter: a uniform draw in `[0, min(max, initial * 2^(attempt-1))]`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(20);
        let ceiling = self
            .initial_backoff_ms
            .saturating_mul(1 << shift)
            .min(self.max_backoff_ms.max(self.initial_backoff_ms));
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Main overlay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlayConfig {
    /// VNI range for the in-process allocator.
    #[serde(default)]
    pub vni_range: VniRange,
    /// Prefix of generated bridge names.
    #[serde(default = "default_bridge_prefix")]
    pub bridge_prefix: String,
    /// Number of random characters appended to the bridge prefix.
    #[serde(default = "default_bridge_suffix_len")]
    pub bridge_suffix_len: usize,
    /// Store conflict retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Pause after a failed neighbor-notification receive, in milliseconds.
    #[serde(default = "default_watcher_error_backoff_ms")]
    pub watcher_error_backoff_ms: u64,
}

fn default_bridge_prefix() -> String {
    "bridge".to_string()
}

fn default_bridge_suffix_len() -> usize {
    7
}

fn default_watcher_error_backoff_ms() -> u64 {
    100
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            vni_range: VniRange::default(),
            bridge_prefix: default_bridge_prefix(),
            bridge_suffix_len: default_bridge_suffix_len(),
            retry: RetryPolicy::default(),
            watcher_error_backoff_ms: default_watcher_error_backoff_ms(),
        }
    }
}

impl OverlayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OverlayError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| OverlayError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let VniRange { start, end } = self.vni_range;
        if start < VNI_MIN || end > VNI_MAX || start > end {
            return Err(OverlayError::Config(format!(
                "vni_range must lie within {VNI_MIN}-{VNI_MAX} with start <= end, got {start}-{end}"
            )));
        }

        if self.bridge_prefix.is_empty()
            || !self
                .bridge_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OverlayError::Config(
                "bridge_prefix must be non-empty alphanumeric, hyphens or underscores".to_string(),
            ));
        }

        if self.bridge_suffix_len == 0 {
            return Err(OverlayError::Config(
                "bridge_suffix_len must be greater than 0".to_string(),
            ));
        }

        if self.bridge_prefix.len() + self.bridge_suffix_len > MAX_IFACE_NAME_LEN {
            return Err(OverlayError::Config(format!(
                "bridge names would exceed {MAX_IFACE_NAME_LEN} characters"
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(OverlayError::Config(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Backoff used by the neighbor watcher after a receive error.
    #[must_use]
    pub fn watcher_error_backoff(&self) -> Duration {
        Duration::from_millis(self.watcher_error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge_prefix, "bridge");
        assert_eq!(config.bridge_suffix_len, 7);
        assert_eq!(config.vni_range, VniRange { start: 1, end: VNI_MAX });
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = OverlayConfig::from_toml("").expect("empty config should parse");
        assert_eq!(config, OverlayConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            bridge_prefix = "ovbr"
            bridge_suffix_len = 6
            watcher_error_backoff_ms = 250

            [vni_range]
            start = 4096
            end = 8191

            [retry]
            max_attempts = 8
            initial_backoff_ms = 10
            max_backoff_ms = 200
        "#;

        let config = OverlayConfig::from_toml(toml).expect("should parse full config");
        assert_eq!(config.vni_range, VniRange { start: 4096, end: 8191 });
        assert_eq!(config.bridge_prefix, "ovbr");
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.watcher_error_backoff(), Duration::from_millis(250));
    }

    #[test]
    fn test_reject_vni_range_outside_24_bits() {
        let toml = r"
            [vni_range]
            start = 1
            end = 16777216
        ";
        let err = OverlayConfig::from_toml(toml).expect_err("range too large");
        assert!(err.to_string().contains("vni_range"));
    }

    #[test]
    fn test_reject_long_bridge_names() {
        let config = OverlayConfig {
            bridge_prefix: "averylongprefix".to_string(),
            ..OverlayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_zero_attempts() {
        let mut config = OverlayConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let err = OverlayConfig::from_toml("bridge_prefix = ").expect_err("invalid");
        assert!(err.to_string().contains("invalid TOML"));
    }

    #[test]
    fn test_from_file() {
        let file = create_temp_config("bridge_prefix = \"vxbr\"\n");
        let config = OverlayConfig::from_file(file.path()).expect("should load file");
        assert_eq!(config.bridge_prefix, "vxbr");
    }

    #[test]
    fn test_from_missing_file() {
        let err = OverlayConfig::from_file("/nonexistent/overlay.toml").expect_err("missing");
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 5,
            max_backoff_ms: 40,
        };
        for attempt in 1..=10 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(40));
        }
        let none = RetryPolicy {
            initial_backoff_ms: 0,
            ..policy
        };
        assert_eq!(none.backoff(3), Duration::ZERO);
    }
}
