// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the mirror engine.
//!
//! This module defines the serializable configuration of a
//! [`ReplicationController`](crate::ReplicationController). It can be
//! constructed programmatically or deserialized from YAML/JSON by the host.
//! Behaviour that is a function rather than data (identity mapping, init,
//! attribute skipping) is injected separately through
//! [`MirrorHooks`](crate::coordinator::MirrorHooks).
//!
//! # Quick Start
//!
//! ```rust
//! use mirror_engine::config::MirrorConfig;
//!
//! let config = MirrorConfig {
//!     source_id: "prod-primary".into(),
//!     destination_id: "dr-standby".into(),
//!     resume_from: Some(1042),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── source_id / destination_id   # Names of the pair (resume keying, logs)
//! ├── resume_from: Option<u64>     # Explicit starting t
//! ├── poll_interval_ms             # Sleep when the log is exhausted
//! ├── channel_capacity             # Tailer → loop buffer
//! ├── read_retry: ReadRetryConfig  # Backoff for transient source reads
//! ├── identity: IdentityConfig     # Synthetic attribute, partition map
//! ├── init: InitConfig             # Destination bootstrap
//! └── resume_store: ResumeStoreConfig # SQLite position + lease
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source_id: "prod-primary"
//! destination_id: "dr-standby"
//! poll_interval_ms: 250
//!
//! identity:
//!   synthetic_attribute: ":mirror/source-eid"
//!   partition_map:
//!     ":part/accounts": ":part/mirror-accounts"
//!
//! init:
//!   lead: "5ms"
//!
//! resume_store:
//!   enabled: true
//!   sqlite_path: "/var/lib/mirror/positions.db"
//! ```

use crate::error::{MirrorError, Result};
use crate::init::DEFAULT_INIT_LEAD;
use crate::model::TxId;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationController::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationController::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Name of the source store. Part of the resume key.
    pub source_id: String,

    /// Name of the destination store. Part of the resume key.
    pub destination_id: String,

    /// First source `t` to replicate. Overrides any stored position.
    #[serde(default)]
    pub resume_from: Option<u64>,

    /// How long the tailer sleeps when the log has nothing new.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Transactions buffered between tailer and consumption loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub read_retry: ReadRetryConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub init: InitConfig,

    #[serde(default)]
    pub resume_store: ResumeStoreConfig,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            source_id: "source".to_string(),
            destination_id: "destination".to_string(),
            resume_from: None,
            poll_interval_ms: default_poll_interval_ms(),
            channel_capacity: default_channel_capacity(),
            read_retry: ReadRetryConfig::default(),
            identity: IdentityConfig::default(),
            init: InitConfig::default(),
            resume_store: ResumeStoreConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Create a fast-polling config for testing.
    pub fn for_testing(source_id: &str, destination_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            poll_interval_ms: 5,
            read_retry: ReadRetryConfig::testing(),
            ..Default::default()
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(MirrorError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(MirrorError::Config(
                "channel_capacity must be positive".to_string(),
            ));
        }
        if self.source_id.is_empty() || self.destination_id.is_empty() {
            return Err(MirrorError::Config(
                "source_id and destination_id must be set".to_string(),
            ));
        }
        if self.identity.synthetic_attribute.is_empty() {
            return Err(MirrorError::Config(
                "identity.synthetic_attribute must be set".to_string(),
            ));
        }
        if self.read_retry.backoff_factor < 1.0 {
            return Err(MirrorError::Config(
                "read_retry.backoff_factor must be at least 1.0".to_string(),
            ));
        }
        if self.resume_store.enabled && self.resume_store.lease_ttl_sec == 0 {
            return Err(MirrorError::Config(
                "resume_store.lease_ttl_sec must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resume_from_t(&self) -> Option<TxId> {
        self.resume_from.map(TxId)
    }

    /// Key naming this source/destination pair in the resume store.
    pub fn pair_key(&self) -> String {
        format!("{}=>{}", self.source_id, self.destination_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReadRetryConfig: backoff for transient source reads
// ═══════════════════════════════════════════════════════════════════════════════

/// Exponential backoff applied when a source read fails.
///
/// Reads are retried forever; only the delay is bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReadRetryConfig {
    /// Millisecond-scale backoff for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay_ms: 2,
            max_delay_ms: 20,
            backoff_factor: 2.0,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IdentityConfig: cross-store identity
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Attribute carrying the source entity id on mirrored entities without a global name.
    #[serde(default = "default_synthetic_attribute")]
    pub synthetic_attribute: String,

    /// Source partition ident → destination partition ident. Unlisted partitions mirror as-is.
    #[serde(default)]
    pub partition_map: BTreeMap<String, String>,
}

fn default_synthetic_attribute() -> String {
    ":mirror/source-eid".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            synthetic_attribute: default_synthetic_attribute(),
            partition_map: BTreeMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InitConfig: destination bootstrap
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Install the synthetic identity attribute before the first transaction.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How far before the first replicated transaction the bootstrap commit is stamped.
    #[serde(default = "default_lead")]
    pub lead: String,
}

fn default_true() -> bool {
    true
}

fn default_lead() -> String {
    "1ms".to_string()
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lead: default_lead(),
        }
    }
}

impl InitConfig {
    /// Parse the lead string to a Duration.
    pub fn lead_duration(&self) -> Duration {
        humantime::parse_duration(&self.lead).unwrap_or(DEFAULT_INIT_LEAD)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ResumeStoreConfig: durable position + lease
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable resume position and single-replicator lease.
///
/// Disabled by default: the host then owns `resume_from` across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeStoreConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Path to SQLite database for positions and leases.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Lease lifetime. Renewed every third of it.
    #[serde(default = "default_lease_ttl_sec")]
    pub lease_ttl_sec: u64,
}

fn default_sqlite_path() -> String {
    "mirror_positions.db".to_string()
}

fn default_lease_ttl_sec() -> u64 {
    30
}

impl Default for ResumeStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sqlite_path: default_sqlite_path(),
            lease_ttl_sec: default_lease_ttl_sec(),
        }
    }
}

impl ResumeStoreConfig {
    /// Enabled store at `path`.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            enabled: true,
            sqlite_path: path.into(),
            lease_ttl_sec: default_lease_ttl_sec(),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_sec)
    }

    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl() / 3
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_config_default() {
        let config = MirrorConfig::default();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.identity.synthetic_attribute, ":mirror/source-eid");
        assert!(config.init.enabled);
        assert!(!config.resume_store.enabled);
        assert!(config.resume_from.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = MirrorConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_zero_channel_capacity_rejected() {
        let config = MirrorConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lease_ttl_rejected_only_when_enabled() {
        let mut config = MirrorConfig::default();
        config.resume_store.lease_ttl_sec = 0;
        assert!(config.validate().is_ok());
        config.resume_store.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pair_key() {
        let config = MirrorConfig::for_testing("a", "b");
        assert_eq!(config.pair_key(), "a=>b");
    }

    #[test]
    fn test_init_lead_various_formats() {
        let test_cases = [
            ("1ms", Duration::from_millis(1)),
            ("5ms", Duration::from_millis(5)),
            ("1s", Duration::from_secs(1)),
        ];

        for (input, expected) in test_cases {
            let config = InitConfig {
                lead: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.lead_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_init_lead_invalid_fallback() {
        let config = InitConfig {
            lead: "soon".to_string(),
            ..Default::default()
        };
        // Should fall back to 1 millisecond
        assert_eq!(config.lead_duration(), Duration::from_millis(1));
    }

    #[test]
    fn test_renew_interval_is_third_of_ttl() {
        let config = ResumeStoreConfig::at("/tmp/x.db");
        assert!(config.enabled);
        assert_eq!(config.renew_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_read_retry_conversion() {
        let retry = ReadRetryConfig::default().retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_config_json_minimal() {
        let json = r#"{"source_id": "s", "destination_id": "d"}"#;
        let config: MirrorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.init.lead, "1ms");
        assert_eq!(config.resume_store.sqlite_path, "mirror_positions.db");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = MirrorConfig::for_testing("src", "dst");
        config
            .identity
            .partition_map
            .insert(":part/a".to_string(), ":part/b".to_string());
        config.resume_from = Some(77);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: MirrorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pair_key(), "src=>dst");
        assert_eq!(parsed.resume_from_t(), Some(TxId(77)));
        assert_eq!(parsed.identity.partition_map.get(":part/a").map(String::as_str), Some(":part/b"));
    }
}
