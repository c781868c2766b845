//! fabric.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Longest accepted lease renewal period (one day).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Coordination settings for one controller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller_type: String,
    /// Lease renewal period.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Peers whose lease is older than this are reaped.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Registration attempts before giving up with a conflict.
    #[serde(default = "default_register_retries")]
    pub register_retries: u32,
    /// Attempts per own-record write before deferring to the next heartbeat.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    /// Upper bound on the best-effort deregistration at shutdown.
    #[serde(default = "default_deregister_timeout_ms")]
    pub deregister_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Registry database file. In-memory when unset.
    pub path: Option<PathBuf>,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_lease_ttl_secs() -> u64 {
    300
}
fn default_register_retries() -> u32 {
    5
}
fn default_write_retries() -> u32 {
    3
}
fn default_deregister_timeout_ms() -> u64 {
    2_000
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

impl ControllerConfig {
    /// Defaults for the given controller type.
    pub fn new(controller_type: &str) -> Self {
        Self {
            controller_type: controller_type.to_string(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            register_retries: default_register_retries(),
            write_retries: default_write_retries(),
            deregister_timeout_ms: default_deregister_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl FabricConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FabricConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the coordination loop cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.controller;
        if c.controller_type.trim().is_empty() {
            anyhow::bail!("controller.controller_type must not be empty");
        }
        if c.heartbeat_interval_secs == 0 {
            anyhow::bail!("controller.heartbeat_interval_secs must be positive");
        }
        if c.heartbeat_interval_secs > MAX_HEARTBEAT_INTERVAL_SECS {
            anyhow::bail!(
                "controller.heartbeat_interval_secs ({}) must not exceed {}",
                c.heartbeat_interval_secs,
                MAX_HEARTBEAT_INTERVAL_SECS
            );
        }
        // An instance stops serving one heartbeat and one second before its
        // lease can expire, which has to leave room for at least one renewal.
        if c.lease_ttl_secs <= 2 * c.heartbeat_interval_secs + 1 {
            anyhow::bail!(
                "controller.lease_ttl_secs ({}) must exceed twice heartbeat_interval_secs ({}) plus one",
                c.lease_ttl_secs,
                c.heartbeat_interval_secs
            );
        }
        if c.register_retries == 0 {
            anyhow::bail!("controller.register_retries must be at least 1");
        }
        Ok(())
    }

    /// Scaffold a minimal fabric.toml.
    pub fn scaffold(controller_type: &str, store_path: Option<PathBuf>) -> Self {
        FabricConfig {
            controller: ControllerConfig::new(controller_type),
            store: StoreConfig { path: store_path },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_round_trips_through_toml() {
        let config = FabricConfig::scaffold("replicaset", Some(PathBuf::from("/tmp/r.redb")));
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("replicaset"));
        assert!(toml_str.contains("/tmp/r.redb"));

        let parsed = FabricConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.controller.lease_ttl_secs, 300);
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[controller]
controller_type = "deployment"
"#;
        let config = FabricConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.controller.controller_type, "deployment");
        assert_eq!(config.controller.heartbeat_interval_secs, 10);
        assert_eq!(config.controller.register_retries, 5);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn test_rejects_ttl_below_heartbeat() {
        let toml_str = r#"
[controller]
controller_type = "replicaset"
heartbeat_interval_secs = 30
lease_ttl_secs = 10
"#;
        let err = FabricConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));
    }

    #[test]
    fn test_rejects_ttl_without_room_to_renew() {
        let toml_str = r#"
[controller]
controller_type = "replicaset"
heartbeat_interval_secs = 10
lease_ttl_secs = 21
"#;
        let err = FabricConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));

        let ok = toml_str.replace("lease_ttl_secs = 21", "lease_ttl_secs = 22");
        assert!(FabricConfig::from_toml_str(&ok).is_ok());
    }

    #[test]
    fn test_rejects_huge_heartbeat() {
        let toml_str = r#"
[controller]
controller_type = "replicaset"
heartbeat_interval_secs = 9223372036854775807
lease_ttl_secs = 9223372036854775807
"#;
        let err = FabricConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_secs"));
    }

    #[test]
    fn test_rejects_empty_type() {
        let toml_str = r#"
[controller]
controller_type = "  "
"#;
        assert!(FabricConfig::from_toml_str(toml_str).is_err());
    }
}
