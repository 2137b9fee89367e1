//! Node configuration: a TOML file overridden by CLI flags.

use crate::Error;
use moira_dag::types::ValidatorId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Data directory; every store, lock, and emitter file lives below it.
    pub datadir: PathBuf,
    /// Graceful shutdown when free disk under `datadir` falls below this,
    /// bytes. Zero disables the check.
    pub minfreedisk: u64,
    pub validator: ValidatorConfig,
    pub emitter: EmitterConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    /// This node's validator id; absent means observer mode.
    pub id: Option<u32>,
    /// Deterministic test keys derived from validator ids; the store set
    /// runs in memory.
    pub fakenet: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmitterConfig {
    pub min_interval_ms: u64,
    pub confirming_interval_ms: u64,
    pub doublesign_protection_ms: u64,
    pub limited_tps_threshold: u64,
    pub no_txs_threshold: u64,
    pub emergency_threshold: u64,
    pub max_pool_txs: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Pending bytes above which the node flushes.
    pub flush_threshold: usize,
    /// Sealed epoch sub-stores kept before dropping.
    pub retention_epochs: u32,
    /// Rocksdb block-cache budget, bytes.
    pub cache_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            datadir: default_datadir(),
            minfreedisk: 0,
            validator: ValidatorConfig::default(),
            emitter: EmitterConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            id: None,
            fakenet: None,
        }
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            confirming_interval_ms: 1_000,
            doublesign_protection_ms: 30_000,
            limited_tps_threshold: 100_000_000,
            no_txs_threshold: 300_000_000,
            emergency_threshold: 1_000_000_000,
            max_pool_txs: 100_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 8 << 20,
            retention_epochs: 2,
            cache_bytes: 64 << 20,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn validator_id(&self) -> Option<ValidatorId> {
        self.validator.id.map(ValidatorId::new)
    }

    pub fn emitter_config(&self, validator: ValidatorId) -> moira_emitter::EmitterConfig {
        moira_emitter::EmitterConfig {
            validator,
            slots: moira_emitter::SlotConfig {
                min_interval: Duration::from_millis(self.emitter.min_interval_ms),
                confirming_interval: Duration::from_millis(self.emitter.confirming_interval_ms),
                limited_tps_threshold: self.emitter.limited_tps_threshold,
                no_txs_threshold: self.emitter.no_txs_threshold,
                emergency_threshold: self.emitter.emergency_threshold,
            },
            doublesign_protection: self.emitter.doublesign_protection_ms * 1_000_000,
            ..Default::default()
        }
    }
}

/// OS-dependent default datadir, `$HOME/.moira` with a cwd fallback.
pub fn default_datadir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".moira"),
        None => PathBuf::from("moira-data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert!(config.validator.id.is_none());
        assert_eq!(config.emitter.min_interval_ms, 500);
        assert_eq!(config.store.retention_epochs, 2);
    }

    #[test]
    fn test_file_overrides_and_unknown_keys_rejected() {
        let config: NodeConfig = toml::from_str(
            r#"
            minfreedisk = 1048576
            [validator]
            id = 2
            fakenet = 5
            [emitter]
            min_interval_ms = 200
            "#,
        )
        .unwrap();
        assert_eq!(config.minfreedisk, 1_048_576);
        assert_eq!(config.validator_id(), Some(ValidatorId::new(2)));
        assert_eq!(config.validator.fakenet, Some(5));
        assert_eq!(config.emitter.min_interval_ms, 200);

        assert!(toml::from_str::<NodeConfig>("surprise = 1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moira.toml");
        std::fs::write(&path, "[validator]\nid = 7\n").unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.validator_id(), Some(ValidatorId::new(7)));
    }
}
