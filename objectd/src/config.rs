//! Daemon configuration, loaded from a TOML file at the entry point: a
//! long-running daemon needs its tier layout and thresholds settable
//! without a rebuild, rather than fixed at construction time.

use crate::{
    manager::ManagerConfig,
    tier::{PlacementRoles, Policy},
};
use serde::{Deserialize, Serialize};
use std::{fs, io, path::PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierPolicyConfig {
    Persistent,
    Volatile,
}

impl From<TierPolicyConfig> for Policy {
    fn from(policy: TierPolicyConfig) -> Self {
        match policy {
            TierPolicyConfig::Persistent => Policy::Persistent,
            TierPolicyConfig::Volatile => Policy::Volatile,
        }
    }
}

/// One `[[tiers]]` entry. `id` must be unique across the list; `weight`
/// orders tiers fastest-first (lower is faster), matching
/// [`crate::tier::Tier::weight`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    pub id: u16,
    pub name: String,
    pub mount_root: PathBuf,
    pub capacity_bytes: u64,
    pub policy: TierPolicyConfig,
    #[serde(default)]
    pub roles: Vec<String>,
    pub weight: u32,
}

impl TierConfig {
    /// Parses `roles` into the bitflags placement uses, warning on (and
    /// ignoring) any name this build doesn't recognize rather than
    /// failing config load over a typo'd role.
    pub fn placement_roles(&self) -> PlacementRoles {
        let mut roles = PlacementRoles::empty();
        for role in &self.roles {
            match role.as_str() {
                "default-target" => roles |= PlacementRoles::DEFAULT_TARGET,
                "ephemeral-target" => roles |= PlacementRoles::EPHEMERAL_TARGET,
                "promotion-cache" => roles |= PlacementRoles::PROMOTION_CACHE,
                other => tracing::warn!(tier = self.id, role = other, "unknown placement role, ignoring"),
            }
        }
        roles
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    #[serde(default = "default_index_capacity")]
    pub index_capacity: usize,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_promoter_interval_secs")]
    pub promoter_interval_secs: u64,
    #[serde(default = "default_max_pipeline")]
    pub max_pipeline: u16,
    #[serde(default)]
    pub manager: ManagerConfig,
    pub tiers: Vec<TierConfig>,
}

fn default_index_capacity() -> usize {
    4096
}

fn default_promoter_interval_secs() -> u64 {
    1
}

fn default_max_pipeline() -> u16 {
    32
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            socket_path = "/tmp/objectd.sock"

            [[tiers]]
            id = 0
            name = "fast"
            mount_root = "/tmp/objectd/fast"
            capacity_bytes = 1073741824
            policy = "volatile"
            roles = ["default-target", "ephemeral-target"]
            weight = 0
        "#;
        let config = ServerConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.tiers.len(), 1);
        assert_eq!(
            config.tiers[0].placement_roles(),
            PlacementRoles::DEFAULT_TARGET | PlacementRoles::EPHEMERAL_TARGET
        );
        assert_eq!(config.index_capacity, 4096);
        assert_eq!(config.promoter_interval_secs, 1);
        assert_eq!(config.max_pipeline, 32);
        assert!(config.idle_timeout_secs.is_none());
    }

    #[test]
    fn unknown_role_is_ignored() {
        let raw = r#"
            socket_path = "/tmp/objectd.sock"

            [[tiers]]
            id = 0
            name = "fast"
            mount_root = "/tmp/objectd/fast"
            capacity_bytes = 1024
            policy = "persistent"
            roles = ["default-target", "made-up-role"]
            weight = 1
        "#;
        let config = ServerConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.tiers[0].placement_roles(), PlacementRoles::DEFAULT_TARGET);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(ServerConfig::from_toml_str("not valid toml [[[").is_err());
    }
}
