// Configuration management for the PakBus CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/pakbus/config.json
// - Linux: ~/.config/pakbus/config.json
// - Windows: %APPDATA%\pakbus\config.json

use anyhow::{Context, Result};
use pakbus_core::{NodeAddress, RouterConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parameters of the two-router simulation
    pub sim: SimConfig,

    /// Template for both simulated routers; addresses come from `sim`
    pub router: RouterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub node_a: NodeAddress,
    pub node_b: NodeAddress,

    /// Worst case response time reported by both loopback ports
    pub worst_case_response_msec: u32,

    /// Simulated time per step
    pub tick_msec: u64,

    /// Real time between steps, zero runs flat out
    pub pace_msec: u64,

    /// Steps before a discovery or echo is given up
    pub max_steps: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sim: SimConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_a: 1,
            node_b: 2,
            worst_case_response_msec: 500,
            tick_msec: 100,
            pace_msec: 20,
            max_steps: 2_000,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("pakbus");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Router config for one end of the simulation
    pub fn router_for(&self, address: NodeAddress) -> Result<RouterConfig> {
        let config = RouterConfig {
            this_node_address: address,
            ..self.router.clone()
        };
        config
            .validate()
            .with_context(|| format!("Invalid router config for node {}", address))?;
        Ok(config)
    }

    /// Set a config value. Nothing is saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "node_a" => updated.sim.node_a = value.parse().context("Invalid node address")?,
            "node_b" => updated.sim.node_b = value.parse().context("Invalid node address")?,
            "worst_case_response_msec" => {
                updated.sim.worst_case_response_msec = value.parse().context("Invalid number")?
            }
            "tick_msec" => updated.sim.tick_msec = value.parse().context("Invalid number")?,
            "pace_msec" => updated.sim.pace_msec = value.parse().context("Invalid number")?,
            "max_steps" => updated.sim.max_steps = value.parse().context("Invalid number")?,
            "is_leaf_node" => {
                updated.router.is_leaf_node = value.parse().context("Invalid boolean value")?
            }
            "max_hop_count" => {
                updated.router.max_hop_count = value.parse().context("Invalid number")?
            }
            "maintenance_interval_msec" => {
                updated.router.maintenance_interval_msec = value.parse().context("Invalid number")?
            }
            "transaction_base_timeout_msec" => {
                updated.router.transaction_base_timeout_msec =
                    value.parse().context("Invalid number")?
            }
            "max_tran_retries" => {
                updated.router.max_tran_retries = value.parse().context("Invalid number")?
            }
            "require_encryption" => {
                updated.router.require_encryption =
                    value.parse().context("Invalid boolean value")?
            }
            "passphrase" => {
                if value.is_empty() {
                    updated.router.ciphers.clear();
                } else {
                    updated
                        .router
                        .ciphers
                        .insert(pakbus_core::BROADCAST_ADDRESS, value.to_string());
                }
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.router_for(updated.sim.node_a)?;
        updated.router_for(updated.sim.node_b)?;
        if updated.sim.node_a == updated.sim.node_b {
            anyhow::bail!("node_a and node_b must differ");
        }
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("node_a".to_string(), self.sim.node_a.to_string()),
            ("node_b".to_string(), self.sim.node_b.to_string()),
            (
                "worst_case_response_msec".to_string(),
                self.sim.worst_case_response_msec.to_string(),
            ),
            ("tick_msec".to_string(), self.sim.tick_msec.to_string()),
            ("pace_msec".to_string(), self.sim.pace_msec.to_string()),
            ("max_steps".to_string(), self.sim.max_steps.to_string()),
            ("is_leaf_node".to_string(), self.router.is_leaf_node.to_string()),
            ("max_hop_count".to_string(), self.router.max_hop_count.to_string()),
            (
                "maintenance_interval_msec".to_string(),
                self.router.maintenance_interval_msec.to_string(),
            ),
            (
                "transaction_base_timeout_msec".to_string(),
                self.router.transaction_base_timeout_msec.to_string(),
            ),
            ("max_tran_retries".to_string(), self.router.max_tran_retries.to_string()),
            (
                "require_encryption".to_string(),
                self.router.require_encryption.to_string(),
            ),
            (
                "passphrase".to_string(),
                if self.router.ciphers.is_empty() { "(none)" } else { "(set)" }.to_string(),
            ),
        ]
    }
}
