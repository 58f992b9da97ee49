//! Configuration for the pool, the monitor and the verification harness
//!
//! One YAML file holds all three sections; every field has a default, so a
//! file only needs the values it changes.
//!
//! ```yaml
//! pool:
//!   block_size: 4096
//!   initial_block_count: 64
//! monitor:
//!   strategy: predictive
//!   target_buffer_level: 0.5
//! harness:
//!   threads: 4
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config, try_load_config};
pub use paths::{default_config_dir, default_config_path, CONFIG_FILE_NAME};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::harness::HarnessConfig;
use crate::monitor::PreventionConfig;
use crate::pool::PoolConfig;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufsafeConfig {
    pub pool: PoolConfig,
    pub monitor: PreventionConfig,
    pub harness: HarnessConfig,
}

impl BufsafeConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.pool.validate().context("Invalid pool section")?;
        self.monitor.validate().context("Invalid monitor section")?;
        self.harness.validate().context("Invalid harness section")?;
        Ok(())
    }
}
