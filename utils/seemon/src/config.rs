use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::layout::Target;
use crate::monitor::MonitorConfig;
use crate::regmap::{PatternBuffer, RegisterError, RegisterStore};
use crate::register_file::DEFAULT_FLIP_PROBABILITY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse session config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error("invalid session config: {0}")]
    Invalid(String),
}

/// How the simulated chip is reached.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Bus {
    /// Register-level access straight into the register file.
    #[default]
    Direct,
    /// Every access framed as I2C command bytes.
    I2c,
}

/// A monitoring session as described by a YAML file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub chip_id: u8,
    pub bus: Bus,
    pub target: Target,
    pub interval_ms: u64,
    pub max_iterations: Option<u64>,
    pub recover: bool,
    pub stop_on_mismatch: bool,
    pub simulate_flip: bool,
    pub flip_probability: f64,
    pub seed: Option<u64>,
    pub pattern: u8,
    pub gen_conf: BTreeMap<String, u32>,
    pub dac: BTreeMap<String, u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chip_id: 1,
            bus: Bus::Direct,
            target: Target::Dac,
            interval_ms: 1,
            max_iterations: None,
            recover: true,
            stop_on_mismatch: false,
            simulate_flip: false,
            flip_probability: DEFAULT_FLIP_PROBABILITY,
            seed: None,
            pattern: PatternBuffer::DEFAULT_FILL,
            gen_conf: BTreeMap::new(),
            dac: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chip_id > 0b111 {
            return Err(ConfigError::Invalid(format!(
                "chip_id {} does not fit 3 bits",
                self.chip_id
            )));
        }
        if !(0.0..=1.0).contains(&self.flip_probability) {
            return Err(ConfigError::Invalid(format!(
                "flip_probability {} outside 0..1",
                self.flip_probability
            )));
        }
        Ok(())
    }

    /// Applies the `gen_conf` / `dac` overrides. Nothing is changed if any override is
    /// rejected.
    pub fn apply_overrides(
        &self,
        gen_conf: &mut RegisterStore,
        dac: &mut RegisterStore,
    ) -> Result<(), ConfigError> {
        let mut staged_gen_conf = gen_conf.clone();
        let mut staged_dac = dac.clone();
        for (name, &value) in &self.gen_conf {
            staged_gen_conf.set(name, value)?;
        }
        for (name, &value) in &self.dac {
            staged_dac.set(name, value)?;
        }
        *gen_conf = staged_gen_conf;
        *dac = staged_dac;
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(self.interval_ms),
            simulate_flip: self.simulate_flip,
            flip_probability: self.flip_probability,
            max_iterations: self.max_iterations,
            stop_on_mismatch: self.stop_on_mismatch,
        }
    }
}
