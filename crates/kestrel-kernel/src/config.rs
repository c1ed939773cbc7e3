//! Kernel configuration
//!
//! Boot parameters, loadable from a JSON blob handed over by the boot stage.
//! Missing fields take their defaults.

use alloc::string::{String, ToString};
use core::fmt;

use kestrel_core::ProcessLimits;
use kestrel_sync::DEFAULT_SPIN_LIMIT;
use serde::{Deserialize, Serialize};

/// Boot-time kernel parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Cores to schedule on (capped by what the HAL reports)
    pub cores: u32,
    /// Physical frames under management
    pub total_frames: usize,
    /// Timer ticks per scheduling quantum
    pub quantum_ticks: u32,
    /// Pages in each process's initial user stack
    pub user_stack_pages: usize,
    /// Handle table capacity per process
    pub max_handles: usize,
    /// Spin iterations before a kernel lock is declared deadlocked
    pub spin_limit: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cores: 4,
            total_frames: 16384,
            quantum_ticks: 10,
            user_stack_pages: 16,
            max_handles: 1024,
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

/// Why a configuration was rejected
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Not valid JSON for `KernelConfig`
    Parse(String),
    ZeroCores,
    ZeroFrames,
    ZeroQuantum,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "invalid kernel config: {}", msg),
            ConfigError::ZeroCores => write!(f, "cores must be at least 1"),
            ConfigError::ZeroFrames => write!(f, "total_frames must be at least 1"),
            ConfigError::ZeroQuantum => write!(f, "quantum_ticks must be at least 1"),
        }
    }
}

impl KernelConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cores == 0 {
            return Err(ConfigError::ZeroCores);
        }
        if self.total_frames == 0 {
            return Err(ConfigError::ZeroFrames);
        }
        if self.quantum_ticks == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        Ok(())
    }

    /// Per-process limits derived from this configuration.
    pub fn process_limits(&self) -> ProcessLimits {
        ProcessLimits {
            max_handles: self.max_handles,
            user_stack_pages: self.user_stack_pages,
            spin_limit: self.spin_limit,
        }
    }
}
