//! Runtime configuration types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration for the translator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Patch block exits into direct jumps when the target is compiled.
    pub block_link: bool,
    /// Upper bound on instructions translated into one block.
    pub max_block_instructions: usize,
    /// Code arena size in bytes.
    pub code_size: usize,
    /// Cycles granted per `run` timeslice.
    pub timeslice: i32,
    /// Log every compiled block.
    pub trace_jit: bool,
    /// Optional function database to load at startup.
    pub func_db: Option<PathBuf>,
    /// Substitute recognized functions with native replacements.
    pub enable_replacements: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            block_link: true,
            max_block_instructions: 1024,
            code_size: 16 * 1024 * 1024,
            timeslice: 1_000_000,
            trace_jit: false,
            func_db: None,
            enable_replacements: true,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RuntimeConfig = toml::from_str("block_link = false").unwrap();
        assert!(!config.block_link);
        assert_eq!(config.timeslice, RuntimeConfig::default().timeslice);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
