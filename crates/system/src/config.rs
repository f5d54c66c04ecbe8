use std::fs;
use std::path::Path;

use kernel::KernelConfig;
use serde::Deserialize;
use service::ServicesConfig;

use crate::error::ConfigError;

/// Most cores a session may emulate.
pub const MAX_CORES: usize = 4;

/// Everything a session needs, loadable from one JSON document. Missing
/// sections take their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub kernel: KernelConfig,
    pub services: ServicesConfig,
}

impl SystemConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cores = self.kernel.num_cores;
        if cores == 0 || cores > MAX_CORES {
            return Err(ConfigError::Invalid(format!(
                "num_cores must be between 1 and {}, got {}",
                MAX_CORES, cores
            )));
        }
        if self.kernel.quantum_us == 0 {
            return Err(ConfigError::Invalid("quantum_us must be positive".into()));
        }
        if self.services.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be positive".into()));
        }
        if self.services.users.len() > service::services::acc::MAX_USERS {
            return Err(ConfigError::Invalid(format!(
                "at most {} users, got {}",
                service::services::acc::MAX_USERS,
                self.services.users.len()
            )));
        }
        Ok(())
    }
}
