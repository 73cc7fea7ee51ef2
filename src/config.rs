//! TOML configuration: dedup tolerance, remote address, optimiser settings.
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! tolerance = 0.05
//!
//! [session]
//! host = "127.0.0.1"
//! port = 2000
//!
//! [optimization]
//! max_iterations = 200
//! objectives = [{ kind = "target", weight = 1.0 }]
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::OptimizationSettings;
use crate::session::{Address, DEFAULT_SCHEME};
use crate::types::{FdmError, FdmResult, DEFAULT_TOLERANCE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: "127.0.0.1".to_string(),
            port: 2000,
        }
    }
}

impl SessionConfig {
    pub fn address(&self) -> FdmResult<Address> {
        Address::new(self.scheme.clone(), self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Distance below which two endpoints are the same node.
    pub tolerance: f64,
    pub session: SessionConfig,
    pub optimization: OptimizationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            session: SessionConfig::default(),
            optimization: OptimizationSettings::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> FdmResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| FdmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> FdmResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| FdmError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> FdmResult<String> {
        toml::to_string(self).map_err(|e| FdmError::Config(e.to_string()))
    }

    fn validate(&self) -> FdmResult<()> {
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(FdmError::Config(format!("tolerance must be positive, got {}", self.tolerance)));
        }
        let opt = &self.optimization;
        if opt.lower_bound > opt.upper_bound {
            return Err(FdmError::Config(format!(
                "lower bound {} exceeds upper bound {}",
                opt.lower_bound, opt.upper_bound
            )));
        }
        self.session.address()?;
        Ok(())
    }
}
