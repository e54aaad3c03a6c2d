//! TOML configuration for speedcheck.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file located via
//! an explicit path, the `SPEEDCHECK_CONFIG` environment variable, or
//! `./speedcheck.toml`, in that order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::CatalogSource;
use crate::engine::http::HttpEngineOptions;
use crate::orchestrator::{Timing, PHASE_TIMEOUT, STOP_GRACE};

pub const CONFIG_ENV: &str = "SPEEDCHECK_CONFIG";
pub const LOCAL_CONFIG: &str = "speedcheck.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedCheckConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SpeedCheckConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration.
    ///
    /// An explicitly requested file must load. Files found through the
    /// environment or the working directory fall back to defaults with a
    /// warning when broken.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "{CONFIG_ENV} set but file could not be loaded, trying fallback");
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "local config file could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.phase_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timing.phase_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.timing.stop_grace_secs == 0 {
            return Err(ConfigError::Invalid(
                "timing.stop_grace_secs must be greater than zero".into(),
            ));
        }
        if self.transfer.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.transfer.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "transfer.progress_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn catalog_source(&self) -> CatalogSource {
        match &self.catalog.path {
            Some(path) => CatalogSource::File(path.clone()),
            None => CatalogSource::Embedded,
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            phase_timeout: Duration::from_secs(self.timing.phase_timeout_secs),
            stop_grace: Duration::from_secs(self.timing.stop_grace_secs),
        }
    }

    pub fn engine_options(&self) -> HttpEngineOptions {
        let mut options = HttpEngineOptions {
            connect_timeout: Duration::from_secs(self.transfer.connect_timeout_secs),
            progress_interval: Duration::from_millis(self.transfer.progress_interval_ms),
            ..HttpEngineOptions::default()
        };
        if let Some(agent) = &self.transfer.user_agent {
            options.user_agent = agent.clone();
        }
        options
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Where the server list lives. `None` uses the compiled-in list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Limit for each download and upload phase.
    pub phase_timeout_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: PHASE_TIMEOUT.as_secs(),
            stop_grace_secs: STOP_GRACE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub connect_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            progress_interval_ms: 100,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SpeedCheckConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing().phase_timeout, Duration::from_secs(20));
        assert!(matches!(config.catalog_source(), CatalogSource::Embedded));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[catalog]
path = "/etc/speedcheck/servers.json"

[timing]
phase_timeout_secs = 5
"#
        )
        .unwrap();
        let config = SpeedCheckConfig::load(file.path()).unwrap();
        assert_eq!(config.timing.phase_timeout_secs, 5);
        assert_eq!(config.timing.stop_grace_secs, 2);
        assert_eq!(config.transfer.connect_timeout_secs, 10);
        assert!(matches!(config.catalog_source(), CatalogSource::File(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[timing]\nphase_timeout_secs = 0").unwrap();
        let err = SpeedCheckConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_stop_grace_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[timing]\nstop_grace_secs = 0").unwrap();
        let err = SpeedCheckConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("stop_grace_secs")));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = SpeedCheckConfig::resolve(Some(Path::new("/nonexistent/speedcheck.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_user_agent_override() {
        let mut config = SpeedCheckConfig::default();
        config.transfer.user_agent = Some("lab-probe/1".into());
        assert_eq!(config.engine_options().user_agent, "lab-probe/1");
    }
}
