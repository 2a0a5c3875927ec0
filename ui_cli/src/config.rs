//! Configuration file loading.
//!
//! ```toml
//! [orchestrator]
//! artifact_dir = "dist"
//! max_parallel = 4
//!
//! [orchestrator.installer]
//! binary = "q"
//!
//! [engine]
//! exec_timeout_secs = 600
//!
//! [[distribution]]
//! name = "opensuse"
//! version = "15.5"
//! architectures = ["x86_64"]
//! libc_variants = ["glibc"]
//! base_image = "opensuse/leap:15.5"
//! package_family = "yum"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use container_runtime::EngineCliConfig;
use install_orchestrator::OrchestratorConfig;
use matrix_shared_types::DistributionSpec;

use crate::error::{CliError, Result};

/// Engine CLI overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engine binary to run instead of `docker`/`finch`/`podman`.
    pub binary: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub build_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = EngineCliConfig::default();
        Self {
            binary: None,
            command_timeout_secs: defaults.command_timeout.as_secs(),
            exec_timeout_secs: defaults.exec_timeout.as_secs(),
            build_timeout_secs: defaults.build_timeout.as_secs(),
        }
    }
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> EngineCliConfig {
        EngineCliConfig {
            binary: self.binary.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            build_timeout: Duration::from_secs(self.build_timeout_secs),
            ..Default::default()
        }
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub orchestrator: OrchestratorConfig,
    pub engine: EngineSettings,
    /// Releases added to the built-in catalog.
    #[serde(rename = "distribution")]
    pub distributions: Vec<DistributionSpec>,
}

/// Default location of the configuration file.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("install-matrix").join("config.toml"))
}

/// Load `path`, or the default file when present, or built-in defaults.
pub fn load(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => read(path),
        None => match default_path() {
            Some(path) if path.is_file() => read(&path),
            _ => Ok(FileConfig::default()),
        },
    }
}

fn read(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&contents).map_err(|source| CliError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
