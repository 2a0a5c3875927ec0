//! Orchestrator configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use environment_catalog::DEFAULT_TEST_USER;

/// How the installer inside an archive is invoked and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerContract {
    /// Only consider archives named `<archive_name>-<arch>-linux*.zip`.
    pub archive_name: Option<String>,
    /// Directory the archive extracts into.
    pub bundle_dir: String,
    /// Installer script inside `bundle_dir`.
    pub installer: String,
    /// Binary expected on PATH after installation.
    pub binary: String,
    pub force_flag: String,
    pub no_confirm_flag: String,
    /// Environment set only for the privileged install.
    pub root_env: BTreeMap<String, String>,
}

impl Default for InstallerContract {
    fn default() -> Self {
        Self {
            archive_name: None,
            bundle_dir: "q".to_string(),
            installer: "install.sh".to_string(),
            binary: "q".to_string(),
            force_flag: "--force".to_string(),
            no_confirm_flag: "--no-confirm".to_string(),
            root_env: BTreeMap::from([("Q_INSTALL_ROOT".to_string(), "true".to_string())]),
        }
    }
}

/// Settings for one orchestrated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding the archives under test.
    pub artifact_dir: PathBuf,
    /// Cells allowed to run at once.
    pub max_parallel: usize,
    /// Keep containers after each cell instead of removing them.
    pub retain_containers: bool,
    /// Unprivileged account used for the user phase.
    pub test_user: String,
    pub installer: InstallerContract,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("dist"),
            max_parallel: 2,
            retain_containers: false,
            test_user: DEFAULT_TEST_USER.to_string(),
            installer: InstallerContract::default(),
        }
    }
}
