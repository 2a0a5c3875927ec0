//! CLI error types.

use std::path::PathBuf;

use thiserror::Error;

/// Every selected cell passed.
pub const EXIT_OK: u8 = 0;
/// At least one cell failed.
pub const EXIT_CELL_FAILURE: u8 = 1;
/// The harness itself could not run.
pub const EXIT_HARNESS: u8 = 2;
/// The run was interrupted.
pub const EXIT_ABORTED: u8 = 130;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Catalog(#[from] environment_catalog::CatalogError),

    #[error(transparent)]
    Runtime(#[from] container_runtime::RuntimeError),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
