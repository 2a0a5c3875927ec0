//! Environment catalog for the install matrix.
//!
//! - `catalog`: distribution releases under test and matrix expansion
//! - `generator`: turns a release into an environment definition
//! - `artifact`: finds the archive for an architecture/libc pairing

pub mod artifact;
pub mod catalog;
pub mod generator;

pub use artifact::{parse_archive_name, ArchiveName, ArtifactError, ArtifactResolver, ResolvedArtifact};
pub use catalog::{builtin_distributions, Catalog, CellFilter, PlannedCell};
pub use generator::{
    package_manager, DefinitionGenerator, PackageManager, ARTIFACT_MOUNT, DEFAULT_TEST_USER,
    VERIFY_SCRIPT_PATH,
};

/// Errors raised by the catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no distribution matches {filter}; available: {}", .available.join(", "))]
    NoMatch {
        filter: String,
        available: Vec<String>,
    },

    #[error("duplicate catalog entry {name} {version}")]
    Duplicate { name: String, version: String },

    #[error("invalid catalog entry: {0}")]
    Invalid(String),
}
