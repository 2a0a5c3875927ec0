//! Runtime gateway contract.
//!
//! The orchestrator only ever talks to a container engine through
//! [`ContainerRuntime`]. The real implementation drives Docker, Finch or
//! Podman; tests substitute an in-memory fake.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use matrix_shared_types::{EnvironmentDefinition, ImageTag, Mount};

/// Errors reported by a runtime gateway.
///
/// A command that ran inside the container and exited non-zero is *not* an
/// error; it is reported through [`ExecOutput::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no container engine reachable: {0}")]
    Unavailable(String),

    #[error("image build failed for {tag}: {message}")]
    BuildFailed {
        tag: String,
        message: String,
        /// Last lines of build output.
        output: String,
    },

    #[error("engine command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// A running container created by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Engine-assigned container id.
    pub id: String,
    pub name: String,
    pub image: ImageTag,
    /// Label of the matrix cell the container belongs to.
    pub cell: String,
}

/// Options for starting a detached container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    /// Label of the owning matrix cell; used to derive the container name.
    pub cell: String,
    pub platform: Option<String>,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
}

/// A shell command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Script passed to `sh -lc`.
    pub script: String,
    pub user: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
}

impl ExecRequest {
    pub fn new(script: impl Into<String>, user: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            user: user.into(),
            workdir: workdir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a command that was dispatched and ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Gateway over a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short engine name for logs and reports.
    fn engine_name(&self) -> &str;

    /// Build (or reuse) the image for a definition.
    async fn build_image(&self, definition: &EnvironmentDefinition) -> Result<ImageTag>;

    /// Start a detached container from a built image.
    async fn run_container(
        &self,
        image: &ImageTag,
        options: &CreateContainerOptions,
    ) -> Result<ContainerHandle>;

    /// Run a command to completion. Cancelling the token aborts the command.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;

    /// Tail of the container's own output.
    async fn logs(&self, handle: &ContainerHandle) -> Result<String>;

    /// Remove a container. Removing an already-gone container succeeds.
    async fn teardown(&self, handle: &ContainerHandle) -> Result<()>;

    /// Stop tracking a container so it survives the run for inspection.
    async fn retain(&self, handle: &ContainerHandle);

    /// Remove every container this gateway created and has not torn down
    /// or retained.
    /// Returns how many were removed.
    async fn teardown_all(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_builder() {
        let request = ExecRequest::new("command -v q", "tester", "/home/tester")
            .with_env("HOME", "/home/tester");
        assert_eq!(request.env.get("HOME").map(String::as_str), Some("/home/tester"));
        assert_eq!(request.user, "tester");
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput::default();
        assert!(ok.success());
        let failed = ExecOutput {
            exit_code: 127,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
