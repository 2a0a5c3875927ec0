//! CLI-based container runtime.
//!
//! This module drives the detected engine's command line client (`docker`,
//! `finch` or `podman`) against the socket found during detection.
//!
//! # Requirements
//!
//! - The engine binary must be installed and in PATH
//! - The engine must be able to run images for the requested platforms
//!
//! # Dispatch detection
//!
//! Every exec prints a sentinel line to stderr before running the caller's
//! script. A command whose stderr lacks the sentinel never started inside the
//! container, which is reported as [`RuntimeError::CommandFailed`] rather than
//! as a non-zero exit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use container_runtime_interface::{
    ContainerHandle, ContainerRuntime, CreateContainerOptions, EnvironmentDefinition, ExecOutput,
    ExecRequest, ImageTag, Result, RuntimeError,
};

use crate::detection::DetectedEngine;

/// Marker written by every exec before the caller's script runs.
const DISPATCH_SENTINEL: &str = "__install_matrix_exec_started__";

/// Label carrying the run id on every container.
pub const RUN_LABEL: &str = "install-matrix.run";

/// Configuration for [`EngineCliRuntime`].
#[derive(Debug, Clone)]
pub struct EngineCliConfig {
    /// Override for the engine binary (default: the engine's own name).
    pub binary: Option<PathBuf>,
    /// Timeout for short engine commands (default: 60s)
    pub command_timeout: Duration,
    /// Timeout for one exec inside a container (default: 300s)
    pub exec_timeout: Duration,
    /// Timeout for an image build (default: 1800s)
    pub build_timeout: Duration,
    /// Build output lines kept for error reports.
    pub log_tail_lines: usize,
    /// Identifier stamped on every container of this run.
    pub run_id: String,
}

impl Default for EngineCliConfig {
    fn default() -> Self {
        Self {
            binary: None,
            command_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(300),
            build_timeout: Duration::from_secs(1800),
            log_tail_lines: 40,
            run_id: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Container runtime backed by an engine CLI.
pub struct EngineCliRuntime {
    engine: DetectedEngine,
    binary: PathBuf,
    config: EngineCliConfig,
    /// Live containers keyed by id.
    containers: Arc<RwLock<HashMap<String, ContainerHandle>>>,
    /// One lock per image tag so concurrent cells share a single build.
    builds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EngineCliRuntime {
    /// Create a runtime for a detected engine, verifying the CLI works.
    pub async fn new(engine: DetectedEngine, config: EngineCliConfig) -> Result<Self> {
        let binary = config
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(engine.kind.binary()));
        let runtime = Self {
            engine,
            binary,
            config,
            containers: Arc::new(RwLock::new(HashMap::new())),
            builds: Mutex::new(HashMap::new()),
        };
        runtime.verify_binary().await?;
        Ok(runtime)
    }

    pub fn engine(&self) -> &DetectedEngine {
        &self.engine
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    async fn verify_binary(&self) -> Result<()> {
        let output = self
            .run_engine(&["version".to_string()], self.config.command_timeout)
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("{:?}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(RuntimeError::Unavailable(format!(
                "{:?} version failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(
            "{} version: {}",
            self.engine.kind,
            String::from_utf8_lossy(&output.stdout).lines().next().unwrap_or_default()
        );
        Ok(())
    }

    // ==================== Engine CLI Helper Methods ====================

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(self.engine.kind.host_args(&self.engine.socket))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run an engine command to completion with a timeout.
    async fn run_engine(&self, args: &[String], limit: Duration) -> Result<std::process::Output> {
        let cmd_str = format!("{} {}", self.engine.kind, args.join(" "));
        debug!("Executing: {}", cmd_str);

        let mut command = self.command();
        command.args(args);
        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| RuntimeError::Timeout(cmd_str.clone()))?
            .map_err(RuntimeError::Io)?;

        Ok(output)
    }

    async fn image_exists(&self, tag: &ImageTag) -> Result<bool> {
        let args = vec!["image".to_string(), "inspect".to_string(), tag.to_string()];
        let output = self.run_engine(&args, self.config.command_timeout).await?;
        Ok(output.status.success())
    }

    /// Write the Containerfile and injected files into a fresh build context.
    async fn write_context(&self, definition: &EnvironmentDefinition) -> Result<tempfile::TempDir> {
        let context = tempfile::Builder::new().prefix("install-matrix-").tempdir()?;
        tokio::fs::write(context.path().join("Containerfile"), definition.render()).await?;
        for (index, injection) in definition.injections.iter().enumerate() {
            let path = context.path().join(EnvironmentDefinition::context_name(index));
            tokio::fs::write(path, &injection.contents).await?;
        }
        Ok(context)
    }

    /// Spawn the build and stream its output line by line.
    async fn stream_build(&self, tag: &ImageTag, args: Vec<String>) -> Result<()> {
        debug!("Executing: {} {}", self.engine.kind, args.join(" "));
        let mut child = self.command().args(&args).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("build stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("build stderr not captured")))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut tail = OutputTail::new(self.config.log_tail_lines);

        let build = async {
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line? {
                        Some(line) => {
                            debug!(target: "install_matrix::build", image = %tag, "{}", line);
                            tail.push(line);
                        }
                        None => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line? {
                        Some(line) => {
                            debug!(target: "install_matrix::build", image = %tag, "{}", line);
                            tail.push(line);
                        }
                        None => err_done = true,
                    },
                }
            }
            child.wait().await
        };

        let status: ExitStatus = tokio::time::timeout(self.config.build_timeout, build)
            .await
            .map_err(|_| RuntimeError::Timeout(format!("build of {}", tag)))??;

        if !status.success() {
            return Err(RuntimeError::BuildFailed {
                tag: tag.to_string(),
                message: format!("engine exited with {}", status),
                output: tail.join(),
            });
        }
        Ok(())
    }

    /// `rm --force` a container by id or name. A container that is already
    /// gone counts as removed.
    async fn remove(&self, target: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "--force".to_string(), target.to_string()];
        let output = self.run_engine(&args, self.config.command_timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing_container(&stderr) {
                return Err(RuntimeError::CommandFailed {
                    command: "rm".to_string(),
                    message: stderr.trim().to_string(),
                });
            }
            debug!("Container {} was already gone", target);
        }
        Ok(())
    }

    /// Remove a container whose `run` did not hand back a usable id.
    async fn discard(&self, name: &str) {
        if let Err(e) = self.remove(name).await {
            warn!("Failed to remove container {} after a failed start: {}", name, e);
        }
    }

    fn exec_args(&self, handle: &ContainerHandle, request: &ExecRequest) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--user".to_string(),
            request.user.clone(),
            "--workdir".to_string(),
            request.workdir.clone(),
        ];
        for (key, value) in &request.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(handle.id.clone());
        args.push("sh".to_string());
        args.push("-lc".to_string());
        args.push(format!("echo {DISPATCH_SENTINEL} >&2\n{}", request.script));
        args
    }
}

/// Bounded buffer of the most recent output lines.
struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn join(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Container names only allow `[a-zA-Z0-9_.-]`.
fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

/// Split the sentinel out of exec stderr. `None` if it never appeared.
fn strip_sentinel(stderr: &str) -> Option<String> {
    let mut found = false;
    let kept: Vec<&str> = stderr
        .lines()
        .filter(|line| {
            if !found && line.trim() == DISPATCH_SENTINEL {
                found = true;
                false
            } else {
                true
            }
        })
        .collect();
    found.then(|| kept.join("\n"))
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no container with") || lower.contains("not found")
}

#[async_trait]
impl ContainerRuntime for EngineCliRuntime {
    fn engine_name(&self) -> &str {
        self.engine.kind.binary()
    }

    async fn build_image(&self, definition: &EnvironmentDefinition) -> Result<ImageTag> {
        let tag = definition.image_tag();

        let lock = {
            let mut builds = self.builds.lock().await;
            Arc::clone(builds.entry(tag.to_string()).or_default())
        };
        let _building = lock.lock().await;

        if self.image_exists(&tag).await? {
            info!("Reusing cached image {}", tag);
            return Ok(tag);
        }

        info!("Building image {} from {}", tag, definition.base_image);
        let context = self.write_context(definition).await?;
        let context_path = context.path().to_string_lossy().to_string();

        let mut args = vec![
            "build".to_string(),
            "--platform".to_string(),
            definition.platform.clone(),
            "-t".to_string(),
            tag.to_string(),
            "-f".to_string(),
            format!("{}/Containerfile", context_path),
        ];
        if self.engine.kind.supports_plain_progress() {
            args.push("--progress".to_string());
            args.push("plain".to_string());
        }
        args.push(context_path);

        self.stream_build(&tag, args).await?;

        info!("Image {} built", tag);
        Ok(tag)
    }

    async fn run_container(
        &self,
        image: &ImageTag,
        options: &CreateContainerOptions,
    ) -> Result<ContainerHandle> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = sanitize_name(&format!("install-matrix-{}-{}", options.cell, &suffix[..8]));

        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            name.clone(),
            "--label".to_string(),
            format!("{}={}", RUN_LABEL, self.config.run_id),
        ];
        if let Some(platform) = &options.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        for (key, value) in &options.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &options.mounts {
            args.push("--volume".to_string());
            args.push(mount.volume_spec());
        }
        args.push(image.to_string());

        info!("Starting container {} from {}", name, image);
        // `run` may create the container and then fail to start it.
        let output = match self.run_engine(&args, self.config.command_timeout).await {
            Ok(output) => output,
            Err(e) => {
                self.discard(&name).await;
                return Err(e);
            }
        };

        if !output.status.success() {
            self.discard(&name).await;
            return Err(RuntimeError::CommandFailed {
                command: "run".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if id.is_empty() {
            self.discard(&name).await;
            return Err(RuntimeError::CommandFailed {
                command: "run".to_string(),
                message: "engine returned no container id".to_string(),
            });
        }

        let handle = ContainerHandle {
            id: id.clone(),
            name,
            image: image.clone(),
            cell: options.cell.clone(),
        };
        self.containers.write().await.insert(id, handle.clone());
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let args = self.exec_args(handle, request);
        debug!("Executing in {} as {}: {}", handle.name, request.user, request.script);

        let started = Instant::now();
        let mut command = self.command();
        command.args(&args);
        let run = command.output();
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RuntimeError::Cancelled(format!("exec in {}", handle.name)));
            }
            result = tokio::time::timeout(self.config.exec_timeout, run) => {
                result
                    .map_err(|_| RuntimeError::Timeout(format!("exec in {}: {}", handle.name, request.script)))?
                    .map_err(RuntimeError::Io)?
            }
        };
        let duration = started.elapsed();

        let raw_stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stderr = strip_sentinel(&raw_stderr).ok_or_else(|| RuntimeError::CommandFailed {
            command: format!("exec {}", handle.name),
            message: raw_stderr.trim().to_string(),
        })?;

        let exit_code = output.status.code().ok_or_else(|| RuntimeError::CommandFailed {
            command: format!("exec {}", handle.name),
            message: format!("terminated by signal ({})", output.status),
        })?;

        Ok(ExecOutput {
            exit_code: i64::from(exit_code),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            duration,
        })
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<String> {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            self.config.log_tail_lines.to_string(),
            handle.id.clone(),
        ];
        let output = self.run_engine(&args, self.config.command_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Err(RuntimeError::ContainerNotFound(handle.id.clone()));
            }
            return Err(RuntimeError::CommandFailed {
                command: "logs".to_string(),
                message: stderr.trim().to_string(),
            });
        }
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn teardown(&self, handle: &ContainerHandle) -> Result<()> {
        info!("Removing container {}", handle.name);
        self.remove(&handle.id).await?;
        self.containers.write().await.remove(&handle.id);
        Ok(())
    }

    async fn retain(&self, handle: &ContainerHandle) {
        info!("Keeping container {} for inspection", handle.name);
        self.containers.write().await.remove(&handle.id);
    }

    async fn teardown_all(&self) -> Result<usize> {
        let handles: Vec<ContainerHandle> = self.containers.read().await.values().cloned().collect();
        let mut removed = 0;
        for handle in handles {
            match self.teardown(&handle).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove container {}: {}", handle.name, e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::EngineKind;

    fn runtime() -> EngineCliRuntime {
        EngineCliRuntime {
            engine: DetectedEngine {
                kind: EngineKind::Docker,
                socket: PathBuf::from("/var/run/docker.sock"),
            },
            binary: PathBuf::from("docker"),
            config: EngineCliConfig::default(),
            containers: Arc::new(RwLock::new(HashMap::new())),
            builds: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn test_config_default() {
        let config = EngineCliConfig::default();
        assert_eq!(config.exec_timeout, Duration::from_secs(300));
        assert_eq!(config.run_id.len(), 32);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("ubuntu-22.04/x86_64:root"), "ubuntu-22.04-x86_64-root");
    }

    #[test]
    fn test_strip_sentinel() {
        let stderr = format!("profile noise\n{DISPATCH_SENTINEL}\ninstall failed\n");
        assert_eq!(strip_sentinel(&stderr).as_deref(), Some("profile noise\ninstall failed"));
        assert_eq!(strip_sentinel("Error response from daemon: container is not running"), None);
    }

    #[test]
    fn test_output_tail_keeps_latest() {
        let mut tail = OutputTail::new(2);
        for line in ["one", "two", "three"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.join(), "two\nthree");
    }

    #[test]
    fn test_exec_args() {
        let runtime = runtime();
        let handle = ContainerHandle {
            id: "abc123".to_string(),
            name: "install-matrix-test".to_string(),
            image: ImageTag("install-matrix/ubuntu-22.04-x86_64:0123456789ab".to_string()),
            cell: "ubuntu-22.04-x86_64-glibc-user".to_string(),
        };
        let request = ExecRequest::new("command -v q", "tester", "/home/tester").with_env("HOME", "/home/tester");
        let args = runtime.exec_args(&handle, &request);
        assert_eq!(&args[..5], &["exec", "--user", "tester", "--workdir", "/home/tester"]);
        assert!(args.contains(&"HOME=/home/tester".to_string()));
        let script = args.last().unwrap();
        assert!(script.starts_with(&format!("echo {DISPATCH_SENTINEL} >&2\n")));
        assert!(script.ends_with("command -v q"));
    }

    #[test]
    fn test_missing_container_messages() {
        assert!(is_missing_container("Error response from daemon: No such container: abc"));
        assert!(is_missing_container("Error: no container with name or ID \"abc\" found"));
        assert!(!is_missing_container("permission denied"));
    }
}
