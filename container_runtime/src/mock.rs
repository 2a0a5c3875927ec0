//! In-memory runtime for tests.
//!
//! `MockRuntime` never touches a real engine. Exec responses are scripted
//! with [`ExecRule`]s and every call is recorded, so tests can assert how
//! many images were built and whether every container was torn down.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use container_runtime_interface::{
    ContainerHandle, ContainerRuntime, CreateContainerOptions, EnvironmentDefinition, ExecOutput,
    ExecRequest, ImageTag, Mount, Result, RuntimeError,
};

/// Scripted reaction to an exec.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// The command ran with this outcome.
    Output {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    /// The exec could not be dispatched.
    NotDispatched(String),
    /// Block until the exec is cancelled.
    Hang,
}

impl MockResponse {
    pub fn exit(exit_code: i64, stderr: impl Into<String>) -> Self {
        MockResponse::Output {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        MockResponse::Output {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Responds to execs whose script contains `pattern` (and whose user
/// matches, when given). The first matching rule wins.
#[derive(Debug, Clone)]
pub struct ExecRule {
    pub pattern: String,
    pub user: Option<String>,
    pub response: MockResponse,
}

/// One recorded exec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container: String,
    pub cell: String,
    pub user: String,
    pub script: String,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    build_requests: Vec<ImageTag>,
    images: HashSet<ImageTag>,
    created: Vec<ContainerHandle>,
    mounts: Vec<Vec<Mount>>,
    torn_down: Vec<String>,
    retained: Vec<String>,
    live: HashSet<String>,
    exec_log: Vec<ExecRecord>,
}

/// Fake gateway recording every call.
#[derive(Debug, Default)]
pub struct MockRuntime {
    rules: Vec<ExecRule>,
    build_failure: Option<String>,
    build_delay: Option<Duration>,
    run_failure: Option<String>,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exec rule.
    pub fn with_exec_rule(mut self, pattern: &str, user: Option<&str>, response: MockResponse) -> Self {
        self.rules.push(ExecRule {
            pattern: pattern.to_string(),
            user: user.map(str::to_string),
            response,
        });
        self
    }

    /// Make every build fail with this message.
    pub fn failing_build(mut self, message: &str) -> Self {
        self.build_failure = Some(message.to_string());
        self
    }

    /// Make every build take `delay` before finishing.
    pub fn slow_build(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Make every container start fail with this message.
    pub fn failing_run(mut self, message: &str) -> Self {
        self.run_failure = Some(message.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of builds requested, cached or not.
    pub fn build_requests(&self) -> usize {
        self.state().build_requests.len()
    }

    /// Distinct images actually built.
    pub fn images_built(&self) -> usize {
        self.state().images.len()
    }

    pub fn containers_created(&self) -> Vec<ContainerHandle> {
        self.state().created.clone()
    }

    /// Mounts passed to each `run_container`, in call order.
    pub fn mounts(&self) -> Vec<Vec<Mount>> {
        self.state().mounts.clone()
    }

    pub fn containers_torn_down(&self) -> Vec<String> {
        self.state().torn_down.clone()
    }

    pub fn containers_retained(&self) -> Vec<String> {
        self.state().retained.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.state().live.len()
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.state().exec_log.clone()
    }

    fn response_for(&self, request: &ExecRequest) -> MockResponse {
        self.rules
            .iter()
            .find(|rule| {
                request.script.contains(&rule.pattern)
                    && rule.user.as_ref().map_or(true, |user| *user == request.user)
            })
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| MockResponse::stdout(""))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn engine_name(&self) -> &str {
        "mock"
    }

    async fn build_image(&self, definition: &EnvironmentDefinition) -> Result<ImageTag> {
        let tag = definition.image_tag();
        self.state().build_requests.push(tag.clone());
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.build_failure {
            return Err(RuntimeError::BuildFailed {
                tag: tag.to_string(),
                message: message.clone(),
                output: format!("step failed: {message}"),
            });
        }
        self.state().images.insert(tag.clone());
        Ok(tag)
    }

    async fn run_container(
        &self,
        image: &ImageTag,
        options: &CreateContainerOptions,
    ) -> Result<ContainerHandle> {
        if let Some(message) = &self.run_failure {
            return Err(RuntimeError::CommandFailed {
                command: "run".to_string(),
                message: message.clone(),
            });
        }
        let mut state = self.state();
        if !state.images.contains(image) {
            return Err(RuntimeError::CommandFailed {
                command: "run".to_string(),
                message: format!("image {image} not built"),
            });
        }
        state.next_id += 1;
        let handle = ContainerHandle {
            id: format!("mock-{}", state.next_id),
            name: format!("install-matrix-{}", options.cell),
            image: image.clone(),
            cell: options.cell.clone(),
        };
        state.created.push(handle.clone());
        state.mounts.push(options.mounts.clone());
        state.live.insert(handle.id.clone());
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        {
            let mut state = self.state();
            if !state.live.contains(&handle.id) {
                return Err(RuntimeError::ContainerNotFound(handle.id.clone()));
            }
            state.exec_log.push(ExecRecord {
                container: handle.id.clone(),
                cell: handle.cell.clone(),
                user: request.user.clone(),
                script: request.script.clone(),
            });
        }

        match self.response_for(request) {
            MockResponse::Output {
                exit_code,
                stdout,
                stderr,
            } => Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
                duration: Duration::from_millis(1),
            }),
            MockResponse::NotDispatched(message) => Err(RuntimeError::CommandFailed {
                command: format!("exec {}", handle.name),
                message,
            }),
            MockResponse::Hang => {
                cancel.cancelled().await;
                Err(RuntimeError::Cancelled(format!("exec in {}", handle.name)))
            }
        }
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<String> {
        Ok(format!("mock logs for {}", handle.name))
    }

    async fn teardown(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state();
        state.live.remove(&handle.id);
        state.torn_down.push(handle.id.clone());
        Ok(())
    }

    async fn retain(&self, handle: &ContainerHandle) {
        let mut state = self.state();
        state.live.remove(&handle.id);
        state.retained.push(handle.id.clone());
    }

    async fn teardown_all(&self) -> Result<usize> {
        let mut state = self.state();
        let live: Vec<String> = state.live.drain().collect();
        let count = live.len();
        state.torn_down.extend(live);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn definition() -> EnvironmentDefinition {
        EnvironmentDefinition {
            name: "alpine-3.19-x86_64".to_string(),
            base_image: "alpine:3.19".to_string(),
            platform: "linux/amd64".to_string(),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            setup: Vec::new(),
            injections: Vec::new(),
            mount_points: Vec::new(),
            workdir: "/".to_string(),
            entrypoint: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        }
    }

    #[tokio::test]
    async fn test_rules_match_user_and_pattern() {
        let runtime = MockRuntime::new()
            .with_exec_rule("install.sh", Some("tester"), MockResponse::exit(1, "denied"));
        let tag = runtime.build_image(&definition()).await.unwrap();
        let handle = runtime
            .run_container(&tag, &CreateContainerOptions { cell: "c".to_string(), ..Default::default() })
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let as_root = runtime
            .exec(&handle, &ExecRequest::new("./install.sh", "root", "/root"), &cancel)
            .await
            .unwrap();
        assert!(as_root.success());

        let as_user = runtime
            .exec(&handle, &ExecRequest::new("./install.sh", "tester", "/home/tester"), &cancel)
            .await
            .unwrap();
        assert_eq!(as_user.exit_code, 1);
        assert_eq!(as_user.stderr, "denied");
        assert_eq!(runtime.exec_log().len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_all_sweeps_live() {
        let runtime = MockRuntime::new();
        let tag = runtime.build_image(&definition()).await.unwrap();
        let options = CreateContainerOptions::default();
        let first = runtime.run_container(&tag, &options).await.unwrap();
        runtime.run_container(&tag, &options).await.unwrap();
        runtime.teardown(&first).await.unwrap();

        assert_eq!(runtime.teardown_all().await.unwrap(), 1);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(runtime.containers_torn_down().len(), 2);
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let runtime = MockRuntime::new().with_exec_rule("sleep", None, MockResponse::Hang);
        let tag = runtime.build_image(&definition()).await.unwrap();
        let handle = runtime
            .run_container(&tag, &CreateContainerOptions::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runtime
            .exec(&handle, &ExecRequest::new("sleep 100", "root", "/root"), &cancel)
            .await;
        assert!(matches!(result, Err(RuntimeError::Cancelled(_))));
    }
}
