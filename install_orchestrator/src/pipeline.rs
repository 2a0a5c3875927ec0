//! Per-cell state machine.
//!
//! A cell moves `Pending → ArtifactResolved → ImageBuilt → ContainerRunning →
//! RootPhase → UserPhase → Completed`. Any step may instead produce
//! `Failed`, which is absorbing. Each state carries exactly the resources
//! acquired so far, so the container handle that needs releasing is always
//! reachable from the pipeline.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use container_runtime_interface::{
    ContainerHandle, ContainerRuntime, CreateContainerOptions, ImageTag, Mount, RuntimeError,
};
use environment_catalog::{ArtifactError, ArtifactResolver, Catalog, DefinitionGenerator, ResolvedArtifact, ARTIFACT_MOUNT};
use matrix_shared_types::{Identity, MatrixCell};

use crate::config::OrchestratorConfig;
use crate::phases::{phase_steps, PhaseStep};
use crate::results::{
    CellFailure, CellResult, CellStatus, FailureKind, PhaseRecord, Stage, StepRecord,
};

/// Everything a pipeline needs from the run.
pub struct PipelineContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub catalog: Catalog,
    pub resolver: ArtifactResolver,
    pub generator: DefinitionGenerator,
    pub config: OrchestratorConfig,
}

impl PipelineContext {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, catalog: Catalog, config: OrchestratorConfig) -> Self {
        let resolver = ArtifactResolver::new(config.artifact_dir.clone())
            .with_name(config.installer.archive_name.clone());
        let generator = DefinitionGenerator::new(config.test_user.clone());
        Self {
            runtime,
            catalog,
            resolver,
            generator,
            config,
        }
    }
}

/// State of one cell.
#[derive(Debug)]
pub enum CellState {
    Pending,
    ArtifactResolved {
        artifact: ResolvedArtifact,
    },
    ImageBuilt {
        artifact: ResolvedArtifact,
        image: ImageTag,
    },
    ContainerRunning {
        artifact: ResolvedArtifact,
        container: ContainerHandle,
    },
    RootPhase {
        artifact: ResolvedArtifact,
        container: ContainerHandle,
    },
    UserPhase {
        artifact: ResolvedArtifact,
        container: ContainerHandle,
    },
    Completed {
        container: ContainerHandle,
    },
    Failed {
        failure: CellFailure,
        container: Option<ContainerHandle>,
    },
}

impl CellState {
    pub fn stage(&self) -> Stage {
        match self {
            CellState::Pending => Stage::Pending,
            CellState::ArtifactResolved { .. } => Stage::ArtifactResolved,
            CellState::ImageBuilt { .. } => Stage::ImageBuilt,
            CellState::ContainerRunning { .. } => Stage::ContainerRunning,
            CellState::RootPhase { .. } => Stage::RootPhase,
            CellState::UserPhase { .. } => Stage::UserPhase,
            CellState::Completed { .. } => Stage::Completed,
            CellState::Failed { .. } => Stage::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CellState::Completed { .. } | CellState::Failed { .. })
    }

    /// Container owned by this state, if one was started.
    pub fn container(&self) -> Option<&ContainerHandle> {
        match self {
            CellState::ContainerRunning { container, .. }
            | CellState::RootPhase { container, .. }
            | CellState::UserPhase { container, .. }
            | CellState::Completed { container } => Some(container),
            CellState::Failed { container, .. } => container.as_ref(),
            _ => None,
        }
    }

    fn take_container(self) -> Option<ContainerHandle> {
        match self {
            CellState::ContainerRunning { container, .. }
            | CellState::RootPhase { container, .. }
            | CellState::UserPhase { container, .. }
            | CellState::Completed { container } => Some(container),
            CellState::Failed { container, .. } => container,
            _ => None,
        }
    }
}

/// Drives one cell through its states.
pub struct CellPipeline {
    ctx: Arc<PipelineContext>,
    cell: MatrixCell,
    state: CellState,
    trace: Vec<Stage>,
    phases: Vec<PhaseRecord>,
    artifact: Option<String>,
    image: Option<ImageTag>,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

impl CellPipeline {
    pub fn new(ctx: Arc<PipelineContext>, cell: MatrixCell) -> Self {
        Self {
            ctx,
            cell,
            state: CellState::Pending,
            trace: vec![Stage::Pending],
            phases: Vec::new(),
            artifact: None,
            image: None,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn cell(&self) -> &MatrixCell {
        &self.cell
    }

    pub fn state(&self) -> &CellState {
        &self.state
    }

    /// Stages visited so far.
    pub fn trace(&self) -> &[Stage] {
        &self.trace
    }

    /// Run `advance` until the cell reaches a terminal state.
    pub async fn drive(&mut self, cancel: &CancellationToken) {
        while !self.state.is_terminal() {
            self.advance(cancel).await;
        }
    }

    /// Perform one transition.
    pub async fn advance(&mut self, cancel: &CancellationToken) {
        let state = std::mem::replace(&mut self.state, CellState::Pending);
        let stage = state.stage();

        let next = if cancel.is_cancelled() && !state.is_terminal() {
            let container = state.take_container();
            CellState::Failed {
                failure: CellFailure::new(FailureKind::Cancelled, stage.next(), "run aborted"),
                container,
            }
        } else {
            match state {
                CellState::Pending => self.resolve_artifact().await,
                CellState::ArtifactResolved { artifact } => self.build_image(artifact, cancel).await,
                CellState::ImageBuilt { artifact, image } => self.start_container(artifact, image).await,
                CellState::ContainerRunning { artifact, container } => {
                    self.run_phase(Identity::Root, artifact, container, cancel).await
                }
                CellState::RootPhase { artifact, container } => {
                    self.run_phase(Identity::User, artifact, container, cancel).await
                }
                CellState::UserPhase { container, .. } => CellState::Completed { container },
                terminal => terminal,
            }
        };

        let next_stage = next.stage();
        if next_stage != stage {
            debug!("Cell {}: {:?} -> {:?}", self.cell, stage, next_stage);
            self.trace.push(next_stage);
        }
        self.state = next;
    }

    async fn resolve_artifact(&mut self) -> CellState {
        match self
            .ctx
            .resolver
            .resolve(self.cell.architecture, self.cell.libc)
            .await
        {
            Ok(artifact) => {
                self.artifact = Some(artifact.file_name.clone());
                CellState::ArtifactResolved { artifact }
            }
            Err(err) => {
                let kind = match err {
                    ArtifactError::Ambiguous { .. } => FailureKind::ArtifactAmbiguous,
                    ArtifactError::Missing { .. } | ArtifactError::Io { .. } => FailureKind::ArtifactMissing,
                };
                self.fail(kind, Stage::ArtifactResolved, err.to_string(), None)
            }
        }
    }

    /// Build the cell's image. Cancellation drops the in-flight build, which
    /// kills the engine process.
    async fn build_image(&mut self, artifact: ResolvedArtifact, cancel: &CancellationToken) -> CellState {
        let Some(spec) = self.ctx.catalog.find(&self.cell.distribution, &self.cell.version) else {
            return self.fail(
                FailureKind::BuildError,
                Stage::ImageBuilt,
                format!("{}-{} is not in the catalog", self.cell.distribution, self.cell.version),
                None,
            );
        };
        let definition = self.ctx.generator.generate(spec, self.cell.architecture);

        let outcome = tokio::select! {
            outcome = self.ctx.runtime.build_image(&definition) => outcome,
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled(format!("build of {}", definition.name))),
        };

        match outcome {
            Ok(image) => {
                self.image = Some(image.clone());
                CellState::ImageBuilt { artifact, image }
            }
            Err(RuntimeError::BuildFailed { message, output, .. }) => {
                self.fail(FailureKind::BuildError, Stage::ImageBuilt, message, Some(output))
            }
            Err(err @ RuntimeError::Cancelled(_)) => {
                self.fail(FailureKind::Cancelled, Stage::ImageBuilt, err.to_string(), None)
            }
            Err(err) => self.fail(FailureKind::BuildError, Stage::ImageBuilt, err.to_string(), None),
        }
    }

    async fn start_container(&mut self, artifact: ResolvedArtifact, image: ImageTag) -> CellState {
        let artifact_dir = artifact
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.ctx.resolver.dir().to_path_buf());
        let options = CreateContainerOptions {
            cell: self.cell.label(),
            platform: Some(self.cell.architecture.platform().to_string()),
            mounts: vec![Mount::read_only(artifact_dir, ARTIFACT_MOUNT)],
            labels: [
                ("install-matrix.cell".to_string(), self.cell.label()),
                ("install-matrix.identity".to_string(), self.cell.identity.to_string()),
            ]
            .into_iter()
            .collect(),
        };

        match self.ctx.runtime.run_container(&image, &options).await {
            Ok(container) => {
                info!("Cell {} running in {}", self.cell, container.name);
                CellState::ContainerRunning { artifact, container }
            }
            Err(err) => {
                let kind = match err {
                    RuntimeError::Cancelled(_) => FailureKind::Cancelled,
                    _ => FailureKind::RuntimeError,
                };
                self.fail(kind, Stage::ContainerRunning, err.to_string(), None)
            }
        }
    }

    /// Run the phase for `identity`. Phases belonging to the other identity
    /// pass through without touching the container.
    async fn run_phase(
        &mut self,
        identity: Identity,
        artifact: ResolvedArtifact,
        container: ContainerHandle,
        cancel: &CancellationToken,
    ) -> CellState {
        let stage = match identity {
            Identity::Root => Stage::RootPhase,
            Identity::User => Stage::UserPhase,
        };
        let advance = |artifact, container| match identity {
            Identity::Root => CellState::RootPhase { artifact, container },
            Identity::User => CellState::UserPhase { artifact, container },
        };

        if self.cell.identity != identity {
            return advance(artifact, container);
        }

        let steps = phase_steps(
            identity,
            &artifact,
            &self.ctx.config.installer,
            &self.ctx.config.test_user,
        );
        let mut record = PhaseRecord {
            identity,
            steps: Vec::new(),
        };

        for PhaseStep { name, request } in steps {
            let started = Instant::now();
            let outcome = self.ctx.runtime.exec(&container, &request, cancel).await;
            match outcome {
                Ok(output) => {
                    let exit_code = output.exit_code;
                    record.steps.push(StepRecord {
                        name: name.to_string(),
                        command: request.script.clone(),
                        user: request.user.clone(),
                        exit_code: Some(exit_code),
                        stdout: output.stdout,
                        stderr: output.stderr,
                        duration_ms: output.duration.as_millis() as u64,
                    });
                    if exit_code != 0 {
                        warn!("Cell {}: {} step {} exited with {}", self.cell, identity, name, exit_code);
                        self.phases.push(record);
                        let failure = CellFailure::new(
                            FailureKind::install_error(identity),
                            stage,
                            format!("{identity} {name} step exited with {exit_code}"),
                        );
                        return CellState::Failed {
                            failure,
                            container: Some(container),
                        };
                    }
                }
                Err(err) => {
                    record.steps.push(StepRecord {
                        name: name.to_string(),
                        command: request.script.clone(),
                        user: request.user.clone(),
                        exit_code: None,
                        stdout: String::new(),
                        stderr: err.to_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    self.phases.push(record);
                    let kind = match err {
                        RuntimeError::Cancelled(_) => FailureKind::Cancelled,
                        _ => FailureKind::InfrastructureError,
                    };
                    let diagnostics = self.ctx.runtime.logs(&container).await.ok();
                    let mut failure = CellFailure::new(kind, stage, format!("{identity} {name} step: {err}"));
                    failure.diagnostics = diagnostics;
                    return CellState::Failed {
                        failure,
                        container: Some(container),
                    };
                }
            }
        }

        debug!("Cell {}: {:?} passed", self.cell, stage);
        self.phases.push(record);
        advance(artifact, container)
    }

    fn fail(
        &self,
        kind: FailureKind,
        stage: Stage,
        message: String,
        diagnostics: Option<String>,
    ) -> CellState {
        warn!("Cell {} failed at {:?}: {:?}: {}", self.cell, stage, kind, message);
        let failure = CellFailure::new(kind, stage, message);
        CellState::Failed {
            failure: match diagnostics {
                Some(diagnostics) => failure.with_diagnostics(diagnostics),
                None => failure,
            },
            container: None,
        }
    }

    /// Build the cell's result. The container, if any, is still alive.
    pub fn result(&self) -> CellResult {
        let (status, failure) = match &self.state {
            CellState::Completed { .. } => (CellStatus::Pass, None),
            CellState::Failed { failure, .. } => (CellStatus::Fail, Some(failure.clone())),
            other => (
                CellStatus::Fail,
                Some(CellFailure::new(
                    FailureKind::InfrastructureError,
                    other.stage(),
                    "pipeline stopped before reaching a terminal state",
                )),
            ),
        };

        CellResult {
            cell: self.cell.clone(),
            status,
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            artifact: self.artifact.clone(),
            image: self.image.as_ref().map(|tag| tag.to_string()),
            container: self.state.container().map(|c| c.name.clone()),
            trace: self.trace.clone(),
            phases: self.phases.clone(),
            failure,
            skip_reason: None,
        }
    }

    /// Tear the container down, or keep it when retention is configured.
    pub async fn release(self) {
        let retain = self.ctx.config.retain_containers;
        let runtime = Arc::clone(&self.ctx.runtime);
        let Some(container) = self.state.take_container() else {
            return;
        };

        if retain {
            info!("Retaining container {} for {}", container.name, container.cell);
            runtime.retain(&container).await;
            return;
        }
        if let Err(err) = runtime.teardown(&container).await {
            warn!("Failed to remove container {}: {}", container.name, err);
        }
    }
}
