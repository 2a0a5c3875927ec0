//! Bounded, cancellable execution of a planned matrix.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use container_runtime_interface::ContainerRuntime;
use environment_catalog::{Catalog, PlannedCell};
use matrix_shared_types::MatrixCell;

use crate::config::OrchestratorConfig;
use crate::pipeline::{CellPipeline, PipelineContext};
use crate::results::{CellFailure, CellResult, CellStatus, FailureKind, ResultSet, Stage};

/// Runs matrix cells against one container runtime.
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, catalog: Catalog, config: OrchestratorConfig) -> Self {
        Self {
            ctx: Arc::new(PipelineContext::new(runtime, catalog, config)),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.ctx.config
    }

    /// Run every planned cell, at most `max_parallel` at a time.
    ///
    /// Skipped cells are recorded without touching the runtime. Cancelling
    /// `cancel` aborts in-flight execs; cells that had not started are
    /// recorded as skipped. Every container created during the run is gone
    /// (or explicitly retained) when this returns.
    pub async fn run(&self, planned: Vec<PlannedCell>, cancel: CancellationToken) -> ResultSet {
        let results = Arc::new(Mutex::new(ResultSet::new()));
        let permits = Arc::new(Semaphore::new(self.ctx.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        let mut launched = Vec::new();

        info!(
            "Running {} cell(s) on {} with parallelism {}",
            planned.len(),
            self.ctx.runtime.engine_name(),
            self.ctx.config.max_parallel.max(1)
        );

        for entry in planned {
            let cell = match entry {
                PlannedCell::Skip { cell, reason } => {
                    info!("Skipping {}: {}", cell, reason);
                    results.lock().await.record(CellResult::skipped(cell, reason));
                    continue;
                }
                PlannedCell::Run(cell) => cell,
            };

            launched.push(cell.clone());
            let ctx = Arc::clone(&self.ctx);
            let results = Arc::clone(&results);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => {
                        results.lock().await.record(CellResult::skipped(cell, "run aborted"));
                        return;
                    }
                };
                if cancel.is_cancelled() {
                    results.lock().await.record(CellResult::skipped(cell, "run aborted"));
                    return;
                }
                run_cell(ctx, cell, &results, &cancel).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("Cell task failed: {}", err);
            }
        }

        match self.ctx.runtime.teardown_all().await {
            Ok(0) => {}
            Ok(count) => warn!("Removed {} container(s) left behind by the run", count),
            Err(err) => error!("Final container sweep failed: {}", err),
        }

        let mut results = match Arc::try_unwrap(results) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().await.clone(),
        };

        // A task that panicked never recorded its cell.
        let recorded: HashSet<String> = results.results().iter().map(|r| r.cell.label()).collect();
        for cell in launched {
            if !recorded.contains(&cell.label()) {
                results.record(CellResult::failed(
                    cell,
                    CellFailure::new(
                        FailureKind::InfrastructureError,
                        Stage::Pending,
                        "cell task terminated without a result",
                    ),
                ));
            }
        }

        let summary = results.summarize();
        info!(
            "Run finished: {} passed, {} failed, {} skipped",
            summary.passed, summary.failed, summary.skipped
        );
        results
    }
}

/// Drive one cell to completion, record its result, then release its
/// container.
async fn run_cell(
    ctx: Arc<PipelineContext>,
    cell: MatrixCell,
    results: &Mutex<ResultSet>,
    cancel: &CancellationToken,
) {
    info!("Starting cell {}", cell);
    let mut pipeline = CellPipeline::new(ctx, cell);
    pipeline.drive(cancel).await;

    let result = pipeline.result();
    match result.status {
        CellStatus::Pass => info!("Cell {} passed in {}ms", result.cell, result.duration_ms),
        _ => warn!(
            "Cell {} failed: {}",
            result.cell,
            result.reason().unwrap_or_default()
        ),
    }
    results.lock().await.record(result);

    pipeline.release().await;
}
