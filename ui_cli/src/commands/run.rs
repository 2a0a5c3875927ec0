//! Run command - execute the matrix and report.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use container_runtime::{detect_local, ContainerRuntime, EngineCliRuntime};
use environment_catalog::{Catalog, PlannedCell};
use install_orchestrator::Orchestrator;

use super::FilterArgs;
use crate::config::FileConfig;
use crate::error::{Result, EXIT_ABORTED, EXIT_CELL_FAILURE, EXIT_OK};
use crate::output;
use crate::report;
use crate::OutputFormat;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Directory holding the archives under test
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Keep containers after the run for inspection
    #[arg(long)]
    keep_containers: bool,

    /// Cells to run at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Report format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Also write the results as JSON to this file
    #[arg(long)]
    results_file: Option<PathBuf>,
}

/// Execute the run command.
pub async fn execute(args: RunArgs, config: FileConfig) -> Result<u8> {
    let mut orchestrator_config = config.orchestrator;
    if let Some(dir) = args.artifacts {
        orchestrator_config.artifact_dir = dir;
    }
    if let Some(parallel) = args.parallel {
        orchestrator_config.max_parallel = parallel.max(1);
    }
    orchestrator_config.retain_containers |= args.keep_containers;

    // Filter errors and a missing engine abort before any cell starts.
    let catalog = Catalog::with_extra(config.distributions)?;
    let planned = catalog.list_cells(&args.filter.to_filter())?;
    let runnable = planned.iter().filter(|p| matches!(p, PlannedCell::Run(_))).count();

    let engine = detect_local().await?;
    output::info(&format!(
        "Using {} at {}",
        engine.kind,
        engine.socket.display()
    ));
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(EngineCliRuntime::new(engine, config.engine.to_engine_config()).await?);

    output::info(&format!(
        "Running {} of {} cell(s) with artifacts from {}",
        runnable,
        planned.len(),
        orchestrator_config.artifact_dir.display()
    ));
    if orchestrator_config.retain_containers {
        output::warn("Containers will be kept after the run");
    }

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let orchestrator = Orchestrator::new(runtime, catalog, orchestrator_config);
    let results = orchestrator.run(planned, cancel.clone()).await;

    report::render(&results, args.format)?;
    if let Some(path) = &args.results_file {
        report::write_results_file(path, &results)?;
        info!("Wrote results to {}", path.display());
    }

    if cancel.is_cancelled() {
        return Ok(EXIT_ABORTED);
    }
    Ok(if results.exit_code() == 0 {
        EXIT_OK
    } else {
        EXIT_CELL_FAILURE
    })
}

/// Cancel the run on the first SIGINT or SIGTERM. A second signal exits
/// at once, leaving cleanup to the operator.
fn watch_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!("Cannot listen for signals: {}", e);
            return;
        }
        output::warn("Interrupted, stopping running cells and removing containers...");
        cancel.cancel();

        if wait_for_signal().await.is_ok() {
            output::error("Interrupted again, exiting without removing containers");
            std::process::exit(i32::from(EXIT_ABORTED));
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
