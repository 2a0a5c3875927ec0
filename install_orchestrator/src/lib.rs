//! Install matrix orchestration.
//!
//! Each matrix cell is driven through a [`CellPipeline`]: resolve the
//! archive, build the environment image, start a container, run the install
//! phase for the cell's identity, then record a [`CellResult`]. The
//! [`Orchestrator`] runs cells concurrently against a shared
//! [`ContainerRuntime`](container_runtime_interface::ContainerRuntime).

pub mod config;
pub mod phases;
pub mod pipeline;
pub mod results;
pub mod scheduler;

pub use config::{InstallerContract, OrchestratorConfig};
pub use pipeline::{CellPipeline, CellState, PipelineContext};
pub use results::{
    CellFailure, CellResult, CellStatus, FailureKind, PhaseRecord, ResultSet, Stage, StatusCounts,
    StepRecord, Summary,
};
pub use scheduler::Orchestrator;
