//! Result model and aggregation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use matrix_shared_types::{Identity, MatrixCell};

/// Final verdict of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Pass,
    Fail,
    Skipped,
}

/// Stages of the per-cell pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    ArtifactResolved,
    ImageBuilt,
    ContainerRunning,
    RootPhase,
    UserPhase,
    Completed,
    Failed,
}

impl Stage {
    /// Stage reached by a successful transition out of `self`.
    pub fn next(self) -> Stage {
        match self {
            Stage::Pending => Stage::ArtifactResolved,
            Stage::ArtifactResolved => Stage::ImageBuilt,
            Stage::ImageBuilt => Stage::ContainerRunning,
            Stage::ContainerRunning => Stage::RootPhase,
            Stage::RootPhase => Stage::UserPhase,
            Stage::UserPhase | Stage::Completed => Stage::Completed,
            Stage::Failed => Stage::Failed,
        }
    }
}

/// Why a cell failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ArtifactMissing,
    ArtifactAmbiguous,
    BuildError,
    /// The container could not be started.
    RuntimeError,
    RootInstallError,
    UserInstallError,
    /// The harness could not drive the engine, as opposed to the installer failing.
    InfrastructureError,
    Cancelled,
}

impl FailureKind {
    pub fn install_error(identity: Identity) -> Self {
        match identity {
            Identity::Root => FailureKind::RootInstallError,
            Identity::User => FailureKind::UserInstallError,
        }
    }
}

/// Failure payload, tagged with the stage it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFailure {
    pub kind: FailureKind,
    /// Stage the cell was attempting when it failed.
    pub stage: Stage,
    pub message: String,
    /// Build output, container logs or similar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl CellFailure {
    pub fn new(kind: FailureKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }
}

/// Output of one exec inside a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub command: String,
    pub user: String,
    /// `None` when the command could not be dispatched.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Steps run under one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub identity: Identity,
    pub steps: Vec<StepRecord>,
}

/// Immutable outcome of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellResult {
    pub cell: MatrixCell,
    pub status: CellStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub trace: Vec<Stage>,
    pub phases: Vec<PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CellFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl CellResult {
    /// Result for a cell that never ran.
    pub fn skipped(cell: MatrixCell, reason: impl Into<String>) -> Self {
        Self {
            cell,
            status: CellStatus::Skipped,
            started_at: Utc::now(),
            duration_ms: 0,
            artifact: None,
            image: None,
            container: None,
            trace: Vec::new(),
            phases: Vec::new(),
            failure: None,
            skip_reason: Some(reason.into()),
        }
    }

    /// Result for a cell that failed outside its pipeline.
    pub fn failed(cell: MatrixCell, failure: CellFailure) -> Self {
        Self {
            status: CellStatus::Fail,
            failure: Some(failure),
            skip_reason: None,
            ..Self::skipped(cell, "")
        }
    }

    /// Human readable reason for a non-passing result.
    pub fn reason(&self) -> Option<String> {
        match (&self.failure, &self.skip_reason) {
            (Some(failure), _) => Some(format!("{:?}: {}", failure.kind, failure.message)),
            (None, Some(reason)) => Some(reason.clone()),
            (None, None) => None,
        }
    }

    /// Steps that ran and did not exit zero.
    pub fn failed_steps(&self) -> impl Iterator<Item = (&PhaseRecord, &StepRecord)> {
        self.phases.iter().flat_map(|phase| {
            phase
                .steps
                .iter()
                .filter(|step| step.exit_code != Some(0))
                .map(move |step| (phase, step))
        })
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    fn add(&mut self, status: CellStatus) {
        self.total += 1;
        match status {
            CellStatus::Pass => self.passed += 1,
            CellStatus::Fail => self.failed += 1,
            CellStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Aggregate view of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub per_distribution: BTreeMap<String, StatusCounts>,
}

impl Summary {
    /// 0 iff nothing failed; skipped cells never count against success.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

/// Append-only collection of cell results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    results: Vec<CellResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: CellResult) {
        self.results.push(result);
    }

    /// Results in completion order.
    pub fn results(&self) -> &[CellResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results grouped by distribution and version for reporting.
    pub fn sorted(&self) -> Vec<&CellResult> {
        let mut sorted: Vec<&CellResult> = self.results.iter().collect();
        sorted.sort_by(|a, b| a.cell.cmp(&b.cell));
        sorted
    }

    pub fn summarize(&self) -> Summary {
        let mut overall = StatusCounts::default();
        let mut per_distribution: BTreeMap<String, StatusCounts> = BTreeMap::new();
        for result in &self.results {
            overall.add(result.status);
            per_distribution
                .entry(result.cell.distribution.clone())
                .or_default()
                .add(result.status);
        }
        Summary {
            total: overall.total,
            passed: overall.passed,
            failed: overall.failed,
            skipped: overall.skipped,
            per_distribution,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.summarize().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_shared_types::{Architecture, LibcVariant};

    fn cell(distribution: &str, identity: Identity) -> MatrixCell {
        MatrixCell {
            distribution: distribution.to_string(),
            version: "1".to_string(),
            architecture: Architecture::X86_64,
            libc: LibcVariant::Glibc,
            identity,
        }
    }

    fn result(distribution: &str, status: CellStatus) -> CellResult {
        let mut result = CellResult::skipped(cell(distribution, Identity::Root), "n/a");
        result.status = status;
        if status == CellStatus::Fail {
            result.failure = Some(CellFailure::new(
                FailureKind::RootInstallError,
                Stage::RootPhase,
                "install exited with 1",
            ));
        }
        result
    }

    #[test]
    fn test_summary_ten_cells_two_failures() {
        let mut set = ResultSet::new();
        for i in 0..10 {
            let distribution = if i % 2 == 0 { "ubuntu" } else { "alpine" };
            let status = if i < 2 { CellStatus::Fail } else { CellStatus::Pass };
            set.record(result(distribution, status));
        }

        let summary = set.summarize();
        assert_eq!(summary.total, 10);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.passed, 8);
        assert_ne!(summary.exit_code(), 0);
        assert_eq!(summary.per_distribution["ubuntu"].failed, 1);
        assert_eq!(summary.per_distribution["alpine"].total, 5);
    }

    #[test]
    fn test_skipped_cells_do_not_fail_the_run() {
        let mut set = ResultSet::new();
        set.record(result("ubuntu", CellStatus::Pass));
        set.record(result("alpine", CellStatus::Skipped));
        assert_eq!(set.exit_code(), 0);
        assert_eq!(set.summarize().skipped, 1);
    }

    #[test]
    fn test_empty_set_passes() {
        assert_eq!(ResultSet::new().exit_code(), 0);
    }

    #[test]
    fn test_sorted_groups_by_distribution() {
        let mut set = ResultSet::new();
        set.record(result("ubuntu", CellStatus::Pass));
        set.record(result("alpine", CellStatus::Pass));
        set.record(result("debian", CellStatus::Pass));
        let order: Vec<&str> = set.sorted().iter().map(|r| r.cell.distribution.as_str()).collect();
        assert_eq!(order, vec!["alpine", "debian", "ubuntu"]);
    }

    #[test]
    fn test_reason_prefers_failure() {
        let failed = result("ubuntu", CellStatus::Fail);
        assert_eq!(failed.reason().unwrap(), "RootInstallError: install exited with 1");
        let skipped = CellResult::skipped(cell("alpine", Identity::User), "unsupported");
        assert_eq!(skipped.reason().as_deref(), Some("unsupported"));
    }

    #[test]
    fn test_stage_next_follows_pipeline_order() {
        let mut stage = Stage::Pending;
        let mut order = vec![stage];
        while stage != Stage::Completed {
            stage = stage.next();
            order.push(stage);
        }
        assert_eq!(order.len(), 7);
        assert_eq!(order[4], Stage::RootPhase);
        assert_eq!(Stage::Failed.next(), Stage::Failed);
    }

    #[test]
    fn test_result_json_shape() {
        let failed = result("ubuntu", CellStatus::Fail);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "fail");
        assert_eq!(json["failure"]["kind"], "RootInstallError");
        assert_eq!(json["cell"]["architecture"], "x86_64");
    }
}
