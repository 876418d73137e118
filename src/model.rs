use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution parameters for a single month run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    /// 1-based month index within the experiment's restart chain.
    pub month: u32,
    /// Initialize from the previous month's restart archive.
    pub use_restart: bool,
    /// Explicit restart archive; overrides the month-1 derivation.
    #[serde(default)]
    pub restart_file: Option<PathBuf>,
    pub num_cores: usize,
    /// Multi-node launch topology (affects the mpirun options handed to the
    /// executable's launch wrapper).
    pub multi_node: bool,
    /// Destroy a pre-existing output directory instead of skipping the run.
    pub overwrite: bool,
    /// Light archival: keep only primary result files plus the two most
    /// recent restart archives.
    pub light: bool,
    /// Launch the executable under its debugger wrapper.
    pub debug: bool,
}

impl RunParams {
    /// Defaults for month `month`: cold start for month 1, restart-chained
    /// otherwise.
    pub fn month(month: u32) -> Self {
        Self {
            month,
            use_restart: month > 1,
            restart_file: None,
            num_cores: 8,
            multi_node: false,
            overwrite: false,
            light: false,
            debug: false,
        }
    }
}

/// Lifecycle states of one run invocation. Not persisted across process
/// restarts; the restart archive is the only durable side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Init,
    Prepared,
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// Per-invocation record tracked by the engine and surfaced in events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub month: u32,
    pub status: RunStatus,
    /// Restart archive consumed by this run, or None for a cold start.
    pub restart: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Non-error terminal outcomes of a run. Configuration, dependency and
/// execution failures surface as errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Output for this month already exists and overwrite is disallowed.
    /// The month is already satisfied, so this is not an error.
    Skipped,
    /// Cancelled by the user; the prior month's restart is intact and the
    /// same month can be retried.
    Interrupted,
}

/// Best-effort progress extracted from the child's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Progress {
    /// "Integration completed through N days"
    Days(u64),
    /// "Integration completed through <month-name> <day>:"
    Date(String),
}

/// Events emitted by the engine and consumed by the CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    Status { month: u32, status: RunStatus },
    Progress { month: u32, progress: Progress },
    /// Raw output line from the child process.
    Line(String),
    Info(InfoEvent),
}

/// Structured info events rendered to human-readable text by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    UsingRestart { path: PathBuf },
    ColdStart { month: u32 },
    SavedRestart { path: PathBuf },
    ArchivedRun { month: u32, output_dir: PathBuf },
    PrunedRestart { month: u32 },
    OverwritingOutput { month: u32 },
}

impl InfoEvent {
    /// Render a human-readable message for the CLI layer.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::UsingRestart { path } => {
                format!("Using restart file {}", path.display())
            }
            InfoEvent::ColdStart { month } => {
                format!("Running month {} without restart file", month)
            }
            InfoEvent::SavedRestart { path } => {
                format!("Saved restart file {}", path.display())
            }
            InfoEvent::ArchivedRun { month, output_dir } => {
                format!("Archived month {} to {}", month, output_dir.display())
            }
            InfoEvent::PrunedRestart { month } => {
                format!("Pruned restart archive for month {}", month)
            }
            InfoEvent::OverwritingOutput { month } => {
                format!("Data for month {} already exists, overwriting", month)
            }
        }
    }
}
