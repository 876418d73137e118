use crate::diag::DiagTable;
use crate::engine::RunEngine;
use crate::experiment::{Experiment, Layout};
use crate::model::{Progress, RunEvent, RunOutcome, RunParams};
use crate::namelist::Namelist;
use crate::sweep::{self, SweepSpace};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Output line routing for the stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "gcmrun",
    version,
    about = "Drive restart-chained runs of a GCM-style simulation executable"
)]
pub struct Cli {
    /// Experiment name (one restart chain per name)
    #[arg(long)]
    pub name: String,

    /// Simulation executable or launch wrapper to invoke per run
    #[arg(long)]
    pub executable: Option<PathBuf>,

    /// Namelist source file, merged in order (later sources win per key)
    #[arg(long = "namelist")]
    pub namelists: Vec<PathBuf>,

    /// JSON namelist patch applied after the sources are merged
    #[arg(long)]
    pub namelist_patch: Option<PathBuf>,

    /// JSON diagnostic output table specification
    #[arg(long)]
    pub diag_table: Option<PathBuf>,

    /// Static field table copied into the run directory
    #[arg(long)]
    pub field_table: Option<PathBuf>,

    /// Extra input file staged into run/INPUT (repeatable)
    #[arg(long = "input-file")]
    pub input_files: Vec<PathBuf>,

    /// First month index to run
    #[arg(long, default_value_t = 1)]
    pub start_month: u32,

    /// Number of consecutive months to run
    #[arg(long, default_value_t = 1)]
    pub months: u32,

    /// Force the first month of this invocation to start cold
    #[arg(long)]
    pub cold_start: bool,

    /// Cores handed to the executable's launch wrapper
    #[arg(long, default_value_t = 8)]
    pub cores: usize,

    /// Multi-node launch topology
    #[arg(long)]
    pub multi_node: bool,

    /// Light archival: keep primary results plus the two most recent restarts
    #[arg(long)]
    pub light: bool,

    /// Overwrite pre-existing month output instead of skipping
    #[arg(long)]
    pub overwrite: bool,

    /// Launch the executable under its debugger wrapper
    #[arg(long)]
    pub debugger: bool,

    /// Model installation root (overrides GCMRUN_BASE)
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Scratch working root (overrides GCMRUN_WORK)
    #[arg(long)]
    pub work: Option<PathBuf>,

    /// Permanent data root (overrides GCMRUN_DATA)
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Environment profile name (overrides GCMRUN_ENV)
    #[arg(long)]
    pub env_name: Option<String>,

    /// JSON parameter sweep specification (section -> parameter -> values)
    #[arg(long)]
    pub sweep: Option<PathBuf>,

    /// Months to run per sweep combination
    #[arg(long, default_value_t = 10)]
    pub sweep_runs: u32,
}

/// Run the driver; returns the process exit code (0 ok, 130 interrupted).
pub async fn run(args: Cli) -> Result<i32> {
    let layout = resolve_layout(&args)?;
    let exp = build_experiment(&args, &layout)?;

    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (out_tx, out_handle) = spawn_output_writer();
    let printer = tokio::spawn(consume_events(event_rx, out_tx.clone()));

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel2 = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel2.store(true, Ordering::Relaxed);
        }
    });

    let code = if let Some(sweep_path) = &args.sweep {
        let text = std::fs::read_to_string(sweep_path)
            .with_context(|| format!("reading sweep spec {}", sweep_path.display()))?;
        let space: SweepSpace = serde_json::from_str(&text)
            .with_context(|| format!("parsing sweep spec {}", sweep_path.display()))?;
        let template = build_params(&args, 1);
        sweep::run_parameter_sweep(
            &exp,
            &space,
            args.sweep_runs,
            &template,
            event_tx.clone(),
            cancel.clone(),
        )
        .await?;
        if cancel.load(Ordering::Relaxed) {
            130
        } else {
            0
        }
    } else {
        drive_chain(&exp, &args, &event_tx, &cancel).await?
    };

    drop(event_tx);
    let _ = printer.await;
    drop(out_tx);
    let _ = out_handle.await;
    Ok(code)
}

/// Run months `start_month..start_month+months` strictly in sequence.
async fn drive_chain(
    exp: &Experiment,
    args: &Cli,
    event_tx: &mpsc::UnboundedSender<RunEvent>,
    cancel: &Arc<AtomicBool>,
) -> Result<i32> {
    let start = args.start_month;
    for month in month_range(start, args.months) {
        if cancel.load(Ordering::Relaxed) {
            return Ok(130);
        }
        let mut params = build_params(args, month);
        if month == start {
            // The first month of an invocation is cold when asked for, or
            // when the chain itself starts here; a later start month
            // continues from the previous month's archived restart.
            params.use_restart = !(args.cold_start || month == 1);
        }
        let engine = RunEngine::new(exp, params, event_tx.clone(), cancel.clone());
        if engine.run().await? == RunOutcome::Interrupted {
            return Ok(130);
        }
    }
    Ok(0)
}

/// Months covered by one invocation, saturating instead of overflowing on
/// extreme start/count values.
fn month_range(start: u32, months: u32) -> std::ops::Range<u32> {
    start..start.saturating_add(months)
}

fn build_params(args: &Cli, month: u32) -> RunParams {
    let mut params = RunParams::month(month);
    params.num_cores = args.cores;
    params.multi_node = args.multi_node;
    params.overwrite = args.overwrite;
    params.light = args.light;
    params.debug = args.debugger;
    params
}

fn resolve_layout(args: &Cli) -> Result<Layout> {
    let mut layout = match (&args.base, &args.work, &args.data) {
        (Some(base), Some(work), Some(data)) => Layout {
            base: base.clone(),
            work: work.clone(),
            data: data.clone(),
            env_name: "default".to_string(),
        },
        _ => {
            let mut layout = Layout::from_env()?;
            if let Some(base) = &args.base {
                layout.base = base.clone();
            }
            if let Some(work) = &args.work {
                layout.work = work.clone();
            }
            if let Some(data) = &args.data {
                layout.data = data.clone();
            }
            layout
        }
    };
    if let Some(env_name) = &args.env_name {
        layout.env_name = env_name.clone();
    }
    Ok(layout)
}

fn build_experiment(args: &Cli, layout: &Layout) -> Result<Experiment> {
    let mut exp = Experiment::new(&args.name, layout)?;
    if let Some(exe) = &args.executable {
        exp.executable = exe.clone();
    }
    exp.overwrite_data = args.overwrite;
    if !args.namelists.is_empty() {
        exp.namelist = Namelist::build(&args.namelists)?;
    }
    if let Some(patch_path) = &args.namelist_patch {
        let text = std::fs::read_to_string(patch_path)
            .with_context(|| format!("reading namelist patch {}", patch_path.display()))?;
        let patch: Namelist = serde_json::from_str(&text)
            .with_context(|| format!("parsing namelist patch {}", patch_path.display()))?;
        exp.update_namelist(&patch);
    }
    if let Some(diag_path) = &args.diag_table {
        let text = std::fs::read_to_string(diag_path)
            .with_context(|| format!("reading diag table spec {}", diag_path.display()))?;
        let diag: DiagTable = serde_json::from_str(&text)
            .with_context(|| format!("parsing diag table spec {}", diag_path.display()))?;
        exp.use_diag_table(&diag);
    }
    exp.field_table = args.field_table.clone();
    exp.input_files = args.input_files.clone();
    Ok(exp)
}

/// Render engine events as timestamped status lines on stderr.
async fn consume_events(
    mut event_rx: mpsc::UnboundedReceiver<RunEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) {
    while let Some(ev) = event_rx.recv().await {
        let line = match ev {
            RunEvent::Status { month, status } => {
                format!("{} month {}: {:?}", timestamp(), month, status)
            }
            RunEvent::Progress { month, progress } => match progress {
                Progress::Days(days) => {
                    format!("{} month {}: completed through {} days", timestamp(), month, days)
                }
                Progress::Date(date) => {
                    format!("{} month {}: completed through {}", timestamp(), month, date)
                }
            },
            RunEvent::Line(l) => l,
            RunEvent::Info(info) => format!("{} {}", timestamp(), info.to_message()),
        };
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
}

fn timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_range_saturates_instead_of_overflowing() {
        assert_eq!(month_range(1, 3).collect::<Vec<_>>(), [1, 2, 3]);
        let range = month_range(u32::MAX - 1, 5);
        assert_eq!(range.start, u32::MAX - 1);
        assert_eq!(range.end, u32::MAX);
        assert_eq!(month_range(10, 0).count(), 0);
    }
}
