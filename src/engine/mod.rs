//! Run lifecycle engine.
//!
//! Drives one month run through `Init -> Prepared -> Running` to a terminal
//! `Completed`, `Failed` or `Interrupted` state: prepares the scratch run
//! directory, resolves the restart dependency, launches the simulation
//! executable as a child process, monitors its output, and archives the
//! results. Emits `RunEvent`s for presentation layers.

mod archive;
mod progress;

use crate::experiment::Experiment;
use crate::model::{InfoEvent, RunEvent, RunOutcome, RunParams, RunRecord, RunStatus};
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Duration;

/// One-shot controller for a single month run of an experiment.
pub struct RunEngine<'a> {
    exp: &'a Experiment,
    params: RunParams,
    event_tx: UnboundedSender<RunEvent>,
    cancel: Arc<AtomicBool>,
}

impl<'a> RunEngine<'a> {
    pub fn new(
        exp: &'a Experiment,
        params: RunParams,
        event_tx: UnboundedSender<RunEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            exp,
            params,
            event_tx,
            cancel,
        }
    }

    /// Execute the run to a terminal outcome.
    ///
    /// Skips (pre-existing output, overwrite disallowed) and interrupts are
    /// non-error outcomes; configuration, dependency and execution failures
    /// are errors. The scratch run directory is cleared on every path that
    /// mutated it, so the next run starts from a known-empty state, and the
    /// prior month's restart archive is never touched on failure.
    pub async fn run(self) -> Result<RunOutcome> {
        if self.params.month == 0 {
            bail!("month index must be >= 1");
        }
        let _guard = self.exp.acquire_run_lock()?;

        let month = self.params.month;
        let mut record = RunRecord {
            month,
            status: RunStatus::Init,
            restart: None,
            output_dir: self.exp.output_dir(month),
        };
        self.set_status(&mut record, RunStatus::Init);

        // Precondition: pre-existing output either skips the run (already
        // satisfied, nothing mutated) or is destroyed up front.
        if record.output_dir.is_dir() {
            if self.params.overwrite || self.exp.overwrite_data {
                self.info(InfoEvent::OverwritingOutput { month });
                std::fs::remove_dir_all(&record.output_dir).with_context(|| {
                    format!("removing existing output {}", record.output_dir.display())
                })?;
            } else {
                self.info(InfoEvent::Message(format!(
                    "Data for month {} already exists and overwrite is disallowed, skipping",
                    month
                )));
                return Ok(RunOutcome::Skipped);
            }
        }

        let result = self.execute(&mut record).await;
        match result {
            Ok(outcome) => {
                self.exp.clear_rundir()?;
                Ok(outcome)
            }
            Err(e) => {
                self.set_status(&mut record, RunStatus::Failed);
                let _ = self.exp.clear_rundir();
                Err(e)
            }
        }
    }

    async fn execute(&self, record: &mut RunRecord) -> Result<RunOutcome> {
        let exp = self.exp;
        let month = record.month;

        // Prepare the scratch area.
        exp.clear_rundir()?;
        let indir = exp.rundir.join("INPUT");
        let restart_staging = exp.rundir.join("RESTART");
        std::fs::create_dir_all(&indir)
            .with_context(|| format!("creating {}", indir.display()))?;
        std::fs::create_dir_all(&restart_staging)
            .with_context(|| format!("creating {}", restart_staging.display()))?;
        std::fs::create_dir_all(&exp.restartdir)
            .with_context(|| format!("creating {}", exp.restartdir.display()))?;
        exp.write_run_inputs(&exp.rundir)?;
        for file in &exp.input_files {
            let name = file
                .file_name()
                .with_context(|| format!("input file {} has no file name", file.display()))?;
            std::fs::copy(file, indir.join(name))
                .with_context(|| format!("copying input file {}", file.display()))?;
        }
        self.set_status(record, RunStatus::Prepared);

        // Resolve the restart dependency before anything is launched.
        let restart = if self.params.use_restart {
            let path = self
                .params
                .restart_file
                .clone()
                .unwrap_or_else(|| exp.restart_path(month - 1));
            if !path.is_file() {
                bail!("restart file not found, expecting {}", path.display());
            }
            archive::unpack_restart(&path, &indir)?;
            self.info(InfoEvent::UsingRestart { path: path.clone() });
            Some(path)
        } else {
            self.info(InfoEvent::ColdStart { month });
            None
        };
        record.restart = restart.clone();

        self.set_status(record, RunStatus::Running);
        if self.launch_and_monitor(record, restart.as_deref()).await? == RunOutcome::Interrupted {
            return Ok(RunOutcome::Interrupted);
        }

        self.archive_run(record)?;
        self.set_status(record, RunStatus::Completed);
        Ok(RunOutcome::Completed)
    }

    /// Spawn the executable and consume its output streams line-by-line
    /// until it exits or the cancel flag is raised.
    async fn launch_and_monitor(
        &self,
        record: &mut RunRecord,
        restart: Option<&Path>,
    ) -> Result<RunOutcome> {
        let exp = self.exp;
        let p = &self.params;
        let mpirun_opts = if p.multi_node {
            "-bootstrap pbsdsh -f $PBS_NODEFILE"
        } else {
            ""
        };

        let mut cmd = Command::new(&exp.executable);
        cmd.current_dir(&exp.rundir)
            .env("GCMRUN_MONTH", p.month.to_string())
            .env("GCMRUN_DATADIR", &record.output_dir)
            .env("GCMRUN_RUNDIR", &exp.rundir)
            .env("GCMRUN_EXECDIR", &exp.execdir)
            .env("GCMRUN_ENV", &exp.layout.env_name)
            .env("GCMRUN_CORES", p.num_cores.to_string())
            .env("GCMRUN_MPIRUN_OPTS", mpirun_opts)
            .env("GCMRUN_DEBUG", if p.debug { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(r) = restart {
            cmd.env("GCMRUN_RESTART", r);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("launching {}", exp.executable.display()))?;
        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let scanner = progress::ProgressScanner::new();
        let mut out_done = false;
        let mut err_done = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(l)) => self.consume_line(record.month, &scanner, l),
                    Ok(None) => out_done = true,
                    Err(e) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(e).context("reading child stdout");
                    }
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(l)) => self.consume_line(record.month, &scanner, l),
                    Ok(None) => err_done = true,
                    Err(e) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(e).context("reading child stderr");
                    }
                },
                _ = ticker.tick() => {
                    if self.cancel.load(Ordering::Relaxed) {
                        self.info(InfoEvent::Message(
                            "Manual interrupt, killing process".to_string(),
                        ));
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        self.set_status(record, RunStatus::Interrupted);
                        return Ok(RunOutcome::Interrupted);
                    }
                }
            }
        }

        // Streams at EOF does not mean the child exited: a wrapper that
        // redirects its stdio and keeps running must still be killable, so
        // the wait races the cancel flag too.
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("waiting for child process")?;
                }
                _ = ticker.tick() => {
                    if self.cancel.load(Ordering::Relaxed) {
                        self.info(InfoEvent::Message(
                            "Manual interrupt, killing process".to_string(),
                        ));
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        self.set_status(record, RunStatus::Interrupted);
                        return Ok(RunOutcome::Interrupted);
                    }
                }
            }
        };
        if self.cancel.load(Ordering::Relaxed) {
            // Cancel landed in the same instant the process exited.
            self.set_status(record, RunStatus::Interrupted);
            return Ok(RunOutcome::Interrupted);
        }
        if !status.success() {
            bail!("run for month {} failed with {}", record.month, status);
        }
        Ok(RunOutcome::Completed)
    }

    /// Pack this month's restart state and move the results into the
    /// permanent output tree. Under the light policy only primary result
    /// files and the new restart archive are kept, and restart storage is
    /// bounded to the two most recent months.
    fn archive_run(&self, record: &RunRecord) -> Result<()> {
        let exp = self.exp;
        let month = record.month;
        let staging = exp.rundir.join("RESTART");

        let restart_archive = exp.restart_path(month);
        let packed = archive::pack_restart(&staging, &restart_archive)?;
        if packed == 0 {
            self.info(InfoEvent::Message(format!(
                "Month {} produced no restart state files",
                month
            )));
        }
        self.info(InfoEvent::SavedRestart {
            path: restart_archive.clone(),
        });
        std::fs::remove_dir_all(&staging)
            .with_context(|| format!("removing {}", staging.display()))?;

        std::fs::create_dir_all(&record.output_dir)
            .with_context(|| format!("creating {}", record.output_dir.display()))?;
        if self.params.light {
            for entry in std::fs::read_dir(&exp.rundir)
                .with_context(|| format!("reading {}", exp.rundir.display()))?
            {
                let entry = entry?;
                let name = entry.file_name();
                if entry.file_type()?.is_file() && name.to_string_lossy().ends_with(".nc") {
                    std::fs::copy(entry.path(), record.output_dir.join(&name))
                        .with_context(|| format!("copying {}", entry.path().display()))?;
                }
            }
            let archive_name = restart_archive
                .file_name()
                .context("restart archive has no file name")?;
            std::fs::copy(&restart_archive, record.output_dir.join(archive_name))
                .with_context(|| format!("copying {}", restart_archive.display()))?;
            // Keep the two most recent months of restart state: once this
            // month's restart is safely archived, month-2's becomes dead
            // weight and is pruned (both the archive and its data-tree copy).
            if month > 2 {
                let stale = month - 2;
                let stale_archive = exp.restart_path(stale);
                let stale_copy = exp
                    .output_dir(stale)
                    .join(format!("res_{}.tar.gz", stale));
                archive::prune_restart_copies(&[&stale_archive, &stale_copy])?;
                self.info(InfoEvent::PrunedRestart { month: stale });
            }
        } else {
            copy_dir_recursive(&exp.rundir, &record.output_dir)?;
        }
        self.info(InfoEvent::ArchivedRun {
            month,
            output_dir: record.output_dir.clone(),
        });
        Ok(())
    }

    fn consume_line(&self, month: u32, scanner: &progress::ProgressScanner, line: String) {
        if let Some(progress) = scanner.scan(&line) {
            let _ = self.event_tx.send(RunEvent::Progress { month, progress });
        }
        let _ = self.event_tx.send(RunEvent::Line(line));
    }

    fn set_status(&self, record: &mut RunRecord, status: RunStatus) {
        record.status = status;
        let _ = self.event_tx.send(RunEvent::Status {
            month: record.month,
            status,
        });
    }

    fn info(&self, event: InfoEvent) {
        let _ = self.event_tx.send(RunEvent::Info(event));
    }
}

/// Copy the contents of `src` into `dest` (created if absent).
fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    for entry in
        std::fs::read_dir(src).with_context(|| format!("reading {}", src.display()))?
    {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    Ok(())
}
