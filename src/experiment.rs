//! Experiment identity and on-disk layout.
//!
//! An `Experiment` owns one mutable scratch run directory, reused and
//! cleared between runs, and one append-only restart directory keyed by
//! month index. Everything the run engine touches hangs off this struct.

use crate::diag::DiagTable;
use crate::namelist::Namelist;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory roots and environment profile, passed in explicitly instead of
/// being read from process-global state by the components that need them.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Root of the model installation (source tree, static tables).
    pub base: PathBuf,
    /// Root for per-experiment scratch working directories.
    pub work: PathBuf,
    /// Root for permanent per-experiment output data.
    pub data: PathBuf,
    /// Name of the machine/environment profile handed to the executable.
    pub env_name: String,
}

impl Layout {
    /// Resolve the layout from `GCMRUN_BASE`, `GCMRUN_WORK` and
    /// `GCMRUN_DATA`. `GCMRUN_ENV` is optional.
    pub fn from_env() -> Result<Layout> {
        let var = |name: &str| {
            std::env::var(name)
                .map(PathBuf::from)
                .with_context(|| format!("environment variable {} must be set", name))
        };
        Ok(Layout {
            base: var("GCMRUN_BASE")?,
            work: var("GCMRUN_WORK")?,
            data: var("GCMRUN_DATA")?,
            env_name: std::env::var("GCMRUN_ENV").unwrap_or_else(|_| "default".to_string()),
        })
    }
}

/// A named series of restart-chained runs and its configuration state.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub name: String,
    pub layout: Layout,
    /// Scratch root for this experiment: `work/<name>`.
    pub workdir: PathBuf,
    /// Where the compiled executable lives.
    pub execdir: PathBuf,
    /// The simulation executable (or its launch wrapper) to invoke per run.
    pub executable: PathBuf,
    /// Append-only archive of per-month restart files.
    pub restartdir: PathBuf,
    /// Temporary area an individual run is performed in.
    pub rundir: PathBuf,
    /// Permanent output tree: `data/<name>`.
    pub datadir: PathBuf,
    pub namelist: Namelist,
    pub diag_table: DiagTable,
    /// Static field table copied verbatim into the run directory, if any.
    pub field_table: Option<PathBuf>,
    /// Extra input files staged into `run/INPUT` before launch.
    pub input_files: Vec<PathBuf>,
    /// Default overwrite policy for pre-existing month output.
    pub overwrite_data: bool,
}

impl Experiment {
    /// Create an experiment under `layout`, making its working directory.
    pub fn new(name: &str, layout: &Layout) -> Result<Experiment> {
        let workdir = layout.work.join(name);
        fs::create_dir_all(&workdir)
            .with_context(|| format!("creating working directory {}", workdir.display()))?;
        let execdir = workdir.join("exec");
        Ok(Experiment {
            name: name.to_string(),
            layout: layout.clone(),
            executable: execdir.join("gcm.x"),
            execdir,
            restartdir: workdir.join("restarts"),
            rundir: workdir.join("run"),
            datadir: layout.data.join(name),
            workdir,
            namelist: Namelist::new(),
            diag_table: DiagTable::new(),
            field_table: None,
            input_files: Vec::new(),
            overwrite_data: false,
        })
    }

    /// Restart archive for `month`, referenced by exact index only.
    pub fn restart_path(&self, month: u32) -> PathBuf {
        self.restartdir.join(format!("res_{}.tar.gz", month))
    }

    /// Permanent output directory for `month`.
    pub fn output_dir(&self, month: u32) -> PathBuf {
        self.datadir.join(format!("run{:03}", month))
    }

    /// Adopt a diagnostic table, cloning it so later mutation of the
    /// caller's copy does not leak into this experiment.
    pub fn use_diag_table(&mut self, diag_table: &DiagTable) {
        self.diag_table = diag_table.copy();
    }

    /// Merge a partial namelist into this experiment's namelist,
    /// overwriting existing values key by key.
    pub fn update_namelist(&mut self, patch: &Namelist) {
        self.namelist.update(patch);
    }

    /// Derive a new experiment based on this one: shares the executable
    /// binding, clones the namelist and diagnostic table.
    pub fn derive(&self, new_name: &str) -> Result<Experiment> {
        let mut exp = Experiment::new(new_name, &self.layout)?;
        exp.execdir = self.execdir.clone();
        exp.executable = self.executable.clone();
        exp.namelist = self.namelist.clone();
        exp.use_diag_table(&self.diag_table);
        exp.field_table = self.field_table.clone();
        exp.input_files = self.input_files.clone();
        exp.overwrite_data = self.overwrite_data;
        Ok(exp)
    }

    /// Reset the scratch run directory to a known-empty state.
    pub fn clear_rundir(&self) -> Result<()> {
        if self.rundir.exists() {
            fs::remove_dir_all(&self.rundir)
                .with_context(|| format!("removing run directory {}", self.rundir.display()))?;
        }
        fs::create_dir_all(&self.rundir)
            .with_context(|| format!("creating run directory {}", self.rundir.display()))?;
        Ok(())
    }

    /// Take the per-experiment run lock. Overlapping invocations against
    /// the same identity race on the shared scratch directory, so a second
    /// acquisition fails fast instead.
    pub fn acquire_run_lock(&self) -> Result<RunGuard> {
        RunGuard::acquire(&self.workdir.join("run.lock"), &self.name)
    }

    /// Write the rendered namelist, diag table and field table into `outdir`.
    pub fn write_run_inputs(&self, outdir: &Path) -> Result<()> {
        self.namelist.write_to(outdir)?;
        let diag_text = self
            .diag_table
            .materialize(&self.name, &self.namelist)
            .context("materializing diag table")?;
        let diag_path = outdir.join("diag_table");
        fs::write(&diag_path, diag_text)
            .with_context(|| format!("writing diag_table to {}", diag_path.display()))?;
        if let Some(src) = &self.field_table {
            let dest = outdir.join("field_table");
            fs::copy(src, &dest)
                .with_context(|| format!("copying field table {}", src.display()))?;
        }
        Ok(())
    }
}

/// Run-in-progress marker. Held for the duration of one run; dropping it
/// releases the lock file.
#[derive(Debug)]
pub struct RunGuard {
    path: PathBuf,
}

impl RunGuard {
    fn acquire(path: &Path, exp_name: &str) -> Result<RunGuard> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(RunGuard {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow::anyhow!(
                "a run is already in progress for experiment {:?} (lock file {})",
                exp_name,
                path.display()
            )),
            Err(e) => {
                Err(e).with_context(|| format!("creating lock file {}", path.display()))
            }
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
