//! End-to-end run lifecycle tests against a stub simulation executable.

#![cfg(unix)]

use gcmrun::diag::DiagTable;
use gcmrun::engine::RunEngine;
use gcmrun::experiment::{Experiment, Layout};
use gcmrun::model::{Progress, RunEvent, RunOutcome, RunParams, RunStatus};
use gcmrun::namelist::NmlValue;
use gcmrun::sweep::{run_parameter_sweep, SweepSpace};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Stub executable: verifies the restart contract, emits a progress line,
/// and produces one restart state file and one result file.
const HAPPY_SCRIPT: &str = r#"#!/bin/sh
if [ -n "$GCMRUN_RESTART" ]; then
    [ -f INPUT/atmos.res.nc ] || exit 3
fi
echo "Integration completed through 30 days"
echo "state $GCMRUN_MONTH" > RESTART/atmos.res.nc
echo "data $GCMRUN_MONTH" > daily.nc
"#;

fn layout(root: &Path) -> Layout {
    Layout {
        base: root.join("base"),
        work: root.join("work"),
        data: root.join("data"),
        env_name: "test".to_string(),
    }
}

fn experiment(root: &Path, script: &str) -> Experiment {
    let mut exp = Experiment::new("lifecycle", &layout(root)).unwrap();
    std::fs::create_dir_all(&exp.execdir).unwrap();
    std::fs::write(&exp.executable, script).unwrap();
    let mut perms = std::fs::metadata(&exp.executable).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&exp.executable, perms).unwrap();

    exp.namelist.set("main_nml", "calendar", "no_calendar");
    exp.namelist.set("main_nml", "dt_atmos", 300i64);
    let mut diag = DiagTable::new();
    diag.add_file("daily", 1, "days", None);
    diag.add_field("dynamics", "ps", false, None).unwrap();
    exp.use_diag_table(&diag);
    exp
}

async fn run_month(
    exp: &Experiment,
    params: RunParams,
) -> (anyhow::Result<RunOutcome>, Vec<RunEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let outcome = RunEngine::new(exp, params, tx, cancel).run().await;
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    (outcome, events)
}

fn statuses(events: &[RunEvent]) -> Vec<RunStatus> {
    events
        .iter()
        .filter_map(|ev| match ev {
            RunEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

#[tokio::test]
async fn cold_start_run_completes_and_archives() {
    let tmp = tempfile::tempdir().unwrap();
    let exp = experiment(tmp.path(), HAPPY_SCRIPT);

    let (outcome, events) = run_month(&exp, RunParams::month(1)).await;
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);

    assert!(exp.restart_path(1).is_file());
    let outdir = exp.output_dir(1);
    assert!(outdir.join("daily.nc").is_file());
    assert!(outdir.join("input.nml").is_file());
    assert!(outdir.join("diag_table").is_file());
    assert!(dir_is_empty(&exp.rundir));

    let st = statuses(&events);
    assert_eq!(
        st,
        [
            RunStatus::Init,
            RunStatus::Prepared,
            RunStatus::Running,
            RunStatus::Completed
        ]
    );
    assert!(events.iter().any(|ev| matches!(
        ev,
        RunEvent::Progress {
            progress: Progress::Days(30),
            ..
        }
    )));
}

#[tokio::test]
async fn chained_run_requires_previous_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let exp = experiment(tmp.path(), HAPPY_SCRIPT);

    let (outcome, _) = run_month(&exp, RunParams::month(2)).await;
    let err = outcome.unwrap_err();
    assert!(err.to_string().contains("restart file not found"));
    assert!(!exp.output_dir(2).exists());
    assert!(dir_is_empty(&exp.rundir));
}

#[tokio::test]
async fn chain_succeeds_once_previous_month_is_archived() {
    let tmp = tempfile::tempdir().unwrap();
    let exp = experiment(tmp.path(), HAPPY_SCRIPT);

    let (outcome, _) = run_month(&exp, RunParams::month(1)).await;
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);

    // The stub exits 3 if the unpacked restart is missing from INPUT, so a
    // completed month 2 proves the dependency was resolved and staged.
    let (outcome, _) = run_month(&exp, RunParams::month(2)).await;
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);
    assert!(exp.restart_path(2).is_file());
}

#[tokio::test]
async fn existing_output_skips_unless_overwrite() {
    let tmp = tempfile::tempdir().unwrap();
    let exp = experiment(tmp.path(), HAPPY_SCRIPT);
    std::fs::create_dir_all(exp.output_dir(1)).unwrap();

    let (outcome, events) = run_month(&exp, RunParams::month(1)).await;
    assert_eq!(outcome.unwrap(), RunOutcome::Skipped);
    assert!(!statuses(&events).contains(&RunStatus::Completed));

    let mut params = RunParams::month(1);
    params.overwrite = true;
    let (outcome, _) = run_month(&exp, params).await;
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);
    assert!(exp.output_dir(1).join("daily.nc").is_file());
}

#[tokio::test]
async fn light_policy_keeps_two_most_recent_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let exp = experiment(tmp.path(), HAPPY_SCRIPT);

    for month in 1..=3 {
        let mut params = RunParams::month(month);
        params.light = true;
        let (outcome, _) = run_month(&exp, params).await;
        assert_eq!(outcome.unwrap(), RunOutcome::Completed);
    }

    assert!(!exp.restart_path(1).is_file());
    assert!(exp.restart_path(2).is_file());
    assert!(exp.restart_path(3).is_file());
    assert!(!exp.output_dir(1).join("res_1.tar.gz").is_file());

    // Light output keeps primary result files only, not the full run dir.
    assert!(exp.output_dir(3).join("daily.nc").is_file());
    assert!(exp.output_dir(3).join("res_3.tar.gz").is_file());
    assert!(!exp.output_dir(3).join("input.nml").exists());
}

#[tokio::test]
async fn cancellation_is_a_clean_abort() {
    let tmp = tempfile::tempdir().unwrap();
    let script = r#"#!/bin/sh
if [ "$GCMRUN_MONTH" = "2" ]; then
    echo "month two stalls"
    sleep 600
fi
echo "state" > RESTART/atmos.res.nc
"#;
    let exp = experiment(tmp.path(), script);

    let mut params = RunParams::month(1);
    params.use_restart = false;
    let (outcome, _) = run_month(&exp, params).await;
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let setter = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            cancel.store(true, Ordering::Relaxed);
        })
    };
    let outcome = RunEngine::new(&exp, RunParams::month(2), tx, cancel)
        .run()
        .await
        .unwrap();
    setter.await.unwrap();
    assert_eq!(outcome, RunOutcome::Interrupted);

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    let st = statuses(&events);
    assert!(st.contains(&RunStatus::Interrupted));
    assert!(!st.contains(&RunStatus::Completed));

    // Month 1's restart is intact, no partial month-2 artifact exists, and
    // the scratch area is ready for a retry of the same month.
    assert!(exp.restart_path(1).is_file());
    assert!(!exp.restart_path(2).exists());
    assert!(!exp.output_dir(2).exists());
    assert!(dir_is_empty(&exp.rundir));
}

#[tokio::test]
async fn failing_child_surfaces_error_and_clears_scratch() {
    let tmp = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\necho boom >&2\nexit 1\n";
    let exp = experiment(tmp.path(), script);

    let (outcome, events) = run_month(&exp, RunParams::month(1)).await;
    let err = outcome.unwrap_err();
    assert!(err.to_string().contains("failed"));
    assert!(statuses(&events).contains(&RunStatus::Failed));
    assert!(!exp.restart_path(1).exists());
    assert!(dir_is_empty(&exp.rundir));
}

#[tokio::test]
async fn empty_diag_table_fails_before_launch() {
    let tmp = tempfile::tempdir().unwrap();
    let marker_script = "#!/bin/sh\ntouch launched\n";
    let mut exp = experiment(tmp.path(), marker_script);
    exp.diag_table = DiagTable::new();

    let (outcome, _) = run_month(&exp, RunParams::month(1)).await;
    assert!(outcome.is_err());
    // The executable must never have been spawned.
    assert!(!exp.rundir.join("launched").exists());
    assert!(dir_is_empty(&exp.rundir));
}

#[tokio::test]
async fn missing_input_file_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut exp = experiment(tmp.path(), HAPPY_SCRIPT);
    exp.input_files = vec![tmp.path().join("no_such_input.nc")];

    let (outcome, _) = run_month(&exp, RunParams::month(1)).await;
    assert!(outcome.is_err());
    assert!(!exp.output_dir(1).exists());
}

#[tokio::test]
async fn cancellation_reaches_a_child_that_closed_its_streams() {
    let tmp = tempfile::tempdir().unwrap();
    // A daemonizing launch wrapper: stdio goes away but the process stays.
    let script = "#!/bin/sh\nexec >/dev/null 2>&1\nsleep 600\n";
    let exp = experiment(tmp.path(), script);

    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let setter = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            cancel.store(true, Ordering::Relaxed);
        })
    };
    let mut params = RunParams::month(1);
    params.use_restart = false;
    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        RunEngine::new(&exp, params, tx, cancel).run(),
    )
    .await
    .expect("cancellation must terminate the run after stream EOF")
    .unwrap();
    setter.await.unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    assert!(dir_is_empty(&exp.rundir));
}

#[tokio::test]
async fn parameter_sweep_derives_and_chains_each_combination() {
    let tmp = tempfile::tempdir().unwrap();
    let exp = experiment(tmp.path(), HAPPY_SCRIPT);

    let mut space = SweepSpace::new();
    space
        .entry("sec".to_string())
        .or_default()
        .insert("p".to_string(), vec![NmlValue::Int(0), NmlValue::Int(1)]);

    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = Arc::new(AtomicBool::new(false));
    run_parameter_sweep(&exp, &space, 2, &RunParams::month(1), tx, cancel)
        .await
        .unwrap();

    for p in [0i64, 1] {
        let name = format!("lifecycle_sec_p_{}", p);
        let datadir = tmp.path().join("data").join(&name);
        for month in [1u32, 2] {
            let outdir = datadir.join(format!("run{:03}", month));
            assert!(outdir.join("daily.nc").is_file());
            let nml = std::fs::read_to_string(outdir.join("input.nml")).unwrap();
            assert!(nml.contains(&format!("p = {}", p)));
        }
        let restarts = tmp.path().join("work").join(&name).join("restarts");
        assert!(restarts.join("res_2.tar.gz").is_file());
    }
}
