//! Parameter sweep driver.
//!
//! Expands a `section -> parameter -> [values]` space into its cartesian
//! product and drives an independent, sequentially restart-chained series
//! of runs for each combination.

use crate::engine::RunEngine;
use crate::experiment::Experiment;
use crate::model::{RunEvent, RunOutcome, RunParams};
use crate::namelist::NmlValue;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc::UnboundedSender;

/// Sweep specification: section -> parameter -> candidate values.
pub type SweepSpace = BTreeMap<String, BTreeMap<String, Vec<NmlValue>>>;

/// One assignment per (section, parameter) axis.
pub type Combination = Vec<(String, String, NmlValue)>;

/// Cartesian product across all (section, parameter) axes.
pub fn combinations(space: &SweepSpace) -> Vec<Combination> {
    let mut combos: Vec<Combination> = vec![Vec::new()];
    for (section, params) in space {
        for (name, values) in params {
            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    values.iter().map(move |value| {
                        let mut next = combo.clone();
                        next.push((section.clone(), name.clone(), value.clone()));
                        next
                    })
                })
                .collect();
        }
    }
    combos
}

/// Deterministic derived-experiment name: the base name plus a truncated
/// identifier and value per axis.
pub fn combo_name(base: &str, combo: &Combination) -> String {
    let parts: Vec<String> = combo
        .iter()
        .map(|(section, name, value)| {
            format!(
                "{}_{}_{}",
                truncate(section, 3),
                truncate(name, 5),
                value_token(value)
            )
        })
        .collect();
    format!("{}_{}", base, parts.join("_"))
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Value rendering for experiment names: strings are used bare, everything
/// else via its namelist rendering.
fn value_token(value: &NmlValue) -> String {
    match value {
        NmlValue::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Derive one experiment per combination and run a strictly sequential
/// chain of `runs` months for it (month 1 cold, the rest restart-chained).
///
/// Combinations are independent of one another; runs within a combination
/// must stay sequential because each consumes the previous month's restart.
pub async fn run_parameter_sweep(
    base: &Experiment,
    space: &SweepSpace,
    runs: u32,
    template: &RunParams,
    event_tx: UnboundedSender<RunEvent>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    if space.is_empty()
        || space
            .values()
            .any(|params| params.is_empty() || params.values().any(|values| values.is_empty()))
    {
        bail!("parameter sweep space must name at least one value per axis");
    }
    for combo in combinations(space) {
        let mut exp = base.derive(&combo_name(&base.name, &combo))?;
        for (section, name, value) in &combo {
            exp.namelist.set(section, name, value.clone());
        }
        for month in 1..=runs {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            let mut params = template.clone();
            params.month = month;
            params.use_restart = month > 1;
            params.restart_file = None;
            let engine = RunEngine::new(&exp, params, event_tx.clone(), cancel.clone());
            if engine.run().await? == RunOutcome::Interrupted {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_2x2() -> SweepSpace {
        let mut space = SweepSpace::new();
        space
            .entry("sec".to_string())
            .or_default()
            .insert("p".to_string(), vec![NmlValue::Int(0), NmlValue::Int(1)]);
        space
            .entry("sec2".to_string())
            .or_default()
            .insert("q".to_string(), vec![NmlValue::Int(10), NmlValue::Int(20)]);
        space
    }

    #[test]
    fn two_by_two_space_yields_four_combinations() {
        let combos = combinations(&space_2x2());
        assert_eq!(combos.len(), 4);

        let pairs: Vec<(i64, i64)> = combos
            .iter()
            .map(|c| {
                let p = match c[0].2 {
                    NmlValue::Int(v) => v,
                    _ => panic!("expected int"),
                };
                let q = match c[1].2 {
                    NmlValue::Int(v) => v,
                    _ => panic!("expected int"),
                };
                (p, q)
            })
            .collect();
        for expected in [(0, 10), (0, 20), (1, 10), (1, 20)] {
            assert!(pairs.contains(&expected));
        }
    }

    #[test]
    fn combo_names_are_distinct_and_deterministic() {
        let combos = combinations(&space_2x2());
        let mut names: Vec<String> = combos
            .iter()
            .map(|c| combo_name("exp", c))
            .collect();
        assert_eq!(names.len(), 4);
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
        assert!(names.iter().any(|n| n == "exp_sec_p_0_sec2_q_10"));
    }

    #[tokio::test]
    async fn degenerate_sweep_space_is_rejected() {
        use crate::experiment::Layout;

        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout {
            base: tmp.path().join("base"),
            work: tmp.path().join("work"),
            data: tmp.path().join("data"),
            env_name: "test".to_string(),
        };
        let base = Experiment::new("sweepbase", &layout).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let err = run_parameter_sweep(
            &base,
            &SweepSpace::new(),
            1,
            &RunParams::month(1),
            tx.clone(),
            cancel.clone(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("sweep space"));

        let mut empty_values = SweepSpace::new();
        empty_values
            .entry("sec".to_string())
            .or_default()
            .insert("p".to_string(), Vec::new());
        assert!(
            run_parameter_sweep(&base, &empty_values, 1, &RunParams::month(1), tx, cancel)
                .await
                .is_err()
        );
    }

    #[test]
    fn identifiers_are_truncated() {
        let mut space = SweepSpace::new();
        space
            .entry("astronomy_nml".to_string())
            .or_default()
            .insert("obliquity".to_string(), vec![NmlValue::Float(5.0)]);
        let combos = combinations(&space);
        assert_eq!(combo_name("exp", &combos[0]), "exp_ast_obliq_5.0");
    }
}
