//! Restart-chained run orchestration for GCM-style simulation executables.
//!
//! The crate composes run configuration (namelist parameters plus a
//! diagnostic output table) per experiment, chains discrete month runs
//! through restart archives, launches and monitors the external simulation
//! executable, and archives the output under an optional disk-bounded
//! retention policy.

pub mod cli;
pub mod diag;
pub mod engine;
pub mod experiment;
pub mod model;
pub mod namelist;
pub mod sweep;
