//! wmh-pipeline library interface
//!
//! Orchestration layer of the WMH segmentation pipeline: masterfile build,
//! cohort partitioning, the stage graph with its worker-pool executor, and
//! the concrete workflows wiring external neuroimaging tools together.
//! Exposed as a library so integration tests can drive workflows with a fake
//! command runner.

pub mod cohort;
pub mod error;
pub mod executor;
pub mod graph;
pub mod masterfile;
pub mod tools;
pub mod workflows;

pub use crate::error::{Error, GraphError, Result, StageError};

/// Provenance label for `pipeline_version.txt`
///
/// Prefers a run-time `git describe`, then the description captured at build
/// time, then the package version.
pub fn version_label() -> String {
    wmh_common::version::version_label(option_env!("GIT_DESCRIBE"), env!("CARGO_PKG_VERSION"))
}
