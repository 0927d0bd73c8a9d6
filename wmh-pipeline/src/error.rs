//! Error types for wmh-pipeline
//!
//! Three layers:
//! - [`GraphError`]: malformed stage specs, raised while the graph is built
//! - [`StageError`]: one stage instance failed; recorded in a crash dump, never
//!   propagated to sibling branches
//! - [`Error`]: everything a workflow entry point can return

use std::path::PathBuf;
use thiserror::Error;

/// Result type for workflow entry points
pub type Result<T> = std::result::Result<T, Error>;

/// Workflow-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Shared taxonomy (ambiguity, missing files, configuration, branch failures)
    #[error(transparent)]
    Common(#[from] wmh_common::Error),

    /// Invalid stage graph
    #[error("Stage graph error: {0}")]
    Graph(#[from] GraphError),

    /// Run interrupted before every stage instance started
    #[error("Run cancelled: {pending} stage instances never started")]
    Cancelled { pending: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structural problems in a list of stage specs
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' consumes unknown stage '{upstream}'")]
    UnknownStage { stage: String, upstream: String },

    #[error("stage '{stage}' consumes '{upstream}.{port}', which '{upstream}' does not produce")]
    UnknownPort {
        stage: String,
        upstream: String,
        port: String,
    },

    #[error("stage '{stage}' receives input port '{port}' more than once")]
    DuplicateInput { stage: String, port: String },

    #[error("cycle between stages: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("stage '{stage}' iterates over unknown group '{group}'")]
    UnknownGroup { stage: String, group: String },

    /// A stage must iterate over at least every group its upstream iterates over
    #[error("stage '{stage}' iterates over {stage_groups:?} but upstream '{upstream}' iterates over {upstream_groups:?}")]
    IterationMismatch {
        stage: String,
        upstream: String,
        stage_groups: Vec<String>,
        upstream_groups: Vec<String>,
    },

    #[error("iterable group '{group}': field '{field}' has {found} values, expected {expected}")]
    UnsynchronizedGroup {
        group: String,
        field: String,
        expected: usize,
        found: usize,
    },

    #[error("iterable group '{0}' has no fields")]
    EmptyGroup(String),

    #[error("iterable group or field '{0}' is declared twice")]
    DuplicateGroup(String),
}

/// Failure of one stage instance
#[derive(Debug, Error)]
pub enum StageError {
    /// External tool exited non-zero (or was killed by a signal)
    #[error("{command} exited with status {}: {stderr_tail}", status_text(.status))]
    ToolFailed {
        command: String,
        status: Option<i32>,
        stderr_tail: String,
    },

    /// External tool could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool succeeded but a documented output file is absent
    #[error("{command} did not produce {}", .path.display())]
    MissingOutput { command: String, path: PathBuf },

    /// Upstream did not deliver a port this stage reads
    #[error("missing input port '{0}'")]
    MissingInput(String),

    /// Branch-level precondition failed
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Common(#[from] wmh_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StageError {
    /// Command line of the failed invocation, when a tool was involved
    pub fn command(&self) -> Option<&str> {
        match self {
            StageError::ToolFailed { command, .. } | StageError::MissingOutput { command, .. } => {
                Some(command)
            }
            _ => None,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            StageError::ToolFailed { status, .. } => *status,
            _ => None,
        }
    }

    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            StageError::ToolFailed { stderr_tail, .. } => Some(stderr_tail),
            _ => None,
        }
    }
}

fn status_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_accessors() {
        let err = StageError::ToolFailed {
            command: "fslmaths a -mas b c".to_string(),
            status: Some(1),
            stderr_tail: "Image Exception".to_string(),
        };
        assert_eq!(err.command(), Some("fslmaths a -mas b c"));
        assert_eq!(err.exit_status(), Some(1));
        assert_eq!(
            err.to_string(),
            "fslmaths a -mas b c exited with status 1: Image Exception"
        );
    }

    #[test]
    fn test_cycle_message() {
        let err = GraphError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "cycle between stages: a -> b -> a");
    }
}
