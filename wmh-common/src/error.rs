//! Common error types for the WMH pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every pipeline component
///
/// Configuration-level variants (`ConflictingClassifierSource`, `NoTrainingData`,
/// `SchemaMismatch`, `Template`, `Config`) are raised before any external tool runs.
#[derive(Error, Debug)]
pub enum Error {
    /// More than one file matched a lookup that must resolve to a single file
    #[error("Ambiguous match for {pattern}: {} files found ({})", .matches.len(), display_paths(.matches))]
    AmbiguousMatch {
        pattern: String,
        matches: Vec<PathBuf>,
    },

    /// A required file does not exist
    #[error("Missing file: {}", .0.display())]
    MissingFile(PathBuf),

    /// Training data and a pretrained classifier were both requested
    #[error("Conflicting classifier source: {0}")]
    ConflictingClassifierSource(String),

    /// Leave-one-out requested on a manifest without labeled rows
    #[error("No training data: manifest has no rows with a manual mask")]
    NoTrainingData,

    /// A persisted manifest does not carry the expected column set
    #[error("Schema mismatch in {}: expected columns {expected:?}, found {found:?}", .path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// At least one branch of a run failed; per-branch details live in crash dumps
    #[error("{failed} of {total} stage instances failed")]
    BranchExecutionFailure { failed: usize, total: usize },

    /// Malformed path template or unknown placeholder
    #[error("Template error: {0}")]
    Template(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_match_names_every_path() {
        let err = Error::AmbiguousMatch {
            pattern: "sub-A/*_FLAIR.nii.gz".to_string(),
            matches: vec![
                PathBuf::from("sub-A/run-1_FLAIR.nii.gz"),
                PathBuf::from("sub-A/run-2_FLAIR.nii.gz"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 files found"));
        assert!(msg.contains("run-1_FLAIR.nii.gz"));
        assert!(msg.contains("run-2_FLAIR.nii.gz"));
    }
}
