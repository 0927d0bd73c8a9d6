//! Cohort partitioning into training and query rows
//!
//! Indices are zero-based here. The classifier counts subjects from one, so
//! [`to_ordinals`] is the only place the translation happens.

use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};
use wmh_common::manifest::Manifest;
use wmh_common::{Error, Result};

/// How the classifier for each query row is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierSource {
    /// Trained per query from its effective training set; optionally persisted
    Train { save: bool },
    /// Loaded from disk; training rows are ignored
    Pretrained(PathBuf),
}

/// Partition mode requested by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionMode {
    /// Train on every labeled row, classify every row, each query excluded from its own training set
    FullLoo { save_classifier: bool },
    /// No training; classify with a stored classifier
    FixedClassifier { classifier: PathBuf },
    /// Explicit training and/or query rows; `None` falls back to the full-LOO choice
    Partial {
        training: Option<Vec<usize>>,
        query: Option<Vec<usize>>,
        save_classifier: bool,
    },
}

/// Raw classifier options as they arrive from configuration and CLI
#[derive(Debug, Clone, Default)]
pub struct CohortSelection {
    pub classifier: Option<PathBuf>,
    pub save_classifier: bool,
    pub training: Option<Vec<usize>>,
    pub query: Option<Vec<usize>>,
}

impl CohortSelection {
    /// Pick the partition mode, rejecting "train now" mixed with "load pretrained"
    ///
    /// A pretrained classifier must exist before any branch is planned.
    pub fn resolve(&self) -> Result<(PartitionMode, Option<Vec<usize>>)> {
        if let Some(classifier) = &self.classifier {
            if self.save_classifier {
                return Err(Error::ConflictingClassifierSource(format!(
                    "save_classifier requested together with pretrained classifier {}",
                    classifier.display()
                )));
            }
            if self.training.as_ref().is_some_and(|t| !t.is_empty()) {
                return Err(Error::ConflictingClassifierSource(format!(
                    "training rows given together with pretrained classifier {}",
                    classifier.display()
                )));
            }
            if !classifier.exists() {
                return Err(Error::MissingFile(classifier.clone()));
            }
            return Ok((
                PartitionMode::FixedClassifier {
                    classifier: classifier.clone(),
                },
                self.query.clone(),
            ));
        }

        if self.training.is_none() && self.query.is_none() {
            return Ok((
                PartitionMode::FullLoo {
                    save_classifier: self.save_classifier,
                },
                None,
            ));
        }

        Ok((
            PartitionMode::Partial {
                training: self.training.clone(),
                query: self.query.clone(),
                save_classifier: self.save_classifier,
            },
            None,
        ))
    }
}

/// Training and query row sets plus the classifier source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub training: BTreeSet<usize>,
    pub query: BTreeSet<usize>,
    pub classifier: ClassifierSource,
}

impl Partition {
    /// Training rows used to classify `query`: the base set minus `query` itself
    pub fn effective_training(&self, query: usize) -> BTreeSet<usize> {
        match self.classifier {
            ClassifierSource::Pretrained(_) => BTreeSet::new(),
            ClassifierSource::Train { .. } => {
                self.training.iter().copied().filter(|&t| t != query).collect()
            }
        }
    }
}

/// Compute the partition of a manifest
///
/// `explicit_query` restricts the query rows in fixed-classifier mode.
pub fn partition(
    manifest: &Manifest,
    mode: &PartitionMode,
    explicit_query: Option<&[usize]>,
) -> Result<Partition> {
    let labeled: BTreeSet<usize> = manifest.labeled_indices().collect();
    let all_rows = || (0..manifest.len()).collect::<BTreeSet<_>>();

    let result = match mode {
        PartitionMode::FullLoo { save_classifier } => {
            if labeled.is_empty() {
                return Err(Error::NoTrainingData);
            }
            Partition {
                training: labeled,
                query: all_rows(),
                classifier: ClassifierSource::Train {
                    save: *save_classifier,
                },
            }
        }
        PartitionMode::FixedClassifier { classifier } => {
            let query = match explicit_query {
                Some(q) => checked_rows(manifest, q, "query")?,
                None => all_rows(),
            };
            Partition {
                training: BTreeSet::new(),
                query,
                classifier: ClassifierSource::Pretrained(classifier.clone()),
            }
        }
        PartitionMode::Partial {
            training,
            query,
            save_classifier,
        } => {
            let training = match training {
                Some(t) => {
                    let rows = checked_rows(manifest, t, "training")?;
                    if let Some(unlabeled) = rows.iter().find(|r| !labeled.contains(r)) {
                        return Err(Error::InvalidInput(format!(
                            "training row {unlabeled} has no manual mask"
                        )));
                    }
                    rows
                }
                None => labeled,
            };
            if training.is_empty() {
                return Err(Error::NoTrainingData);
            }
            let query = match query {
                Some(q) => checked_rows(manifest, q, "query")?,
                None => all_rows(),
            };
            Partition {
                training,
                query,
                classifier: ClassifierSource::Train {
                    save: *save_classifier,
                },
            }
        }
    };

    info!(
        training = result.training.len(),
        query = result.query.len(),
        rows = manifest.len(),
        "Partitioned cohort"
    );
    debug!(training = ?result.training, query = ?result.query, "Partition rows");
    Ok(result)
}

fn checked_rows(manifest: &Manifest, rows: &[usize], what: &str) -> Result<BTreeSet<usize>> {
    if let Some(bad) = rows.iter().find(|&&r| r >= manifest.len()) {
        return Err(Error::InvalidInput(format!(
            "{what} row {bad} is out of range for a manifest of {} rows",
            manifest.len()
        )));
    }
    Ok(rows.iter().copied().collect())
}

/// Comma-separated one-based ordinals, as the classifier expects them
pub fn to_ordinals(rows: &BTreeSet<usize>) -> String {
    rows.iter()
        .map(|r| (r + 1).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-separated list of zero-based rows (CLI and config input)
pub fn parse_rows(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<usize>()
                .map_err(|e| Error::InvalidInput(format!("row '{t}' is not an index: {e}")))
        })
        .collect()
}
