//! Completeness check over a finished stage directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use wmh_common::discovery::SubjectSession;
use wmh_common::resolver::glob_sorted;
use wmh_common::{Error, Result};

/// Per-session file counts of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub counts: BTreeMap<SubjectSession, usize>,
    /// Highest count seen; the expected count for every session
    pub expected: usize,
    /// Sessions below `expected`, with the pattern they were checked against
    pub incomplete: Vec<(SubjectSession, PathBuf)>,
}

impl CheckReport {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// Count files matching `sub-<s>/ses-<ss>/anat/<pattern>` for each pair
pub fn scan_outputs(stage_dir: &Path, pairs: &[SubjectSession], pattern: &str) -> Result<CheckReport> {
    let mut counts = BTreeMap::new();
    let mut globs = BTreeMap::new();
    for (subject, session) in pairs {
        let glob = stage_dir
            .join(format!("sub-{subject}"))
            .join(format!("ses-{session}"))
            .join("anat")
            .join(pattern);
        let found = glob_sorted(&glob.to_string_lossy())?.len();
        counts.insert((subject.clone(), session.clone()), found);
        globs.insert((subject.clone(), session.clone()), glob);
    }

    let expected = counts.values().copied().max().unwrap_or(0);
    let incomplete = counts
        .iter()
        .filter(|&(_, &n)| n < expected)
        .filter_map(|(pair, _)| globs.remove(pair).map(|g| (pair.clone(), g)))
        .collect();
    Ok(CheckReport {
        counts,
        expected,
        incomplete,
    })
}

/// Fail with [`Error::MissingFile`] if any pair has fewer matches than the best-covered one
pub fn check_outputs(stage_dir: &Path, pairs: &[SubjectSession], pattern: &str) -> Result<CheckReport> {
    let report = scan_outputs(stage_dir, pairs, pattern)?;
    for ((subject, session), glob) in &report.incomplete {
        warn!(
            subject = %subject,
            session = %session,
            found = report.counts.get(&(subject.clone(), session.clone())).copied().unwrap_or(0),
            expected = report.expected,
            pattern = %glob.display(),
            "Incomplete outputs"
        );
    }
    match report.incomplete.first() {
        Some((_, glob)) => Err(Error::MissingFile(glob.clone())),
        None => {
            info!(
                stage_dir = %stage_dir.display(),
                sessions = report.counts.len(),
                per_session = report.expected,
                "All outputs present"
            );
            Ok(report)
        }
    }
}
