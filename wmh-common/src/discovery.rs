//! Subject/session discovery in a BIDS tree

use crate::naming::{parse_subject_session, BidsKey};
use crate::resolver::glob_sorted;
use crate::Result;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// A (subject, session) pair
pub type SubjectSession = (String, String);

/// All (subject, session) pairs with a FLAIR image of acquisition `acq`
///
/// `acq = "*"` matches any acquisition. Pairs are de-duplicated and sorted.
/// Labels must be valid BIDS labels; anything else is rejected rather than
/// renamed.
pub fn discover_subject_sessions(bids_dir: &Path, acq: &str) -> Result<Vec<SubjectSession>> {
    let pattern = bids_dir.join(format!(
        "sub-*/ses-*/anat/sub-*_ses-*_acq-{acq}_*_FLAIR.nii.gz"
    ));
    let mut pairs = BTreeSet::new();
    for path in glob_sorted(&pattern.to_string_lossy())? {
        let relative = path.strip_prefix(bids_dir).unwrap_or(&path);
        let (subject, session) = parse_subject_session(relative)?;
        BidsKey::new(&subject, &session)?;
        pairs.insert((subject, session));
    }
    info!(acq = %acq, count = pairs.len(), "Discovered subject/sessions");
    Ok(pairs.into_iter().collect())
}

/// Unique subjects of a pair list, sorted
pub fn subjects_of(pairs: &[SubjectSession]) -> Vec<String> {
    pairs
        .iter()
        .map(|(s, _)| s.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Keep only pairs whose subject is listed; an empty list keeps everything
pub fn restrict_subjects(pairs: Vec<SubjectSession>, subjects: &[String]) -> Vec<SubjectSession> {
    if subjects.is_empty() {
        return pairs;
    }
    pairs
        .into_iter()
        .filter(|(s, _)| subjects.contains(s))
        .collect()
}
