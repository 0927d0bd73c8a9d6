//! Masterfile builder
//!
//! Scans the prepared-FLAIR tree, pairs every FLAIR with its companion files
//! and writes the three masterfile views. The build is all-or-nothing: every
//! row is validated before the first byte is written, and the views are moved
//! into place only after all three temp files exist.
//!
//! The three renames are not one atomic step. The header view is the one read
//! back by later workflows, so the old copy is removed before any rename and
//! the new one is moved in last: a failure part way leaves no readable
//! manifest rather than a mix of old and new views. The version sidecar is
//! written by the caller after a successful build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wmh_common::config::MasterfileTemplates;
use wmh_common::manifest::{
    Manifest, ManifestRow, MASTERFILE, MASTERFILE_TRAINING, MASTERFILE_WITH_HEADER,
};
use wmh_common::naming::parse_subject_session;
use wmh_common::resolver::glob_sorted;
use wmh_common::{Bindings, Error, Result};

/// Build the manifest for one acquisition and persist its three views into `out_dir`
pub fn build(
    prep_dir: &Path,
    training_dir: &Path,
    out_dir: &Path,
    templates: &MasterfileTemplates,
    acq: &str,
) -> Result<Manifest> {
    let manifest = scan(prep_dir, training_dir, templates, acq)?;
    write_views(&manifest, out_dir)?;
    info!(
        rows = manifest.len(),
        labeled = manifest.labeled_indices().count(),
        out_dir = %out_dir.display(),
        "Wrote masterfile"
    );
    Ok(manifest)
}

/// Enumerate and validate rows without writing anything
pub fn scan(
    prep_dir: &Path,
    training_dir: &Path,
    templates: &MasterfileTemplates,
    acq: &str,
) -> Result<Manifest> {
    let pattern = prep_dir.join(templates.flair.render(&Bindings::wildcard().with_acq(acq))?);
    let pattern = pattern.to_string_lossy().into_owned();

    // One FLAIR per (subject, session); duplicate runs are never silently merged
    let mut by_case: BTreeMap<(String, String), Vec<PathBuf>> = BTreeMap::new();
    let mut order = Vec::new();
    for flair in glob_sorted(&pattern)? {
        let relative = flair.strip_prefix(prep_dir).unwrap_or(&flair);
        let case = parse_subject_session(relative)?;
        let entry = by_case.entry(case.clone()).or_default();
        if entry.is_empty() {
            order.push(case);
        }
        entry.push(flair);
    }

    let mut rows = Vec::with_capacity(order.len());
    for (subject, session) in order {
        let mut flairs = by_case
            .remove(&(subject.clone(), session.clone()))
            .unwrap_or_default();
        if flairs.len() > 1 {
            return Err(Error::AmbiguousMatch {
                pattern: pattern.clone(),
                matches: flairs,
            });
        }
        let Some(flair) = flairs.pop() else {
            continue;
        };

        let bindings = Bindings::new(&subject, &session).with_acq(acq);
        let t1w = prep_dir.join(templates.t1w.render(&bindings)?);
        let mat = prep_dir.join(templates.mat.render(&bindings)?);
        let mask = training_dir.join(templates.manual_mask.render(&bindings)?);
        let manual_mask = mask.exists().then_some(mask);

        let row = ManifestRow {
            flair,
            t1w,
            manual_mask,
            mat,
            subject,
            session,
        };
        validate_row(&row)?;
        debug!(
            subject = %row.subject,
            session = %row.session,
            labeled = row.is_labeled(),
            "Masterfile row"
        );
        rows.push(row);
    }

    Ok(Manifest::new(rows))
}

fn validate_row(row: &ManifestRow) -> Result<()> {
    let required = [Some(&row.flair), Some(&row.t1w), Some(&row.mat), row.manual_mask.as_ref()];
    for path in required.into_iter().flatten() {
        if !path.exists() {
            return Err(Error::MissingFile(path.clone()));
        }
        // The classifier splits rows on whitespace
        if path.to_string_lossy().chars().any(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "masterfile paths must not contain whitespace: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn write_views(manifest: &Manifest, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)?;

    // Header view last
    let views = [
        (MASTERFILE, manifest.render_plain()),
        (MASTERFILE_TRAINING, manifest.render_training()),
        (MASTERFILE_WITH_HEADER, manifest.render_with_header()),
    ];

    let mut staged = Vec::with_capacity(views.len());
    for (name, content) in &views {
        let tmp = out_dir.join(format!(".{name}.tmp"));
        if let Err(e) = std::fs::write(&tmp, content) {
            discard(&staged);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        staged.push((tmp, out_dir.join(name)));
    }

    match std::fs::remove_file(out_dir.join(MASTERFILE_WITH_HEADER)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            discard(&staged);
            return Err(e.into());
        }
    }
    for (i, (tmp, dest)) in staged.iter().enumerate() {
        if let Err(e) = std::fs::rename(tmp, dest) {
            discard(&staged[i..]);
            return Err(e.into());
        }
    }
    Ok(())
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        let _ = std::fs::remove_file(tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_in_path_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let spaced = dir.path().join("with space.nii.gz");
        std::fs::write(&spaced, b"").unwrap();
        let row = ManifestRow {
            flair: spaced.clone(),
            t1w: spaced.clone(),
            manual_mask: None,
            mat: spaced,
            subject: "A".to_string(),
            session: "s1".to_string(),
        };
        assert!(matches!(validate_row(&row), Err(Error::InvalidInput(_))));
    }
}
