//! Input layout for LOCATE
//!
//! LOCATE reads flat directories of `{sub_ses}_<feature>.nii.gz` files. Sessions
//! with a manual label go to `training_subjects/`, the rest to
//! `test_subjects/`. Every entry is a relative symlink into the derivatives
//! tree, so the farm can be moved together with it.

use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wmh_common::config::RunConfig;
use wmh_common::discovery::SubjectSession;
use wmh_common::naming::Stage;
use wmh_common::resolver::{OnEmpty, PathResolver};
use wmh_common::version::export_version;
use wmh_common::{Bindings, PathTemplate, Result};

pub const TRAINING_SUBJECTS: &str = "training_subjects";
pub const TEST_SUBJECTS: &str = "test_subjects";

const MANUAL_LABEL: &str = "{sub_ses}_manualmask.nii.gz";

/// Derivatives linked for every session: (source stage, source pattern, link name)
const FEATURES: [(Stage, &str, &str); 6] = [
    (
        Stage::Bianca,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_*_FLAIR_LPM.nii.gz",
        "{sub_ses}_BIANCA_LPM.nii.gz",
    ),
    (
        Stage::PrepareFlair,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_*_FLAIR_biascorr.nii.gz",
        "{sub_ses}_feature_FLAIR.nii.gz",
    ),
    (
        Stage::PrepareFlair,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_*_desc-t1w_brain.nii.gz",
        "{sub_ses}_feature_t1w.nii.gz",
    ),
    (
        Stage::PrepareFlair,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_*_desc-distanceVent.nii.gz",
        "{sub_ses}_ventdistmap.nii.gz",
    ),
    (
        Stage::PrepareFlair,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_*_desc-brainmask.nii.gz",
        "{sub_ses}_brainmask.nii.gz",
    ),
    (
        Stage::PrepareFlair,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_*_desc-wmmask.nii.gz",
        "{sub_ses}_biancamask.nii.gz",
    ),
];

/// Which sessions ended up where
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocateLayout {
    pub training: Vec<SubjectSession>,
    pub test: Vec<SubjectSession>,
    pub links: Vec<PathBuf>,
}

/// Build the LOCATE symlink farm for `acq`
///
/// Re-running replaces existing links, and a session that changed sides since
/// the last run loses its entries on the old side. Any missing or ambiguous
/// feature fails the whole call; LOCATE cannot use a partial session.
pub fn prepare_locate(config: &RunConfig, acq: &str, pairs: &[SubjectSession], version: &str) -> Result<LocateLayout> {
    let out_dir = config.stage_dir(Stage::Locate, Some(acq));
    let training_dir = out_dir.join(TRAINING_SUBJECTS);
    let test_dir = out_dir.join(TEST_SUBJECTS);
    std::fs::create_dir_all(&training_dir)?;
    std::fs::create_dir_all(&test_dir)?;
    export_version(&out_dir, version)?;

    let labels = PathResolver::new(config.training_data_dir()?);
    let manual_label = PathTemplate::parse(MANUAL_LABEL)?;
    let features = FEATURES
        .iter()
        .map(|(stage, source, link)| {
            Ok((
                PathResolver::new(config.stage_dir(*stage, Some(acq))),
                PathTemplate::parse(source)?,
                PathTemplate::parse(link)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut layout = LocateLayout::default();
    for (subject, session) in pairs {
        let bindings = Bindings::new(subject, session).with_acq(acq);

        let label = replace_link(
            &labels,
            &config.masterfile.manual_mask,
            &training_dir,
            &manual_label,
            &bindings,
            OnEmpty::Allow,
        )?;
        let (dest_dir, stale_dir) = match label {
            Some(link) => {
                layout.training.push((subject.clone(), session.clone()));
                layout.links.push(link);
                (&training_dir, &test_dir)
            }
            None => {
                layout.test.push((subject.clone(), session.clone()));
                (&test_dir, &training_dir)
            }
        };

        remove_link(stale_dir, &manual_label, &bindings)?;
        for (_, _, link) in &features {
            remove_link(stale_dir, link, &bindings)?;
        }
        for (resolver, source, link) in &features {
            if let Some(link) = replace_link(resolver, source, dest_dir, link, &bindings, OnEmpty::Raise)? {
                layout.links.push(link);
            }
        }
        debug!(subject = %subject, session = %session, dir = %dest_dir.display(), "Linked LOCATE inputs");
    }

    info!(
        acq = %acq,
        training = layout.training.len(),
        test = layout.test.len(),
        out_dir = %out_dir.display(),
        "Prepared LOCATE inputs"
    );
    Ok(layout)
}

/// Remove `name` from `dir` if an earlier run left it there
fn remove_link(dir: &Path, name: &PathTemplate, bindings: &Bindings<'_>) -> Result<()> {
    let path = dir.join(name.render(bindings)?);
    if path.symlink_metadata().is_ok() {
        std::fs::remove_file(&path)?;
        debug!(path = %path.display(), "Removed stale LOCATE link");
    }
    Ok(())
}

/// Link through the resolver, removing a link left by an earlier run first
fn replace_link(
    resolver: &PathResolver,
    source: &PathTemplate,
    dest_dir: &Path,
    name: &PathTemplate,
    bindings: &Bindings<'_>,
    on_empty: OnEmpty,
) -> Result<Option<PathBuf>> {
    remove_link(dest_dir, name, bindings)?;
    resolver.link(source, dest_dir, name, bindings, on_empty)
}
