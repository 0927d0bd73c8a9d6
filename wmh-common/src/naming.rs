//! Derivatives naming grammar
//!
//! Every stage output lives at
//! `<stage>/sub-<s>/ses-<ss>/anat/sub-<s>_ses-<ss>[_acq-<a>][_run-<r>]_<descriptor><ext>`.
//! Later stages re-discover these files by glob, so the grammar here is the
//! interop contract between stages and must not drift.
//!
//! Entity labels are restricted to ASCII alphanumerics. With `_`, `-` and `/`
//! excluded from labels, distinct keys can never render to the same path.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Processing stage, one output directory each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PrepareTemplate,
    PrepareT1w,
    PrepareFlair,
    PrepareFlairIntNorm,
    Bianca,
    BiancaThreshold,
    Locate,
    PostLocateMasking,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::PrepareTemplate,
        Stage::PrepareT1w,
        Stage::PrepareFlair,
        Stage::PrepareFlairIntNorm,
        Stage::Bianca,
        Stage::BiancaThreshold,
        Stage::Locate,
        Stage::PostLocateMasking,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::PrepareTemplate => "prepare_template",
            Stage::PrepareT1w => "prepare_t1w",
            Stage::PrepareFlair => "prepare_flair",
            Stage::PrepareFlairIntNorm => "prepare_flair_intNorm",
            Stage::Bianca => "bianca",
            Stage::BiancaThreshold => "bianca_threshold",
            Stage::Locate => "locate",
            Stage::PostLocateMasking => "post_locate_masking",
        }
    }

    /// Template and T1w preparation are shared by all FLAIR acquisitions
    pub fn per_acquisition(&self) -> bool {
        !matches!(self, Stage::PrepareTemplate | Stage::PrepareT1w)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

fn validate_label(entity: &str, label: &str) -> Result<()> {
    if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidInput(format!(
            "{entity} label must be non-empty ASCII alphanumeric, got '{label}'"
        )));
    }
    Ok(())
}

/// BIDS entities identifying one case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BidsKey {
    subject: String,
    session: Option<String>,
    acq: Option<String>,
    run: Option<String>,
}

impl BidsKey {
    pub fn new(subject: &str, session: &str) -> Result<Self> {
        validate_label("subject", subject)?;
        validate_label("session", session)?;
        Ok(Self {
            subject: subject.to_string(),
            session: Some(session.to_string()),
            acq: None,
            run: None,
        })
    }

    /// Key for per-subject outputs (longitudinal template), no session level
    pub fn subject_only(subject: &str) -> Result<Self> {
        validate_label("subject", subject)?;
        Ok(Self {
            subject: subject.to_string(),
            session: None,
            acq: None,
            run: None,
        })
    }

    pub fn with_acq(mut self, acq: &str) -> Result<Self> {
        validate_label("acq", acq)?;
        self.acq = Some(acq.to_string());
        Ok(self)
    }

    pub fn with_run(mut self, run: &str) -> Result<Self> {
        validate_label("run", run)?;
        self.run = Some(run.to_string());
        Ok(self)
    }

    /// Build a key from the entities of an existing BIDS file name
    pub fn from_source_file(path: &Path) -> Result<Self> {
        let entities = parse_entities(path);
        let subject = entities.subject.ok_or_else(|| {
            Error::InvalidInput(format!("no sub- entity in {}", path.display()))
        })?;
        let mut key = match entities.session {
            Some(session) => Self::new(&subject, &session)?,
            None => Self::subject_only(&subject)?,
        };
        if let Some(acq) = entities.acq {
            key = key.with_acq(&acq)?;
        }
        if let Some(run) = entities.run {
            key = key.with_run(&run)?;
        }
        Ok(key)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn acq(&self) -> Option<&str> {
        self.acq.as_deref()
    }

    pub fn run(&self) -> Option<&str> {
        self.run.as_deref()
    }

    /// `sub-<s>[/ses-<ss>]/anat`
    pub fn anat_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(format!("sub-{}", self.subject));
        if let Some(session) = &self.session {
            dir.push(format!("ses-{session}"));
        }
        dir.push("anat");
        dir
    }

    /// `sub-<s>[_ses-<ss>][_acq-<a>][_run-<r>]`
    pub fn prefix(&self) -> String {
        let mut prefix = format!("sub-{}", self.subject);
        if let Some(session) = &self.session {
            prefix.push_str(&format!("_ses-{session}"));
        }
        if let Some(acq) = &self.acq {
            prefix.push_str(&format!("_acq-{acq}"));
        }
        if let Some(run) = &self.run {
            prefix.push_str(&format!("_run-{run}"));
        }
        prefix
    }
}

impl fmt::Display for BidsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}

/// File extension of a derivative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extension {
    NiftiGz,
    Mat,
    Txt,
    Json,
    /// Opaque artifacts written without an extension (classifier files)
    Bare,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::NiftiGz => ".nii.gz",
            Extension::Mat => ".mat",
            Extension::Txt => ".txt",
            Extension::Json => ".json",
            Extension::Bare => "",
        }
    }
}

/// Everything in a derivative file name after the entity prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub space: Option<String>,
    pub desc: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub suffix: Option<String>,
    pub extension: Extension,
}

impl Descriptor {
    pub fn suffix(suffix: &str) -> Self {
        Self {
            space: None,
            desc: None,
            from: None,
            to: None,
            suffix: Some(suffix.to_string()),
            extension: Extension::NiftiGz,
        }
    }

    pub fn desc(desc: &str) -> Self {
        Self {
            space: None,
            desc: Some(desc.to_string()),
            from: None,
            to: None,
            suffix: None,
            extension: Extension::NiftiGz,
        }
    }

    /// Transform between two spaces, `.mat` by default
    pub fn transform(from: &str, to: &str) -> Self {
        Self {
            space: None,
            desc: None,
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            suffix: None,
            extension: Extension::Mat,
        }
    }

    pub fn with_space(mut self, space: &str) -> Self {
        self.space = Some(space.to_string());
        self
    }

    pub fn with_desc(mut self, desc: &str) -> Self {
        self.desc = Some(desc.to_string());
        self
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = Some(suffix.to_string());
        self
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = extension;
        self
    }

    /// Entity values must not contain the `-` separator
    ///
    /// `space`, `from` and `to` follow the BIDS label rule. `desc` may also
    /// carry `.` (threshold values) and inner `_` (compound descriptions such
    /// as `t1w_brain`).
    pub fn validate(&self) -> Result<()> {
        for (entity, value) in [("space", &self.space), ("from", &self.from), ("to", &self.to)] {
            if let Some(value) = value {
                validate_label(entity, value)?;
            }
        }
        if let Some(desc) = &self.desc {
            let valid = !desc.is_empty()
                && !desc.starts_with('_')
                && !desc.ends_with('_')
                && desc.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
            if !valid {
                return Err(Error::InvalidInput(format!(
                    "desc value must be ASCII alphanumeric with inner '.' or '_', got '{desc}'"
                )));
            }
        }
        Ok(())
    }

    /// `[space-S][_desc-D][_from-F_to-T][_suffix]<ext>`
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(space) = &self.space {
            parts.push(format!("space-{space}"));
        }
        if let Some(desc) = &self.desc {
            parts.push(format!("desc-{desc}"));
        }
        if let Some(from) = &self.from {
            parts.push(format!("from-{from}"));
        }
        if let Some(to) = &self.to {
            parts.push(format!("to-{to}"));
        }
        if let Some(suffix) = &self.suffix {
            parts.push(suffix.clone());
        }
        format!("{}{}", parts.join("_"), self.extension.as_str())
    }
}

/// File name of a derivative, without directories
pub fn file_name(key: &BidsKey, descriptor: &Descriptor) -> Result<String> {
    descriptor.validate()?;
    Ok(format!("{}_{}", key.prefix(), descriptor.render()))
}

/// Relative output path of a derivative: pure, no I/O
pub fn name_for(key: &BidsKey, stage: Stage, descriptor: &Descriptor) -> Result<PathBuf> {
    Ok(Path::new(stage.dir_name())
        .join(key.anat_dir())
        .join(file_name(key, descriptor)?))
}

/// BIDS entities found in a file name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entities {
    pub subject: Option<String>,
    pub session: Option<String>,
    pub acq: Option<String>,
    pub run: Option<String>,
}

/// Extract sub/ses/acq/run from the `_`-separated tokens of a file name
pub fn parse_entities(path: &Path) -> Entities {
    let mut entities = Entities::default();
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return entities;
    };
    for token in name.split('_') {
        let Some((key, value)) = token.split_once('-') else {
            continue;
        };
        let value = value.split('.').next().unwrap_or(value).to_string();
        let slot = match key {
            "sub" => &mut entities.subject,
            "ses" => &mut entities.session,
            "acq" => &mut entities.acq,
            "run" => &mut entities.run,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    entities
}

/// Subject and session from the `sub-<id>` and `ses-<id>` directories of a relative path
///
/// Only the first directory component carrying each token counts, so a scan
/// root that itself contains `sub-` cannot leak into the identifiers.
pub fn parse_subject_session(relative: &Path) -> Result<(String, String)> {
    let mut subject = None;
    let mut session = None;
    for component in relative.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        let part = part.to_string_lossy();
        if subject.is_none() {
            if let Some(id) = part.strip_prefix("sub-") {
                if !id.contains('_') {
                    subject = Some(id.to_string());
                    continue;
                }
            }
        }
        if session.is_none() {
            if let Some(id) = part.strip_prefix("ses-") {
                if !id.contains('_') {
                    session = Some(id.to_string());
                }
            }
        }
    }
    match (subject, session) {
        (Some(sub), Some(ses)) => Ok((sub, ses)),
        _ => Err(Error::InvalidInput(format!(
            "cannot parse sub-/ses- directories from {}",
            relative.display()
        ))),
    }
}

/// `flair<acq>`: the space name of one FLAIR acquisition
pub fn flair_space(acq: &str) -> String {
    format!("flair{acq}")
}

/// Descriptors of the derivatives each stage produces
pub mod derivatives {
    use super::{flair_space, Descriptor, Extension};

    pub fn preproc_t1w() -> Descriptor {
        Descriptor::desc("preproc").with_suffix("T1w")
    }

    pub fn brain_t1w() -> Descriptor {
        Descriptor::desc("brain").with_suffix("T1w")
    }

    pub fn brain_mask() -> Descriptor {
        Descriptor::desc("brain").with_suffix("mask")
    }

    pub fn dseg() -> Descriptor {
        Descriptor::suffix("dseg")
    }

    pub fn bianca_wmmask() -> Descriptor {
        Descriptor::desc("bianca").with_suffix("wmmask")
    }

    pub fn bianca_ventmask() -> Descriptor {
        Descriptor::desc("bianca").with_suffix("ventmask")
    }

    pub fn bianca_ventdistmap() -> Descriptor {
        Descriptor::desc("bianca").with_suffix("ventdistmap")
    }

    pub fn periventmask() -> Descriptor {
        Descriptor::desc("periventmask")
    }

    pub fn deep_wm_mask() -> Descriptor {
        Descriptor::desc("deepWMmask")
    }

    /// `space-MNI_desc-warped2mm_T1w`
    pub fn mni_warped_t1w() -> Descriptor {
        Descriptor::desc("warped2mm").with_space("MNI").with_suffix("T1w")
    }

    /// `from-<from>_to-MNI_xfm.mat`
    pub fn to_mni_xfm(from: &str) -> Descriptor {
        Descriptor::transform(from, "MNI").with_suffix("xfm")
    }

    /// `from-<from>_to-MNI_warpfield.nii.gz`
    pub fn to_mni_warpfield(from: &str) -> Descriptor {
        Descriptor::transform(from, "MNI")
            .with_suffix("warpfield")
            .with_extension(Extension::NiftiGz)
    }

    pub fn flair_biascorr() -> Descriptor {
        Descriptor::suffix("FLAIR_biascorr")
    }

    pub fn flair_biascorr_int_norm() -> Descriptor {
        Descriptor::suffix("FLAIR_biascorrIntNorm")
    }

    /// Derivative resampled into the space of one FLAIR acquisition
    pub fn in_flair_space(acq: &str, desc: &str) -> Descriptor {
        Descriptor::desc(desc).with_space(&flair_space(acq))
    }

    pub fn t1w_to_flair(acq: &str) -> Descriptor {
        Descriptor::transform("t1w", &flair_space(acq))
    }

    /// `desc-12dof_from-flair<acq>_to-MNI.mat`
    pub fn flair_to_mni(acq: &str) -> Descriptor {
        Descriptor::transform(&flair_space(acq), "MNI").with_desc("12dof")
    }

    pub fn flair_lpm() -> Descriptor {
        Descriptor::suffix("FLAIR_LPM")
    }

    pub fn flair_classifier() -> Descriptor {
        Descriptor::suffix("FLAIR_classifier").with_extension(Extension::Bare)
    }

    pub fn flair_classifier_labels() -> Descriptor {
        Descriptor::suffix("FLAIR_classifier_labels").with_extension(Extension::Bare)
    }

    pub fn bianca_masked_lpm() -> Descriptor {
        Descriptor::desc("biancamasked").with_suffix("FLAIR_LPM")
    }

    pub fn threshold_desc(threshold: &str) -> String {
        format!("thresh{threshold}")
    }

    pub fn thresholded_lpm(threshold: &str) -> Descriptor {
        Descriptor::desc(&threshold_desc(threshold)).with_suffix("biancaLPMmaskedThrBin")
    }

    pub fn cluster_stats(threshold: &str, region: &str) -> Descriptor {
        Descriptor::desc(&threshold_desc(threshold))
            .with_suffix(&format!("ClusterStats{region}"))
            .with_extension(Extension::Txt)
    }

    pub fn overlap(threshold: &str) -> Descriptor {
        Descriptor::desc(&threshold_desc(threshold))
            .with_suffix("overlap")
            .with_extension(Extension::Txt)
    }

    pub fn locate_masked_lesion_map() -> Descriptor {
        Descriptor::desc("biancaMasked").with_suffix("locateBinaryLesionMap")
    }
}
