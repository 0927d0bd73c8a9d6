//! Run configuration
//!
//! One immutable [`RunConfig`] is built per invocation and passed by reference
//! to every component. Sources, highest priority first:
//! 1. Command-line flags ([`ConfigOverrides`])
//! 2. Environment (`WMH_CONFIG`, `WMH_N_CPU`, `FSLDIR`)
//! 3. TOML config file
//! 4. Compiled defaults
//!
//! A missing config file is not an error: defaults are used and a warning is
//! logged. Template strings are parsed while the TOML is deserialized, so an
//! unknown placeholder aborts loading before any work starts.

use crate::naming::Stage;
use crate::template::PathTemplate;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "WMH_CONFIG";
pub const N_CPU_ENV: &str = "WMH_N_CPU";
pub const FSL_DIR_ENV: &str = "FSLDIR";

/// Configuration file contents; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub bids_dir: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub crash_dir: Option<PathBuf>,
    #[serde(default)]
    pub n_cpu: Option<usize>,
    #[serde(default)]
    pub fsl_dir: Option<PathBuf>,
    #[serde(default)]
    pub acquisitions: Option<Vec<String>>,
    /// Restrict discovery to these subjects (empty: all)
    #[serde(default)]
    pub subjects: Vec<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub t1w: T1wConfig,
    #[serde(default)]
    pub masterfile: MasterfileToml,
    #[serde(default)]
    pub bianca: BiancaConfig,
    #[serde(default)]
    pub threshold: ThresholdConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Longitudinal template preparation inputs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateConfig {
    /// Root of the sMRIPrep derivatives holding per-subject templates
    #[serde(default)]
    pub smriprep_dir: Option<PathBuf>,
}

/// Brain extraction template used by T1w preparation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct T1wConfig {
    #[serde(default)]
    pub brain_template: Option<PathBuf>,
    #[serde(default)]
    pub brain_probability_mask: Option<PathBuf>,
}

/// Companion-file templates for the masterfile build
///
/// `flair`, `t1w` and `mat` are relative to the prepared-FLAIR directory,
/// `manual_mask` to the training data directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MasterfileToml {
    #[serde(default)]
    pub flair: Option<PathTemplate>,
    #[serde(default)]
    pub t1w: Option<PathTemplate>,
    #[serde(default)]
    pub manual_mask: Option<PathTemplate>,
    #[serde(default)]
    pub mat: Option<PathTemplate>,
}

/// Resolved masterfile templates
#[derive(Debug, Clone)]
pub struct MasterfileTemplates {
    pub flair: PathTemplate,
    pub t1w: PathTemplate,
    pub manual_mask: PathTemplate,
    pub mat: PathTemplate,
}

impl MasterfileTemplates {
    fn resolve(toml: MasterfileToml) -> Result<Self> {
        let or_default = |t: Option<PathTemplate>, raw: &str| match t {
            Some(t) => Ok(t),
            None => PathTemplate::parse(raw),
        };
        Ok(Self {
            flair: or_default(toml.flair, DEFAULT_FLAIR_TEMPLATE)?,
            t1w: or_default(toml.t1w, DEFAULT_T1W_TEMPLATE)?,
            manual_mask: or_default(toml.manual_mask, DEFAULT_MANUAL_MASK_TEMPLATE)?,
            mat: or_default(toml.mat, DEFAULT_MAT_TEMPLATE)?,
        })
    }
}

/// Classifier settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BiancaConfig {
    /// Directory holding the manual gold-standard masks
    #[serde(default)]
    pub training_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub save_classifier: bool,
    /// Pretrained classifier; training is skipped when set
    #[serde(default)]
    pub classifier: Option<PathBuf>,
    /// Explicit zero-based training rows
    #[serde(default)]
    pub training: Option<Vec<usize>>,
    /// Explicit zero-based query rows
    #[serde(default)]
    pub query: Option<Vec<usize>>,
}

/// Thresholding settings
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<f64>,
    /// Manual masks for overlap measures; defaults to the training data directory
    #[serde(default)]
    pub mask_dir: Option<PathBuf>,
    #[serde(default = "default_overlap")]
    pub overlap: bool,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            mask_dir: None,
            overlap: default_overlap(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_thresholds() -> Vec<f64> {
    vec![0.99]
}

fn default_overlap() -> bool {
    true
}

fn default_acquisitions() -> Vec<String> {
    vec!["2D".to_string(), "3D".to_string()]
}

pub const DEFAULT_FLAIR_TEMPLATE: &str =
    "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_*_FLAIR_biascorr.nii.gz";
pub const DEFAULT_T1W_TEMPLATE: &str =
    "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_space-flair{acq}_desc-t1w_brain.nii.gz";
pub const DEFAULT_MANUAL_MASK_TEMPLATE: &str =
    "sub-{subject}/ses-{session}/sub-{subject}_ses-{session}_acq-{acq}_run-1_FLAIR_mask_goldstandard_new.nii.gz";
pub const DEFAULT_MAT_TEMPLATE: &str =
    "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_desc-12dof_from-flair{acq}_to-MNI.mat";

/// Command-line overrides (highest priority)
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub base_dir: Option<PathBuf>,
    pub bids_dir: Option<PathBuf>,
    pub n_cpu: Option<usize>,
    pub log_level: Option<String>,
}

/// Immutable configuration for one pipeline invocation
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_dir: PathBuf,
    pub bids_dir: PathBuf,
    pub work_dir: PathBuf,
    pub crash_dir: PathBuf,
    pub n_cpu: usize,
    pub fsl_dir: Option<PathBuf>,
    pub acquisitions: Vec<String>,
    pub subjects: Vec<String>,
    pub logging: LoggingConfig,
    pub template: TemplateConfig,
    pub t1w: T1wConfig,
    pub masterfile: MasterfileTemplates,
    pub bianca: BiancaConfig,
    pub threshold: ThresholdConfig,
}

impl RunConfig {
    /// Load configuration following the priority order above
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let toml = match locate_config_file(overrides.config_file.as_deref())? {
            Some(path) => {
                info!("Loading config from {}", path.display());
                load_toml(&path)?
            }
            None => {
                warn!("No config file found, using compiled defaults");
                TomlConfig::default()
            }
        };
        Self::from_parts(toml, overrides)
    }

    /// Merge a parsed file with overrides and environment
    pub fn from_parts(toml: TomlConfig, overrides: &ConfigOverrides) -> Result<Self> {
        let base_dir = overrides
            .base_dir
            .clone()
            .or(toml.base_dir)
            .ok_or_else(|| Error::Config("base_dir is not configured".to_string()))?;
        let bids_dir = overrides
            .bids_dir
            .clone()
            .or(toml.bids_dir)
            .ok_or_else(|| Error::Config("bids_dir is not configured".to_string()))?;

        let env_n_cpu = match std::env::var(N_CPU_ENV) {
            Ok(v) => Some(v.parse::<usize>().map_err(|e| {
                Error::Config(format!("{N_CPU_ENV}='{v}' is not a CPU count: {e}"))
            })?),
            Err(_) => None,
        };
        let n_cpu = overrides
            .n_cpu
            .or(env_n_cpu)
            .or(toml.n_cpu)
            .unwrap_or_else(num_cpus::get);
        if n_cpu == 0 {
            return Err(Error::Config("n_cpu must be at least 1".to_string()));
        }

        let fsl_dir = std::env::var_os(FSL_DIR_ENV)
            .map(PathBuf::from)
            .or(toml.fsl_dir);

        let mut logging = toml.logging;
        if let Some(level) = &overrides.log_level {
            logging.level = level.clone();
        }

        let work_dir = toml.work_dir.unwrap_or_else(|| base_dir.join("_wd"));
        let crash_dir = toml.crash_dir.unwrap_or_else(|| base_dir.join("_crash"));

        Ok(Self {
            base_dir,
            bids_dir,
            work_dir,
            crash_dir,
            n_cpu,
            fsl_dir,
            acquisitions: toml.acquisitions.unwrap_or_else(default_acquisitions),
            subjects: toml.subjects,
            logging,
            template: toml.template,
            t1w: toml.t1w,
            masterfile: MasterfileTemplates::resolve(toml.masterfile)?,
            bianca: toml.bianca,
            threshold: toml.threshold,
        })
    }

    /// Output directory of a stage: `<base>[/<acq>]/<stage>`
    pub fn stage_dir(&self, stage: Stage, acq: Option<&str>) -> PathBuf {
        self.derivatives_root(stage, acq).join(stage.dir_name())
    }

    /// Directory the stage directory lives in; per-acquisition stages nest under the acquisition
    pub fn derivatives_root(&self, stage: Stage, acq: Option<&str>) -> PathBuf {
        match (stage.per_acquisition(), acq) {
            (true, Some(acq)) => self.base_dir.join(acq),
            _ => self.base_dir.clone(),
        }
    }

    /// Working directory of one workflow run
    pub fn workflow_work_dir(&self, workflow: &str, acq: Option<&str>) -> PathBuf {
        match acq {
            Some(acq) => self.work_dir.join(acq).join(workflow),
            None => self.work_dir.join(workflow),
        }
    }

    /// Crash dump directory of one workflow run
    pub fn workflow_crash_dir(&self, workflow: &str, acq: Option<&str>) -> PathBuf {
        match acq {
            Some(acq) => self.crash_dir.join(acq).join(workflow),
            None => self.crash_dir.join(workflow),
        }
    }

    /// A file from `$FSLDIR/data/standard`
    pub fn fsl_standard(&self, name: &str) -> Result<PathBuf> {
        let fsl_dir = self.fsl_dir.as_ref().ok_or_else(|| {
            Error::Config(format!("{FSL_DIR_ENV} is not set and fsl_dir is not configured"))
        })?;
        Ok(fsl_dir.join("data").join("standard").join(name))
    }

    /// Training data directory, required by masterfile and overlap stages
    pub fn training_data_dir(&self) -> Result<&Path> {
        self.bianca
            .training_data_dir
            .as_deref()
            .ok_or_else(|| Error::Config("bianca.training_data_dir is not configured".to_string()))
    }
}

/// Config file location: explicit path, then `$WMH_CONFIG`, then the user config dir
pub fn locate_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(Error::Config(format!(
                "{CONFIG_ENV} points to a missing file: {}",
                path.display()
            )));
        }
        return Ok(Some(path));
    }

    Ok(default_config_path().filter(|p| p.exists()))
}

/// `<user config dir>/wmh-pipeline/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wmh-pipeline").join("config.toml"))
}

/// Parse a TOML config file
pub fn load_toml(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reproduce_masterfile_names() {
        let t = MasterfileTemplates::resolve(MasterfileToml::default()).unwrap();
        assert!(t.flair.as_str().ends_with("_acq-{acq}_*_FLAIR_biascorr.nii.gz"));
        assert!(t.mat.as_str().ends_with("_desc-12dof_from-flair{acq}_to-MNI.mat"));
    }

    #[test]
    fn test_stage_dir_nesting() {
        let toml: TomlConfig = toml::from_str(
            r#"
            base_dir = "/data/wmh"
            bids_dir = "/data/bids"
            n_cpu = 2
            "#,
        )
        .unwrap();
        let cfg = RunConfig::from_parts(toml, &ConfigOverrides::default()).unwrap();
        assert_eq!(
            cfg.stage_dir(Stage::PrepareFlair, Some("2D")),
            PathBuf::from("/data/wmh/2D/prepare_flair")
        );
        assert_eq!(
            cfg.stage_dir(Stage::PrepareT1w, Some("2D")),
            PathBuf::from("/data/wmh/prepare_t1w")
        );
        assert_eq!(cfg.work_dir, PathBuf::from("/data/wmh/_wd"));
        assert_eq!(cfg.crash_dir, PathBuf::from("/data/wmh/_crash"));
    }

    #[test]
    fn test_unknown_placeholder_aborts_loading() {
        let parsed = toml::from_str::<TomlConfig>(
            r#"
            [masterfile]
            flair = "sub-{subject}/ses-{sesion}/anat/*_FLAIR.nii.gz"
            "#,
        );
        let err = parsed.unwrap_err().to_string();
        assert!(err.contains("sesion"), "{err}");
    }

    #[test]
    fn test_missing_base_dir_is_config_error() {
        let err = RunConfig::from_parts(TomlConfig::default(), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
