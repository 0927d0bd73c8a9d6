//! Test Helper Utilities
//!
//! Shared fixtures for wmh-pipeline integration tests: a fake command runner
//! that pretends to be FSL/ANTs/BIANCA and a prepared derivatives tree.

#![allow(dead_code)]

pub mod log_capture;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wmh_common::config::{BiancaConfig, ConfigOverrides, RunConfig, TomlConfig};
use wmh_pipeline::tools::{CommandRunner, ToolInvocation, ToolOutput};
use wmh_pipeline::workflows::WorkflowContext;

type Predicate = Box<dyn Fn(&ToolInvocation) -> bool + Send + Sync>;

/// Records invocations and creates the files a real tool would write
///
/// Every argument naming a missing path inside the working directory is
/// created, as are the fixed-name outputs of `bianca` and
/// `bianca_overlap_measures`.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    fail_when: Option<Predicate>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runner whose matching invocations exit with status 1
    pub fn failing(pred: impl Fn(&ToolInvocation) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::default(),
            fail_when: Some(Box::new(pred)),
        })
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<ToolInvocation> {
        self.calls().into_iter().filter(|c| c.program == program).collect()
    }

    fn outputs_of(invocation: &ToolInvocation) -> Vec<PathBuf> {
        let cwd = &invocation.cwd;
        let mut files: Vec<PathBuf> = invocation
            .args
            .iter()
            .map(|a| match a.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => value,
                _ => a.as_str(),
            })
            .map(PathBuf::from)
            .filter(|p| p.is_absolute() && p.starts_with(cwd))
            .collect();

        match invocation.program.as_str() {
            "bianca" => {
                if let Some(i) = invocation.args.iter().position(|a| a == "-o") {
                    if let Some(base) = invocation.args.get(i + 1) {
                        files.push(PathBuf::from(format!("{base}.nii.gz")));
                    }
                }
                if let Some(clf) = invocation
                    .args
                    .iter()
                    .find_map(|a| a.strip_prefix("--saveclassifierdata="))
                {
                    files.push(PathBuf::from(format!("{clf}_labels")));
                }
            }
            "bianca_overlap_measures" => {
                if let Some(threshold) = invocation.args.get(1) {
                    files.push(cwd.join(format!("Overlap_and_Volumes_lpm_{threshold}.txt")));
                }
            }
            _ => {}
        }
        files
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        if self.fail_when.as_ref().is_some_and(|f| f(invocation)) {
            return Ok(ToolOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("{}: simulated failure", invocation.program),
            });
        }

        for file in Self::outputs_of(invocation) {
            if file.symlink_metadata().is_ok() {
                continue;
            }
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&file, invocation.command_line())?;
        }

        let stdout = match invocation.program.as_str() {
            "fslstats" => "0.000000 812.500000 \n".to_string(),
            "bianca_cluster_stats" => "Number of clusters: 3\nTotal volume: 1234\n".to_string(),
            _ => String::new(),
        };
        Ok(ToolOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

pub fn touch(root: &Path, rel: &str) -> PathBuf {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(&p, b"").unwrap();
    p
}

/// Temporary base/BIDS/training directories with a resolved run config
pub struct TestTree {
    pub dir: TempDir,
    pub config: RunConfig,
}

impl TestTree {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(edit: impl FnOnce(&mut TomlConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut toml = TomlConfig {
            bianca: BiancaConfig {
                training_data_dir: Some(dir.path().join("training")),
                ..Default::default()
            },
            ..Default::default()
        };
        edit(&mut toml);
        let config = RunConfig::from_parts(
            toml,
            &ConfigOverrides {
                base_dir: Some(dir.path().join("out")),
                bids_dir: Some(dir.path().join("bids")),
                n_cpu: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn training_dir(&self) -> PathBuf {
        self.dir.path().join("training")
    }

    pub fn ctx(&self, runner: Arc<FakeRunner>) -> WorkflowContext<'_> {
        WorkflowContext::new(&self.config, runner, CancellationToken::new(), "v-test".to_string())
    }

    /// Prepared-FLAIR outputs of one session as the FLAIR workflow leaves them
    pub fn prepared_flair(&self, acq: &str, subject: &str, session: &str) {
        let dir = self.path().join(format!("out/{acq}/prepare_flair/sub-{subject}/ses-{session}/anat"));
        let prefix = format!("sub-{subject}_ses-{session}");
        for name in [
            format!("{prefix}_acq-{acq}_run-1_FLAIR_biascorr.nii.gz"),
            format!("{prefix}_space-flair{acq}_desc-t1w_brain.nii.gz"),
            format!("{prefix}_space-flair{acq}_desc-brainmask.nii.gz"),
            format!("{prefix}_space-flair{acq}_desc-wmmask.nii.gz"),
            format!("{prefix}_space-flair{acq}_desc-distanceVent.nii.gz"),
            format!("{prefix}_space-flair{acq}_desc-periventmask.nii.gz"),
            format!("{prefix}_space-flair{acq}_desc-deepWMmask.nii.gz"),
            format!("{prefix}_desc-12dof_from-flair{acq}_to-MNI.mat"),
        ] {
            touch(&dir, &name);
        }
    }

    /// Gold-standard mask in the training data directory
    pub fn manual_mask(&self, acq: &str, subject: &str, session: &str) -> PathBuf {
        touch(
            &self.training_dir(),
            &format!(
                "sub-{subject}/ses-{session}/sub-{subject}_ses-{session}_acq-{acq}_run-1_FLAIR_mask_goldstandard_new.nii.gz"
            ),
        )
    }

    /// A lesion probability map as the BIANCA workflow leaves it
    pub fn lesion_map(&self, acq: &str, subject: &str, session: &str) -> PathBuf {
        touch(
            &self.path().join(format!("out/{acq}/bianca")),
            &format!(
                "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_run-1_FLAIR_LPM.nii.gz"
            ),
        )
    }
}

pub fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter().map(|(s, ss)| (s.to_string(), ss.to_string())).collect()
}
