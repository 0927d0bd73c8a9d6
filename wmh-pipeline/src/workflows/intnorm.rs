//! Min-max intensity normalization of the bias-corrected FLAIR within the brain mask

use super::{case_group, grabber, sink, Lookup, WorkflowContext, CASE, IN_PORT, SOURCE_PORT};
use crate::error::{Result, StageError};
use crate::executor::RunSummary;
use crate::graph::{IterationSpace, StageSpec};
use crate::tools::{invoke, DataSink, Outputs, PortValue, StageAction, StageContext, ToolInvocation, ToolStep};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use wmh_common::discovery::SubjectSession;
use wmh_common::naming::{derivatives, Stage};

pub const WORKFLOW: &str = "prepare_flair_intNorm";

const GRAB: &str = "grabber";
const RANGE: &str = "img_range";
const NORMALIZED: &str = "flair_normalized";

/// `min max` as printed by `fslstats -R`
pub fn parse_range(stats: &str) -> std::result::Result<(f64, f64), StageError> {
    let values = stats
        .split_whitespace()
        .map(|t| t.parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StageError::Precondition(format!("cannot parse intensity range '{}': {e}", stats.trim())))?;
    match values.as_slice() {
        [min, max] if max > min => Ok((*min, *max)),
        [min, max] => Err(StageError::Precondition(format!(
            "degenerate intensity range {min}..{max} inside brain mask"
        ))),
        _ => Err(StageError::Precondition(format!(
            "expected 'min max', got '{}'",
            stats.trim()
        ))),
    }
}

/// Subtract the minimum, then divide by the range
pub struct RangeNormalize;

#[async_trait]
impl StageAction for RangeNormalize {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Outputs, StageError> {
        let stats = tokio::fs::read_to_string(ctx.input_path("range")?).await?;
        let (min, max) = parse_range(&stats)?;
        debug!(stage = %ctx.stage, branch = %ctx.key, min, max, "Normalizing intensities");

        let out_file = ctx.work_dir.join("flair_biascorr_intnorm.nii.gz");
        let invocation = ToolInvocation {
            program: "fslmaths".to_string(),
            args: vec![
                ctx.input_path("in_file")?.display().to_string(),
                "-sub".to_string(),
                min.to_string(),
                "-div".to_string(),
                (max - min).to_string(),
                out_file.display().to_string(),
            ],
            cwd: ctx.work_dir.clone(),
        };
        invoke(ctx, &invocation).await?;
        if !out_file.exists() {
            return Err(StageError::MissingOutput {
                command: invocation.command_line(),
                path: out_file,
            });
        }

        let mut outputs = Outputs::new();
        outputs.insert("out_file".to_string(), PortValue::Path(out_file));
        Ok(outputs)
    }

    fn fingerprint(&self) -> String {
        "fslmaths -sub min -div range".to_string()
    }
}

pub fn stages(ctx: &WorkflowContext<'_>, acq: &str) -> Result<Vec<StageSpec>> {
    let config = ctx.config;
    let over = [CASE];
    let prep_dir = config.stage_dir(Stage::PrepareFlair, Some(acq));

    let range = ToolStep::new("fslstats")
        .input("in_file")
        .lit("-k")
        .input("mask_file")
        .lit("-R")
        .stdout_to("range", "range.txt");

    Ok(vec![
        grabber(
            GRAB,
            &over,
            Some(acq),
            vec![
                Lookup::required(
                    "flair",
                    &prep_dir,
                    "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_*_FLAIR_biascorr.nii.gz",
                )?,
                Lookup::required(
                    "brainmask",
                    &prep_dir,
                    "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_space-flair{acq}_desc-brainmask.nii.gz",
                )?,
            ],
        ),
        StageSpec::new(RANGE, Arc::new(range))
            .over(&over)
            .input(GRAB, "flair", "in_file")
            .input(GRAB, "brainmask", "mask_file")
            .outputs(&["range"]),
        StageSpec::new(NORMALIZED, Arc::new(RangeNormalize))
            .over(&over)
            .input(GRAB, "flair", "in_file")
            .input(RANGE, "range", "range")
            .outputs(&["out_file"]),
        sink(
            "ds_flair_biascorr_intnorm",
            DataSink::new(
                Stage::PrepareFlairIntNorm,
                &config.derivatives_root(Stage::PrepareFlairIntNorm, Some(acq)),
                SOURCE_PORT,
                IN_PORT,
                derivatives::flair_biascorr_int_norm(),
            ),
            &over,
            (GRAB, "flair"),
            (NORMALIZED, "out_file"),
        ),
    ])
}

/// Normalize the prepared `acq` FLAIR of every (subject, session) pair
pub async fn run(ctx: &WorkflowContext<'_>, acq: &str, pairs: Vec<SubjectSession>) -> Result<RunSummary> {
    let out_dir = ctx.config.stage_dir(Stage::PrepareFlairIntNorm, Some(acq));
    ctx.export_version(&out_dir)?;
    info!(acq = %acq, sessions = pairs.len(), "Normalizing FLAIR intensities");

    let space = IterationSpace::new(vec![case_group(&pairs)?])?;
    ctx.run_graph(WORKFLOW, Some(acq), stages(ctx, acq)?, space).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("12.000000 845.500000 \n").unwrap(), (12.0, 845.5));
        assert!(matches!(parse_range("3 3"), Err(StageError::Precondition(_))));
        assert!(parse_range("").is_err());
        assert!(parse_range("nan-ish 4").is_err());
    }
}
