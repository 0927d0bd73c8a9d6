//! Masks LOCATE's binary lesion maps with the BIANCA white-matter mask

use super::{case_group, grabber, sink, source_file, Lookup, WorkflowContext, CASE, IN_PORT, SOURCE_PORT};
use crate::error::Result;
use crate::executor::RunSummary;
use crate::graph::{IterationSpace, StageSpec};
use crate::tools::{DataSink, ToolStep};
use std::sync::Arc;
use tracing::info;
use wmh_common::discovery::SubjectSession;
use wmh_common::naming::{derivatives, Stage};

pub const WORKFLOW: &str = "post_locate_masking";

const GRAB: &str = "grabber";
const SOURCE: &str = "generic_bids_file";
const MASKED: &str = "locate_output_masked";

pub fn stages(ctx: &WorkflowContext<'_>, acq: &str) -> Result<Vec<StageSpec>> {
    let config = ctx.config;
    let over = [CASE];
    let locate_dir = config.stage_dir(Stage::Locate, Some(acq));

    Ok(vec![
        grabber(
            GRAB,
            &over,
            Some(acq),
            vec![
                Lookup::required("bianca_mask", &locate_dir, "*/{sub_ses}_biancamask.nii.gz")?,
                Lookup::required(
                    "locate_mask",
                    &locate_dir,
                    "*/*_results_directory/{sub_ses}_BIANCA_LOCATE_binarylesionmap.nii.gz",
                )?,
            ],
        ),
        source_file(
            SOURCE,
            &over,
            &config.bids_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_FLAIR.nii.gz",
        ),
        StageSpec::new(
            MASKED,
            Arc::new(
                ToolStep::new("fslmaths")
                    .input("in_file")
                    .lit("-mas")
                    .input("mask_file")
                    .output("out_file", "locate_masked.nii.gz"),
            ),
        )
        .over(&over)
        .input(GRAB, "locate_mask", "in_file")
        .input(GRAB, "bianca_mask", "mask_file")
        .outputs(&["out_file"]),
        sink(
            "ds",
            DataSink::new(
                Stage::PostLocateMasking,
                &config.derivatives_root(Stage::PostLocateMasking, Some(acq)),
                SOURCE_PORT,
                IN_PORT,
                derivatives::locate_masked_lesion_map(),
            ),
            &over,
            (SOURCE, SOURCE_PORT),
            (MASKED, "out_file"),
        ),
    ])
}

/// Mask the LOCATE output of every (subject, session) pair
pub async fn run(ctx: &WorkflowContext<'_>, acq: &str, pairs: Vec<SubjectSession>) -> Result<RunSummary> {
    let out_dir = ctx.config.stage_dir(Stage::PostLocateMasking, Some(acq));
    ctx.export_version(&out_dir)?;
    info!(acq = %acq, sessions = pairs.len(), "Masking LOCATE lesion maps");

    let space = IterationSpace::new(vec![case_group(&pairs)?])?;
    ctx.run_graph(WORKFLOW, Some(acq), stages(ctx, acq)?, space).await
}
