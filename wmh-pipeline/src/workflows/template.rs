//! Longitudinal template preparation, one branch per subject
//!
//! Inputs are the sMRIPrep subject templates. Outputs land in
//! `<base>/prepare_template` and are shared by every acquisition.

use super::norm::{self, NormInputs, NormOptions};
use super::{grabber, sink, source_file, Lookup, WorkflowContext, IN_PORT, SOURCE_PORT, SUBJECT};
use crate::error::Result;
use crate::executor::RunSummary;
use crate::graph::{IterableGroup, IterationSpace, StageSpec};
use crate::tools::{DataSink, ToolStep};
use std::sync::Arc;
use tracing::info;
use wmh_common::naming::{derivatives, Descriptor, Stage};
use wmh_common::Error;

pub const WORKFLOW: &str = "prepare_template";

const GRAB: &str = "grabber";
const SOURCE: &str = "generic_bids_file";

/// Stages of the workflow, replicated per subject
pub fn stages(ctx: &WorkflowContext<'_>) -> Result<Vec<StageSpec>> {
    let config = ctx.config;
    let smriprep = config
        .template
        .smriprep_dir
        .as_deref()
        .ok_or_else(|| Error::Config("template.smriprep_dir is not configured".to_string()))?;
    let over = [SUBJECT];

    let mut specs = vec![
        grabber(
            GRAB,
            &over,
            None,
            vec![
                Lookup::required("t1w", smriprep, "sub-{subject}/anat/sub-{subject}_T1w_preproc.nii.gz")?,
                Lookup::required("brainmask", smriprep, "sub-{subject}/anat/sub-{subject}_T1w_brainmask.nii.gz")?,
                Lookup::required(
                    "csf_pve",
                    smriprep,
                    "sub-{subject}/anat/sub-{subject}_T1w_class-CSF_probtissue.nii.gz",
                )?,
            ],
        ),
        source_file(SOURCE, &over, &config.bids_dir, "sub-{subject}/anat/sub-{subject}_T1w.nii.gz"),
        StageSpec::new(
            "t1w_brain",
            Arc::new(
                ToolStep::new("fslmaths")
                    .input("in_file")
                    .lit("-mas")
                    .input("mask_file")
                    .output("out_file", "t1w_brain.nii.gz"),
            ),
        )
        .over(&over)
        .input(GRAB, "t1w", "in_file")
        .input(GRAB, "brainmask", "mask_file")
        .outputs(&["out_file"]),
    ];

    specs.extend(norm::normalization_stages(
        config,
        &over,
        NormInputs {
            t1w: (GRAB, "t1w"),
            brain: ("t1w_brain", "out_file"),
            brainmask: (GRAB, "brainmask"),
            csf_pve: (GRAB, "csf_pve"),
        },
        NormOptions {
            dilate_distance_mask: true,
            mask_regions: true,
        },
    )?);

    let root = config.derivatives_root(Stage::PrepareTemplate, None);
    let sinks: [(&str, (&str, &str), Descriptor); 10] = [
        ("ds_t1w_preproc", (GRAB, "t1w"), derivatives::preproc_t1w()),
        ("ds_t1w_mask", (GRAB, "brainmask"), derivatives::brain_mask()),
        ("ds_bianca_wm_mask", norm::WM_MASK, derivatives::bianca_wmmask()),
        ("ds_bianca_vent_mask", norm::VENT_MASK, derivatives::bianca_ventmask()),
        ("ds_distance_map", norm::DISTANCE_MAP, derivatives::bianca_ventdistmap()),
        ("ds_perivent_mask", norm::PERIVENT_MASK, derivatives::periventmask()),
        ("ds_deepwm_mask", norm::DEEP_WM_MASK, derivatives::deep_wm_mask()),
        ("ds_t1w_to_mni_warp", norm::WARP, derivatives::to_mni_warpfield("tpl")),
        ("ds_t1w_to_mni_xfm", norm::XFM, derivatives::to_mni_xfm("tpl")),
        ("ds_t1w_mni_space", norm::WARPED, derivatives::mni_warped_t1w()),
    ];
    for (name, file, descriptor) in sinks {
        specs.push(sink(
            name,
            DataSink::new(Stage::PrepareTemplate, &root, SOURCE_PORT, IN_PORT, descriptor),
            &over,
            (SOURCE, SOURCE_PORT),
            file,
        ));
    }
    Ok(specs)
}

/// Prepare templates for `subjects`
pub async fn run(ctx: &WorkflowContext<'_>, subjects: Vec<String>) -> Result<RunSummary> {
    let out_dir = ctx.config.stage_dir(Stage::PrepareTemplate, None);
    ctx.export_version(&out_dir)?;
    info!(subjects = subjects.len(), out_dir = %out_dir.display(), "Preparing subject templates");

    let space = IterationSpace::new(vec![IterableGroup::single(SUBJECT, subjects)])?;
    ctx.run_graph(WORKFLOW, None, stages(ctx)?, space).await
}
