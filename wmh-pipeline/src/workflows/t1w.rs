//! Per-session T1w preparation
//!
//! Bias correction, ANTs brain extraction, FAST tissue segmentation, then the
//! shared normalization and BIANCA mask stages. Outputs land in
//! `<base>/prepare_t1w` and are shared by every FLAIR acquisition.

use super::norm::{self, NormInputs, NormOptions};
use super::{case_group, grabber, sink, source_file, Lookup, WorkflowContext, CASE, IN_PORT, SOURCE_PORT};
use crate::error::Result;
use crate::executor::RunSummary;
use crate::graph::{IterationSpace, StageSpec};
use crate::tools::{DataSink, ToolStep};
use std::sync::Arc;
use tracing::info;
use wmh_common::discovery::SubjectSession;
use wmh_common::naming::{derivatives, Descriptor, Stage};
use wmh_common::Error;

pub const WORKFLOW: &str = "prepare_t1w";

const GRAB: &str = "grabber";
const SOURCE: &str = "generic_bids_file";
const N4: &str = "n4_biascorr";
const BRAIN: &str = "brain_extraction";
const FAST: &str = "t1w_dseg";

pub fn stages(ctx: &WorkflowContext<'_>) -> Result<Vec<StageSpec>> {
    let config = ctx.config;
    let brain_template = config
        .t1w
        .brain_template
        .as_deref()
        .ok_or_else(|| Error::Config("t1w.brain_template is not configured".to_string()))?;
    let probability_mask = config
        .t1w
        .brain_probability_mask
        .as_deref()
        .ok_or_else(|| Error::Config("t1w.brain_probability_mask is not configured".to_string()))?;
    let over = [CASE];

    let n4 = ToolStep::new("N4BiasFieldCorrection")
        .lits(&["-d", "3", "-i"])
        .input("in_file")
        .lit("-o")
        .output("out_file", "t1w_n4.nii.gz");

    let extraction = ToolStep::new("antsBrainExtraction.sh")
        .lits(&["-d", "3", "-a"])
        .input("in_file")
        .lit("-e")
        .lit(&brain_template.to_string_lossy())
        .lit("-m")
        .lit(&probability_mask.to_string_lossy())
        .lit("-o")
        .local("ants_")
        .produces("brain", "ants_BrainExtractionBrain.nii.gz")
        .produces("mask", "ants_BrainExtractionMask.nii.gz");

    let fast = ToolStep::new("fast")
        .lits(&["-N", "-g", "-p", "-o"])
        .local("fast")
        .input("in_file")
        .produces("dseg", "fast_seg.nii.gz")
        .produces("csf_pve", "fast_pve_0.nii.gz");

    let mut specs = vec![
        grabber(
            GRAB,
            &over,
            None,
            vec![Lookup::required(
                "t1w",
                &config.bids_dir,
                "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_*_T1w.nii.gz",
            )?],
        ),
        source_file(
            SOURCE,
            &over,
            &config.bids_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_T1w.nii.gz",
        ),
        StageSpec::new(N4, Arc::new(n4))
            .over(&over)
            .input(GRAB, "t1w", "in_file")
            .outputs(&["out_file"]),
        StageSpec::new(BRAIN, Arc::new(extraction))
            .over(&over)
            .input(N4, "out_file", "in_file")
            .outputs(&["brain", "mask"]),
        StageSpec::new(FAST, Arc::new(fast))
            .over(&over)
            .input(BRAIN, "brain", "in_file")
            .outputs(&["dseg", "csf_pve"]),
    ];

    specs.extend(norm::normalization_stages(
        config,
        &over,
        NormInputs {
            t1w: (N4, "out_file"),
            brain: (BRAIN, "brain"),
            brainmask: (BRAIN, "mask"),
            csf_pve: (FAST, "csf_pve"),
        },
        NormOptions::default(),
    )?);

    let root = config.derivatives_root(Stage::PrepareT1w, None);
    let sinks: [(&str, (&str, &str), Descriptor); 12] = [
        ("ds_t1w_preproc", (N4, "out_file"), derivatives::preproc_t1w()),
        ("ds_t1w_brain", (BRAIN, "brain"), derivatives::brain_t1w()),
        ("ds_t1w_mask", (BRAIN, "mask"), derivatives::brain_mask()),
        ("ds_t1w_dseg", (FAST, "dseg"), derivatives::dseg()),
        ("ds_bianca_wm_mask", norm::WM_MASK, derivatives::bianca_wmmask()),
        ("ds_bianca_vent_mask", norm::VENT_MASK, derivatives::bianca_ventmask()),
        ("ds_distance_map", norm::DISTANCE_MAP, derivatives::bianca_ventdistmap()),
        ("ds_perivent_mask", norm::PERIVENT_MASK, derivatives::periventmask()),
        ("ds_deepwm_mask", norm::DEEP_WM_MASK, derivatives::deep_wm_mask()),
        ("ds_t1w_to_mni_xfm", norm::XFM, derivatives::to_mni_xfm("T1w")),
        ("ds_t1w_to_mni_warp", norm::WARP, derivatives::to_mni_warpfield("T1w")),
        ("ds_t1w_mni_space", norm::WARPED, derivatives::mni_warped_t1w()),
    ];
    for (name, file, descriptor) in sinks {
        specs.push(sink(
            name,
            DataSink::new(Stage::PrepareT1w, &root, SOURCE_PORT, IN_PORT, descriptor),
            &over,
            (SOURCE, SOURCE_PORT),
            file,
        ));
    }
    Ok(specs)
}

/// Prepare the T1w of every (subject, session) pair
pub async fn run(ctx: &WorkflowContext<'_>, pairs: Vec<SubjectSession>) -> Result<RunSummary> {
    let out_dir = ctx.config.stage_dir(Stage::PrepareT1w, None);
    ctx.export_version(&out_dir)?;
    info!(sessions = pairs.len(), out_dir = %out_dir.display(), "Preparing T1w images");

    let space = IterationSpace::new(vec![case_group(&pairs)?])?;
    ctx.run_graph(WORKFLOW, None, stages(ctx)?, space).await
}
