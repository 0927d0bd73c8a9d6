//! FLAIR preparation for one acquisition
//!
//! The bias-corrected FLAIR becomes the reference space: T1w-derived images
//! and masks are registered into it (6 dof), and the FLAIR→MNI affine is
//! composed from the inverse registration and the T1w→MNI affine.

use super::{case_group, grabber, sink, source_file, Lookup, WorkflowContext, CASE, IN_PORT, SOURCE_PORT};
use crate::error::Result;
use crate::executor::RunSummary;
use crate::graph::{IterationSpace, StageSpec};
use crate::tools::{DataSink, ToolStep};
use std::sync::Arc;
use tracing::info;
use wmh_common::discovery::SubjectSession;
use wmh_common::naming::{derivatives, Descriptor, Stage};

pub const WORKFLOW: &str = "prepare_flair";

const GRAB: &str = "grabber";
const SOURCE: &str = "generic_bids_file";
const BIASCORR: &str = "flair_biascorr";
const T1W_TO_FLAIR: &str = "flirt_t1w_to_flair";
const FLAIR_TO_MNI: &str = "flair_to_mni";

/// T1w-preparation outputs looked up per session: (port, descriptor part of the file name)
const T1W_INPUTS: [(&str, &str); 8] = [
    ("t1w", "desc-preproc_T1w.nii.gz"),
    ("t1w_brain", "desc-brain_T1w.nii.gz"),
    ("brainmask", "desc-brain_mask.nii.gz"),
    ("wmmask", "desc-bianca_wmmask.nii.gz"),
    ("distance_map", "desc-bianca_ventdistmap.nii.gz"),
    ("perivent_mask", "desc-periventmask.nii.gz"),
    ("deepwm_mask", "desc-deepWMmask.nii.gz"),
    ("t1w_to_mni", "from-T1w_to-MNI_xfm.mat"),
];

/// Images resampled into FLAIR space: (grabbed port, descriptor, nearest-neighbour)
const TO_FLAIR_SPACE: [(&str, &str, bool); 6] = [
    ("t1w_brain", "t1w_brain", false),
    ("brainmask", "brainmask", true),
    ("wmmask", "wmmask", true),
    ("distance_map", "distanceVent", false),
    ("perivent_mask", "periventmask", true),
    ("deepwm_mask", "deepWMmask", true),
];

/// `flirt -applyxfm` of `in_file` onto `reference` with `matrix`
fn apply_xfm(nearest_neighbour: bool) -> ToolStep {
    let step = ToolStep::new("flirt")
        .lit("-in")
        .input("in_file")
        .lit("-ref")
        .input("reference")
        .lits(&["-applyxfm", "-init"])
        .input("matrix")
        .lit("-out")
        .output("out_file", "in_flair_space.nii.gz");
    if nearest_neighbour {
        step.lits(&["-interp", "nearestneighbour"])
    } else {
        step
    }
}

pub fn stages(ctx: &WorkflowContext<'_>, acq: &str) -> Result<Vec<StageSpec>> {
    let config = ctx.config;
    let over = [CASE];
    let t1w_dir = config.stage_dir(Stage::PrepareT1w, None);

    let mut lookups = vec![Lookup::required(
        "flair",
        &config.bids_dir,
        "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_*_FLAIR.nii.gz",
    )?];
    for (port, desc) in T1W_INPUTS {
        lookups.push(Lookup::required(
            port,
            &t1w_dir,
            &format!("sub-{{subject}}/ses-{{session}}/anat/sub-{{subject}}_ses-{{session}}_{desc}"),
        )?);
    }

    let mut specs = vec![
        grabber(GRAB, &over, Some(acq), lookups),
        source_file(
            SOURCE,
            &over,
            &config.bids_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_T1w.nii.gz",
        ),
        StageSpec::new(
            "flair_reorient",
            Arc::new(
                ToolStep::new("fslreorient2std")
                    .input("in_file")
                    .output("out_file", "flair_reoriented.nii.gz"),
            ),
        )
        .over(&over)
        .input(GRAB, "flair", "in_file")
        .outputs(&["out_file"]),
        StageSpec::new(
            BIASCORR,
            Arc::new(
                ToolStep::new("N4BiasFieldCorrection")
                    .lits(&["-d", "3", "-i"])
                    .input("in_file")
                    .lit("-o")
                    .output("out_file", "flair_biascorr.nii.gz"),
            ),
        )
        .over(&over)
        .input("flair_reorient", "out_file", "in_file")
        .outputs(&["out_file"]),
        StageSpec::new(
            T1W_TO_FLAIR,
            Arc::new(
                ToolStep::new("flirt")
                    .lit("-in")
                    .input("in_file")
                    .lit("-ref")
                    .input("reference")
                    .lits(&["-dof", "6", "-omat"])
                    .output("out_matrix_file", "t1w_to_flair.mat")
                    .lit("-out")
                    .output("out_file", "t1w_in_flair.nii.gz"),
            ),
        )
        .over(&over)
        .input(GRAB, "t1w", "in_file")
        .input(BIASCORR, "out_file", "reference")
        .outputs(&["out_matrix_file", "out_file"]),
        StageSpec::new(
            "flair_to_t1w",
            Arc::new(
                ToolStep::new("convert_xfm")
                    .lit("-omat")
                    .output("out_file", "flair_to_t1w.mat")
                    .lit("-inverse")
                    .input("in_file"),
            ),
        )
        .over(&over)
        .input(T1W_TO_FLAIR, "out_matrix_file", "in_file")
        .outputs(&["out_file"]),
        // convert_xfm -concat A B applies B first
        StageSpec::new(
            FLAIR_TO_MNI,
            Arc::new(
                ToolStep::new("convert_xfm")
                    .lit("-omat")
                    .output("out_file", "flair_to_mni.mat")
                    .lit("-concat")
                    .input("t1w_to_mni")
                    .input("flair_to_t1w"),
            ),
        )
        .over(&over)
        .input(GRAB, "t1w_to_mni", "t1w_to_mni")
        .input("flair_to_t1w", "out_file", "flair_to_t1w")
        .outputs(&["out_file"]),
    ];

    for (port, _, nn) in TO_FLAIR_SPACE {
        specs.push(
            StageSpec::new(&format!("{port}_flair_space"), Arc::new(apply_xfm(nn)))
                .over(&over)
                .input(GRAB, port, "in_file")
                .input(BIASCORR, "out_file", "reference")
                .input(T1W_TO_FLAIR, "out_matrix_file", "matrix")
                .outputs(&["out_file"]),
        );
    }

    let root = config.derivatives_root(Stage::PrepareFlair, Some(acq));
    let flair_sink = |descriptor: Descriptor| {
        DataSink::new(Stage::PrepareFlair, &root, SOURCE_PORT, IN_PORT, descriptor)
    };

    specs.push(sink(
        "ds_flair_biascorr",
        flair_sink(derivatives::flair_biascorr()),
        &over,
        (GRAB, "flair"),
        (BIASCORR, "out_file"),
    ));
    for (port, desc, _) in TO_FLAIR_SPACE {
        let stage = format!("{port}_flair_space");
        specs.push(sink(
            &format!("ds_{port}"),
            flair_sink(derivatives::in_flair_space(acq, desc)),
            &over,
            (SOURCE, SOURCE_PORT),
            (stage.as_str(), "out_file"),
        ));
    }
    specs.push(sink(
        "ds_t1w_to_flair",
        flair_sink(derivatives::t1w_to_flair(acq)),
        &over,
        (SOURCE, SOURCE_PORT),
        (T1W_TO_FLAIR, "out_matrix_file"),
    ));
    specs.push(sink(
        "ds_flair_to_mni",
        flair_sink(derivatives::flair_to_mni(acq)),
        &over,
        (SOURCE, SOURCE_PORT),
        (FLAIR_TO_MNI, "out_file"),
    ));
    Ok(specs)
}

/// Prepare the `acq` FLAIR of every (subject, session) pair
pub async fn run(ctx: &WorkflowContext<'_>, acq: &str, pairs: Vec<SubjectSession>) -> Result<RunSummary> {
    let out_dir = ctx.config.stage_dir(Stage::PrepareFlair, Some(acq));
    ctx.export_version(&out_dir)?;
    info!(acq = %acq, sessions = pairs.len(), out_dir = %out_dir.display(), "Preparing FLAIR images");

    let space = IterationSpace::new(vec![case_group(&pairs)?])?;
    ctx.run_graph(WORKFLOW, Some(acq), stages(ctx, acq)?, space).await
}
