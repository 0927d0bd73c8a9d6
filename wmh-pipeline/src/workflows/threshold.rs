//! Thresholding of lesion probability maps and lesion statistics
//!
//! The LPM is masked to white matter once per session; every threshold then
//! forms its own branch (session × threshold cross product).

use super::{case_group, grabber, sink, Lookup, WorkflowContext, CASE, IN_PORT, SOURCE_PORT};
use crate::error::Result;
use crate::executor::RunSummary;
use crate::graph::{BranchKey, IterableGroup, IterationSpace, StageSpec};
use crate::tools::{DataSink, ToolStep};
use std::sync::Arc;
use tracing::info;
use wmh_common::discovery::SubjectSession;
use wmh_common::naming::{derivatives, Descriptor, Stage};
use wmh_common::Error;

pub const WORKFLOW: &str = "bianca_threshold";

/// Iteration group of thresholds
pub const THRESHOLD: &str = "threshold";

const GRAB: &str = "grabber";
const MASKED: &str = "bianca_lpm_masked";
const THRESHOLDED: &str = "thresholded_bianca_lpm_mask";
const OVERLAP: &str = "overlap";

/// Cluster statistics per region: (stage, grabbed mask port, file name suffix)
const CLUSTER_STATS: [(&str, &str, &str); 3] = [
    ("cluster_stats_total", "wm_mask", "Total"),
    ("cluster_stats_deepwm", "deepwm_mask", "deepwm"),
    ("cluster_stats_perventwm", "pervent_mask", "perventwm"),
];

/// Parameters of one thresholding run
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdOptions {
    pub thresholds: Vec<f64>,
    /// Compare against the manual mask with `bianca_overlap_measures`
    pub overlap: bool,
}

/// Threshold values as they appear in commands and file names
pub fn threshold_values(thresholds: &[f64]) -> Vec<String> {
    thresholds.iter().map(|t| t.to_string()).collect()
}

fn threshold_of(key: &BranchKey) -> &str {
    key.get(THRESHOLD).unwrap_or_default()
}

pub fn stages(ctx: &WorkflowContext<'_>, acq: &str, options: &ThresholdOptions) -> Result<Vec<StageSpec>> {
    let config = ctx.config;
    let case = [CASE];
    let case_thr = [CASE, THRESHOLD];
    let bianca_dir = config.stage_dir(Stage::Bianca, Some(acq));
    let flair_dir = config.stage_dir(Stage::PrepareFlair, Some(acq));

    let mut lookups = vec![
        Lookup::required(
            "bianca_lpm",
            &bianca_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_acq-{acq}_*_FLAIR_LPM.nii.gz",
        )?,
        Lookup::required(
            "wm_mask",
            &flair_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_space-flair{acq}_desc-wmmask.nii.gz",
        )?,
        Lookup::required(
            "deepwm_mask",
            &flair_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_space-flair{acq}_desc-deepWMmask.nii.gz",
        )?,
        Lookup::required(
            "pervent_mask",
            &flair_dir,
            "sub-{subject}/ses-{session}/anat/sub-{subject}_ses-{session}_space-flair{acq}_desc-periventmask.nii.gz",
        )?,
    ];
    if options.overlap {
        let mask_dir = match &config.threshold.mask_dir {
            Some(dir) => dir.as_path(),
            None => config.training_data_dir()?,
        };
        lookups.push(Lookup::required(
            "manual_mask",
            mask_dir,
            config.masterfile.manual_mask.as_str(),
        )?);
    }

    let mut specs = vec![
        grabber(GRAB, &case, Some(acq), lookups),
        StageSpec::new(
            MASKED,
            Arc::new(
                ToolStep::new("fslmaths")
                    .input("in_file")
                    .lit("-mas")
                    .input("mask_file")
                    .output("out_file", "lpm_masked.nii.gz"),
            ),
        )
        .over(&case)
        .input(GRAB, "bianca_lpm", "in_file")
        .input(GRAB, "wm_mask", "mask_file")
        .outputs(&["out_file"]),
        StageSpec::new(
            THRESHOLDED,
            Arc::new(
                ToolStep::new("fslmaths")
                    .input("in_file")
                    .lit("-thr")
                    .key(THRESHOLD)
                    .lit("-bin")
                    .output("out_file", "lpm_masked_thr.nii.gz"),
            ),
        )
        .over(&case_thr)
        .input(MASKED, "out_file", "in_file")
        .outputs(&["out_file"]),
    ];

    for (stage, mask_port, _) in CLUSTER_STATS {
        specs.push(
            StageSpec::new(
                stage,
                Arc::new(
                    ToolStep::new("bianca_cluster_stats")
                        .input("bianca_output_map")
                        .key(THRESHOLD)
                        .lit("0")
                        .input("mask_file")
                        .stdout_to("out_stat", "out.txt"),
                ),
            )
            .over(&case_thr)
            .input(MASKED, "out_file", "bianca_output_map")
            .input(GRAB, mask_port, "mask_file")
            .outputs(&["out_stat"]),
        );
    }

    if options.overlap {
        // Results are written next to the lesion map, named after it
        specs.push(
            StageSpec::new(
                OVERLAP,
                Arc::new(
                    ToolStep::new("bianca_overlap_measures")
                        .stage_input("lesionmask", "lpm.nii.gz")
                        .local("lpm.nii.gz")
                        .key(THRESHOLD)
                        .input("manualmask")
                        .lit("1")
                        .produces("out_file", "Overlap_and_Volumes_lpm_{threshold}.txt"),
                ),
            )
            .over(&case_thr)
            .input(MASKED, "out_file", "lesionmask")
            .input(GRAB, "manual_mask", "manualmask")
            .outputs(&["out_file"]),
        );
    }

    let root = config.derivatives_root(Stage::BiancaThreshold, Some(acq));
    let keyed = |descriptor: fn(&str) -> Descriptor| {
        DataSink::keyed(Stage::BiancaThreshold, &root, SOURCE_PORT, IN_PORT, move |key| {
            descriptor(threshold_of(key))
        })
    };

    specs.push(sink(
        "ds_masked",
        DataSink::new(
            Stage::BiancaThreshold,
            &root,
            SOURCE_PORT,
            IN_PORT,
            derivatives::bianca_masked_lpm(),
        ),
        &case,
        (GRAB, "bianca_lpm"),
        (MASKED, "out_file"),
    ));
    specs.push(sink(
        "ds_masked_thr_bin",
        keyed(derivatives::thresholded_lpm),
        &case_thr,
        (GRAB, "bianca_lpm"),
        (THRESHOLDED, "out_file"),
    ));
    for (stage, _, region) in CLUSTER_STATS {
        specs.push(sink(
            &format!("ds_{stage}"),
            DataSink::keyed(Stage::BiancaThreshold, &root, SOURCE_PORT, IN_PORT, move |key| {
                derivatives::cluster_stats(threshold_of(key), region)
            }),
            &case_thr,
            (GRAB, "bianca_lpm"),
            (stage, "out_stat"),
        ));
    }
    if options.overlap {
        specs.push(sink(
            "ds_overlap",
            keyed(derivatives::overlap),
            &case_thr,
            (GRAB, "bianca_lpm"),
            (OVERLAP, "out_file"),
        ));
    }
    Ok(specs)
}

/// Threshold the `acq` lesion maps of every (subject, session) pair at every threshold
pub async fn run(
    ctx: &WorkflowContext<'_>,
    acq: &str,
    pairs: Vec<SubjectSession>,
    options: &ThresholdOptions,
) -> Result<RunSummary> {
    if options.thresholds.is_empty() {
        return Err(Error::InvalidInput("no thresholds given".to_string()).into());
    }
    let out_dir = ctx.config.stage_dir(Stage::BiancaThreshold, Some(acq));
    ctx.export_version(&out_dir)?;
    info!(
        acq = %acq,
        sessions = pairs.len(),
        thresholds = ?options.thresholds,
        overlap = options.overlap,
        "Thresholding lesion probability maps"
    );

    let space = IterationSpace::new(vec![
        case_group(&pairs)?,
        IterableGroup::single(THRESHOLD, threshold_values(&options.thresholds)),
    ])?;
    ctx.run_graph(WORKFLOW, Some(acq), stages(ctx, acq, options)?, space).await
}
