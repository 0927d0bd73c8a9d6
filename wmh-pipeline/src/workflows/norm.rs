//! MNI normalization and BIANCA mask stages shared by template and T1w preparation
//!
//! flirt (12 dof, 1 mm brain template) initializes fnirt against the 2 mm
//! template. The inverted warp brings the MNI ventricle atlas back for
//! `make_bianca_mask`; the ventricle distance map then splits white matter
//! into periventricular (< 10 mm) and deep regions.

use crate::graph::StageSpec;
use crate::tools::ToolStep;
use std::sync::Arc;
use wmh_common::config::RunConfig;
use wmh_common::Result;

pub const MNI_1MM_BRAIN: &str = "MNI152_T1_1mm_brain.nii.gz";
pub const MNI_2MM: &str = "MNI152_T1_2mm.nii.gz";
pub const FNIRT_CONFIG: &str = "T1_2_MNI152_2mm";
/// Distance from the ventricles separating periventricular from deep white matter (mm)
pub const PERIVENT_DISTANCE: &str = "10";

pub const XFM: (&str, &str) = ("flirt_mni", "out_matrix_file");
pub const WARP: (&str, &str) = ("fnirt_mni", "field_file");
pub const WARPED: (&str, &str) = ("fnirt_mni", "warped_file");
pub const WM_MASK: (&str, &str) = ("make_bianca_mask", "mask_file");
pub const VENT_MASK: (&str, &str) = ("make_bianca_mask", "vent_file");
pub const DISTANCE_MAP: (&str, &str) = ("distancemap", "distance_map");
pub const PERIVENT_MASK: (&str, &str) = ("perivent_mask", "out_file");
pub const DEEP_WM_MASK: (&str, &str) = ("deepwm_mask", "out_file");

/// Upstream ports feeding the normalization stages
#[derive(Debug, Clone, Copy)]
pub struct NormInputs<'a> {
    pub t1w: (&'a str, &'a str),
    pub brain: (&'a str, &'a str),
    pub brainmask: (&'a str, &'a str),
    pub csf_pve: (&'a str, &'a str),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormOptions {
    /// Dilate the brain mask before computing the distance map (avoids rim effects)
    pub dilate_distance_mask: bool,
    /// Restrict the periventricular and deep WM masks to the brain mask
    pub mask_regions: bool,
}

/// Stages from brain-extracted T1w to MNI transforms and white-matter masks
pub fn normalization_stages(
    config: &RunConfig,
    over: &[&str],
    inputs: NormInputs<'_>,
    options: NormOptions,
) -> Result<Vec<StageSpec>> {
    let mni_brain = config.fsl_standard(MNI_1MM_BRAIN)?;
    let mni_2mm = config.fsl_standard(MNI_2MM)?;

    let flirt = ToolStep::new("flirt")
        .lit("-in")
        .input("in_file")
        .lit("-ref")
        .lit(&mni_brain.to_string_lossy())
        .lits(&["-dof", "12", "-omat"])
        .output(XFM.1, "t1w_to_mni.mat")
        .lit("-out")
        .output("out_file", "t1w_to_mni_affine.nii.gz");

    let fnirt = ToolStep::new("fnirt")
        .input_with("--in=", "in_file")
        .input_with("--aff=", "affine_file")
        .lit(&format!("--config={FNIRT_CONFIG}"))
        .lit(&format!("--ref={}", mni_2mm.display()))
        .output_with("--cout=", WARP.1, "t1w_to_mni_warpfield.nii.gz")
        .output_with("--iout=", WARPED.1, "t1w_mni_warped.nii.gz");

    let invwarp = ToolStep::new("invwarp")
        .input_with("--warp=", "warp")
        .input_with("--ref=", "reference")
        .output_with("--out=", "inverse_warp", "mni_to_t1w_warp.nii.gz");

    // make_bianca_mask derives <base>_brain and <base>_brain_mask from the structural name
    let bianca_mask = ToolStep::new("make_bianca_mask")
        .stage_input("structural", "t1w.nii.gz")
        .stage_input("brain", "t1w_brain.nii.gz")
        .stage_input("brainmask", "t1w_brain_mask.nii.gz")
        .local("t1w.nii.gz")
        .input("csf_pve")
        .input("warp")
        .lit("0")
        .produces(WM_MASK.1, "t1w_bianca_mask.nii.gz")
        .produces(VENT_MASK.1, "t1w_ventmask.nii.gz");

    let distancemap = ToolStep::new("distancemap")
        .lit("-i")
        .input("in_file")
        .lit("-m")
        .input("mask_file")
        .lit("-o")
        .output(DISTANCE_MAP.1, "distancemap.nii.gz");

    let region = |op: &str, file: &str| {
        let step = ToolStep::new("fslmaths")
            .input("in_file")
            .lits(&[op, PERIVENT_DISTANCE, "-bin"]);
        let step = if options.mask_regions {
            step.lit("-mas").input("mask_file")
        } else {
            step
        };
        step.output("out_file", file)
    };

    let mut specs = vec![
        StageSpec::new(XFM.0, Arc::new(flirt))
            .over(over)
            .input(inputs.brain.0, inputs.brain.1, "in_file")
            .outputs(&[XFM.1, "out_file"]),
        StageSpec::new(WARP.0, Arc::new(fnirt))
            .over(over)
            .input(inputs.t1w.0, inputs.t1w.1, "in_file")
            .input(XFM.0, XFM.1, "affine_file")
            .outputs(&[WARP.1, WARPED.1]),
        StageSpec::new("invwarp_mni", Arc::new(invwarp))
            .over(over)
            .input(WARP.0, WARP.1, "warp")
            .input(inputs.t1w.0, inputs.t1w.1, "reference")
            .outputs(&["inverse_warp"]),
        StageSpec::new(WM_MASK.0, Arc::new(bianca_mask))
            .over(over)
            .input(inputs.t1w.0, inputs.t1w.1, "structural")
            .input(inputs.brain.0, inputs.brain.1, "brain")
            .input(inputs.brainmask.0, inputs.brainmask.1, "brainmask")
            .input(inputs.csf_pve.0, inputs.csf_pve.1, "csf_pve")
            .input("invwarp_mni", "inverse_warp", "warp")
            .outputs(&[WM_MASK.1, VENT_MASK.1]),
    ];

    let distance_mask = if options.dilate_distance_mask {
        let dilate = ToolStep::new("fslmaths")
            .input("in_file")
            .lit("-dilF")
            .output("out_file", "brainmask_dil.nii.gz");
        specs.push(
            StageSpec::new("brainmask_dil", Arc::new(dilate))
                .over(over)
                .input(inputs.brainmask.0, inputs.brainmask.1, "in_file")
                .outputs(&["out_file"]),
        );
        ("brainmask_dil", "out_file")
    } else {
        inputs.brainmask
    };

    specs.push(
        StageSpec::new(DISTANCE_MAP.0, Arc::new(distancemap))
            .over(over)
            .input(VENT_MASK.0, VENT_MASK.1, "in_file")
            .input(distance_mask.0, distance_mask.1, "mask_file")
            .outputs(&[DISTANCE_MAP.1]),
    );

    for (name, op, file) in [
        (PERIVENT_MASK.0, "-uthr", "perivent_mask.nii.gz"),
        (DEEP_WM_MASK.0, "-thr", "deepWM_mask.nii.gz"),
    ] {
        let mut spec = StageSpec::new(name, Arc::new(region(op, file)))
            .over(over)
            .input(DISTANCE_MAP.0, DISTANCE_MAP.1, "in_file")
            .outputs(&["out_file"]);
        if options.mask_regions {
            spec = spec.input(inputs.brainmask.0, inputs.brainmask.1, "mask_file");
        }
        specs.push(spec);
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageGraph;
    use wmh_common::config::{ConfigOverrides, TomlConfig};

    fn config() -> RunConfig {
        let toml = TomlConfig {
            fsl_dir: Some("/opt/fsl".into()),
            ..Default::default()
        };
        RunConfig::from_parts(
            toml,
            &ConfigOverrides {
                base_dir: Some("/out".into()),
                bids_dir: Some("/bids".into()),
                n_cpu: Some(1),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_template_flavour_adds_dilation_and_masking() {
        let cfg = config();
        let inputs = NormInputs {
            t1w: ("grab", "t1w"),
            brain: ("brain", "out_file"),
            brainmask: ("grab", "brainmask"),
            csf_pve: ("grab", "csf"),
        };
        let plain = normalization_stages(&cfg, &["subject"], inputs, NormOptions::default()).unwrap();
        let masked = normalization_stages(
            &cfg,
            &["subject"],
            inputs,
            NormOptions {
                dilate_distance_mask: true,
                mask_regions: true,
            },
        )
        .unwrap();
        assert_eq!(masked.len(), plain.len() + 1);
        let deep = masked.iter().find(|s| s.name == DEEP_WM_MASK.0).unwrap();
        assert!(deep.inputs.iter().any(|e| e.to_port == "mask_file"));
    }

    #[test]
    fn test_missing_fsl_dir_is_a_config_error() {
        let mut cfg = config();
        cfg.fsl_dir = None;
        let inputs = NormInputs {
            t1w: ("g", "t1w"),
            brain: ("g", "brain"),
            brainmask: ("g", "mask"),
            csf_pve: ("g", "csf"),
        };
        let err = normalization_stages(&cfg, &[], inputs, NormOptions::default()).unwrap_err();
        assert!(matches!(err, wmh_common::Error::Config(_)));
    }

    #[test]
    fn test_stages_form_a_valid_graph_with_their_upstream() {
        use crate::tools::FnStep;
        let grab = StageSpec::new("grab", Arc::new(FnStep::new("grab", |_| Ok(Default::default()))))
            .over(&["subject"])
            .outputs(&["t1w", "brain", "mask", "csf"]);
        let inputs = NormInputs {
            t1w: ("grab", "t1w"),
            brain: ("grab", "brain"),
            brainmask: ("grab", "mask"),
            csf_pve: ("grab", "csf"),
        };
        let mut specs = vec![grab];
        specs.extend(normalization_stages(&config(), &["subject"], inputs, NormOptions::default()).unwrap());
        let graph = StageGraph::build(specs).unwrap();
        assert_eq!(graph.stages()[0].name, "grab");
        assert!(graph.position(DISTANCE_MAP.0) > graph.position(WM_MASK.0));
    }
}
