//! Workflow smoke tests against a fake tool runner
//!
//! Each test lays out the derivatives a previous workflow would have left,
//! runs one workflow end to end and inspects the sinked outputs and the
//! recorded command lines.

mod helpers;

use helpers::{pairs, touch, FakeRunner, TestTree};
use std::path::PathBuf;
use wmh_common::naming::Stage;
use wmh_pipeline::cohort::CohortSelection;
use wmh_pipeline::workflows::threshold::ThresholdOptions;
use wmh_pipeline::workflows::{bianca, intnorm, locate, post_locate, threshold};
use wmh_pipeline::Error;

const ACQ: &str = "3D";

fn anat(tree: &TestTree, stage: Stage, subject: &str, session: &str) -> PathBuf {
    tree.config
        .stage_dir(stage, Some(ACQ))
        .join(format!("sub-{subject}/ses-{session}/anat"))
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(flag))
}

/// Three sessions, the first two labeled
fn bianca_tree() -> TestTree {
    let tree = TestTree::new();
    for (s, ses) in [("A", "tp1"), ("B", "tp1"), ("C", "tp1")] {
        tree.prepared_flair(ACQ, s, ses);
    }
    tree.manual_mask(ACQ, "A", "tp1");
    tree.manual_mask(ACQ, "B", "tp1");
    tree
}

#[tokio::test]
async fn test_bianca_leave_one_out() {
    let tree = bianca_tree();
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    bianca::prepare_masterfile(&ctx, ACQ).unwrap();

    let selection = CohortSelection {
        save_classifier: true,
        ..Default::default()
    };
    let summary = bianca::run(&ctx, ACQ, &selection).await.unwrap();
    assert!(summary.is_success());

    let mut training_by_query: Vec<(String, String)> = runner
        .calls_to("bianca")
        .iter()
        .map(|c| {
            (
                arg_value(&c.args, "--querysubjectnum=").unwrap().to_string(),
                arg_value(&c.args, "--trainingnums=").unwrap().to_string(),
            )
        })
        .collect();
    training_by_query.sort();
    assert_eq!(
        training_by_query,
        vec![
            ("1".to_string(), "2".to_string()),
            ("2".to_string(), "1".to_string()),
            ("3".to_string(), "1,2".to_string()),
        ]
    );

    for s in ["A", "B", "C"] {
        let dir = anat(&tree, Stage::Bianca, s, "tp1");
        let prefix = format!("sub-{s}_ses-tp1_acq-3D_run-1");
        assert!(dir.join(format!("{prefix}_FLAIR_LPM.nii.gz")).exists());
        assert!(dir.join(format!("{prefix}_FLAIR_classifier")).exists());
        assert!(dir.join(format!("{prefix}_FLAIR_classifier_labels")).exists());
    }

    let sidecar = anat(&tree, Stage::Bianca, "A", "tp1").join("sub-A_ses-tp1_acq-3D_run-1_FLAIR_LPM.json");
    let meta: serde_json::Value = serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
    assert_eq!(meta["query_subject_session"], serde_json::json!(["A", "tp1"]));
    assert_eq!(meta["training_subjects_sessions"], serde_json::json!([["B", "tp1"]]));
}

#[tokio::test]
async fn test_bianca_pretrained_skips_training() {
    let tree = bianca_tree();
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    bianca::prepare_masterfile(&ctx, ACQ).unwrap();
    let clf = touch(tree.path(), "clf/acq-3D_run-1_FLAIR_classifier");

    let selection = CohortSelection {
        classifier: Some(clf.clone()),
        query: Some(vec![2]),
        ..Default::default()
    };
    bianca::run(&ctx, ACQ, &selection).await.unwrap();

    let calls = runner.calls_to("bianca");
    assert_eq!(calls.len(), 1);
    assert_eq!(arg_value(&calls[0].args, "--querysubjectnum="), Some("3"));
    let clf_arg = clf.display().to_string();
    assert_eq!(
        arg_value(&calls[0].args, "--loadclassifierdata="),
        Some(clf_arg.as_str())
    );
    assert!(arg_value(&calls[0].args, "--trainingnums=").is_none());
}

#[tokio::test]
async fn test_bianca_conflicting_classifier_options_rejected() {
    let tree = bianca_tree();
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    bianca::prepare_masterfile(&ctx, ACQ).unwrap();

    let selection = CohortSelection {
        classifier: Some(tree.path().join("clf")),
        save_classifier: true,
        ..Default::default()
    };
    let err = bianca::run(&ctx, ACQ, &selection).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Common(wmh_common::Error::ConflictingClassifierSource(_))
    ));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_bianca_missing_pretrained_classifier_fails_once() {
    let tree = bianca_tree();
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    bianca::prepare_masterfile(&ctx, ACQ).unwrap();
    let clf = tree.path().join("clf/acq-3D_run-1_FLAIR_classifier");

    let selection = CohortSelection {
        classifier: Some(clf.clone()),
        ..Default::default()
    };
    let err = bianca::run(&ctx, ACQ, &selection).await.unwrap_err();
    assert!(matches!(err, Error::Common(wmh_common::Error::MissingFile(p)) if p == clf));
    assert!(runner.calls().is_empty());
    assert!(!tree.config.workflow_crash_dir(bianca::WORKFLOW, Some(ACQ)).exists());
}

#[tokio::test]
async fn test_bianca_sole_labeled_query_has_no_training() {
    let tree = TestTree::new();
    tree.prepared_flair(ACQ, "A", "tp1");
    tree.prepared_flair(ACQ, "B", "tp1");
    tree.manual_mask(ACQ, "A", "tp1");
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    bianca::prepare_masterfile(&ctx, ACQ).unwrap();

    let err = bianca::run(&ctx, ACQ, &CohortSelection::default()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Common(wmh_common::Error::BranchExecutionFailure { failed: 1, .. })
    ));

    // B still trains on A
    let calls = runner.calls_to("bianca");
    assert_eq!(calls.len(), 1);
    assert_eq!(arg_value(&calls[0].args, "--querysubjectnum="), Some("2"));
    assert_eq!(arg_value(&calls[0].args, "--trainingnums="), Some("1"));
    assert!(anat(&tree, Stage::Bianca, "B", "tp1")
        .join("sub-B_ses-tp1_acq-3D_run-1_FLAIR_LPM.nii.gz")
        .exists());
    assert!(!anat(&tree, Stage::Bianca, "A", "tp1")
        .join("sub-A_ses-tp1_acq-3D_run-1_FLAIR_LPM.nii.gz")
        .exists());

    let crash_dir = tree.config.workflow_crash_dir(bianca::WORKFLOW, Some(ACQ));
    let dumps: Vec<_> = std::fs::read_dir(&crash_dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(dumps.len(), 1);
    let dump: serde_json::Value = serde_json::from_slice(&std::fs::read(dumps[0].path()).unwrap()).unwrap();
    assert_eq!(dump["branch"]["query_num"], "1");
    assert!(dump["error"].as_str().unwrap().contains("no training subjects besides itself"));
}

#[tokio::test]
async fn test_bianca_failure_is_isolated_to_its_query() {
    let tree = bianca_tree();
    let runner = FakeRunner::failing(|inv| {
        inv.program == "bianca" && inv.args.iter().any(|a| a == "--querysubjectnum=2")
    });
    let ctx = tree.ctx(runner.clone());
    bianca::prepare_masterfile(&ctx, ACQ).unwrap();

    let err = bianca::run(&ctx, ACQ, &CohortSelection::default()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Common(wmh_common::Error::BranchExecutionFailure { failed: 1, .. })
    ));

    assert!(anat(&tree, Stage::Bianca, "A", "tp1")
        .join("sub-A_ses-tp1_acq-3D_run-1_FLAIR_LPM.nii.gz")
        .exists());
    assert!(!anat(&tree, Stage::Bianca, "B", "tp1")
        .join("sub-B_ses-tp1_acq-3D_run-1_FLAIR_LPM.nii.gz")
        .exists());

    let crash_dir = tree.config.workflow_crash_dir(bianca::WORKFLOW, Some(ACQ));
    let dumps: Vec<_> = std::fs::read_dir(&crash_dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(dumps.len(), 1);
    let dump: serde_json::Value = serde_json::from_slice(&std::fs::read(dumps[0].path()).unwrap()).unwrap();
    assert_eq!(dump["stage"], "bianca");
    assert_eq!(dump["branch"]["query_num"], "2");
}

#[tokio::test]
async fn test_export_classifier_strips_session_prefix() {
    let tree = bianca_tree();
    let ctx = tree.ctx(FakeRunner::new());
    let manifest = bianca::prepare_masterfile(&ctx, ACQ).unwrap();
    let selection = CohortSelection {
        save_classifier: true,
        ..Default::default()
    };
    bianca::run(&ctx, ACQ, &selection).await.unwrap();

    let out = tree.path().join("exported");
    let bianca_dir = tree.config.stage_dir(Stage::Bianca, Some(ACQ));
    let files = bianca::export_classifier(&bianca_dir, &manifest, 1, &out).unwrap();

    assert!(out.join("acq-3D_run-1_FLAIR_classifier").exists());
    assert!(out.join("acq-3D_run-1_FLAIR_classifier_labels").exists());
    assert!(files.iter().all(|f| !f
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("sub-")));
}

#[test]
fn test_export_classifier_without_saved_classifier_fails() {
    let tree = bianca_tree();
    let ctx = tree.ctx(FakeRunner::new());
    let manifest = bianca::prepare_masterfile(&ctx, ACQ).unwrap();
    let bianca_dir = tree.config.stage_dir(Stage::Bianca, Some(ACQ));

    let err = bianca::export_classifier(&bianca_dir, &manifest, 0, &tree.path().join("exported")).unwrap_err();
    assert!(matches!(err, wmh_common::Error::MissingFile(_)));
}

fn threshold_tree() -> TestTree {
    let tree = TestTree::new();
    for s in ["A", "B"] {
        tree.prepared_flair(ACQ, s, "tp1");
        tree.lesion_map(ACQ, s, "tp1");
    }
    tree
}

#[tokio::test]
async fn test_threshold_writes_stats_per_threshold() {
    let tree = threshold_tree();
    tree.manual_mask(ACQ, "A", "tp1");
    tree.manual_mask(ACQ, "B", "tp1");
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    let options = ThresholdOptions {
        thresholds: vec![0.9, 0.99],
        overlap: true,
    };

    let summary = threshold::run(&ctx, ACQ, pairs(&[("A", "tp1"), ("B", "tp1")]), &options)
        .await
        .unwrap();
    assert!(summary.is_success());

    let dir = anat(&tree, Stage::BiancaThreshold, "A", "tp1");
    let prefix = "sub-A_ses-tp1_acq-3D_run-1";
    assert!(dir.join(format!("{prefix}_desc-biancamasked_FLAIR_LPM.nii.gz")).exists());
    for t in ["0.9", "0.99"] {
        assert!(dir
            .join(format!("{prefix}_desc-thresh{t}_biancaLPMmaskedThrBin.nii.gz"))
            .exists());
        assert!(dir.join(format!("{prefix}_desc-thresh{t}_overlap.txt")).exists());
        for region in ["Total", "deepwm", "perventwm"] {
            let stats = dir.join(format!("{prefix}_desc-thresh{t}_ClusterStats{region}.txt"));
            assert!(std::fs::read_to_string(stats).unwrap().contains("Number of clusters"));
        }
    }

    let thresholds: Vec<String> = runner
        .calls_to("fslmaths")
        .iter()
        .filter(|c| c.args.iter().any(|a| a == "-thr"))
        .map(|c| c.args[2].clone())
        .collect();
    assert_eq!(thresholds.len(), 4);
    assert!(thresholds.iter().all(|t| t == "0.9" || t == "0.99"));
    assert_eq!(runner.calls_to("bianca_overlap_measures").len(), 4);
}

#[tokio::test]
async fn test_threshold_missing_manual_mask_fails_only_that_session() {
    let tree = threshold_tree();
    tree.manual_mask(ACQ, "A", "tp1");
    let ctx = tree.ctx(FakeRunner::new());
    let options = ThresholdOptions {
        thresholds: vec![0.9],
        overlap: true,
    };

    let err = threshold::run(&ctx, ACQ, pairs(&[("A", "tp1"), ("B", "tp1")]), &options)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Common(wmh_common::Error::BranchExecutionFailure { failed: 1, .. })
    ));
    assert!(anat(&tree, Stage::BiancaThreshold, "A", "tp1")
        .join("sub-A_ses-tp1_acq-3D_run-1_desc-thresh0.9_overlap.txt")
        .exists());
    assert!(!anat(&tree, Stage::BiancaThreshold, "B", "tp1").exists());
}

#[tokio::test]
async fn test_threshold_requires_a_threshold() {
    let tree = threshold_tree();
    let ctx = tree.ctx(FakeRunner::new());
    let options = ThresholdOptions {
        thresholds: vec![],
        overlap: false,
    };
    let err = threshold::run(&ctx, ACQ, pairs(&[("A", "tp1")]), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Common(wmh_common::Error::InvalidInput(_))));
}

#[test]
fn test_prepare_locate_splits_by_manual_label() {
    let tree = threshold_tree();
    tree.manual_mask(ACQ, "A", "tp1");
    let pairs = pairs(&[("A", "tp1"), ("B", "tp1")]);

    let layout = locate::prepare_locate(&tree.config, ACQ, &pairs, "v-test").unwrap();
    assert_eq!(layout.training, pairs[..1].to_vec());
    assert_eq!(layout.test, pairs[1..].to_vec());
    // Six features per session plus one manual label
    assert_eq!(layout.links.len(), 13);

    let locate_dir = tree.config.stage_dir(Stage::Locate, Some(ACQ));
    let label = locate_dir.join("training_subjects/sub-Ases-tp1_manualmask.nii.gz");
    assert!(label.symlink_metadata().unwrap().file_type().is_symlink());
    assert!(std::fs::read_link(&label).unwrap().is_relative());
    assert!(label.exists());
    assert!(locate_dir.join("test_subjects/sub-Bses-tp1_BIANCA_LPM.nii.gz").exists());
    assert!(locate_dir.join("test_subjects/sub-Bses-tp1_biancamask.nii.gz").exists());

    // Re-running replaces the links instead of failing on them
    let again = locate::prepare_locate(&tree.config, ACQ, &pairs, "v-test").unwrap();
    assert_eq!(again, layout);
}

#[test]
fn test_prepare_locate_moves_newly_labeled_session() {
    let tree = threshold_tree();
    let pairs = pairs(&[("A", "tp1")]);
    let locate_dir = tree.config.stage_dir(Stage::Locate, Some(ACQ));

    let before = locate::prepare_locate(&tree.config, ACQ, &pairs, "v-test").unwrap();
    assert_eq!(before.test, pairs);
    assert!(locate_dir.join("test_subjects/sub-Ases-tp1_feature_FLAIR.nii.gz").exists());

    tree.manual_mask(ACQ, "A", "tp1");
    let after = locate::prepare_locate(&tree.config, ACQ, &pairs, "v-test").unwrap();
    assert_eq!(after.training, pairs);
    assert!(locate_dir.join("training_subjects/sub-Ases-tp1_feature_FLAIR.nii.gz").exists());
    let leftovers: Vec<_> = std::fs::read_dir(locate_dir.join("test_subjects"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sub-Ases-tp1"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_post_locate_masks_lesion_map() {
    let tree = threshold_tree();
    let pairs = pairs(&[("B", "tp1")]);
    locate::prepare_locate(&tree.config, ACQ, &pairs, "v-test").unwrap();
    let locate_dir = tree.config.stage_dir(Stage::Locate, Some(ACQ));
    touch(
        &locate_dir,
        "test_subjects/LOCATE_results_directory/sub-Bses-tp1_BIANCA_LOCATE_binarylesionmap.nii.gz",
    );

    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());
    post_locate::run(&ctx, ACQ, pairs).await.unwrap();

    assert!(anat(&tree, Stage::PostLocateMasking, "B", "tp1")
        .join("sub-B_ses-tp1_desc-biancaMasked_locateBinaryLesionMap.nii.gz")
        .exists());
    let calls = runner.calls_to("fslmaths");
    assert_eq!(calls.len(), 1);
    assert!(calls[0].args[0].ends_with("_BIANCA_LOCATE_binarylesionmap.nii.gz"));
    assert!(calls[0].args[2].ends_with("sub-Bses-tp1_biancamask.nii.gz"));
}

#[tokio::test]
async fn test_intnorm_uses_brain_intensity_range() {
    let tree = TestTree::new();
    tree.prepared_flair(ACQ, "A", "tp1");
    let runner = FakeRunner::new();
    let graph = tree.path().join("graphs/intnorm.dot");
    let ctx = tree.ctx(runner.clone()).with_graph_out(Some(graph.clone()));

    intnorm::run(&ctx, ACQ, pairs(&[("A", "tp1")])).await.unwrap();

    let normalize: Vec<_> = runner
        .calls_to("fslmaths")
        .into_iter()
        .filter(|c| c.args.iter().any(|a| a == "-div"))
        .collect();
    assert_eq!(normalize.len(), 1);
    assert_eq!(normalize[0].args[1..5], ["-sub", "0", "-div", "812.5"]);
    assert!(anat(&tree, Stage::PrepareFlairIntNorm, "A", "tp1")
        .join("sub-A_ses-tp1_acq-3D_run-1_FLAIR_biascorrIntNorm.nii.gz")
        .exists());

    let dot = std::fs::read_to_string(graph).unwrap();
    assert!(dot.starts_with("digraph \"prepare_flair_intNorm\""));
    assert!(dot.contains("\"img_range\" -> \"flair_normalized\""));
}

#[tokio::test]
async fn test_rerun_reuses_tool_results() {
    let tree = TestTree::new();
    tree.prepared_flair(ACQ, "A", "tp1");
    let runner = FakeRunner::new();
    let ctx = tree.ctx(runner.clone());

    intnorm::run(&ctx, ACQ, pairs(&[("A", "tp1")])).await.unwrap();
    let first = runner.calls().len();
    let summary = intnorm::run(&ctx, ACQ, pairs(&[("A", "tp1")])).await.unwrap();

    assert_eq!(runner.calls().len(), first);
    assert!(summary.cached >= 2);
}
