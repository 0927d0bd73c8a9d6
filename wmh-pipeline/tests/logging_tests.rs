//! Structured logging of runs: failures, summaries, incomplete outputs

mod helpers;

use helpers::log_capture::capture_logs;
use helpers::{pairs, touch, FakeRunner, TestTree};
use tracing::Level;
use wmh_common::naming::Stage;
use wmh_pipeline::workflows::{check, intnorm};

#[tokio::test]
async fn test_failed_instance_logs_stage_and_crash_dump() {
    let (logs, _guard) = capture_logs();
    let tree = TestTree::new();
    tree.prepared_flair("3D", "A", "tp1");
    let ctx = tree.ctx(FakeRunner::failing(|inv| inv.program == "fslstats"));

    let result = intnorm::run(&ctx, "3D", pairs(&[("A", "tp1")])).await;
    assert!(result.is_err());

    let failures = logs.matching(Level::ERROR, "Stage instance failed");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].field("stage"), Some("img_range"));
    assert_eq!(failures[0].field("branch"), Some("session=tp1,subject=A"));
    assert!(failures[0].field("crash_dump").unwrap().contains("crash-"));

    let summary = logs.matching(Level::INFO, "Workflow finished");
    assert_eq!(summary.last().unwrap().field("failed"), Some("1"));
    assert_eq!(summary.last().unwrap().field("blocked"), Some("2"));
}

#[test]
fn test_incomplete_outputs_are_warned_per_session() {
    let (logs, _guard) = capture_logs();
    let tree = TestTree::new();
    let stage_dir = tree.config.stage_dir(Stage::BiancaThreshold, Some("3D"));
    touch(&stage_dir, "sub-A/ses-tp1/anat/sub-A_ses-tp1_desc-thresh0.9_overlap.txt");

    let err = check::check_outputs(&stage_dir, &pairs(&[("A", "tp1"), ("B", "tp1"), ("C", "tp1")]), "*_overlap.txt");
    assert!(err.is_err());

    let warnings = logs.matching(Level::WARN, "Incomplete outputs");
    let subjects: Vec<_> = warnings.iter().filter_map(|w| w.field("subject")).collect();
    assert_eq!(subjects, vec!["B", "C"]);
    assert_eq!(warnings[0].field("expected"), Some("1"));
}
