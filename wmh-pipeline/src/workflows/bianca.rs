//! Lesion probability maps with BIANCA, one branch per query row
//!
//! The masterfile and the partition are fixed before the graph is built. Each
//! query branch carries its zero-based row, the one-based subject number the
//! classifier expects and the ordinals of its effective training set, so the
//! query is never part of its own training data.

use super::{sink, WorkflowContext, IN_PORT, SOURCE_PORT};
use crate::cohort::{partition, to_ordinals, ClassifierSource, CohortSelection, Partition};
use crate::error::{Result, StageError};
use crate::executor::RunSummary;
use crate::graph::{IterableGroup, IterationSpace, StageSpec};
use crate::masterfile;
use crate::tools::{invoke, DataSink, FnStep, Outputs, PortValue, StageAction, StageContext, ToolInvocation};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use wmh_common::manifest::{
    Manifest, BRAINMASK_FEATURE_NUM, FEATURE_SUBSET, LABEL_FEATURE_NUM, MASTERFILE, MAT_FEATURE_NUM,
};
use wmh_common::naming::{derivatives, Stage};
use wmh_common::resolver::glob_sorted;
use wmh_common::Error;

pub const WORKFLOW: &str = "bianca";

/// Iteration group of query rows
pub const QUERY: &str = "query";

const QUERY_INFO: &str = "query_info";
const BIANCA: &str = "bianca";

const OUTPUT_BASENAME: &str = "output_bianca";
const CLASSIFIER_FILE: &str = "classifier";
const CLASSIFIER_LABELS_FILE: &str = "classifier_labels";

/// Command-line arguments of one BIANCA run
///
/// `training_nums` are one-based ordinals; they are ignored when a pretrained
/// classifier is loaded.
pub fn bianca_args(
    masterfile: &Path,
    query_num: &str,
    training_nums: &str,
    classifier: &ClassifierSource,
    work_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        format!("--singlefile={}", masterfile.display()),
        format!("--featuresubset={FEATURE_SUBSET}"),
        format!("--brainmaskfeaturenum={BRAINMASK_FEATURE_NUM}"),
        format!("--matfeaturenum={MAT_FEATURE_NUM}"),
    ];
    match classifier {
        ClassifierSource::Train { save } => {
            args.push(format!("--labelfeaturenum={LABEL_FEATURE_NUM}"));
            args.push(format!("--trainingnums={training_nums}"));
            args.push(format!("--querysubjectnum={query_num}"));
            if *save {
                args.push(format!(
                    "--saveclassifierdata={}",
                    work_dir.join(CLASSIFIER_FILE).display()
                ));
            }
        }
        ClassifierSource::Pretrained(file) => {
            args.push(format!("--querysubjectnum={query_num}"));
            args.push(format!("--loadclassifierdata={}", file.display()));
        }
    }
    args.push("-o".to_string());
    args.push(work_dir.join(OUTPUT_BASENAME).display().to_string());
    args.push("-v".to_string());
    args
}

/// Query group: row index, classifier subject number and effective training ordinals in lockstep
pub fn query_group(partition: &Partition) -> std::result::Result<IterableGroup, crate::error::GraphError> {
    let mut index = Vec::new();
    let mut num = Vec::new();
    let mut training = Vec::new();
    for &q in &partition.query {
        index.push(q.to_string());
        num.push((q + 1).to_string());
        training.push(to_ordinals(&partition.effective_training(q)));
    }
    IterableGroup::synchronized(
        QUERY,
        vec![("query_index", index), ("query_num", num), ("training_nums", training)],
    )
}

/// Runs the classifier for one query row
pub struct BiancaStep {
    masterfile: PathBuf,
    classifier: ClassifierSource,
}

#[async_trait]
impl StageAction for BiancaStep {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Outputs, StageError> {
        let query_num = ctx.value("query_num")?;
        let training_nums = ctx.value("training_nums")?;
        if matches!(self.classifier, ClassifierSource::Train { .. }) && training_nums.is_empty() {
            return Err(StageError::Precondition(format!(
                "query subject {query_num} has no training subjects besides itself"
            )));
        }

        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let invocation = ToolInvocation {
            program: "bianca".to_string(),
            args: bianca_args(
                &self.masterfile,
                query_num,
                training_nums,
                &self.classifier,
                &ctx.work_dir,
            ),
            cwd: ctx.work_dir.clone(),
        };
        invoke(ctx, &invocation).await?;

        let mut expected = vec![("out_file", format!("{OUTPUT_BASENAME}.nii.gz"))];
        if matches!(self.classifier, ClassifierSource::Train { save: true }) {
            expected.push(("classifier_file", CLASSIFIER_FILE.to_string()));
            expected.push(("classifier_labels_file", CLASSIFIER_LABELS_FILE.to_string()));
        }

        let mut outputs = Outputs::new();
        for (port, file) in expected {
            let path = ctx.work_dir.join(file);
            if !path.exists() {
                return Err(StageError::MissingOutput {
                    command: invocation.command_line(),
                    path,
                });
            }
            outputs.insert(port.to_string(), PortValue::Path(path));
        }
        Ok(outputs)
    }

    fn fingerprint(&self) -> String {
        format!("bianca {} {:?}", self.masterfile.display(), self.classifier)
    }
}

/// Query flair plus the JSON sidecar describing how its map was produced
fn query_info(manifest: Arc<Manifest>, masterfile: PathBuf, classifier: ClassifierSource) -> FnStep {
    FnStep::new(QUERY_INFO, move |ctx| {
        let index: usize = ctx
            .value("query_index")?
            .parse()
            .map_err(|e| StageError::Precondition(format!("bad query index: {e}")))?;
        let row = manifest
            .get(index)
            .ok_or_else(|| StageError::Precondition(format!("query row {index} is not in the masterfile")))?;

        let mut meta = json!({
            "masterfile": masterfile.display().to_string(),
            "query_subject_session": [row.subject, row.session],
            "query_flair": row.flair.display().to_string(),
        });
        match &classifier {
            ClassifierSource::Train { .. } => {
                let training: Vec<[&str; 2]> = ctx
                    .value("training_nums")?
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .filter_map(|t| t.parse::<usize>().ok())
                    .filter_map(|n| manifest.get(n.saturating_sub(1)))
                    .map(|r| [r.subject.as_str(), r.session.as_str()])
                    .collect();
                meta["training_subjects_sessions"] = json!(training);
            }
            ClassifierSource::Pretrained(file) => {
                meta["classifier_file"] = json!(file.display().to_string());
            }
        }

        let mut out = Outputs::new();
        out.insert("query_flair".to_string(), PortValue::Path(row.flair.clone()));
        out.insert("meta".to_string(), PortValue::Text(serde_json::to_string_pretty(&meta)?));
        Ok(out)
    })
}

pub fn stages(ctx: &WorkflowContext<'_>, acq: &str, manifest: Arc<Manifest>, partition: &Partition) -> Vec<StageSpec> {
    let over = [QUERY];
    let bianca_dir = ctx.config.stage_dir(Stage::Bianca, Some(acq));
    let masterfile = bianca_dir.join(MASTERFILE);
    let root = ctx.config.derivatives_root(Stage::Bianca, Some(acq));
    let classifier = partition.classifier.clone();

    let mut specs = vec![
        StageSpec::new(
            QUERY_INFO,
            Arc::new(query_info(manifest, masterfile.clone(), classifier.clone())),
        )
        .over(&over)
        .outputs(&["query_flair", "meta"]),
        StageSpec::new(
            BIANCA,
            Arc::new(BiancaStep {
                masterfile,
                classifier: classifier.clone(),
            }),
        )
        .over(&over)
        .outputs(&["out_file", "classifier_file", "classifier_labels_file"]),
        sink(
            "ds_lpm",
            DataSink::new(Stage::Bianca, &root, SOURCE_PORT, IN_PORT, derivatives::flair_lpm()).with_meta("meta"),
            &over,
            (QUERY_INFO, "query_flair"),
            (BIANCA, "out_file"),
        )
        .input(QUERY_INFO, "meta", "meta"),
    ];

    if matches!(classifier, ClassifierSource::Train { save: true }) {
        specs.push(sink(
            "ds_clf",
            DataSink::new(Stage::Bianca, &root, SOURCE_PORT, IN_PORT, derivatives::flair_classifier()),
            &over,
            (QUERY_INFO, "query_flair"),
            (BIANCA, "classifier_file"),
        ));
        specs.push(sink(
            "ds_clf_labels",
            DataSink::new(
                Stage::Bianca,
                &root,
                SOURCE_PORT,
                IN_PORT,
                derivatives::flair_classifier_labels(),
            ),
            &over,
            (QUERY_INFO, "query_flair"),
            (BIANCA, "classifier_labels_file"),
        ));
    }
    specs
}

/// Build the `acq` masterfile from the prepared FLAIR tree into the BIANCA directory
pub fn prepare_masterfile(ctx: &WorkflowContext<'_>, acq: &str) -> Result<Manifest> {
    let config = ctx.config;
    let bianca_dir = config.stage_dir(Stage::Bianca, Some(acq));
    let manifest = masterfile::build(
        &config.stage_dir(Stage::PrepareFlair, Some(acq)),
        config.training_data_dir()?,
        &bianca_dir,
        &config.masterfile,
        acq,
    )?;
    ctx.export_version(&bianca_dir)?;
    Ok(manifest)
}

/// Classify the query rows of the `acq` masterfile
pub async fn run(ctx: &WorkflowContext<'_>, acq: &str, selection: &CohortSelection) -> Result<RunSummary> {
    let bianca_dir = ctx.config.stage_dir(Stage::Bianca, Some(acq));
    let manifest = Arc::new(Manifest::read_from_dir(&bianca_dir)?);
    let (mode, explicit_query) = selection.resolve()?;
    let partition = partition(&manifest, &mode, explicit_query.as_deref())?;
    ctx.export_version(&bianca_dir)?;

    info!(
        acq = %acq,
        rows = manifest.len(),
        training = partition.training.len(),
        query = partition.query.len(),
        "Running BIANCA"
    );

    let space = IterationSpace::new(vec![query_group(&partition)?])?;
    let specs = stages(ctx, acq, manifest, &partition);
    ctx.run_graph(WORKFLOW, Some(acq), specs, space).await
}

/// Copy one query row's saved classifier into `clf_dir` as a reusable pretrained classifier
///
/// The `sub-<s>_ses-<ss>_` prefix is stripped, leaving names such as
/// `acq-3D_run-1_FLAIR_classifier`.
pub fn export_classifier(
    bianca_dir: &Path,
    manifest: &Manifest,
    query: usize,
    clf_dir: &Path,
) -> wmh_common::Result<Vec<PathBuf>> {
    let row = manifest.get(query).ok_or_else(|| {
        Error::InvalidInput(format!(
            "query row {query} is out of range for a manifest of {} rows",
            manifest.len()
        ))
    })?;
    let prefix = format!("sub-{}_ses-{}_", row.subject, row.session);
    let pattern = bianca_dir
        .join(format!("sub-{}", row.subject))
        .join(format!("ses-{}", row.session))
        .join("anat")
        .join(format!("{prefix}*"));
    let files = glob_sorted(&pattern.to_string_lossy())?;
    if !files.iter().any(|f| f.to_string_lossy().ends_with("_FLAIR_classifier")) {
        return Err(Error::MissingFile(pattern));
    }

    std::fs::create_dir_all(clf_dir)?;
    let mut copied = Vec::with_capacity(files.len());
    for file in files {
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let stripped = name.strip_prefix(&prefix).unwrap_or(&name);
        let dest = clf_dir.join(stripped);
        std::fs::copy(&file, &dest)?;
        debug!(from = %file.display(), to = %dest.display(), "Exported classifier file");
        copied.push(dest);
    }
    info!(query, files = copied.len(), clf_dir = %clf_dir.display(), "Exported classifier");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_args_for_training_run() {
        let args = bianca_args(
            Path::new("/o/2D/bianca/masterfile.txt"),
            "2",
            "1,3",
            &ClassifierSource::Train { save: true },
            Path::new("/wd"),
        );
        assert_eq!(args[0], "--singlefile=/o/2D/bianca/masterfile.txt");
        assert!(args.contains(&"--featuresubset=1,2".to_string()));
        assert!(args.contains(&"--brainmaskfeaturenum=2".to_string()));
        assert!(args.contains(&"--labelfeaturenum=3".to_string()));
        assert!(args.contains(&"--trainingnums=1,3".to_string()));
        assert!(args.contains(&"--querysubjectnum=2".to_string()));
        assert!(args.contains(&"--saveclassifierdata=/wd/classifier".to_string()));
        assert_eq!(args[args.len() - 3..], ["-o", "/wd/output_bianca", "-v"]);
    }

    #[test]
    fn test_args_for_pretrained_run_omit_training() {
        let args = bianca_args(
            Path::new("/m.txt"),
            "1",
            "",
            &ClassifierSource::Pretrained(PathBuf::from("/clf/acq-3D_run-1_FLAIR_classifier")),
            Path::new("/wd"),
        );
        assert!(args.iter().all(|a| !a.starts_with("--trainingnums")));
        assert!(args.iter().all(|a| !a.starts_with("--labelfeaturenum")));
        assert!(args.contains(&"--loadclassifierdata=/clf/acq-3D_run-1_FLAIR_classifier".to_string()));
    }

    #[test]
    fn test_query_group_excludes_self_from_training() {
        let p = Partition {
            training: BTreeSet::from([0, 2]),
            query: BTreeSet::from([0, 1, 2]),
            classifier: ClassifierSource::Train { save: false },
        };
        let group = query_group(&p).unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(p.effective_training(0), BTreeSet::from([2]));
        assert_eq!(to_ordinals(&p.effective_training(1)), "1,3");
    }
}
