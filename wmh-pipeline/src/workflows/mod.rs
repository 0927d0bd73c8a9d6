//! Concrete processing workflows
//!
//! Each workflow declares a list of [`StageSpec`]s over its iteration groups
//! and hands them to [`WorkflowContext::run_graph`], which validates the
//! graph, optionally exports it as DOT, expands it per branch and runs it on
//! the worker pool.
//!
//! Conventions shared by every workflow:
//! - lookups are in-process [`FnStep`]s resolving [`PathTemplate`]s, so
//!   ambiguity surfaces as a branch failure with a crash dump
//! - derivatives reach the output tree only through [`DataSink`] stages
//! - every output directory gets a `pipeline_version.txt`

pub mod bianca;
pub mod check;
pub mod flair;
pub mod intnorm;
pub mod locate;
pub mod norm;
pub mod post_locate;
pub mod t1w;
pub mod template;
pub mod threshold;

use crate::error::{GraphError, Result, StageError};
use crate::executor::{Executor, RunSummary};
use crate::graph::{IterableGroup, IterationSpace, StageGraph, StageSpec};
use crate::tools::{render_name, CommandRunner, DataSink, FnStep, Outputs, PortValue, StageContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wmh_common::config::RunConfig;
use wmh_common::discovery::{discover_subject_sessions, restrict_subjects, SubjectSession};
use wmh_common::resolver::{OnEmpty, PathResolver};
use wmh_common::version::export_version;
use wmh_common::{Bindings, PathTemplate};

/// Input port of a sink carrying the file whose entities name the copy
pub const SOURCE_PORT: &str = "source";
/// Input port of a sink carrying the file to copy
pub const IN_PORT: &str = "in_file";

/// Iteration group of synchronized subject/session pairs
pub const CASE: &str = "case";
/// Iteration group of subjects (longitudinal templates)
pub const SUBJECT: &str = "subject";

/// Everything a workflow needs besides its own parameters
pub struct WorkflowContext<'a> {
    pub config: &'a RunConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancellationToken,
    /// Provenance label written to every output directory
    pub version: String,
    /// Write the stage graph as DOT to this file before running
    pub graph_out: Option<PathBuf>,
}

impl<'a> WorkflowContext<'a> {
    pub fn new(config: &'a RunConfig, runner: Arc<dyn CommandRunner>, cancel: CancellationToken, version: String) -> Self {
        Self {
            config,
            runner,
            cancel,
            version,
            graph_out: None,
        }
    }

    pub fn with_graph_out(mut self, path: Option<PathBuf>) -> Self {
        self.graph_out = path;
        self
    }

    /// Subject/session pairs with a FLAIR of `acq`, restricted to configured subjects
    pub fn subject_sessions(&self, acq: &str) -> Result<Vec<SubjectSession>> {
        let pairs = discover_subject_sessions(&self.config.bids_dir, acq)?;
        Ok(restrict_subjects(pairs, &self.config.subjects))
    }

    /// Record the pipeline version in an output directory
    pub fn export_version(&self, out_dir: &Path) -> Result<()> {
        export_version(out_dir, &self.version)?;
        Ok(())
    }

    /// Validate, plan and execute one workflow
    pub async fn run_graph(
        &self,
        workflow: &str,
        acq: Option<&str>,
        specs: Vec<StageSpec>,
        space: IterationSpace,
    ) -> Result<RunSummary> {
        let graph = StageGraph::build(specs)?;
        if let Some(path) = &self.graph_out {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, graph.to_dot(workflow)).await?;
            info!(workflow = %workflow, path = %path.display(), "Wrote stage graph");
        }
        let plan = graph.plan(&space)?;

        let executor = Executor::new(
            Arc::clone(&self.runner),
            self.config.n_cpu,
            self.config.workflow_work_dir(workflow, acq),
            self.config.workflow_crash_dir(workflow, acq),
            self.cancel.clone(),
        );
        executor.run(workflow, &graph, &plan).await.into_result()
    }
}

/// Synchronized subject/session group
pub fn case_group(pairs: &[SubjectSession]) -> std::result::Result<IterableGroup, GraphError> {
    let (subjects, sessions): (Vec<String>, Vec<String>) = pairs.iter().cloned().unzip();
    IterableGroup::synchronized(CASE, vec![("subject", subjects), ("session", sessions)])
}

/// One file looked up per branch and published on `port`
#[derive(Debug, Clone)]
pub struct Lookup {
    pub port: String,
    pub root: PathBuf,
    pub template: PathTemplate,
    pub on_empty: OnEmpty,
}

impl Lookup {
    /// Lookup that fails the branch when nothing matches
    pub fn required(port: &str, root: &Path, template: &str) -> wmh_common::Result<Self> {
        Ok(Self {
            port: port.to_string(),
            root: root.to_path_buf(),
            template: PathTemplate::parse(template)?,
            on_empty: OnEmpty::Raise,
        })
    }

    /// Lookup whose absence is published as [`PortValue::Absent`]
    pub fn optional(port: &str, root: &Path, template: &str) -> wmh_common::Result<Self> {
        Ok(Self {
            on_empty: OnEmpty::Allow,
            ..Self::required(port, root, template)?
        })
    }

    fn resolve(&self, ctx: &StageContext, acq: Option<&str>) -> std::result::Result<PortValue, StageError> {
        let bindings = Bindings {
            subject: ctx.key.get("subject"),
            session: ctx.key.get("session"),
            acq,
        };
        let found = PathResolver::new(self.root.clone()).resolve(&self.template, &bindings, self.on_empty)?;
        Ok(found.map_or(PortValue::Absent, PortValue::Path))
    }
}

/// Stage resolving every lookup for the branch
pub fn grabber(name: &str, over: &[&str], acq: Option<&str>, lookups: Vec<Lookup>) -> StageSpec {
    let outputs: Vec<String> = lookups.iter().map(|l| l.port.clone()).collect();
    let acq = acq.map(str::to_string);
    let step = FnStep::new(name, move |ctx| {
        let mut out = Outputs::new();
        for lookup in &lookups {
            out.insert(lookup.port.clone(), lookup.resolve(ctx, acq.as_deref())?);
        }
        Ok(out)
    });
    let mut spec = StageSpec::new(name, Arc::new(step)).over(over);
    spec.outputs = outputs;
    spec
}

/// Stage publishing a synthetic BIDS file name that sinks take their entities from
///
/// `pattern` uses `{field}` for branch values, e.g. `sub-{subject}_ses-{session}_T1w.nii.gz`.
/// The file never has to exist.
pub fn source_file(name: &str, over: &[&str], root: &Path, pattern: &str) -> StageSpec {
    let root = root.to_path_buf();
    let pattern = pattern.to_string();
    let step = FnStep::new(name, move |ctx| {
        let mut out = Outputs::new();
        out.insert(
            SOURCE_PORT.to_string(),
            PortValue::Path(root.join(render_name(&pattern, &ctx.key))),
        );
        Ok(out)
    });
    StageSpec::new(name, Arc::new(step))
        .over(over)
        .outputs(&[SOURCE_PORT])
}

/// Sink stage wired to a source-name port and a file port
pub fn sink(name: &str, action: DataSink, over: &[&str], source: (&str, &str), file: (&str, &str)) -> StageSpec {
    StageSpec::new(name, Arc::new(action))
        .over(over)
        .input(source.0, source.1, SOURCE_PORT)
        .input(file.0, file.1, IN_PORT)
        .outputs(&["out_file", "sidecar"])
}
