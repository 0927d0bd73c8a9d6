//! Worker-pool executor for expanded stage graphs
//!
//! Instances become ready once every upstream instance of their own branch
//! has finished. A bounded set of ready instances runs concurrently: the pool
//! is seeded up to the worker budget and refilled as each instance completes.
//!
//! A failed instance writes a crash dump and blocks its dependents; siblings
//! keep running. Cancellation stops new instances from starting while
//! in-flight ones finish.
//!
//! Cached results are keyed on the size and modification time of every input
//! file, not only its path. A cacheable instance that recomputed in this run
//! also forces its direct dependents to recompute.

use crate::error::{Error, Result, StageError};
use crate::graph::{BranchKey, ExecutionPlan, Instance, StageGraph};
use crate::tools::{CommandRunner, Outputs, PortValue, StageAction, StageContext, COMMAND_FILE};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cached result of a successful instance
pub const RESULT_FILE: &str = "_result.json";

/// Final state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Succeeded,
    Cached,
    Failed,
    /// An upstream instance of the same branch failed
    Blocked,
    /// Never started because the run was cancelled
    Cancelled,
}

/// Outcome of one instance
#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub stage: String,
    pub key: BranchKey,
    pub state: InstanceState,
    pub outputs: Outputs,
    pub error: Option<String>,
    pub crash_dump: Option<PathBuf>,
}

/// End-of-run summary
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub workflow: String,
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub crash_dumps: Vec<PathBuf>,
    pub results: Vec<InstanceResult>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.cancelled == 0
    }

    /// Results of every instance of one stage
    pub fn outputs_of<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a InstanceResult> + 'a {
        self.results.iter().filter(move |r| r.stage == stage)
    }

    /// Turn failed or cancelled runs into an error
    pub fn into_result(self) -> Result<Self> {
        if self.failed > 0 {
            return Err(Error::Common(wmh_common::Error::BranchExecutionFailure {
                failed: self.failed,
                total: self.total(),
            }));
        }
        if self.cancelled > 0 {
            return Err(Error::Cancelled {
                pending: self.cancelled,
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedResult {
    hash: String,
    outputs: Outputs,
}

#[derive(Debug, Serialize)]
struct CrashDump<'a> {
    workflow: &'a str,
    stage: &'a str,
    branch: BTreeMap<&'a str, &'a str>,
    error: String,
    command: Option<&'a str>,
    exit_status: Option<i32>,
    stderr_tail: Option<&'a str>,
    work_dir: &'a Path,
    timestamp: String,
}

/// Runs plans with a bounded number of concurrent instances
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    n_workers: usize,
    work_dir: PathBuf,
    crash_dir: PathBuf,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        n_workers: usize,
        work_dir: PathBuf,
        crash_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            n_workers: n_workers.max(1),
            work_dir,
            crash_dir,
            cancel,
        }
    }

    /// Working directory of one instance: `<work_dir>/<branch slug>/<stage>`
    pub fn instance_dir(&self, instance: &Instance) -> PathBuf {
        self.work_dir.join(instance.key.slug()).join(&instance.stage_name)
    }

    /// Execute every instance of the plan
    ///
    /// Never fails because of a stage: per-instance failures are recorded in
    /// the summary. Use [`RunSummary::into_result`] for the overall verdict.
    pub async fn run(&self, workflow: &str, graph: &StageGraph, plan: &ExecutionPlan) -> RunSummary {
        let n = plan.len();
        info!(
            workflow = %workflow,
            instances = n,
            stages = graph.len(),
            workers = self.n_workers,
            "Starting workflow"
        );

        let mut states = vec![InstanceState::Pending; n];
        let mut outputs: Vec<Outputs> = vec![Outputs::new(); n];
        let mut errors: Vec<Option<String>> = vec![None; n];
        let mut dumps: Vec<Option<PathBuf>> = vec![None; n];
        let mut recomputed = vec![false; n];
        let mut remaining: Vec<usize> = plan.instances().iter().map(|i| i.deps.len()).collect();
        let mut ready: VecDeque<usize> = plan
            .instances()
            .iter()
            .filter(|i| i.deps.is_empty())
            .map(|i| i.id)
            .collect();

        let mut tasks = FuturesUnordered::new();
        let mut cancel_seen = false;

        loop {
            // Keep the pool full
            while !self.cancel.is_cancelled() && tasks.len() < self.n_workers {
                let Some(id) = ready.pop_front() else {
                    break;
                };
                let Some(instance) = plan.get(id) else {
                    continue;
                };
                let Some(spec) = graph.stages().get(instance.stage) else {
                    continue;
                };
                let inputs = gather_inputs(plan, instance, &spec.inputs, &outputs);
                let ctx = StageContext {
                    stage: instance.stage_name.clone(),
                    key: instance.key.clone(),
                    inputs,
                    work_dir: self.instance_dir(instance),
                    runner: Arc::clone(&self.runner),
                };
                let action = Arc::clone(&spec.action);
                let force = instance.deps.iter().any(|&d| recomputed[d]);
                tasks.push(async move {
                    let result = execute(&ctx, action.as_ref(), force).await;
                    (id, ctx, result)
                });
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!(
                        workflow = %workflow,
                        in_flight = tasks.len(),
                        "Cancellation requested, waiting for running stage instances"
                    );
                }
                Some((id, ctx, result)) = tasks.next() => {
                    match result {
                        Ok((out, cached)) => {
                            states[id] = if cached { InstanceState::Cached } else { InstanceState::Succeeded };
                            debug!(stage = %ctx.stage, branch = %ctx.key, cached, "Stage instance finished");
                            outputs[id] = out;
                            recomputed[id] = !cached
                                && plan
                                    .get(id)
                                    .and_then(|i| graph.stages().get(i.stage))
                                    .is_some_and(|spec| spec.action.cacheable());
                            for &d in plan.dependents(id) {
                                remaining[d] = remaining[d].saturating_sub(1);
                                if remaining[d] == 0 && states[d] == InstanceState::Pending {
                                    ready.push_back(d);
                                }
                            }
                        }
                        Err(err) => {
                            states[id] = InstanceState::Failed;
                            let dump = self.write_crash_dump(workflow, &ctx, &err).await;
                            let dump_path = dump
                                .as_deref()
                                .map(|p| p.display().to_string())
                                .unwrap_or_default();
                            error!(
                                workflow = %workflow,
                                stage = %ctx.stage,
                                branch = %ctx.key,
                                crash_dump = %dump_path,
                                "Stage instance failed: {}",
                                err
                            );
                            errors[id] = Some(err.to_string());
                            dumps[id] = dump;
                            block_dependents(plan, id, &mut states);
                        }
                    }
                }
                else => break,
            }
        }

        for state in states.iter_mut() {
            if *state == InstanceState::Pending {
                *state = InstanceState::Cancelled;
            }
        }

        let results: Vec<InstanceResult> = plan
            .instances()
            .iter()
            .map(|i| InstanceResult {
                stage: i.stage_name.clone(),
                key: i.key.clone(),
                state: states[i.id],
                outputs: std::mem::take(&mut outputs[i.id]),
                error: errors[i.id].take(),
                crash_dump: dumps[i.id].take(),
            })
            .collect();

        let count = |s: InstanceState| states.iter().filter(|&&x| x == s).count();
        let summary = RunSummary {
            workflow: workflow.to_string(),
            succeeded: count(InstanceState::Succeeded),
            cached: count(InstanceState::Cached),
            failed: count(InstanceState::Failed),
            blocked: count(InstanceState::Blocked),
            cancelled: count(InstanceState::Cancelled),
            crash_dumps: results.iter().filter_map(|r| r.crash_dump.clone()).collect(),
            results,
        };

        info!(
            workflow = %workflow,
            succeeded = summary.succeeded,
            cached = summary.cached,
            failed = summary.failed,
            blocked = summary.blocked,
            cancelled = summary.cancelled,
            "Workflow finished"
        );
        summary
    }

    async fn write_crash_dump(&self, workflow: &str, ctx: &StageContext, err: &StageError) -> Option<PathBuf> {
        let now = chrono::Utc::now();
        let name = format!(
            "crash-{}-{}-{}.json",
            now.format("%Y%m%dT%H%M%S"),
            ctx.stage,
            Uuid::new_v4()
        );
        let path = self.crash_dir.join(name);
        let dump = CrashDump {
            workflow,
            stage: &ctx.stage,
            branch: ctx.key.values().collect(),
            error: err.to_string(),
            command: err.command(),
            exit_status: err.exit_status(),
            stderr_tail: err.stderr_tail(),
            work_dir: &ctx.work_dir,
            timestamp: now.to_rfc3339(),
        };

        let written = async {
            tokio::fs::create_dir_all(&self.crash_dir).await?;
            let body = serde_json::to_vec_pretty(&dump)?;
            tokio::fs::write(&path, body).await?;
            Ok::<_, StageError>(())
        }
        .await;

        match written {
            Ok(()) => Some(path),
            Err(e) => {
                error!(path = %path.display(), "Failed to write crash dump: {}", e);
                None
            }
        }
    }
}

/// Collect the upstream outputs an instance consumes
fn gather_inputs(
    plan: &ExecutionPlan,
    instance: &Instance,
    edges: &[crate::graph::Edge],
    outputs: &[Outputs],
) -> Outputs {
    let mut inputs = Outputs::new();
    for edge in edges {
        let value = instance
            .deps
            .iter()
            .filter_map(|&d| plan.get(d))
            .find(|up| up.stage_name == edge.from_stage)
            .and_then(|up| outputs.get(up.id))
            .and_then(|out| out.get(&edge.from_port))
            .cloned()
            .unwrap_or(PortValue::Absent);
        inputs.insert(edge.to_port.clone(), value);
    }
    inputs
}

/// Mark every transitive dependent that has not run as blocked
fn block_dependents(plan: &ExecutionPlan, failed: usize, states: &mut [InstanceState]) {
    let mut queue: VecDeque<usize> = plan.dependents(failed).iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if states[id] == InstanceState::Pending {
            states[id] = InstanceState::Blocked;
            queue.extend(plan.dependents(id).iter().copied());
        }
    }
}

/// Run one instance, reusing a cached result when inputs are unchanged
///
/// `force` skips the lookup when an upstream instance recomputed in this run.
async fn execute(
    ctx: &StageContext,
    action: &dyn StageAction,
    force: bool,
) -> std::result::Result<(Outputs, bool), StageError> {
    tokio::fs::create_dir_all(&ctx.work_dir).await?;

    let hash = if action.cacheable() {
        let hash = input_hash(ctx, action).await?;
        let cached = if force {
            None
        } else {
            load_cached(&ctx.work_dir, &hash).await
        };
        if let Some(outputs) = cached {
            debug!(stage = %ctx.stage, branch = %ctx.key, "Reusing cached result");
            return Ok((outputs, true));
        }
        Some(hash)
    } else {
        None
    };

    match tokio::fs::remove_file(ctx.work_dir.join(COMMAND_FILE)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let outputs = action.run(ctx).await?;

    if let Some(hash) = hash {
        let cached = CachedResult {
            hash,
            outputs: outputs.clone(),
        };
        tokio::fs::write(ctx.work_dir.join(RESULT_FILE), serde_json::to_vec_pretty(&cached)?).await?;
    }
    Ok((outputs, false))
}

/// SHA-256 over stage name, action parameters, branch, resolved inputs and
/// the size and mtime of each input file
pub async fn input_hash(ctx: &StageContext, action: &dyn StageAction) -> std::result::Result<String, StageError> {
    let mut hasher = Sha256::new();
    hasher.update(ctx.stage.as_bytes());
    hasher.update([0]);
    hasher.update(action.fingerprint().as_bytes());
    hasher.update([0]);
    hasher.update(ctx.key.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(&ctx.inputs)?);
    for value in ctx.inputs.values() {
        if let PortValue::Path(path) = value {
            hasher.update([0]);
            hasher.update(file_stamp(path).await.as_bytes());
        }
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// `<size>:<mtime ns>`, or `missing` when the file cannot be read
async fn file_stamp(path: &Path) -> String {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return "missing".to_string();
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("{}:{}", meta.len(), mtime)
}

async fn load_cached(work_dir: &Path, hash: &str) -> Option<Outputs> {
    let body = tokio::fs::read(work_dir.join(RESULT_FILE)).await.ok()?;
    let cached: CachedResult = serde_json::from_slice(&body).ok()?;
    if cached.hash != hash {
        return None;
    }
    let complete = cached.outputs.values().all(|v| match v {
        PortValue::Path(p) => p.exists(),
        _ => true,
    });
    complete.then_some(cached.outputs)
}
