//! External tool boundary and reusable stage actions
//!
//! Every stage instance is a [`StageAction`] run inside its own working
//! directory. Tools are started through a [`CommandRunner`] so tests can
//! substitute a fake that never spawns a process.
//!
//! Contract with an external tool:
//! - inputs are absolute paths that exist
//! - the working directory is writable and exclusive to the instance
//! - a non-zero exit status fails the instance
//! - documented output files must exist afterwards

use crate::error::StageError;
use crate::graph::BranchKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use wmh_common::naming::{name_for, BidsKey, Descriptor, Stage};
use wmh_common::resolver::create_relative_symlink;

/// File recording every command an instance ran
pub const COMMAND_FILE: &str = "command.txt";

const STDERR_TAIL_LINES: usize = 20;

/// Value travelling along an edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortValue {
    Path(PathBuf),
    Text(String),
    /// Optional lookup that found nothing (e.g. no manual mask)
    Absent,
}

/// Named outputs of one stage instance
pub type Outputs = BTreeMap<String, PortValue>;

/// Everything a stage instance sees while it runs
pub struct StageContext {
    pub stage: String,
    pub key: BranchKey,
    pub inputs: Outputs,
    pub work_dir: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
}

impl StageContext {
    pub fn input(&self, port: &str) -> Result<&PortValue, StageError> {
        self.inputs
            .get(port)
            .ok_or_else(|| StageError::MissingInput(port.to_string()))
    }

    /// A required path input
    pub fn input_path(&self, port: &str) -> Result<&Path, StageError> {
        match self.input(port)? {
            PortValue::Path(p) => Ok(p),
            _ => Err(StageError::MissingInput(port.to_string())),
        }
    }

    /// A path input that may legitimately be absent
    pub fn optional_path(&self, port: &str) -> Option<&Path> {
        match self.inputs.get(port) {
            Some(PortValue::Path(p)) => Some(p),
            _ => None,
        }
    }

    pub fn input_text(&self, port: &str) -> Result<String, StageError> {
        match self.input(port)? {
            PortValue::Text(t) => Ok(t.clone()),
            PortValue::Path(p) => Ok(p.display().to_string()),
            PortValue::Absent => Err(StageError::MissingInput(port.to_string())),
        }
    }

    /// Iteration value of this branch
    pub fn value(&self, field: &str) -> Result<&str, StageError> {
        self.key
            .get(field)
            .ok_or_else(|| StageError::Precondition(format!("branch has no '{field}' value")))
    }
}

/// One unit of work replicated over the branches of a stage
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError>;

    /// Whether results may be reused on a re-run with identical inputs
    fn cacheable(&self) -> bool {
        true
    }

    /// Stable description of the action's parameters, part of the cache hash
    fn fingerprint(&self) -> String;
}

/// A fully rendered command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ToolInvocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code; `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Starts external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput>;
}

/// Runs programs as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .output()
            .await?;
        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run one invocation, recording it and mapping failure to [`StageError`]
pub async fn invoke(ctx: &StageContext, invocation: &ToolInvocation) -> Result<ToolOutput, StageError> {
    let command = invocation.command_line();
    debug!(stage = %ctx.stage, branch = %ctx.key, command = %command, "Invoking tool");
    record_command(&invocation.cwd, &command).await?;

    let output = ctx
        .runner
        .run(invocation)
        .await
        .map_err(|source| StageError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

    if !output.success() {
        return Err(StageError::ToolFailed {
            command,
            status: output.status,
            stderr_tail: tail(&output.stderr, STDERR_TAIL_LINES),
        });
    }
    Ok(output)
}

async fn record_command(cwd: &Path, command: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(cwd).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(cwd.join(COMMAND_FILE))
        .await?;
    file.write_all(command.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Last `n` lines of a text
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Substitute `{field}` with the branch's iteration values
pub fn render_name(name: &str, key: &BranchKey) -> String {
    key.values()
        .fold(name.to_string(), |acc, (field, value)| {
            acc.replace(&format!("{{{field}}}"), value)
        })
}

/// Symlink an input into the working directory under a fixed name
async fn stage_file(src: &Path, dest: &Path) -> Result<(), StageError> {
    match tokio::fs::remove_file(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    create_relative_symlink(src, dest)?;
    Ok(())
}

/// One argument of a [`ToolStep`] command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Lit(String),
    /// Path or text arriving on an input port
    Input(String),
    /// `<prefix><input>`, e.g. `--in=`
    InputWith(String, String),
    /// Iteration value of the branch
    Key(String),
    KeyWith(String, String),
    /// File in the working directory (absolute on the command line)
    Output(String),
    OutputWith(String, String),
}

/// Declarative single-command stage
///
/// ```ignore
/// ToolStep::new("fslmaths")
///     .input("in_file")
///     .lit("-mas")
///     .input("mask")
///     .output("out_file", "masked.nii.gz");
/// ```
#[derive(Debug, Clone)]
pub struct ToolStep {
    program: String,
    args: Vec<Arg>,
    staged: Vec<(String, String)>,
    outputs: Vec<(String, String)>,
    stdout: Option<(String, String)>,
}

impl ToolStep {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            staged: Vec::new(),
            outputs: Vec::new(),
            stdout: None,
        }
    }

    pub fn lit(mut self, value: &str) -> Self {
        self.args.push(Arg::Lit(value.to_string()));
        self
    }

    pub fn lits(mut self, values: &[&str]) -> Self {
        self.args.extend(values.iter().map(|v| Arg::Lit(v.to_string())));
        self
    }

    pub fn input(mut self, port: &str) -> Self {
        self.args.push(Arg::Input(port.to_string()));
        self
    }

    pub fn input_with(mut self, prefix: &str, port: &str) -> Self {
        self.args.push(Arg::InputWith(prefix.to_string(), port.to_string()));
        self
    }

    pub fn key(mut self, field: &str) -> Self {
        self.args.push(Arg::Key(field.to_string()));
        self
    }

    pub fn key_with(mut self, prefix: &str, field: &str) -> Self {
        self.args.push(Arg::KeyWith(prefix.to_string(), field.to_string()));
        self
    }

    /// Output file passed on the command line and published on `port`
    pub fn output(mut self, port: &str, file: &str) -> Self {
        self.args.push(Arg::Output(file.to_string()));
        self.produces(port, file)
    }

    pub fn output_with(mut self, prefix: &str, port: &str, file: &str) -> Self {
        self.args.push(Arg::OutputWith(prefix.to_string(), file.to_string()));
        self.produces(port, file)
    }

    /// File in the working directory passed by absolute path, not published
    pub fn local(mut self, file: &str) -> Self {
        self.args.push(Arg::Output(file.to_string()));
        self
    }

    /// Output file the tool writes under a fixed name without being told
    pub fn produces(mut self, port: &str, file: &str) -> Self {
        self.outputs.push((port.to_string(), file.to_string()));
        self
    }

    /// Link an input into the working directory as `local` before running
    pub fn stage_input(mut self, port: &str, local: &str) -> Self {
        self.staged.push((port.to_string(), local.to_string()));
        self
    }

    /// Save standard output to `file` and publish it on `port`
    pub fn stdout_to(mut self, port: &str, file: &str) -> Self {
        self.stdout = Some((port.to_string(), file.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn output_ports(&self) -> Vec<String> {
        self.outputs
            .iter()
            .chain(self.stdout.iter())
            .map(|(port, _)| port.clone())
            .collect()
    }

    fn render_arg(&self, arg: &Arg, ctx: &StageContext) -> Result<String, StageError> {
        Ok(match arg {
            Arg::Lit(v) => v.clone(),
            Arg::Input(port) => ctx.input_text(port)?,
            Arg::InputWith(prefix, port) => format!("{prefix}{}", ctx.input_text(port)?),
            Arg::Key(field) => ctx.value(field)?.to_string(),
            Arg::KeyWith(prefix, field) => format!("{prefix}{}", ctx.value(field)?),
            Arg::Output(file) => ctx.work_dir.join(render_name(file, &ctx.key)).display().to_string(),
            Arg::OutputWith(prefix, file) => format!(
                "{prefix}{}",
                ctx.work_dir.join(render_name(file, &ctx.key)).display()
            ),
        })
    }

    /// Render the command line for one branch
    pub fn invocation(&self, ctx: &StageContext) -> Result<ToolInvocation, StageError> {
        let args = self
            .args
            .iter()
            .map(|a| self.render_arg(a, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ToolInvocation {
            program: self.program.clone(),
            args,
            cwd: ctx.work_dir.clone(),
        })
    }
}

#[async_trait]
impl StageAction for ToolStep {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        for (port, local) in &self.staged {
            stage_file(ctx.input_path(port)?, &ctx.work_dir.join(local)).await?;
        }

        let invocation = self.invocation(ctx)?;
        let output = invoke(ctx, &invocation).await?;

        let mut outputs = Outputs::new();
        if let Some((port, file)) = &self.stdout {
            let path = ctx.work_dir.join(render_name(file, &ctx.key));
            tokio::fs::write(&path, &output.stdout).await?;
            outputs.insert(port.clone(), PortValue::Path(path));
        }
        for (port, file) in &self.outputs {
            let path = ctx.work_dir.join(render_name(file, &ctx.key));
            if !path.exists() {
                return Err(StageError::MissingOutput {
                    command: invocation.command_line(),
                    path,
                });
            }
            outputs.insert(port.clone(), PortValue::Path(path));
        }
        Ok(outputs)
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} {:?} {:?} {:?} {:?}",
            self.program, self.args, self.staged, self.outputs, self.stdout
        )
    }
}

type StepFn = dyn Fn(&StageContext) -> Result<Outputs, StageError> + Send + Sync;

/// In-process step, used for lookups and small bookkeeping
///
/// Never cached: lookups must see the filesystem as it is now.
pub struct FnStep {
    name: String,
    f: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&StageContext) -> Result<Outputs, StageError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl StageAction for FnStep {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        (self.f)(ctx)
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn fingerprint(&self) -> String {
        self.name.clone()
    }
}

type DescriptorFn = dyn Fn(&BranchKey) -> Descriptor + Send + Sync;

/// Copies one file into the derivatives tree under its BIDS name
///
/// Entities (subject, session, acquisition, run) come from the source file,
/// the descriptor from the sink. An optional metadata port carries JSON that
/// is written next to the copy with a `.json` extension.
pub struct DataSink {
    stage: Stage,
    root: PathBuf,
    source_port: String,
    in_port: String,
    meta_port: Option<String>,
    descriptor: Box<DescriptorFn>,
}

impl DataSink {
    pub fn new(stage: Stage, root: &Path, source_port: &str, in_port: &str, descriptor: Descriptor) -> Self {
        Self::keyed(stage, root, source_port, in_port, move |_| descriptor.clone())
    }

    /// Descriptor computed from the branch, e.g. a threshold
    pub fn keyed<F>(stage: Stage, root: &Path, source_port: &str, in_port: &str, descriptor: F) -> Self
    where
        F: Fn(&BranchKey) -> Descriptor + Send + Sync + 'static,
    {
        Self {
            stage,
            root: root.to_path_buf(),
            source_port: source_port.to_string(),
            in_port: in_port.to_string(),
            meta_port: None,
            descriptor: Box::new(descriptor),
        }
    }

    pub fn with_meta(mut self, port: &str) -> Self {
        self.meta_port = Some(port.to_string());
        self
    }

    /// Destination of the copy for a given source file and branch
    pub fn destination(&self, source: &Path, key: &BranchKey) -> Result<PathBuf, StageError> {
        let bids = BidsKey::from_source_file(source)?;
        Ok(self.root.join(name_for(&bids, self.stage, &(self.descriptor)(key))?))
    }
}

/// `<name without extension>.json`
pub fn sidecar_path(dest: &Path, descriptor: &Descriptor) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(descriptor.extension.as_str())
        .unwrap_or(&name);
    dest.with_file_name(format!("{stem}.json"))
}

#[async_trait]
impl StageAction for DataSink {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        let source = ctx.input_path(&self.source_port)?;
        let in_file = ctx.input_path(&self.in_port)?;
        let dest = self.destination(source, &ctx.key)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(in_file, &dest).await?;
        debug!(stage = %ctx.stage, dest = %dest.display(), "Sinked derivative");

        let mut outputs = Outputs::new();
        if let Some(port) = &self.meta_port {
            let meta = ctx.input_text(port)?;
            let sidecar = sidecar_path(&dest, &(self.descriptor)(&ctx.key));
            tokio::fs::write(&sidecar, meta).await?;
            outputs.insert("sidecar".to_string(), PortValue::Path(sidecar));
        }
        outputs.insert("out_file".to_string(), PortValue::Path(dest));
        Ok(outputs)
    }

    fn fingerprint(&self) -> String {
        format!(
            "sink {} {} {} {} {:?}",
            self.stage,
            self.root.display(),
            self.source_port,
            self.in_port,
            self.meta_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wmh_common::naming::{derivatives, Extension};

    #[test]
    fn test_tail_keeps_last_lines() {
        let text = (1..=30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let t = tail(&text, 3);
        assert_eq!(t, "28\n29\n30");
        assert_eq!(tail("one", 20), "one");
    }

    #[test]
    fn test_sidecar_replaces_double_extension() {
        let dest = PathBuf::from("/o/sub-A_ses-s1_FLAIR_LPM.nii.gz");
        assert_eq!(
            sidecar_path(&dest, &derivatives::flair_lpm()),
            PathBuf::from("/o/sub-A_ses-s1_FLAIR_LPM.json")
        );
        let bare = derivatives::flair_classifier();
        assert_eq!(bare.extension, Extension::Bare);
        assert_eq!(
            sidecar_path(Path::new("/o/x_FLAIR_classifier"), &bare),
            PathBuf::from("/o/x_FLAIR_classifier.json")
        );
    }

    #[test]
    fn test_command_line_joins_args() {
        let inv = ToolInvocation {
            program: "fslmaths".to_string(),
            args: vec!["a.nii.gz".into(), "-thr".into(), "0.9".into()],
            cwd: PathBuf::from("/tmp"),
        };
        assert_eq!(inv.command_line(), "fslmaths a.nii.gz -thr 0.9");
    }
}
