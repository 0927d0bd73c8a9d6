//! wmh-pipeline - WMH segmentation pipeline runner
//!
//! One subcommand per workflow. Every workflow reads the shared run
//! configuration, writes derivatives below `base_dir` and exits non-zero when
//! any branch failed (crash dumps name the failing stage).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wmh_common::config::{ConfigOverrides, RunConfig};
use wmh_common::discovery::subjects_of;
use wmh_common::manifest::Manifest;
use wmh_common::naming::Stage;
use wmh_pipeline::cohort::{parse_rows, CohortSelection};
use wmh_pipeline::executor::RunSummary;
use wmh_pipeline::tools::ProcessRunner;
use wmh_pipeline::workflows::threshold::ThresholdOptions;
use wmh_pipeline::workflows::{
    bianca, check, flair, intnorm, locate, post_locate, t1w, template, threshold, WorkflowContext,
};

/// Command-line arguments for wmh-pipeline
#[derive(Parser, Debug)]
#[command(name = "wmh-pipeline")]
#[command(about = "White-matter hyperintensity segmentation pipeline")]
#[command(version)]
struct Cli {
    /// Config file (default: $WMH_CONFIG, then the user config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker pool size
    #[arg(long, global = true, env = "WMH_N_CPU")]
    n_cpu: Option<usize>,

    /// Log level or filter directive (RUST_LOG wins when set)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output root
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// BIDS input root
    #[arg(long, global = true)]
    bids_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Acq {
    /// FLAIR acquisition label, e.g. 2D or 3D
    #[arg(long)]
    acq: String,
}

#[derive(Args, Debug, Clone, Default)]
struct GraphOut {
    /// Write the stage graph as Graphviz DOT
    #[arg(long, value_name = "FILE")]
    graph: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Longitudinal templates: normalization and BIANCA masks per subject
    PrepareTemplate(GraphOut),
    /// Per-session T1w preparation
    PrepareT1w(GraphOut),
    /// Per-session FLAIR preparation and registration into FLAIR space
    PrepareFlair {
        #[command(flatten)]
        acq: Acq,
        #[command(flatten)]
        graph: GraphOut,
    },
    /// Min-max intensity normalization of the prepared FLAIR
    NormalizeFlair {
        #[command(flatten)]
        acq: Acq,
        #[command(flatten)]
        graph: GraphOut,
    },
    /// Build the masterfile from the prepared FLAIR tree
    Masterfile(Acq),
    /// Lesion probability maps, leave-one-out by default
    Bianca {
        #[command(flatten)]
        acq: Acq,
        /// Persist each query's classifier
        #[arg(long)]
        save_classifier: bool,
        /// Pretrained classifier file
        #[arg(long, value_name = "FILE")]
        classifier: Option<PathBuf>,
        /// Zero-based training rows, comma separated
        #[arg(long, value_name = "I,..")]
        training: Option<String>,
        /// Zero-based query rows, comma separated
        #[arg(long, value_name = "I,..")]
        query: Option<String>,
        #[command(flatten)]
        graph: GraphOut,
    },
    /// Copy one query's saved classifier out as a reusable pretrained classifier
    ExportClassifier {
        #[command(flatten)]
        acq: Acq,
        /// Zero-based query row
        #[arg(long)]
        query: usize,
        /// Destination directory
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },
    /// Threshold lesion maps and compute cluster and overlap statistics
    Threshold {
        #[command(flatten)]
        acq: Acq,
        /// Threshold, repeatable (default: from config)
        #[arg(long = "threshold", value_name = "T")]
        thresholds: Vec<f64>,
        /// Skip the comparison with manual masks
        #[arg(long)]
        no_overlap: bool,
        #[command(flatten)]
        graph: GraphOut,
    },
    /// Symlink farm of LOCATE inputs
    PrepareLocate(Acq),
    /// Mask LOCATE outputs with the BIANCA white-matter mask
    PostLocateMask {
        #[command(flatten)]
        acq: Acq,
        #[command(flatten)]
        graph: GraphOut,
    },
    /// Report sessions with fewer matching outputs than the rest
    Check {
        #[command(flatten)]
        acq: Acq,
        /// Stage directory to scan
        #[arg(long, value_name = "DIR")]
        stage: PathBuf,
        /// File pattern below sub-*/ses-*/anat
        #[arg(long, value_name = "GLOB")]
        pattern: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        config_file: cli.config.clone(),
        base_dir: cli.base_dir.clone(),
        bids_dir: cli.bids_dir.clone(),
        n_cpu: cli.n_cpu,
        log_level: cli.log_level.clone(),
    };
    let config = RunConfig::load(&overrides).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting wmh-pipeline v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let version = wmh_pipeline::version_label();
    info!(
        version = %version,
        base_dir = %config.base_dir.display(),
        bids_dir = %config.bids_dir.display(),
        n_cpu = config.n_cpu,
        "Run configuration"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let ctx = WorkflowContext::new(&config, Arc::new(ProcessRunner), cancel, version);
    run_command(cli.command, ctx).await
}

async fn run_command(command: Command, ctx: WorkflowContext<'_>) -> Result<()> {
    let config = ctx.config;
    match command {
        Command::PrepareTemplate(graph) => {
            let ctx = ctx.with_graph_out(graph.graph);
            let subjects = subjects_of(&ctx.subject_sessions("*")?);
            report(template::run(&ctx, subjects).await)
        }
        Command::PrepareT1w(graph) => {
            let ctx = ctx.with_graph_out(graph.graph);
            let pairs = ctx.subject_sessions("*")?;
            report(t1w::run(&ctx, pairs).await)
        }
        Command::PrepareFlair { acq, graph } => {
            let ctx = ctx.with_graph_out(graph.graph);
            let pairs = ctx.subject_sessions(&acq.acq)?;
            report(flair::run(&ctx, &acq.acq, pairs).await)
        }
        Command::NormalizeFlair { acq, graph } => {
            let ctx = ctx.with_graph_out(graph.graph);
            let pairs = ctx.subject_sessions(&acq.acq)?;
            report(intnorm::run(&ctx, &acq.acq, pairs).await)
        }
        Command::Masterfile(acq) => {
            let manifest = bianca::prepare_masterfile(&ctx, &acq.acq)
                .with_context(|| format!("Failed to build the {} masterfile", acq.acq))?;
            info!(
                acq = %acq.acq,
                rows = manifest.len(),
                labeled = manifest.labeled_indices().count(),
                "Masterfile ready"
            );
            Ok(())
        }
        Command::Bianca {
            acq,
            save_classifier,
            classifier,
            training,
            query,
            graph,
        } => {
            let ctx = ctx.with_graph_out(graph.graph);
            let selection = CohortSelection {
                classifier: classifier.or_else(|| config.bianca.classifier.clone()),
                save_classifier: save_classifier || config.bianca.save_classifier,
                training: rows_arg(training.as_deref())?.or_else(|| config.bianca.training.clone()),
                query: rows_arg(query.as_deref())?.or_else(|| config.bianca.query.clone()),
            };
            report(bianca::run(&ctx, &acq.acq, &selection).await)
        }
        Command::ExportClassifier { acq, query, out } => {
            let bianca_dir = config.stage_dir(Stage::Bianca, Some(&acq.acq));
            let manifest = Manifest::read_from_dir(&bianca_dir)?;
            let files = bianca::export_classifier(&bianca_dir, &manifest, query, &out)?;
            info!(files = files.len(), out = %out.display(), "Classifier exported");
            Ok(())
        }
        Command::Threshold {
            acq,
            thresholds,
            no_overlap,
            graph,
        } => {
            let ctx = ctx.with_graph_out(graph.graph);
            let options = ThresholdOptions {
                thresholds: if thresholds.is_empty() {
                    config.threshold.thresholds.clone()
                } else {
                    thresholds
                },
                overlap: config.threshold.overlap && !no_overlap,
            };
            let pairs = ctx.subject_sessions(&acq.acq)?;
            report(threshold::run(&ctx, &acq.acq, pairs, &options).await)
        }
        Command::PrepareLocate(acq) => {
            let pairs = ctx.subject_sessions(&acq.acq)?;
            let layout = locate::prepare_locate(config, &acq.acq, &pairs, &ctx.version)?;
            info!(links = layout.links.len(), "LOCATE inputs linked");
            Ok(())
        }
        Command::PostLocateMask { acq, graph } => {
            let ctx = ctx.with_graph_out(graph.graph);
            let pairs = ctx.subject_sessions(&acq.acq)?;
            report(post_locate::run(&ctx, &acq.acq, pairs).await)
        }
        Command::Check { acq, stage, pattern } => {
            let pairs = ctx.subject_sessions(&acq.acq)?;
            check::check_outputs(&stage, &pairs, &pattern)?;
            Ok(())
        }
    }
}

fn rows_arg(arg: Option<&str>) -> Result<Option<Vec<usize>>> {
    arg.map(parse_rows).transpose().context("Invalid row list")
}

fn report(result: wmh_pipeline::Result<RunSummary>) -> Result<()> {
    match result {
        Ok(summary) => {
            info!(
                workflow = %summary.workflow,
                succeeded = summary.succeeded,
                cached = summary.cached,
                "Workflow finished"
            );
            Ok(())
        }
        Err(wmh_pipeline::Error::Cancelled { pending }) => {
            bail!("Run cancelled with {pending} stage instances not started")
        }
        Err(e) => Err(e).context("Workflow failed; see crash dumps for failing stages"),
    }
}

/// Cancel the run on Ctrl+C or SIGTERM
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing running stages");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing running stages");
        },
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bianca_arguments_parse() {
        let cli = Cli::try_parse_from([
            "wmh-pipeline",
            "--n-cpu",
            "4",
            "bianca",
            "--acq",
            "3D",
            "--save-classifier",
            "--query",
            "0,2",
        ])
        .unwrap();
        assert_eq!(cli.n_cpu, Some(4));
        let Command::Bianca { acq, save_classifier, query, classifier, .. } = cli.command else {
            panic!("expected the bianca command");
        };
        assert_eq!(acq.acq, "3D");
        assert!(save_classifier);
        assert!(classifier.is_none());
        assert_eq!(rows_arg(query.as_deref()).unwrap(), Some(vec![0, 2]));
    }

    #[test]
    fn test_thresholds_repeat_and_global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "wmh-pipeline",
            "threshold",
            "--acq",
            "2D",
            "--threshold",
            "0.9",
            "--threshold",
            "0.99",
            "--no-overlap",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        let Command::Threshold { thresholds, no_overlap, .. } = cli.command else {
            panic!("expected the threshold command");
        };
        assert_eq!(thresholds, vec![0.9, 0.99]);
        assert!(no_overlap);
    }

    #[test]
    fn test_acquisition_is_required() {
        assert!(Cli::try_parse_from(["wmh-pipeline", "prepare-flair"]).is_err());
        assert!(Cli::try_parse_from(["wmh-pipeline", "prepare-t1w", "--graph", "t1w.dot"]).is_ok());
    }

    #[test]
    fn test_invalid_row_list_is_rejected() {
        assert!(rows_arg(Some("1,x")).is_err());
        assert_eq!(rows_arg(None).unwrap(), None);
    }
}
