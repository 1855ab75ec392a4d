use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{error, info};

use pipeline_agent::{registry, ClaudeHeadlessRuntime, CodexHeadlessRuntime};
use pipeline_core::config::{find_pipeline, load_pipeline_file};
use pipeline_core::types::PipelineStatus;
use pipeline_engine::Orchestrator;

struct CliArgs {
    pipeline: String,
    repo_root: PathBuf,
    dry_run: bool,
    runtime: Option<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage: agent-pipeline <pipeline.yml | pipeline-name> [--repo <path>] [--runtime <tag>] [--dry-run]"
    );
    std::process::exit(2);
}

fn parse_args() -> CliArgs {
    let mut pipeline = None;
    let mut repo_root = PathBuf::from(".");
    let mut dry_run = false;
    let mut runtime = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--repo" => repo_root = args.next().map(PathBuf::from).unwrap_or_else(|| usage()),
            "--runtime" => runtime = Some(args.next().unwrap_or_else(|| usage())),
            "--dry-run" => dry_run = true,
            "-h" | "--help" => usage(),
            other if other.starts_with('-') => usage(),
            other => {
                if pipeline.replace(other.to_string()).is_some() {
                    usage();
                }
            }
        }
    }

    CliArgs {
        pipeline: pipeline.unwrap_or_else(|| usage()),
        repo_root,
        dry_run,
        runtime,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "pipeline_cli=info,pipeline_engine=info,pipeline_core=info,pipeline_agent=info".into()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args();

    registry::register(Arc::new(ClaudeHeadlessRuntime::default()))?;
    registry::register(Arc::new(CodexHeadlessRuntime::default()))?;

    // Either a direct YAML path or a name under .agent-pipeline/pipelines/.
    let candidate = Path::new(&args.pipeline);
    let source = if candidate.is_file() {
        candidate.to_path_buf()
    } else {
        find_pipeline(&args.repo_root, &args.pipeline)?
    };
    let config = load_pipeline_file(&source)?;

    info!(pipeline = %config.name, source = %source.display(), "loaded pipeline");

    let mut orchestrator = Orchestrator::new(&args.repo_root).with_dry_run(args.dry_run);
    if let Some(tag) = args.runtime {
        orchestrator = orchestrator.with_default_runtime(tag);
    }

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("interrupt received, aborting pipeline");
            cancel.cancel();
        }
    });

    let state = orchestrator.run(config, Some(source)).await?;

    info!(
        run_id = %state.run_id,
        status = ?state.status,
        stages = state.stages.len(),
        duration_s = state.artifacts.total_duration,
        "pipeline finished"
    );

    match state.status {
        PipelineStatus::Completed => Ok(()),
        status => bail!("pipeline ended with status {status:?}"),
    }
}
