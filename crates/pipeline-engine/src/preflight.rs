use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Result};
use tracing::warn;

use pipeline_core::git::Git;
use pipeline_core::runtime::DEFAULT_RUNTIME_TAG;
use pipeline_core::types::{MergeStrategy, PipelineConfig};

use pipeline_agent::registry;

/// Fail fast on anything that would break mid-run: missing CLIs, missing
/// agent prompt files, an unusable runtime. Runs before any state is
/// written.
pub async fn check(
    repo_root: &Path,
    config: &PipelineConfig,
    default_runtime: Option<&str>,
) -> Result<()> {
    if !Git::available() {
        bail!("git is not installed or not on PATH; the pipeline engine requires the git CLI");
    }

    if config.git.merge_strategy == MergeStrategy::PullRequest && !gh_available().await {
        bail!(
            "mergeStrategy pull-request requires the gh CLI; install it and run `gh auth login`"
        );
    }

    for stage in config.agents.iter().filter(|s| s.enabled) {
        let path = if stage.agent.is_absolute() {
            stage.agent.clone()
        } else {
            repo_root.join(&stage.agent)
        };
        if !path.is_file() {
            bail!(
                "agent file for stage {} not found: {} (expected a prompt file; see .agent-pipeline/agents/)",
                stage.name,
                path.display()
            );
        }
    }

    // Every runtime the run can select must validate before we start.
    let mut tags: BTreeSet<&str> = BTreeSet::new();
    for stage in config.agents.iter().filter(|s| s.enabled) {
        tags.insert(resolve_tag(config, stage.runtime.as_ref().map(|r| r.type_tag.as_str()), default_runtime));
    }
    if config.agents.iter().all(|s| !s.enabled) {
        tags.insert(resolve_tag(config, None, default_runtime));
    }

    for tag in tags {
        let runtime = registry::get(tag)?;
        let report = runtime.validate().await;
        for warning in &report.warnings {
            warn!(runtime = tag, "runtime warning: {warning}");
        }
        if !report.valid {
            bail!(
                "runtime {tag} failed validation: {}",
                report.errors.join("; ")
            );
        }
    }

    Ok(())
}

/// Runtime tag priority: stage > pipeline > injected default > global default.
pub fn resolve_tag<'a>(
    config: &'a PipelineConfig,
    stage_tag: Option<&'a str>,
    default_runtime: Option<&'a str>,
) -> &'a str {
    stage_tag
        .filter(|t| !t.is_empty())
        .or_else(|| {
            config
                .runtime
                .as_ref()
                .map(|r| r.type_tag.as_str())
                .filter(|t| !t.is_empty())
        })
        .or(default_runtime)
        .unwrap_or(DEFAULT_RUNTIME_TAG)
}

async fn gh_available() -> bool {
    tokio::process::Command::new("gh")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
