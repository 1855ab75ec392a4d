use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use pipeline_core::git::{allocate_branch, Git};
use pipeline_core::handover::HandoverManager;
use pipeline_core::state::StateManager;
use pipeline_core::types::{
    short_run_id, Artifacts, LoopContext, PipelineConfig, PipelineState, PipelineStatus,
    TriggerInfo,
};

use crate::context::RunContext;
use crate::notify::{Notifier, NotifyKind};

/// Caller-supplied knobs for one run.
pub struct InitOptions {
    pub notifier: Arc<dyn Notifier>,
    pub cancel: CancellationToken,
    pub dry_run: bool,
    pub default_runtime: Option<String>,
    pub loop_ctx: Option<LoopContext>,
    /// Pre-generated run id (the orchestrator mints it early so injected
    /// stage names can embed it). Generated here when absent.
    pub run_id: Option<String>,
}

/// Assemble run identity, isolation, handover and initial state. The state
/// is persisted once before any stage starts.
pub async fn initialize(
    repo_root: &Path,
    config: PipelineConfig,
    opts: InitOptions,
) -> Result<(Arc<RunContext>, PipelineState)> {
    let run_id = opts
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let short_id = short_run_id(&run_id);

    let git_main = Git::new(repo_root);
    let initial_commit = git_main
        .head_sha()
        .context("read HEAD of the main repository")?;

    if !config.settings.preserve_working_tree {
        match git_main.has_uncommitted_changes() {
            Ok(true) => warn!(
                "main repository has uncommitted changes; they stay untouched, but commit or \
                 stash them if the pipeline should see them"
            ),
            Ok(false) => {}
            Err(e) => warn!("working tree check: {e}"),
        }
    }

    // Isolation: a worktree on the run's branch, unless disabled.
    let (exec_root, branch, worktree_path) = if config.git.worktree.enabled {
        let branch = allocate_branch(
            config.git.branch_strategy,
            &config.git.branch_prefix,
            &config.name,
            &short_id,
        );
        let path = worktree_location(repo_root, &config, &short_id);
        create_worktree(&git_main, &path, &branch, &config.git.base_branch)?;
        info!(branch = %branch, path = %path.display(), "created run worktree");
        (path.clone(), branch, Some(path))
    } else {
        let branch = git_main.current_branch().unwrap_or_else(|_| "HEAD".to_string());
        (repo_root.to_path_buf(), branch, None)
    };

    let handover = HandoverManager::init(&exec_root, &config.name, &run_id, None)?;

    let state = PipelineState {
        run_id: run_id.clone(),
        pipeline_config: config.clone(),
        trigger: TriggerInfo {
            kind: config.trigger,
            commit_sha: initial_commit.clone(),
            timestamp: Utc::now(),
        },
        stages: Vec::new(),
        status: PipelineStatus::Running,
        artifacts: Artifacts {
            initial_commit,
            final_commit: None,
            changed_files: Vec::new(),
            total_duration: 0.0,
            handover_dir: handover.dir().to_path_buf(),
            main_repo_handover_dir: None,
            worktree_path,
            pull_request: None,
        },
        loop_context: opts.loop_ctx.clone(),
    };

    let state_mgr = StateManager::new(repo_root);
    if let Err(e) = state_mgr.save(&state) {
        warn!("initial state persistence failed: {e:#}");
    }

    let ctx = Arc::new(RunContext {
        run_id,
        short_id,
        repo_root: repo_root.to_path_buf(),
        exec_root,
        branch,
        handover,
        state_mgr,
        notifier: opts.notifier,
        cancel: opts.cancel,
        dry_run: opts.dry_run,
        default_runtime: opts.default_runtime,
        loop_ctx: opts.loop_ctx,
        config,
    });

    ctx.notify(
        NotifyKind::PipelineStarted,
        format!("pipeline {} started on branch {}", ctx.config.name, ctx.branch),
    );

    Ok((ctx, state))
}

fn worktree_location(repo_root: &Path, config: &PipelineConfig, short_id: &str) -> PathBuf {
    let leaf = format!("{}-{short_id}", config.name);
    match &config.git.worktree.directory {
        Some(dir) if dir.is_absolute() => dir.join(leaf),
        Some(dir) => repo_root.join(dir).join(leaf),
        None => repo_root
            .join(".agent-pipeline")
            .join("worktrees")
            .join(leaf),
    }
}

/// Clear any stale directory at the worktree path, then check the run
/// branch out there. An existing branch (reusable strategy) is reused.
fn create_worktree(git: &Git, path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if path.exists() {
        let _ = git.remove_worktree(path);
        let _ = std::fs::remove_dir_all(path);
    }
    let _ = git.prune_worktrees();
    git.create_worktree(path, branch, base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_location_defaults_under_agent_pipeline() {
        let config: PipelineConfig =
            serde_yaml::from_str("name: demo\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        let path = worktree_location(Path::new("/repo"), &config, "abcd1234");
        assert_eq!(
            path,
            Path::new("/repo/.agent-pipeline/worktrees/demo-abcd1234")
        );
    }

    #[test]
    fn custom_worktree_directory_is_respected() {
        let mut config: PipelineConfig =
            serde_yaml::from_str("name: demo\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        config.git.worktree.directory = Some(PathBuf::from("/scratch/wt"));
        let path = worktree_location(Path::new("/repo"), &config, "abcd1234");
        assert_eq!(path, Path::new("/scratch/wt/demo-abcd1234"));
    }
}
