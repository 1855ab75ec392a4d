use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use pipeline_core::template::{render, TemplateVars};
use pipeline_core::types::{
    BranchStrategy, MergeStrategy, PipelineState, PipelineStatus, PullRequestInfo,
};

use crate::context::RunContext;
use crate::notify::NotifyKind;

/// Close out a run: metrics, merge-strategy dispatch, worktree disposition,
/// handover mirror, summary artifacts, final notification. Merge failures
/// are never fatal; the work is preserved and a manual remediation logged.
pub async fn finalize(ctx: &Arc<RunContext>, state: &mut PipelineState) -> Result<()> {
    let git_exec = ctx.git_exec();

    state.artifacts.total_duration =
        (Utc::now() - state.trigger.timestamp).num_milliseconds() as f64 / 1_000.0;
    if let Ok(sha) = git_exec.head_sha() {
        state.artifacts.final_commit = Some(sha);
    }
    match git_exec.changed_files_since(&state.artifacts.initial_commit) {
        Ok(files) => state.artifacts.changed_files = files,
        Err(e) => warn!("changed-files query: {e}"),
    }

    // Mirror the worktree-local handover into the main repo before the
    // worktree can be disposed of.
    if ctx.in_worktree() {
        match ctx.handover.copy_to(&ctx.repo_root) {
            Ok(mirror) => state.artifacts.main_repo_handover_dir = Some(mirror),
            Err(e) => warn!("handover mirror: {e}"),
        }
    }

    let succeeded = state.status == PipelineStatus::Completed;
    let any_commit = state.stages.iter().any(|s| s.commit_sha.is_some());

    if succeeded && !ctx.dry_run {
        if !any_commit {
            info!("no commits to merge; skipping {:?} merge strategy", ctx.config.git.merge_strategy);
        } else {
            match ctx.config.git.merge_strategy {
                MergeStrategy::None => {
                    info!(branch = %ctx.branch, "mergeStrategy none: branch preserved");
                }
                MergeStrategy::PullRequest => {
                    if let Err(e) = open_pull_request(ctx, state).await {
                        warn!(
                            "pull request failed: {e:#}; push and open it manually: \
                             git push -u origin {0} && gh pr create --head {0}",
                            ctx.branch
                        );
                    }
                }
                MergeStrategy::LocalMerge => {
                    if let Err(e) = local_merge(ctx) {
                        warn!(
                            "local merge failed: {e:#}; branch {} is preserved, merge manually \
                             with: git merge --no-ff {}",
                            ctx.branch, ctx.branch
                        );
                    }
                }
            }
        }
    }

    dispose_worktree(ctx, state, succeeded);
    write_summary(ctx, state);

    if succeeded {
        ctx.notify(
            NotifyKind::PipelineCompleted,
            format!(
                "pipeline {} completed in {:.0}s ({} stages, {} files changed)",
                ctx.config.name,
                state.artifacts.total_duration,
                state.stages.len(),
                state.artifacts.changed_files.len()
            ),
        );
    } else {
        ctx.notify(
            NotifyKind::PipelineFailed,
            format!("pipeline {} ended with status {:?}", ctx.config.name, state.status),
        );
    }

    ctx.persist(state);
    Ok(())
}

// ── Pull request ─────────────────────────────────────────────────────────

async fn open_pull_request(ctx: &Arc<RunContext>, state: &mut PipelineState) -> Result<()> {
    let git_exec = ctx.git_exec();
    git_exec.push_branch(&ctx.branch)?;

    // An existing PR for this branch is surfaced, not duplicated.
    if let Some(existing) = view_pull_request(ctx, &ctx.branch).await? {
        info!(url = %existing.url, "pull request already exists for this branch");
        state.artifacts.pull_request = Some(existing);
        return Ok(());
    }

    let vars = TemplateVars {
        stage: "",
        pipeline_name: &ctx.config.name,
        run_id: &ctx.run_id,
        branch: &ctx.branch,
    };
    let pr = &ctx.config.git.pull_request;
    let title = pr
        .title
        .as_deref()
        .map(|t| render(t, &vars))
        .unwrap_or_else(|| format!("{}: pipeline run {}", ctx.config.name, ctx.short_id));
    let body = pr
        .body
        .as_deref()
        .map(|b| render(b, &vars))
        .unwrap_or_else(|| {
            format!(
                "Automated changes from pipeline `{}` (run `{}`).\n\nStages:\n{}",
                ctx.config.name,
                ctx.run_id,
                state
                    .stages
                    .iter()
                    .map(|s| format!("- {} ({:?})", s.stage_name, s.status))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        });

    let mut args: Vec<String> = vec![
        "pr".into(),
        "create".into(),
        "--base".into(),
        ctx.config.git.base_branch.clone(),
        "--head".into(),
        ctx.branch.clone(),
        "--title".into(),
        title,
        "--body".into(),
        body,
    ];
    for reviewer in &pr.reviewers {
        args.push("--reviewer".into());
        args.push(reviewer.clone());
    }
    for label in &pr.labels {
        args.push("--label".into());
        args.push(label.clone());
    }
    if pr.draft {
        args.push("--draft".into());
    }

    let output = run_gh(ctx, &args).await?;
    let url = output
        .lines()
        .rev()
        .find(|l| l.starts_with("https://"))
        .unwrap_or_default()
        .trim()
        .to_string();
    if url.is_empty() {
        bail!("gh pr create returned no URL");
    }
    let number = url
        .rsplit('/')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);

    let created = PullRequestInfo {
        url: url.clone(),
        number,
        branch: ctx.branch.clone(),
    };
    info!(url = %url, "opened pull request");
    ctx.notify(NotifyKind::PrCreated, format!("opened pull request {url}"));
    state.artifacts.pull_request = Some(created);
    Ok(())
}

async fn view_pull_request(ctx: &Arc<RunContext>, branch: &str) -> Result<Option<PullRequestInfo>> {
    let out = tokio::process::Command::new("gh")
        .args(["pr", "view", branch, "--json", "url,number"])
        .current_dir(&ctx.repo_root)
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawn gh pr view")?;
    if !out.status.success() {
        return Ok(None);
    }
    let value: serde_json::Value =
        serde_json::from_slice(&out.stdout).context("parse gh pr view output")?;
    let url = value.get("url").and_then(|v| v.as_str()).unwrap_or_default();
    if url.is_empty() {
        return Ok(None);
    }
    Ok(Some(PullRequestInfo {
        url: url.to_string(),
        number: value.get("number").and_then(|v| v.as_u64()).unwrap_or(0),
        branch: branch.to_string(),
    }))
}

async fn run_gh(ctx: &Arc<RunContext>, args: &[String]) -> Result<String> {
    let out = tokio::process::Command::new("gh")
        .args(args)
        .current_dir(&ctx.repo_root)
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawn gh")?;
    if !out.status.success() {
        bail!(
            "gh {} failed: {}",
            args.first().map(String::as_str).unwrap_or(""),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

// ── Local merge ──────────────────────────────────────────────────────────

/// Merge the pipeline branch into `baseBranch` without touching the user's
/// working tree: merge in place when base is checked out at the main repo
/// root, refuse when it is checked out in some other worktree, and use a
/// temporary worktree otherwise.
fn local_merge(ctx: &Arc<RunContext>) -> Result<()> {
    let git_main = ctx.git_main();
    let base = &ctx.config.git.base_branch;

    let repo_root = std::fs::canonicalize(&ctx.repo_root).unwrap_or_else(|_| ctx.repo_root.clone());
    match git_main.branch_checkout_path(base)? {
        Some(path) if std::fs::canonicalize(&path).unwrap_or(path.clone()) == repo_root => {
            git_main.merge_no_ff(&ctx.branch)?;
            info!(base = %base, branch = %ctx.branch, "merged in main repository");
        }
        Some(path) => {
            bail!(
                "branch {base} is checked out at {}; finish or detach that worktree, \
                 then merge {} manually",
                path.display(),
                ctx.branch
            );
        }
        None => {
            let tmp = ctx
                .repo_root
                .join(".agent-pipeline")
                .join("worktrees")
                .join(format!("merge-{}", ctx.short_id));
            git_main.create_worktree(&tmp, base, base)?;
            let merge_git = pipeline_core::git::Git::new(&tmp);
            let merged = merge_git.merge_no_ff(&ctx.branch);
            match merged {
                Ok(()) => {
                    git_main.remove_worktree(&tmp)?;
                    let _ = git_main.prune_worktrees();
                    info!(base = %base, branch = %ctx.branch, "merged via temporary worktree");
                }
                Err(e) => {
                    // Keep the temp worktree so the conflict can be resolved by hand.
                    bail!(
                        "merge of {} into {base} conflicted in {}: {e}",
                        ctx.branch,
                        tmp.display()
                    );
                }
            }
        }
    }
    Ok(())
}

// ── Worktree disposition ─────────────────────────────────────────────────

fn dispose_worktree(ctx: &Arc<RunContext>, state: &PipelineState, succeeded: bool) {
    let Some(path) = &state.artifacts.worktree_path else {
        return;
    };
    let strategy = ctx.config.git.branch_strategy;

    if !succeeded {
        info!(path = %path.display(), "run did not succeed; keeping worktree for debugging");
        return;
    }
    match strategy {
        BranchStrategy::UniqueAndDelete => {
            if ctx.dry_run {
                return;
            }
            let git_main = ctx.git_main();
            if let Err(e) = git_main.remove_worktree(path) {
                warn!("remove worktree: {e}");
                return;
            }
            let _ = git_main.prune_worktrees();
            if let Err(e) = git_main.delete_branch(&ctx.branch) {
                warn!("delete branch {}: {e}", ctx.branch);
            } else {
                info!(branch = %ctx.branch, "removed worktree and branch");
            }
        }
        BranchStrategy::Reusable | BranchStrategy::UniquePerRun => {
            info!(path = %path.display(), "keeping worktree (strategy {:?})", strategy);
        }
    }
}

// ── Summary artifacts ────────────────────────────────────────────────────

fn write_summary(ctx: &Arc<RunContext>, state: &PipelineState) {
    let dir = ctx.outputs_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("create outputs dir: {e}");
        return;
    }

    let changed = state.artifacts.changed_files.join("\n");
    if let Err(e) = std::fs::write(dir.join("changed-files.txt"), changed) {
        warn!("write changed-files.txt: {e}");
    }

    let summary = json!({
        "runId": state.run_id,
        "pipeline": ctx.config.name,
        "status": state.status,
        "totalDuration": state.artifacts.total_duration,
        "initialCommit": state.artifacts.initial_commit,
        "finalCommit": state.artifacts.final_commit,
        "branch": ctx.branch,
        "stages": state.stages.iter().map(|s| json!({
            "name": s.stage_name,
            "status": s.status,
            "duration": s.duration,
            "commitSha": s.commit_sha,
        })).collect::<Vec<_>>(),
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(body) => {
            if let Err(e) = std::fs::write(dir.join("pipeline-summary.json"), body) {
                warn!("write pipeline-summary.json: {e}");
            }
        }
        Err(e) => warn!("serialize summary: {e}"),
    }
}
