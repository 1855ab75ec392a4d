use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use pipeline_core::config::load_pipeline_file;
use pipeline_core::fsutil::{copy_dir_recursive, move_into_unique};
use pipeline_core::loop_state::{
    ensure_queue_dirs, oldest_pending_yaml, resolve_queue_dirs, LoopStateManager,
};
use pipeline_core::types::{
    short_run_id, FailureStrategy, IterationRecord, LoopContext, LoopStatus, PipelineConfig,
    PipelineState, PipelineStatus, StageConfig, TerminationReason,
};

use crate::orchestrator::Orchestrator;

const LOOP_AGENT_NAME: &str = "loop-agent";

/// Built-in prompt for the synthetic loop stage. A user template replaces
/// it via `settings.instructions.looping`.
const DEFAULT_LOOP_TEMPLATE: &str = "\
You are the loop controller for pipeline `{{pipelineName}}`, iteration
{{iteration}} of {{maxIterations}}.

The pipeline that just ran:

```yaml
{{pipelineYaml}}
```

Review the handover directory to judge whether further work remains. If it
does, write a complete pipeline YAML file (same schema as above) into
`{{pendingDir}}`; it will be picked up as the next iteration. If the work is
done, write nothing there. Either way, summarise your decision in your stage
output file.
";

/// Append the synthetic loop stage to the config: depends on every declared
/// stage so it runs strictly last, fails soft (`onFail: warn`), and reads
/// its prompt from a per-session file written here. The caller passes a
/// clone, so the user's config is never mutated.
pub(crate) fn inject_loop_agent(
    config: &mut PipelineConfig,
    loop_ctx: &LoopContext,
    repo_root: &Path,
    run_id: &str,
) -> Result<()> {
    let prompt_path = write_loop_prompt(config, loop_ctx, repo_root)?;

    let existing: HashSet<&str> = config.agents.iter().map(|s| s.name.as_str()).collect();
    let short = short_run_id(run_id);
    let mut name = LOOP_AGENT_NAME.to_string();
    if existing.contains(name.as_str()) {
        name = format!("{LOOP_AGENT_NAME}-{short}");
    }
    let mut counter = 2;
    while existing.contains(name.as_str()) {
        name = format!("{LOOP_AGENT_NAME}-{short}-{counter}");
        counter += 1;
    }

    let mut stage = StageConfig::new(&name, prompt_path);
    stage.depends_on = config.agents.iter().map(|s| s.name.clone()).collect();
    stage.on_fail = Some(FailureStrategy::Warn);
    config.agents.push(stage);

    info!(stage = %name, "injected loop stage");
    Ok(())
}

fn write_loop_prompt(
    config: &PipelineConfig,
    loop_ctx: &LoopContext,
    repo_root: &Path,
) -> Result<PathBuf> {
    let template = match &config.settings.instructions.looping {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read loop template {}", path.display()))?,
        None => DEFAULT_LOOP_TEMPLATE.to_string(),
    };

    // Prefer the on-disk YAML the run was started from; fall back to
    // re-serializing the config snapshot.
    let pipeline_yaml = loop_ctx
        .pipeline_source
        .as_ref()
        .and_then(|p| std::fs::read_to_string(p).ok())
        .map_or_else(
            || serde_yaml::to_string(config).unwrap_or_default(),
            |s| s,
        );

    let pending = resolve_queue_dirs(repo_root, &loop_ctx.directories).pending;
    let body = template
        .replace("{{pipelineName}}", &config.name)
        .replace("{{iteration}}", &loop_ctx.current_iteration.to_string())
        .replace("{{maxIterations}}", &loop_ctx.max_iterations.to_string())
        .replace("{{pipelineYaml}}", &pipeline_yaml)
        .replace("{{pendingDir}}", &pending.display().to_string());

    let session_dir = repo_root
        .join(".agent-pipeline")
        .join("loops")
        .join(&loop_ctx.loop_session_id);
    std::fs::create_dir_all(&session_dir)
        .with_context(|| format!("create {}", session_dir.display()))?;
    let path = session_dir.join("loop-agent.md");
    std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Chain pipeline runs through the queue directories until `pending/` is
/// empty, the iteration limit is hit, a run fails hard, or an abort lands.
pub(crate) async fn run_loop(
    orch: &Orchestrator,
    initial_config: PipelineConfig,
    source: Option<PathBuf>,
) -> Result<PipelineState> {
    let session_id = format!(
        "{}-{}",
        initial_config.name,
        short_run_id(&Uuid::new_v4().to_string())
    );
    let max_iterations = initial_config.looping.max_iterations;
    let loop_mgr = LoopStateManager::new(&orch.repo_root);
    loop_mgr.create_session(&session_id, max_iterations)?;
    let dirs = ensure_queue_dirs(&orch.repo_root, &initial_config.looping.directories)?;

    info!(session = %session_id, max_iterations, "loop session started");

    let mut current_config = initial_config.clone();
    let mut current_source = source;
    // Queue file currently executing, to be moved to finished/failed.
    let mut running_file: Option<PathBuf> = None;
    let mut iteration: u32 = 1;
    let mut last_state: Option<PipelineState> = None;
    let termination: TerminationReason;

    loop {
        let loop_ctx = LoopContext {
            enabled: true,
            current_iteration: iteration,
            max_iterations,
            loop_session_id: session_id.clone(),
            pipeline_source: current_source.clone(),
            termination_reason: None,
            directories: dirs.clone(),
            is_final_group: None,
        };

        let started = Utc::now();
        let pipeline_name = current_config.name.clone();
        let result = orch.run_once(current_config.clone(), Some(loop_ctx)).await;
        let duration = (Utc::now() - started).num_milliseconds() as f64 / 1_000.0;

        let (iteration_status, run_id) = match &result {
            Ok(state) => (
                match state.status {
                    PipelineStatus::Completed => "completed",
                    PipelineStatus::Failed => "failed",
                    PipelineStatus::Aborted => "aborted",
                    PipelineStatus::Running => "completed",
                },
                state.run_id.clone(),
            ),
            Err(_) => ("failed", String::new()),
        };

        loop_mgr.record_iteration(
            &session_id,
            IterationRecord {
                iteration_number: iteration,
                pipeline_name: pipeline_name.clone(),
                run_id,
                status: iteration_status.to_string(),
                duration,
                triggered_next: false,
            },
        )?;

        // A worktree run left its queue traffic in the worktree; mirror it
        // back so this loop (observing the main repo) sees it.
        if let Ok(state) = &result {
            copy_queues_back(state, &orch.repo_root, &initial_config);
        }

        // Settle the queue file that produced this iteration.
        if let Some(file) = running_file.take() {
            let dest = if iteration_status == "completed" {
                &dirs.finished
            } else {
                &dirs.failed
            };
            if let Err(e) = move_into_unique(&file, dest) {
                warn!("queue move after iteration {iteration}: {e}");
            }
        }

        match result {
            Ok(state) if state.status == PipelineStatus::Aborted => {
                last_state = Some(state);
                termination = TerminationReason::Aborted;
                break;
            }
            Ok(state) if state.status == PipelineStatus::Failed => {
                last_state = Some(state);
                termination = TerminationReason::Failure;
                break;
            }
            Ok(state) => last_state = Some(state),
            Err(e) => {
                if last_state.is_none() {
                    // The very first run never started; surface its error.
                    loop_mgr.close_session(&session_id, LoopStatus::Failed)?;
                    return Err(e);
                }
                warn!("loop iteration {iteration} failed before execution: {e:#}");
                termination = TerminationReason::Failure;
                break;
            }
        }

        iteration += 1;

        // Poll pending/ for the next pipeline, oldest first. An empty
        // queue is natural completion even when the limit is also hit;
        // with work still pending, the limit wins and the files stay put.
        let Some(next_file) = oldest_pending_yaml(&dirs.pending) else {
            termination = TerminationReason::Natural;
            break;
        };
        if iteration > max_iterations {
            termination = TerminationReason::LimitReached;
            break;
        }
        let moved = move_into_unique(&next_file, &dirs.running)?;
        match load_pipeline_file(&moved) {
            Ok(next_config) => {
                info!(
                    file = %moved.display(),
                    pipeline = %next_config.name,
                    "queued pipeline picked up"
                );
                // The previous iteration triggered this one.
                if let Some(session) = loop_mgr.load_session(&session_id) {
                    if let Some(last) = session.iterations.last() {
                        let mut updated = last.clone();
                        updated.triggered_next = true;
                        let _ =
                            loop_mgr.update_iteration(&session_id, last.iteration_number, updated);
                    }
                }
                current_config = adopt_loop_settings(next_config, &initial_config);
                current_source = Some(moved.clone());
                running_file = Some(moved);
            }
            Err(e) => {
                warn!("queued file {} is not a valid pipeline: {e:#}", moved.display());
                if let Err(move_err) = move_into_unique(&moved, &dirs.failed) {
                    warn!("move invalid queue file: {move_err}");
                }
                termination = TerminationReason::Failure;
                break;
            }
        }
    }

    let session_status = match termination {
        TerminationReason::Natural => LoopStatus::Completed,
        TerminationReason::LimitReached => LoopStatus::LimitReached,
        TerminationReason::Failure | TerminationReason::Aborted => LoopStatus::Failed,
    };
    loop_mgr.close_session(&session_id, session_status)?;
    info!(session = %session_id, reason = ?termination, "loop session ended");

    let mut state = last_state.context("loop produced no pipeline state")?;
    if let Some(lc) = state.loop_context.as_mut() {
        lc.termination_reason = Some(termination);
    }
    if let Err(e) = pipeline_core::state::StateManager::new(&orch.repo_root).save(&state) {
        warn!("state persistence failed: {e:#}");
    }
    Ok(state)
}

/// The session, not the queued file, owns the loop policy: a queued
/// pipeline keeps running in this session's queue dirs and limits.
fn adopt_loop_settings(mut next: PipelineConfig, initial: &PipelineConfig) -> PipelineConfig {
    next.looping.enabled = true;
    next.looping.max_iterations = initial.looping.max_iterations;
    next.looping.directories = initial.looping.directories.clone();
    next
}

fn copy_queues_back(state: &PipelineState, repo_root: &Path, config: &PipelineConfig) {
    let Some(worktree) = &state.artifacts.worktree_path else {
        return;
    };
    let wt_dirs = resolve_queue_dirs(worktree, &config.looping.directories);
    let main_dirs = resolve_queue_dirs(repo_root, &config.looping.directories);
    for (src, dst) in wt_dirs.all().into_iter().zip(main_dirs.all()) {
        if src == dst || !src.is_dir() {
            continue;
        }
        if let Err(e) = copy_dir_recursive(src, dst) {
            warn!("queue copyback {} -> {}: {e}", src.display(), dst.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::types::QueueDirs;

    fn sample_config() -> PipelineConfig {
        serde_yaml::from_str(
            "name: demo\nagents:\n  - name: a\n    agent: a.md\n  - name: b\n    agent: b.md\n    dependsOn: [a]\n",
        )
        .unwrap()
    }

    fn sample_loop_ctx(session: &str) -> LoopContext {
        LoopContext {
            enabled: true,
            current_iteration: 1,
            max_iterations: 3,
            loop_session_id: session.to_string(),
            pipeline_source: None,
            termination_reason: None,
            directories: QueueDirs::for_session(session),
            is_final_group: None,
        }
    }

    #[test]
    fn loop_agent_depends_on_every_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = sample_config();
        let ctx = sample_loop_ctx("sess");
        inject_loop_agent(&mut config, &ctx, tmp.path(), "01234567-aaaa").unwrap();

        let injected = config.agents.last().unwrap();
        assert_eq!(injected.name, "loop-agent");
        assert_eq!(injected.depends_on, vec!["a", "b"]);
        assert_eq!(injected.on_fail, Some(FailureStrategy::Warn));
        assert!(injected.agent.is_file());
    }

    #[test]
    fn loop_agent_name_avoids_collisions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = sample_config();
        config.agents.push(StageConfig::new("loop-agent", "x.md"));
        let ctx = sample_loop_ctx("sess");
        inject_loop_agent(&mut config, &ctx, tmp.path(), "deadbeef-0000").unwrap();
        assert_eq!(config.agents.last().unwrap().name, "loop-agent-deadbeef");
    }

    #[test]
    fn loop_prompt_embeds_yaml_and_pending_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sample_config();
        let ctx = sample_loop_ctx("sess");
        let path = write_loop_prompt(&config, &ctx, tmp.path()).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("name: demo"));
        assert!(body.contains("pending"));
        assert!(body.contains("iteration\n1 of 3") || body.contains("1 of 3"));
        assert!(!body.contains("{{"));
    }

    #[test]
    fn queued_pipeline_adopts_session_loop_policy() {
        let initial = {
            let mut c = sample_config();
            c.looping.enabled = true;
            c.looping.max_iterations = 7;
            c
        };
        let next: PipelineConfig =
            serde_yaml::from_str("name: next\nagents:\n  - name: z\n    agent: z.md\n").unwrap();
        let adopted = adopt_loop_settings(next, &initial);
        assert!(adopted.looping.enabled);
        assert_eq!(adopted.looping.max_iterations, 7);
        assert_eq!(adopted.looping.directories.pending, initial.looping.directories.pending);
    }
}
