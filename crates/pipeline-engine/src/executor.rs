use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pipeline_core::runtime::{ExecutionOptions, ExecutionRequest, ExecutionResult};
use pipeline_core::template::TemplateVars;
use pipeline_core::tokens::estimate_tokens;
use pipeline_core::types::{
    StageConfig, StageError, StageExecution, StageStatus, StageTokenUsage,
};

use pipeline_agent::registry;

use crate::context::RunContext;
use crate::preflight::resolve_tag;

/// Elapsed-time marks at which a still-running stage draws a warning.
const WARNING_MARKS_MIN: [u64; 3] = [5, 10, 13];

/// Extra envelope on top of the runtime's own timeout, so the runtime gets
/// to deliver SIGTERM/SIGKILL before the executor gives up on it.
const TIMEOUT_GRACE: Duration = Duration::from_secs(15);

/// Run one stage to a terminal status. Never returns an error: failures are
/// classified and recorded on the returned execution, and the caller's
/// failure strategy decides what happens downstream.
pub async fn execute_stage(
    ctx: Arc<RunContext>,
    stage: StageConfig,
    is_final_group: bool,
) -> StageExecution {
    let start_time = Utc::now();
    let timeout = Duration::from_secs(stage.timeout_s());
    let retry = stage.retry.clone().unwrap_or_default();
    let max_attempts = retry.max_attempts.max(1);

    let warn_guard = spawn_warning_timers(&stage.name, timeout);

    let mut failed_attempts: u32 = 0;
    let outcome = pipeline_core::retry::run_with_retry(
        &retry,
        |event| {
            failed_attempts = event.attempt_number;
            warn!(
                stage = %stage.name,
                attempt = event.attempt_number,
                max_attempts = event.max_attempts,
                delay_ms = event.delays.last().map(|d| d.as_millis()).unwrap_or(0),
                "stage attempt failed, retrying: {}",
                event.last_error
            );
        },
        |attempt| run_attempt(&ctx, &stage, timeout, is_final_group, attempt),
    )
    .await;
    warn_guard.cancel();

    let end_time = Utc::now();
    let duration = (end_time - start_time).num_milliseconds() as f64 / 1_000.0;

    let mut execution = StageExecution {
        stage_name: stage.name.clone(),
        status: StageStatus::Running,
        start_time,
        end_time: Some(end_time),
        duration: Some(duration),
        commit_sha: None,
        commit_message: None,
        agent_output: None,
        extracted_data: None,
        token_usage: None,
        error: None,
        retry_attempt: failed_attempts,
        max_retries: max_attempts,
        condition_evaluated: None,
        condition_result: None,
    };

    match outcome {
        Ok(attempt_result) => {
            execution.status = StageStatus::Success;
            record_success(&ctx, &stage, &mut execution, attempt_result);
        }
        Err(err) => {
            // All attempts failed; the count equals max_attempts.
            execution.retry_attempt = max_attempts;
            execution.status = StageStatus::Failed;
            execution.error = Some(classify_error(&err, &stage));
        }
    }

    info!(
        stage = %stage.name,
        status = ?execution.status,
        duration_s = duration,
        attempts = execution.retry_attempt + u32::from(execution.status == StageStatus::Success),
        "stage finished"
    );

    execution
}

struct AttemptResult {
    result: ExecutionResult,
    estimated_input: u64,
}

/// One attempt, end to end: resolve the runtime, assemble prompts, run
/// under the timeout envelope. Retries re-enter here from the top.
async fn run_attempt(
    ctx: &Arc<RunContext>,
    stage: &StageConfig,
    timeout: Duration,
    is_final_group: bool,
    attempt: u32,
) -> Result<AttemptResult> {
    let tag = resolve_tag(
        &ctx.config,
        stage.runtime.as_ref().map(|r| r.type_tag.as_str()),
        ctx.default_runtime.as_deref(),
    );
    let runtime = registry::get(tag)?;

    let system_prompt = load_agent_prompt(ctx, stage)?;
    let user_prompt = build_user_prompt(ctx, stage, is_final_group)?;
    let estimated_input = estimate_tokens(&user_prompt) + estimate_tokens(&system_prompt);

    let mut runtime_options = ctx
        .config
        .runtime
        .as_ref()
        .map(|r| r.options.clone())
        .unwrap_or_default();
    if let Some(stage_runtime) = &stage.runtime {
        runtime_options.extend(stage_runtime.options.clone());
    }
    runtime_options
        .entry("cwd".to_string())
        .or_insert_with(|| serde_json::Value::from(ctx.exec_root.display().to_string()));

    let stage_name = stage.name.clone();
    let options = ExecutionOptions {
        timeout,
        permission_mode: ctx.config.settings.permission_mode,
        model: runtime_options
            .get("model")
            .and_then(serde_json::Value::as_str)
            .map(|m| m.to_lowercase()),
        max_turns: runtime_options
            .get("maxTurns")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as u32),
        max_thinking_tokens: runtime_options
            .get("maxThinkingTokens")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as u32),
        output_keys: runtime_options
            .get("outputKeys")
            .map(|v| match v {
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(String::from)
                    .collect(),
                serde_json::Value::String(s) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default(),
        on_output_update: Some(Arc::new(move |line: &str| {
            info!(stage = %stage_name, "{line}");
        })),
        runtime_options,
        cancel: ctx.cancel.child_token(),
    };

    if attempt > 1 {
        info!(stage = %stage.name, attempt, runtime = tag, "re-running stage");
    }

    let request = ExecutionRequest {
        system_prompt,
        user_prompt,
        options,
    };

    // The runtime owns the real timeout (and subprocess termination); this
    // envelope only catches a runtime that fails to honor it.
    match tokio::time::timeout(timeout + TIMEOUT_GRACE, runtime.execute(request)).await {
        Ok(result) => result.map(|result| AttemptResult {
            result,
            estimated_input,
        }),
        Err(_) => Err(anyhow!(
            "agent timed out after {} minutes",
            timeout.as_secs() / 60
        )),
    }
}

fn load_agent_prompt(ctx: &RunContext, stage: &StageConfig) -> Result<String> {
    let candidates: Vec<PathBuf> = if stage.agent.is_absolute() {
        vec![stage.agent.clone()]
    } else {
        vec![ctx.exec_root.join(&stage.agent), ctx.repo_root.join(&stage.agent)]
    };
    for path in &candidates {
        if path.is_file() {
            return std::fs::read_to_string(path)
                .with_context(|| format!("read agent file {}", path.display()));
        }
    }
    Err(anyhow!(
        "agent file not found for stage {}: {}",
        stage.name,
        stage.agent.display()
    ))
}

/// User prompt: execution environment, handover context, loop section for
/// final-group stages, then the declared inputs.
fn build_user_prompt(
    ctx: &RunContext,
    stage: &StageConfig,
    is_final_group: bool,
) -> Result<String> {
    let mut prompt = String::new();

    prompt.push_str("## Execution Environment\n\n");
    prompt.push_str(&format!("Working directory: {}\n", ctx.exec_root.display()));
    if ctx.in_worktree() {
        prompt.push_str(&format!(
            "Main repository: {}\nYou are running inside an isolated git worktree; all file \
             changes stay on branch `{}` until the pipeline merges them.\n",
            ctx.repo_root.display(),
            ctx.branch
        ));
    }
    prompt.push('\n');

    let previous = ctx.handover.previous_stages();
    let custom = ctx.config.settings.instructions.handover.as_deref();
    prompt.push_str(&ctx.handover.build_context_message(&stage.name, &previous, custom)?);

    if let Some(loop_ctx) = ctx.loop_ctx.as_ref().filter(|l| l.enabled) {
        if is_final_group {
            prompt.push_str(&format!(
                "\n## Loop Context\n\nIteration {} of {}. To queue a follow-up pipeline, write \
                 a pipeline YAML file into `{}`; it runs after this one finishes.\n",
                loop_ctx.current_iteration,
                loop_ctx.max_iterations,
                loop_ctx.directories.pending.display()
            ));
        }
    }

    if !stage.inputs.is_empty() {
        prompt.push_str("\n## Inputs\n\n");
        for (key, value) in &stage.inputs {
            prompt.push_str(&format!("- **{key}**: {value}\n"));
        }
    }

    Ok(prompt)
}

fn record_success(
    ctx: &RunContext,
    stage: &StageConfig,
    execution: &mut StageExecution,
    attempt: AttemptResult,
) {
    let AttemptResult {
        result,
        estimated_input,
    } = attempt;

    let mut usage = StageTokenUsage {
        estimated_input,
        ..Default::default()
    };
    if let Some(tokens) = &result.token_usage {
        usage.actual_input = tokens.input_tokens;
        usage.output = tokens.output_tokens;
        usage.cache_creation = tokens.cache_creation_tokens.unwrap_or(0);
        usage.cache_read = tokens.cache_read_tokens.unwrap_or(0);
        usage.thinking_tokens = tokens.thinking_tokens.unwrap_or(0);
    }
    usage.num_turns = result.num_turns;

    if let Err(e) = ctx.handover.write_stage_output(&stage.name, &result.text_output) {
        warn!(stage = %stage.name, "write_stage_output: {e}");
    }
    write_side_outputs(ctx, stage, &result);

    // Auto-commit whatever the agent changed in the execution tree.
    let auto_commit = stage.auto_commit.unwrap_or(ctx.config.settings.auto_commit);
    if auto_commit && !ctx.dry_run {
        let vars = TemplateVars {
            stage: &stage.name,
            pipeline_name: &ctx.config.name,
            run_id: &ctx.run_id,
            branch: &ctx.branch,
        };
        match ctx.git_exec().create_stage_commit(
            &ctx.config.settings.commit_prefix,
            &vars,
            stage.commit_message.as_deref(),
        ) {
            Ok(Some(commit)) => {
                execution.commit_sha = Some(commit.sha);
                execution.commit_message = Some(commit.message);
            }
            Ok(None) => {}
            Err(e) => warn!(stage = %stage.name, "auto-commit failed: {e}"),
        }
    }

    execution.agent_output = Some(result.text_output);
    execution.extracted_data = result.extracted_data;
    execution.token_usage = Some(usage);
}

/// Raw and structured stage outputs under `.agent-pipeline/outputs/<runId>/`
/// in the main repository. Best-effort.
fn write_side_outputs(ctx: &RunContext, stage: &StageConfig, result: &ExecutionResult) {
    let dir = ctx.outputs_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(stage = %stage.name, "create outputs dir: {e}");
        return;
    }
    if let Err(e) = std::fs::write(dir.join(format!("{}-raw.md", stage.name)), &result.text_output) {
        warn!(stage = %stage.name, "write raw output: {e}");
    }
    if let Some(data) = &result.extracted_data {
        if let Ok(json) = serde_json::to_string_pretty(data) {
            if let Err(e) = std::fs::write(dir.join(format!("{}-output.json", stage.name)), json) {
                warn!(stage = %stage.name, "write structured output: {e}");
            }
        }
    }
}

/// Non-blocking tiered warnings while a stage runs long. Marks at or past
/// the hard timeout are pointless and dropped.
fn spawn_warning_timers(stage_name: &str, timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let guard = token.clone();
    let stage = stage_name.to_string();
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        for mark in WARNING_MARKS_MIN {
            let at = Duration::from_secs(mark * 60);
            if at >= timeout {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(start + at) => {
                    warn!(stage = %stage, "still running after {mark} minutes");
                }
                _ = guard.cancelled() => return,
            }
        }
    });
    token
}

/// Map a failure to a user-facing error record: one-line reason, optional
/// suggestion, optional agent path for verbose output.
pub fn classify_error(err: &anyhow::Error, stage: &StageConfig) -> StageError {
    let message = format!("{err:#}");
    let lower = message.to_lowercase();

    let (code, suggestion, agent_path) = if lower.contains("agent file not found") {
        (
            "agent-file-missing",
            Some("create the prompt file or fix the stage's `agent` path".to_string()),
            Some(stage.agent.display().to_string()),
        )
    } else if lower.contains("timed out") {
        (
            "timeout",
            Some(format!(
                "raise `timeout` above {}s or split the stage into smaller ones",
                stage.timeout_s()
            )),
            None,
        )
    } else if lower.contains("aborted") {
        ("aborted", None, None)
    } else if lower.contains("no runtime registered") {
        (
            "runtime-not-found",
            Some("register the runtime at startup or fix the `runtime.type` tag".to_string()),
            None,
        )
    } else if lower.contains("failed to spawn") {
        (
            "runtime-not-installed",
            Some("install the runtime CLI named in the error".to_string()),
            None,
        )
    } else if lower.contains("exited with") {
        (
            "agent-exit",
            Some("check the execution log and the agent's stderr for the cause".to_string()),
            None,
        )
    } else {
        ("stage-error", None, None)
    };

    StageError {
        message,
        code: Some(code.to_string()),
        suggestion,
        agent_path,
    }
}
