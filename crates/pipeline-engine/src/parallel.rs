use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use pipeline_core::types::{
    PipelineState, StageConfig, StageError, StageExecution, StageStatus,
};

use crate::context::RunContext;
use crate::executor::execute_stage;
use crate::notify::NotifyKind;

/// What one level produced, for the orchestrator's failure dispatch.
#[derive(Debug, Default)]
pub struct GroupReport {
    /// Names of stages that ended `failed`, in completion order.
    pub failed: Vec<String>,
    /// True when the pipeline abort fired before or during this group.
    pub aborted: bool,
}

/// Run every stage of one level concurrently. Executions are appended to
/// `state.stages` in completion order; the state is persisted and the
/// change callback fires after every append. Stages already running when
/// an abort arrives finish on their own (the runtime kills its subprocess);
/// un-started stages never start.
pub async fn execute_group(
    ctx: &Arc<RunContext>,
    group: Vec<StageConfig>,
    state: &mut PipelineState,
    is_final_group: bool,
    on_state_change: &mut dyn FnMut(&PipelineState),
) -> GroupReport {
    let mut report = GroupReport::default();

    if ctx.cancel.is_cancelled() {
        report.aborted = true;
        for stage in &group {
            append_aborted(ctx, state, &stage.name, on_state_change);
        }
        return report;
    }

    let mut tasks: JoinSet<StageExecution> = JoinSet::new();
    // Start order follows config declaration order.
    for stage in group {
        let ctx = Arc::clone(ctx);
        tasks.spawn(async move { execute_stage(ctx, stage, is_final_group).await });
    }

    let mut completed_names: Vec<String> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let execution = match joined {
            Ok(execution) => execution,
            Err(join_err) => {
                warn!("stage task panicked: {join_err}");
                continue;
            }
        };

        match execution.status {
            StageStatus::Failed => {
                report.failed.push(execution.stage_name.clone());
                ctx.notify(
                    NotifyKind::StageFailed,
                    format!(
                        "stage {} failed: {}",
                        execution.stage_name,
                        execution
                            .error
                            .as_ref()
                            .map(|e| e.message.as_str())
                            .unwrap_or("unknown error")
                    ),
                );
            }
            _ => {
                completed_names.push(execution.stage_name.clone());
                ctx.notify(
                    NotifyKind::StageCompleted,
                    format!("stage {} completed", execution.stage_name),
                );
            }
        }

        // The log (like HANDOVER.md) is only ever written from here, in
        // completion order, so concurrent stages cannot interleave entries.
        append_log_entry(ctx, &execution);

        state.stages.push(execution);
        ctx.persist(state);
        on_state_change(state);
    }

    if ctx.cancel.is_cancelled() {
        report.aborted = true;
    }

    // Consolidate the handover snapshot once the level is done.
    if !completed_names.is_empty() {
        let merge = if completed_names.len() == 1 {
            ctx.handover.copy_stage_to_handover(&completed_names[0])
        } else {
            ctx.handover.merge_parallel_outputs(&completed_names)
        };
        if let Err(e) = merge {
            warn!("handover consolidation: {e}");
        }
    }

    report
}

fn append_log_entry(ctx: &Arc<RunContext>, execution: &StageExecution) {
    let status = match execution.status {
        StageStatus::Success => "success",
        StageStatus::Failed => "failed",
        StageStatus::Skipped => "skipped",
        StageStatus::Running => "running",
    };
    let message = if let Some(error) = &execution.error {
        error.message.clone()
    } else if let Some(usage) = &execution.token_usage {
        format!(
            "tokens: in={} out={}{}",
            usage.actual_input,
            usage.output,
            execution
                .commit_sha
                .as_deref()
                .map(|sha| format!(", commit {sha}"))
                .unwrap_or_default()
        )
    } else {
        String::new()
    };
    if let Err(e) = ctx.handover.append_to_log(
        &execution.stage_name,
        status,
        execution.duration.unwrap_or(0.0),
        &message,
    ) {
        warn!(stage = %execution.stage_name, "append_to_log: {e}");
    }
}

/// An abort before start is recorded as skipped with an abort error; the
/// pipeline-level status becomes `aborted`.
fn append_aborted(
    ctx: &Arc<RunContext>,
    state: &mut PipelineState,
    stage_name: &str,
    on_state_change: &mut dyn FnMut(&PipelineState),
) {
    state.stages.push(StageExecution::skipped(
        stage_name,
        Some(StageError {
            message: "pipeline aborted before this stage started".to_string(),
            code: Some("aborted".to_string()),
            suggestion: None,
            agent_path: None,
        }),
    ));
    ctx.persist(state);
    on_state_change(state);
}
