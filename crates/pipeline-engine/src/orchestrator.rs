use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use pipeline_core::config::validate_config;
use pipeline_core::dag;
use pipeline_core::types::{
    FailureStrategy, LoopContext, PipelineConfig, PipelineState, PipelineStatus, StageError,
    StageExecution,
};

use crate::context::RunContext;
use crate::finalize::finalize;
use crate::init::{initialize, InitOptions};
use crate::loop_exec;
use crate::notify::{LogNotifier, Notifier};
use crate::parallel::execute_group;
use crate::preflight;

/// Drives a pipeline run end to end: validate → plan → init → level-by-level
/// execution → finalize. Owns the abort token and all shared-state mutation;
/// stage executors only hand completed executions back.
pub struct Orchestrator {
    pub repo_root: PathBuf,
    pub notifier: Arc<dyn Notifier>,
    pub default_runtime: Option<String>,
    pub dry_run: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            notifier: Arc::new(LogNotifier),
            default_runtime: None,
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_default_runtime(mut self, tag: impl Into<String>) -> Self {
        self.default_runtime = Some(tag.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Token observers can trigger to abort the run (and any loop).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a pipeline. With looping enabled this chains runs through the
    /// queue directories; otherwise it is a single run.
    pub async fn run(
        &self,
        config: PipelineConfig,
        source: Option<PathBuf>,
    ) -> Result<PipelineState> {
        if config.looping.enabled {
            loop_exec::run_loop(self, config, source).await
        } else {
            self.run_once(config, None).await
        }
    }

    /// One pipeline run. Loop iterations re-enter here with their context.
    pub(crate) async fn run_once(
        &self,
        config: PipelineConfig,
        loop_ctx: Option<LoopContext>,
    ) -> Result<PipelineState> {
        // Config problems are fatal before any state is written.
        let report = validate_config(&config);
        for warning in &report.warnings {
            warn!(pipeline = %config.name, "config warning: {warning}");
        }
        if !report.is_valid() {
            bail!(
                "pipeline {} failed validation: {}",
                config.name,
                report.errors.join("; ")
            );
        }

        let run_id = Uuid::new_v4().to_string();

        // Looping injects a synthetic final stage that depends on all others.
        let mut config = config;
        if let Some(lc) = &loop_ctx {
            loop_exec::inject_loop_agent(&mut config, lc, &self.repo_root, &run_id)?;
        }

        let plan = dag::plan(&config)?;
        for warning in &plan.warnings {
            warn!(pipeline = %config.name, "plan warning: {warning}");
        }
        info!(
            pipeline = %config.name,
            stages = plan.total_stages,
            groups = plan.groups.len(),
            max_parallelism = plan.max_parallelism,
            "execution plan ready"
        );

        preflight::check(&self.repo_root, &config, self.default_runtime.as_deref()).await?;

        let (ctx, mut state) = initialize(
            &self.repo_root,
            config,
            InitOptions {
                notifier: Arc::clone(&self.notifier),
                cancel: self.cancel.child_token(),
                dry_run: self.dry_run,
                default_runtime: self.default_runtime.clone(),
                loop_ctx,
                run_id: Some(run_id),
            },
        )
        .await?;

        self.execute_plan(&ctx, &plan, &mut state).await?;

        finalize(&ctx, &mut state).await?;
        Ok(state)
    }

    /// Advance level by level; group `k+1` starts only after every stage of
    /// group `k` is terminal, and every status change is persisted before
    /// the next decision.
    async fn execute_plan(
        &self,
        ctx: &Arc<RunContext>,
        plan: &dag::ExecutionPlan,
        state: &mut PipelineState,
    ) -> Result<()> {
        // Stages that failed, or were skipped because a dependency failed.
        // Disabled stages are transparent: their dependents still run.
        let mut unrunnable: HashSet<String> = HashSet::new();
        let total_groups = plan.groups.len();

        for (index, group_names) in plan.groups.iter().enumerate() {
            let is_final_group = index + 1 == total_groups;
            if is_final_group {
                if let Some(lc) = state.loop_context.as_mut() {
                    lc.is_final_group = Some(true);
                }
            }

            let mut to_run = Vec::new();
            for name in group_names {
                let Some(stage) = ctx.config.stage(name).cloned() else {
                    continue;
                };
                if !stage.enabled {
                    info!(stage = %name, "stage disabled, skipping");
                    self.push_skipped(ctx, state, name, None);
                    continue;
                }
                if let Some(dep) = stage.depends_on.iter().find(|d| unrunnable.contains(*d)) {
                    self.push_skipped(
                        ctx,
                        state,
                        name,
                        Some(StageError {
                            message: format!("dependency {dep} did not succeed"),
                            code: Some("dependency-failed".to_string()),
                            suggestion: None,
                            agent_path: None,
                        }),
                    );
                    unrunnable.insert(name.clone());
                    continue;
                }
                to_run.push(stage);
            }

            if to_run.is_empty() {
                continue;
            }

            let report =
                execute_group(ctx, to_run, state, is_final_group, &mut |_state| {}).await;

            if report.aborted {
                state.status = PipelineStatus::Aborted;
                ctx.persist(state);
                return Ok(());
            }

            // Failure-strategy dispatch, evaluated once the group finished.
            let mut stop = false;
            for name in &report.failed {
                let strategy = ctx
                    .config
                    .stage(name)
                    .and_then(|s| s.on_fail)
                    .unwrap_or(ctx.config.settings.failure_strategy);
                match strategy {
                    FailureStrategy::Stop => {
                        stop = true;
                    }
                    FailureStrategy::Warn => {
                        warn!(stage = %name, "stage failed; continuing (onFail=warn)");
                        unrunnable.insert(name.clone());
                    }
                    FailureStrategy::Continue => {
                        unrunnable.insert(name.clone());
                    }
                }
            }
            if stop {
                state.status = PipelineStatus::Failed;
                ctx.persist(state);
                return Ok(());
            }
        }

        if state.status == PipelineStatus::Running {
            state.status = PipelineStatus::Completed;
        }
        ctx.persist(state);
        Ok(())
    }

    fn push_skipped(
        &self,
        ctx: &Arc<RunContext>,
        state: &mut PipelineState,
        name: &str,
        error: Option<StageError>,
    ) {
        state.stages.push(StageExecution::skipped(name, error));
        ctx.persist(state);
    }
}
