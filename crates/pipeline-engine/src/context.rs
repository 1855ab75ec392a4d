use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pipeline_core::git::Git;
use pipeline_core::handover::HandoverManager;
use pipeline_core::state::StateManager;
use pipeline_core::types::{LoopContext, PipelineConfig};

use crate::notify::{Notifier, NotifyEvent, NotifyKind};

/// Everything a run's executors share. Built once by the initializer and
/// handed around as an `Arc`; all mutation of the pipeline state itself
/// stays with the orchestrator thread.
pub struct RunContext {
    pub config: PipelineConfig,
    pub run_id: String,
    /// First 8 hex chars of `run_id`.
    pub short_id: String,
    /// Main repository root. State and outputs always land here.
    pub repo_root: PathBuf,
    /// Where stages execute: the worktree, or `repo_root` without isolation.
    pub exec_root: PathBuf,
    pub branch: String,
    pub handover: HandoverManager,
    pub state_mgr: StateManager,
    pub notifier: Arc<dyn Notifier>,
    pub cancel: CancellationToken,
    pub dry_run: bool,
    /// Caller-injected default runtime tag, consulted after stage- and
    /// pipeline-level settings.
    pub default_runtime: Option<String>,
    pub loop_ctx: Option<LoopContext>,
}

impl RunContext {
    pub fn git_main(&self) -> Git {
        Git::new(&self.repo_root)
    }

    pub fn git_exec(&self) -> Git {
        Git::new(&self.exec_root)
    }

    pub fn in_worktree(&self) -> bool {
        self.exec_root != self.repo_root
    }

    /// Per-run outputs directory under the main repository.
    pub fn outputs_dir(&self) -> PathBuf {
        self.repo_root
            .join(".agent-pipeline")
            .join("outputs")
            .join(&self.run_id)
    }

    /// Persist the run state. Persistence failures are logged and
    /// swallowed: the run keeps going and readers may see a stale state.
    pub fn persist(&self, state: &pipeline_core::types::PipelineState) {
        if let Err(e) = self.state_mgr.save(state) {
            tracing::warn!(run_id = %self.run_id, "state persistence failed: {e:#}");
        }
    }

    pub fn notify(&self, kind: NotifyKind, detail: impl Into<String>) {
        self.notifier.notify(&NotifyEvent {
            kind,
            pipeline: self.config.name.clone(),
            run_id: self.run_id.clone(),
            detail: detail.into(),
        });
    }
}
