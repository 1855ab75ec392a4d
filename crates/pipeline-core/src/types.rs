use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Hard timeout applied to a stage when the config gives none.
pub const DEFAULT_STAGE_TIMEOUT_S: u64 = 900;

/// Upper bound on loop iterations when the config gives none.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

// ── Pipeline configuration ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Schedule,
}

impl Default for TriggerKind {
    fn default() -> Self {
        Self::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    /// Mark the pipeline failed; no downstream group starts.
    Stop,
    /// Log the failure, continue; dependents of the failed stage are skipped.
    Warn,
    /// Same as Warn without the user-facing warning.
    Continue,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        Self::Stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Parallel
    }
}

/// Permission modes understood by agent runtimes (mirrors the `claude` CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_cli_value(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Default
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    /// One fixed branch per pipeline, reused across runs.
    Reusable,
    /// A fresh branch per run, kept after the run for manual cleanup.
    UniquePerRun,
    /// A fresh branch per run, deleted with its worktree on success.
    UniqueAndDelete,
}

impl Default for BranchStrategy {
    fn default() -> Self {
        Self::Reusable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    PullRequest,
    LocalMerge,
    None,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::None
    }
}

/// Runtime selection: a type tag plus an opaque options bag forwarded to the
/// runtime (`cwd`, `allowedTools`, `resume`, model flags, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// One agent invocation in the pipeline DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub name: String,
    /// Path to the agent prompt file (becomes the system prompt).
    pub agent: PathBuf,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hard timeout in seconds. Default 900.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the pipeline-level failure strategy for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FailureStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    /// Named inputs rendered verbatim into the agent prompt, in order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_commit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    /// Opaque condition expression; the engine carries it but does not evaluate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_true() -> bool {
    true
}

impl StageConfig {
    pub fn new(name: impl Into<String>, agent: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            depends_on: Vec::new(),
            enabled: true,
            timeout: None,
            retry: None,
            on_fail: None,
            runtime: None,
            inputs: IndexMap::new(),
            auto_commit: None,
            commit_message: None,
            condition: None,
        }
    }

    pub fn timeout_s(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_STAGE_TIMEOUT_S)
    }
}

/// Paths to user-supplied instruction templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub looping: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Commit message template; `{{stage}}`, `{{pipelineName}}`, `{{runId}}`
    /// and `{{branch}}` are substituted.
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub preserve_working_tree: bool,
    #[serde(default)]
    pub instructions: InstructionPaths,
}

fn default_commit_prefix() -> String {
    "pipeline({{pipelineName}}): {{stage}}".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_commit: true,
            commit_prefix: default_commit_prefix(),
            execution_mode: ExecutionMode::default(),
            failure_strategy: FailureStrategy::default(),
            permission_mode: PermissionMode::default(),
            preserve_working_tree: false,
            instructions: InstructionPaths::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSettings {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub branch_strategy: BranchStrategy,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub pull_request: PullRequestSettings,
    #[serde(default)]
    pub worktree: WorktreeSettings,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "pipeline".to_string()
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            branch_strategy: BranchStrategy::default(),
            branch_prefix: default_branch_prefix(),
            merge_strategy: MergeStrategy::default(),
            pull_request: PullRequestSettings::default(),
            worktree: WorktreeSettings::default(),
        }
    }
}

/// The four loop queue directories. Relative paths are resolved against the
/// main repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDirs {
    pub pending: PathBuf,
    pub running: PathBuf,
    pub finished: PathBuf,
    pub failed: PathBuf,
}

impl QueueDirs {
    /// Default layout under `.agent-pipeline/loops/<session>/`.
    pub fn for_session(session: &str) -> Self {
        let base = PathBuf::from(".agent-pipeline").join("loops").join(session);
        Self {
            pending: base.join("pending"),
            running: base.join("running"),
            finished: base.join("finished"),
            failed: base.join("failed"),
        }
    }

    pub fn all(&self) -> [&PathBuf; 4] {
        [&self.pending, &self.running, &self.finished, &self.failed]
    }
}

impl Default for QueueDirs {
    fn default() -> Self {
        Self::for_session("default")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub directories: QueueDirs,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            directories: QueueDirs::default(),
        }
    }
}

/// A declarative pipeline as loaded from YAML. Immutable for the duration of
/// a run; the state carries a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    pub agents: Vec<StageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub git: GitSettings,
    #[serde(default)]
    pub looping: LoopSettings,
    /// Opaque to the core; consumed by notification adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<serde_yaml::Value>,
    /// Opaque to the core; consumed by the handover template loader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<serde_yaml::Value>,
}

impl PipelineConfig {
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.agents.iter().find(|s| s.name == name)
    }
}

// ── Pipeline state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub commit_sha: String,
    pub timestamp: DateTime<Utc>,
}

/// Token accounting persisted per stage. Field names are part of the on-disk
/// state schema and stay snake_case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTokenUsage {
    pub estimated_input: u64,
    pub actual_input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_creation: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub thinking_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_path: Option<String>,
}

/// One completed (or skipped) stage as appended to `PipelineState.stages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    pub stage_name: String,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<StageTokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_evaluated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

impl StageExecution {
    pub fn skipped(stage_name: impl Into<String>, reason: Option<StageError>) -> Self {
        let now = Utc::now();
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Skipped,
            start_time: now,
            end_time: Some(now),
            duration: Some(0.0),
            commit_sha: None,
            commit_message: None,
            agent_output: None,
            extracted_data: None,
            token_usage: None,
            error: reason,
            retry_attempt: 0,
            max_retries: 0,
            condition_evaluated: None,
            condition_result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub url: String,
    pub number: u64,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    pub initial_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Seconds.
    #[serde(default)]
    pub total_duration: f64,
    pub handover_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_repo_handover_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    Natural,
    LimitReached,
    Failure,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    pub enabled: bool,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub loop_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    pub directories: QueueDirs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final_group: Option<bool>,
}

/// Full state of one pipeline run. Created by the initializer, mutated
/// monotonically, persisted after every stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub run_id: String,
    pub pipeline_config: PipelineConfig,
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub stages: Vec<StageExecution>,
    pub status: PipelineStatus,
    pub artifacts: Artifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_context: Option<LoopContext>,
}

impl PipelineState {
    /// First 8 hex chars of the run id, used in branch and directory names.
    pub fn short_run_id(&self) -> String {
        short_run_id(&self.run_id)
    }

    pub fn stage_execution(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_name == name)
    }
}

pub fn short_run_id(run_id: &str) -> String {
    run_id.chars().filter(|c| *c != '-').take(8).collect()
}

// ── Loop sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopStatus {
    Running,
    Completed,
    Failed,
    LimitReached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration_number: u32,
    pub pipeline_name: String,
    pub run_id: String,
    pub status: String,
    /// Seconds.
    pub duration: f64,
    pub triggered_next: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: LoopStatus,
    pub max_iterations: u32,
    pub total_iterations: u32,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
}
