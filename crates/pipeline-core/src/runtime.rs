use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::PermissionMode;

/// Callback fed human-readable activity lines while an agent streams.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Options accompanying one agent invocation.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Hard timeout for the whole invocation.
    pub timeout: Duration,
    pub permission_mode: PermissionMode,
    /// Normalized lowercase model tag, or none for the runtime default.
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_thinking_tokens: Option<u32>,
    /// Keys the caller expects in the structured output.
    pub output_keys: Vec<String>,
    pub on_output_update: Option<OutputCallback>,
    /// Opaque bag forwarded to the runtime (`cwd`, `allowedTools`,
    /// `disallowedTools`, `resume`, ...).
    pub runtime_options: HashMap<String, serde_json::Value>,
    pub cancel: CancellationToken,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::types::DEFAULT_STAGE_TIMEOUT_S),
            permission_mode: PermissionMode::Default,
            model: None,
            max_turns: None,
            max_thinking_tokens: None,
            output_keys: Vec::new(),
            on_output_update: None,
            runtime_options: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("timeout", &self.timeout)
            .field("permission_mode", &self.permission_mode)
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .field("output_keys", &self.output_keys)
            .field("runtime_options", &self.runtime_options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: ExecutionOptions,
}

/// Token accounting as reported by a runtime. `total_tokens` is
/// input + output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub text_output: String,
    pub extracted_data: Option<HashMap<String, serde_json::Value>>,
    pub token_usage: Option<TokenUsage>,
    pub num_turns: Option<u32>,
    /// Runtime-specific extras (session id, cost, wall time, ...).
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RuntimeCapabilities {
    pub supports_streaming: bool,
    pub supports_token_tracking: bool,
    pub supports_mcp: bool,
    pub supports_context_reduction: bool,
    pub available_models: Vec<String>,
    pub permission_modes: Vec<PermissionMode>,
}

/// Environment check result; an invalid runtime must not be selected.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// One mechanism for invoking an agent: an in-process SDK or a spawned CLI.
/// Implementations are registered in the runtime registry at process start
/// and looked up by their type tag.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Registry tag, e.g. `claude-code-headless`.
    fn type_tag(&self) -> &str;

    /// Human-readable name for logs and errors.
    fn name(&self) -> &str;

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;

    fn capabilities(&self) -> RuntimeCapabilities;

    async fn validate(&self) -> ValidationReport;
}

/// Default runtime tag when neither the stage, the pipeline, nor the caller
/// selects one.
pub const DEFAULT_RUNTIME_TAG: &str = "claude-code-headless";
