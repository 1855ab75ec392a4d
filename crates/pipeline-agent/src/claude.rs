use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use pipeline_core::runtime::{
    AgentRuntime, ExecutionRequest, ExecutionResult, RuntimeCapabilities, TokenUsage,
    ValidationReport,
};
use pipeline_core::types::PermissionMode;

use crate::event::StreamCollector;
use crate::extract::extract_output_keys;

/// Tools denied unless the caller supplies an explicit allow-list.
const DEFAULT_DISALLOWED_TOOLS: &[&str] = &["WebSearch"];

/// Grace period between SIGTERM and SIGKILL on timeout or abort.
const TERM_GRACE: Duration = Duration::from_secs(5);

const INSTALL_HINT: &str = "install it with: npm install -g @anthropic-ai/claude-code";

/// Runs the `claude` CLI headless (`-p --output-format stream-json`) as a
/// subprocess, one invocation per stage attempt.
pub struct ClaudeHeadlessRuntime {
    /// Path to the `claude` binary.
    pub bin: String,
}

impl Default for ClaudeHeadlessRuntime {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl ClaudeHeadlessRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn terminate(child: &mut Child) {
        if let Some(pid) = child.id() {
            // SIGTERM first so the CLI can flush its stream; SIGKILL after
            // the grace period.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        } else {
            let _ = child.start_kill();
        }
    }
}

/// CLI arguments for one request. Split out so tests can check the wire
/// format without spawning anything.
pub fn build_claude_args(request: &ExecutionRequest) -> Vec<String> {
    let options = &request.options;
    let mut args = vec![
        "-p".to_string(),
        request.user_prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if options.permission_mode != PermissionMode::Default {
        args.push("--permission-mode".to_string());
        args.push(options.permission_mode.as_cli_value().to_string());
    }
    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(max_turns) = options.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }
    if let Some(max_thinking) = options.max_thinking_tokens {
        args.push("--max-thinking-tokens".to_string());
        args.push(max_thinking.to_string());
    }
    if !request.system_prompt.is_empty() {
        args.push("--append-system-prompt".to_string());
        args.push(request.system_prompt.clone());
    }

    // Tool access: an explicit allow-list wins; otherwise deny the default
    // set plus whatever the user added.
    let allowed = string_list(options.runtime_options.get("allowedTools"));
    if !allowed.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed.join(","));
    } else {
        let mut disallowed: Vec<String> = DEFAULT_DISALLOWED_TOOLS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for tool in string_list(options.runtime_options.get("disallowedTools")) {
            if !disallowed.contains(&tool) {
                disallowed.push(tool);
            }
        }
        args.push("--disallowedTools".to_string());
        args.push(disallowed.join(","));
    }

    // Remaining runtime options pass through as flags.
    let mut extra: Vec<(&String, &Value)> = options
        .runtime_options
        .iter()
        .filter(|(k, _)| {
            // Handled via dedicated options/flags above, or not CLI-visible.
            !matches!(
                k.as_str(),
                "cwd" | "allowedTools" | "disallowedTools" | "outputKeys" | "model"
                    | "maxTurns" | "maxThinkingTokens"
            )
        })
        .collect();
    extra.sort_by_key(|(k, _)| k.as_str());
    for (key, value) in extra {
        match value {
            Value::Bool(true) => args.push(format!("--{key}")),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) => {
                args.push(format!("--{key}"));
                args.push(s.clone());
            }
            Value::Number(n) => {
                args.push(format!("--{key}"));
                args.push(n.to_string());
            }
            other => {
                args.push(format!("--{key}"));
                args.push(other.to_string());
            }
        }
    }

    args
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn to_token_usage(usage: &crate::event::Usage) -> TokenUsage {
    let input = usage.input_tokens.unwrap_or(0);
    let output = usage.output_tokens.unwrap_or(0);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        cache_creation_tokens: usage.cache_creation_input_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
        thinking_tokens: usage.thinking_tokens,
        total_tokens: input + output,
    }
}

#[async_trait]
impl AgentRuntime for ClaudeHeadlessRuntime {
    fn type_tag(&self) -> &str {
        "claude-code-headless"
    }

    fn name(&self) -> &str {
        "Claude Code (headless CLI)"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let args = build_claude_args(&request);
        let options = &request.options;

        let cwd: Option<PathBuf> = options
            .runtime_options
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        info!(runtime = self.type_tag(), cwd = ?cwd, "spawning claude subprocess");

        let mut child = cmd.spawn().map_err(|e| {
            anyhow!("failed to spawn {:?}: {e}; {INSTALL_HINT}", self.bin)
        })?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut collector = StreamCollector::new();
        let mut stderr_tail = String::new();

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line.context("error reading claude stdout")? {
                        Some(l) => {
                            for activity in collector.push_line(&l) {
                                if let Some(cb) = &options.on_output_update {
                                    cb(&activity);
                                }
                            }
                        }
                        None => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            warn!(runtime = self.type_tag(), "claude stderr: {}", l);
                            stderr_tail.push_str(&l);
                            stderr_tail.push('\n');
                        }
                    }
                }
                _ = &mut deadline => {
                    Self::terminate(&mut child).await;
                    bail!(
                        "agent timed out after {} minutes",
                        options.timeout.as_secs() / 60
                    );
                }
                _ = options.cancel.cancelled() => {
                    Self::terminate(&mut child).await;
                    bail!("agent aborted");
                }
            }
        }

        while let Ok(Some(l)) = stderr_lines.next_line().await {
            if !l.is_empty() {
                stderr_tail.push_str(&l);
                stderr_tail.push('\n');
            }
        }

        let exit_status = child.wait().await.context("failed to wait for claude")?;
        if !exit_status.success() {
            let tail: String = stderr_tail
                .chars()
                .rev()
                .take(2_000)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            bail!(
                "claude exited with {}: {}",
                exit_status.code().unwrap_or(-1),
                tail.trim()
            );
        }

        let outcome = collector.finish();

        info!(
            runtime = self.type_tag(),
            num_turns = ?outcome.num_turns,
            output_len = outcome.text.len(),
            "claude subprocess finished"
        );

        let mut metadata: HashMap<String, Value> = HashMap::new();
        if let Some(sid) = &outcome.session_id {
            metadata.insert("session_id".to_string(), Value::from(sid.clone()));
        }
        if let Some(cost) = outcome.total_cost_usd {
            metadata.insert("total_cost_usd".to_string(), Value::from(cost));
        }
        if let Some(ms) = outcome.duration_ms {
            metadata.insert("duration_ms".to_string(), Value::from(ms));
        }

        Ok(ExecutionResult {
            extracted_data: extract_output_keys(&outcome.text, &options.output_keys),
            token_usage: outcome.usage.as_ref().map(to_token_usage),
            num_turns: outcome.num_turns.map(|n| n as u32),
            metadata,
            text_output: outcome.text,
        })
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: true,
            supports_token_tracking: true,
            supports_mcp: true,
            supports_context_reduction: false,
            available_models: vec![
                "sonnet".to_string(),
                "opus".to_string(),
                "haiku".to_string(),
            ],
            permission_modes: vec![
                PermissionMode::Default,
                PermissionMode::AcceptEdits,
                PermissionMode::BypassPermissions,
                PermissionMode::Plan,
            ],
        }
    }

    async fn validate(&self) -> ValidationReport {
        let probe = Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match probe {
            Ok(status) if status.success() => ValidationReport::ok(),
            Ok(status) => ValidationReport::invalid(format!(
                "{:?} --version exited with {}",
                self.bin,
                status.code().unwrap_or(-1)
            )),
            Err(e) => ValidationReport::invalid(format!(
                "{:?} is not runnable ({e}); {INSTALL_HINT}",
                self.bin
            )),
        }
    }
}
