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
    AgentRuntime, ExecutionRequest, ExecutionResult, RuntimeCapabilities, ValidationReport,
};
use pipeline_core::types::PermissionMode;

use crate::extract::extract_output_keys;

const TERM_GRACE: Duration = Duration::from_secs(5);

/// Runs `codex exec` headless. The final message is read back from a file
/// because the codex CLI interleaves progress output on stdout.
pub struct CodexHeadlessRuntime {
    pub bin: String,
}

impl Default for CodexHeadlessRuntime {
    fn default() -> Self {
        Self::new("codex")
    }
}

impl CodexHeadlessRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn terminate(child: &mut Child) {
        if let Some(pid) = child.id() {
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

/// Arguments for one request, minus the output-file path (injected by the
/// caller because it is per-invocation).
pub fn build_codex_args(request: &ExecutionRequest, output_file: &str) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--output-last-message".to_string(),
        output_file.to_string(),
        "--full-auto".to_string(),
    ];
    if let Some(model) = &request.options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    // Codex takes a single prompt argument; fold the system prompt in.
    let mut prompt = String::new();
    if !request.system_prompt.is_empty() {
        prompt.push_str(&request.system_prompt);
        prompt.push_str("\n\n---\n\n");
    }
    prompt.push_str(&request.user_prompt);
    args.push(prompt);

    args
}

#[async_trait]
impl AgentRuntime for CodexHeadlessRuntime {
    fn type_tag(&self) -> &str {
        "codex-headless"
    }

    fn name(&self) -> &str {
        "Codex (headless CLI)"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let options = &request.options;

        let output_file = tempfile::NamedTempFile::new().context("create codex output file")?;
        let output_path = output_file.path().to_string_lossy().into_owned();
        let args = build_codex_args(&request, &output_path);

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

        info!(runtime = self.type_tag(), cwd = ?cwd, "spawning codex subprocess");

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {:?}: {e}; install the codex CLI first", self.bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut stderr_tail = String::new();

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line.context("error reading codex stdout")? {
                        Some(l) => {
                            if !l.is_empty() {
                                if let Some(cb) = &options.on_output_update {
                                    cb(&l);
                                }
                            }
                        }
                        None => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            warn!(runtime = self.type_tag(), "codex stderr: {}", l);
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

        let exit_status = child.wait().await.context("failed to wait for codex")?;
        if !exit_status.success() {
            bail!(
                "codex exited with {}: {}",
                exit_status.code().unwrap_or(-1),
                stderr_tail.trim()
            );
        }

        let text_output = std::fs::read_to_string(output_file.path())
            .unwrap_or_default()
            .trim_end()
            .to_string();

        info!(
            runtime = self.type_tag(),
            output_len = text_output.len(),
            "codex subprocess finished"
        );

        Ok(ExecutionResult {
            extracted_data: extract_output_keys(&text_output, &options.output_keys),
            token_usage: None,
            num_turns: None,
            metadata: HashMap::new(),
            text_output,
        })
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: true,
            supports_token_tracking: false,
            supports_mcp: false,
            supports_context_reduction: false,
            available_models: Vec::new(),
            permission_modes: vec![PermissionMode::Default, PermissionMode::BypassPermissions],
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
            Err(e) => {
                ValidationReport::invalid(format!("{:?} is not runnable ({e})", self.bin))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::runtime::ExecutionOptions;

    #[test]
    fn exec_args_carry_output_file_and_full_auto() {
        let request = ExecutionRequest {
            system_prompt: String::new(),
            user_prompt: "fix the bug".to_string(),
            options: ExecutionOptions::default(),
        };
        let args = build_codex_args(&request, "/tmp/out.txt");
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "--output-last-message");
        assert_eq!(args[2], "/tmp/out.txt");
        assert_eq!(args[3], "--full-auto");
        assert_eq!(args.last().map(String::as_str), Some("fix the bug"));
    }

    #[test]
    fn system_prompt_is_folded_into_the_prompt() {
        let request = ExecutionRequest {
            system_prompt: "you are careful".to_string(),
            user_prompt: "do it".to_string(),
            options: ExecutionOptions::default(),
        };
        let args = build_codex_args(&request, "/tmp/out.txt");
        let prompt = args.last().unwrap();
        assert!(prompt.starts_with("you are careful"));
        assert!(prompt.ends_with("do it"));
    }
}
