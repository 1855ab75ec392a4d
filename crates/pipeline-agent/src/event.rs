use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by the headless CLI
/// (`--output-format stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message — emitted once at the very end.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text { text: String },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Textual output (may be empty if last turn was a tool call).
    pub result: Option<String>,
    /// Some CLI versions use `output` instead of `result`.
    pub output: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub usage: Option<Usage>,
}

impl ResultEvent {
    pub fn text(&self) -> Option<&str> {
        self.result.as_deref().or(self.output.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
}

/// Short human-readable line describing a tool call, fed to the caller's
/// output-update callback while the agent streams.
pub fn activity_line(name: &str, input: &Value) -> String {
    let detail = ["file_path", "path", "command", "pattern", "query", "url", "description"]
        .iter()
        .find_map(|field| input.get(field).and_then(Value::as_str));
    match detail {
        Some(d) => {
            let mut d = d.replace('\n', " ");
            if d.len() > 120 {
                d.truncate(120);
                d.push('…');
            }
            format!("{name}: {d}")
        }
        None => name.to_string(),
    }
}

/// Everything the stream yielded once the subprocess exits.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutcome {
    pub text: String,
    pub session_id: Option<String>,
    pub usage: Option<Usage>,
    pub num_turns: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub is_error: bool,
}

/// Incremental NDJSON parser. Fed one line at a time while the subprocess
/// streams; the last parseable result event is authoritative, with the
/// accumulated assistant text as fallback.
#[derive(Default)]
pub struct StreamCollector {
    assistant_text: String,
    session_id: Option<String>,
    last_result: Option<ResultEvent>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one stream line. Returns activity lines for tool calls so the
    /// caller can forward them to its update callback.
    pub fn push_line(&mut self, line: &str) -> Vec<String> {
        if line.is_empty() {
            return Vec::new();
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut activity = Vec::new();
        match event {
            AgentEvent::System(e) => {
                if let Some(sid) = e.session_id {
                    self.session_id = Some(sid);
                }
            }
            AgentEvent::Assistant(e) => {
                let blocks = e.message.and_then(|m| m.content).unwrap_or_default();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !self.assistant_text.is_empty() {
                                self.assistant_text.push('\n');
                            }
                            self.assistant_text.push_str(&text);
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            activity.push(activity_line(&name, &input));
                        }
                        _ => {}
                    }
                }
            }
            AgentEvent::Result(e) => {
                if let Some(sid) = &e.session_id {
                    self.session_id = Some(sid.clone());
                }
                self.last_result = Some(e);
            }
            _ => {}
        }
        activity
    }

    pub fn finish(self) -> ParsedOutcome {
        let mut outcome = ParsedOutcome {
            session_id: self.session_id,
            ..ParsedOutcome::default()
        };
        if let Some(result) = self.last_result {
            outcome.text = result.text().unwrap_or_default().to_string();
            outcome.usage = result.usage.clone();
            outcome.num_turns = result.num_turns;
            outcome.total_cost_usd = result.total_cost_usd;
            outcome.duration_ms = result.duration_ms;
            outcome.is_error = result.is_error.unwrap_or(false);
        }
        // Fall back to collected assistant text if the result was empty.
        if outcome.text.is_empty() && !self.assistant_text.is_empty() {
            outcome.text = self.assistant_text;
        }
        outcome
    }
}

/// Parse a complete NDJSON stream in one pass.
pub fn parse_stream(data: &str) -> ParsedOutcome {
    let mut collector = StreamCollector::new();
    for line in data.lines() {
        collector.push_line(line);
    }
    collector.finish()
}
