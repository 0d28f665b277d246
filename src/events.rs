//! Parsing of the agent's structured stdout stream.
//!
//! The agent emits one JSON event per line. Every line becomes an
//! [`AgentEvent`]; lines that are not JSON (or carry an unknown type tag)
//! are preserved verbatim as `Raw` so nothing is dropped from the log.

use serde_json::{json, Value};

use crate::types::{LogLevel, TaskMode};

/// Marker the plan-mode preamble asks the agent to emit between the plan
/// and the implementation output.
pub const PLAN_SENTINEL: &str = "---PLAN END---";

/// A single parsed event from the agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    System {
        model: String,
    },
    Assistant {
        text: Vec<String>,
        tools: Vec<String>,
    },
    ToolUse {
        name: String,
        summary: String,
    },
    Result {
        text: String,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
        cost_usd: Option<f64>,
    },
    Error {
        message: String,
    },
    Raw {
        line: String,
    },
}

/// Parse one stdout line. Never fails: anything unrecognised becomes `Raw`.
pub fn parse_line(line: &str) -> AgentEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            return AgentEvent::Raw {
                line: line.to_string(),
            }
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("system") => AgentEvent::System {
            model: value
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        },
        Some("assistant") => {
            let mut text = Vec::new();
            let mut tools = Vec::new();
            if let Some(blocks) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
            {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(Value::as_str) {
                                text.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let name = block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("tool");
                            tools.push(tool_summary(name, block.get("input")));
                        }
                        _ => {}
                    }
                }
            }
            AgentEvent::Assistant { text, tools }
        }
        Some("tool_use") => {
            let name = value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string();
            let summary = tool_summary(&name, value.get("input"));
            AgentEvent::ToolUse { name, summary }
        }
        Some("result") => {
            let usage = value.get("usage");
            let cost_usd = value
                .get("total_cost_usd")
                .and_then(Value::as_f64)
                .or_else(|| value.get("cost").and_then(Value::as_f64))
                .or_else(|| usage.and_then(|u| u.get("cost")).and_then(Value::as_f64));
            AgentEvent::Result {
                text: value
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_tokens: usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_i64),
                output_tokens: usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64),
                cost_usd,
            }
        }
        Some("error") => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| {
                    value
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                })
                .unwrap_or("unknown agent error")
                .to_string();
            AgentEvent::Error { message }
        }
        _ => AgentEvent::Raw {
            line: line.to_string(),
        },
    }
}

/// Short human summary of a tool invocation, shown in the task log.
fn tool_summary(name: &str, input: Option<&Value>) -> String {
    let field = |key: &str| {
        input
            .and_then(|i| i.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match name {
        "Bash" => match field("command") {
            Some(cmd) => {
                let short: String = cmd.chars().take(100).collect();
                format!("[Running: {}]", short)
            }
            None => format!("[Using {}]", name),
        },
        "Edit" | "Write" => match field("file_path") {
            Some(path) => format!("[{}: {}]", name, path),
            None => format!("[Using {}]", name),
        },
        "Read" => match field("file_path") {
            Some(path) => format!("[Reading: {}]", path),
            None => format!("[Using {}]", name),
        },
        _ => format!("[Using {}]", name),
    }
}

impl AgentEvent {
    /// Log severity of this event. Agent errors are logged as errors but do
    /// not by themselves fail the task.
    pub fn level(&self) -> LogLevel {
        match self {
            AgentEvent::Error { .. } => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    /// UI-visible summary line for the task log.
    pub fn message(&self) -> String {
        match self {
            AgentEvent::System { model } => format!("agent session started (model: {})", model),
            AgentEvent::Assistant { text, tools } => {
                let mut parts = text.clone();
                parts.extend(tools.iter().cloned());
                if parts.is_empty() {
                    "assistant message".to_string()
                } else {
                    parts.join("\n")
                }
            }
            AgentEvent::ToolUse { summary, .. } => summary.clone(),
            AgentEvent::Result { text, .. } => {
                if text.is_empty() {
                    "agent run finished".to_string()
                } else {
                    text.clone()
                }
            }
            AgentEvent::Error { message } => message.clone(),
            AgentEvent::Raw { line } => line.clone(),
        }
    }

    /// Wire representation of a recognised event. Parsing the result of this
    /// yields an event with the same semantic fields (text, usage, cost).
    pub fn to_wire(&self) -> Value {
        match self {
            AgentEvent::System { model } => json!({ "type": "system", "model": model }),
            AgentEvent::Assistant { text, .. } => {
                let blocks: Vec<Value> = text
                    .iter()
                    .map(|t| json!({ "type": "text", "text": t }))
                    .collect();
                json!({ "type": "assistant", "message": { "content": blocks } })
            }
            AgentEvent::ToolUse { name, .. } => json!({ "type": "tool_use", "name": name }),
            AgentEvent::Result {
                text,
                input_tokens,
                output_tokens,
                cost_usd,
            } => json!({
                "type": "result",
                "result": text,
                "usage": {
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                },
                "total_cost_usd": cost_usd,
            }),
            AgentEvent::Error { message } => json!({ "type": "error", "message": message }),
            AgentEvent::Raw { line } => Value::String(line.clone()),
        }
    }
}

/// Final fields extracted from a completed stream.
#[derive(Debug, Clone, Default)]
pub struct FinalOutput {
    pub output: Option<String>,
    pub plan: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

/// Accumulates assistant text across a stream and records the terminal
/// `result` event, if one arrives.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    chunks: Vec<String>,
    result: Option<AgentEvent>,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Assistant { text, .. } => {
                self.chunks.extend(text.iter().cloned());
            }
            AgentEvent::Result { .. } => {
                self.result = Some(event.clone());
            }
            _ => {}
        }
    }

    /// Fold the stream into final output fields. With no terminal event the
    /// output is the assistant text in emission order and usage stays unset.
    /// In plan mode the text is split at the first sentinel; a missing
    /// sentinel means the whole text is the plan.
    pub fn finalize(self, mode: TaskMode) -> FinalOutput {
        let (text, input_tokens, output_tokens, cost_usd) = match self.result {
            Some(AgentEvent::Result {
                text,
                input_tokens,
                output_tokens,
                cost_usd,
            }) => (text, input_tokens, output_tokens, cost_usd),
            _ => (self.chunks.join("\n"), None, None, None),
        };

        let (output, plan) = match mode {
            TaskMode::Execute => (Some(text), None),
            TaskMode::Plan => match text.find(PLAN_SENTINEL) {
                Some(idx) => {
                    let plan = text[..idx].trim().to_string();
                    let rest = text[idx + PLAN_SENTINEL.len()..].trim().to_string();
                    (Some(rest), Some(plan))
                }
                None => (None, Some(text)),
            },
        };

        FinalOutput {
            output,
            plan,
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }
}
