//! Agent stream-json event parser.
//!
//! Decodes one line of the agent's `--output-format stream-json` output into
//! a [`StreamEvent`]. Parsing is lenient: missing fields fall back to empty
//! values, unknown event types and unknown content blocks are skipped, and
//! only a line that is not JSON at all is an error.
//!
//! # Recognized events
//!
//! | `type`      | `subtype`          | Maps to                          |
//! |-------------|--------------------|----------------------------------|
//! | `system`    | `init`             | [`StreamEvent::Init`]            |
//! | `system`    | `compact_boundary` | [`StreamEvent::Compaction`]      |
//! | `assistant` |                    | [`StreamEvent::Assistant`]       |
//! | `user`      |                    | [`StreamEvent::ToolResults`]     |
//! | `result`    | any                | [`StreamEvent::Result`]          |

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::Result;

#[allow(clippy::expect_used)]
static WRAPPER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[a-z_]+>").expect("hardcoded regex"));

/// One decoded event from the agent's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Session start; carries the backend session id.
    Init {
        /// Real session id assigned by the agent.
        session_id: Option<String>,
        /// Model in use.
        model: Option<String>,
    },
    /// Assistant output: text, tool invocations, thinking.
    Assistant(AssistantMessage),
    /// Results of earlier tool invocations.
    ToolResults(ToolResultMessage),
    /// The agent compacted its context window.
    Compaction {
        /// `auto` or `manual`.
        trigger: String,
        /// Token count before compaction, when reported.
        pre_tokens: Option<u64>,
    },
    /// Terminal event for one turn.
    Result(TurnResult),
}

/// A content block of an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// Plain assistant text.
    Text(String),
    /// Tool invocation.
    ToolUse(ToolUse),
    /// Extended thinking; never republished.
    Thinking(String),
}

/// A tool invocation with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    /// Correlation id; synthesized as `tool-<n>` when the agent omits it.
    pub id: String,
    /// Tool name, e.g. `Bash` or `mcp__github__create_issue`.
    pub name: String,
    /// Tool input object.
    pub input: Value,
}

/// Assistant event payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantMessage {
    /// Content blocks in emission order.
    pub blocks: Vec<ContentBlock>,
    /// Set when the message comes from a subagent.
    pub parent_tool_use_id: Option<String>,
}

impl AssistantMessage {
    /// Concatenated text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool invocations in emission order.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(tool) => Some(tool),
                _ => None,
            })
            .collect()
    }
}

/// One tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Id of the invocation this result answers.
    pub tool_use_id: String,
    /// Result text with entities unescaped and wrapper tags removed.
    pub text: String,
    /// Whether the tool failed.
    pub is_error: bool,
}

/// Tool-result event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolResultMessage {
    /// Non-empty results in emission order.
    pub results: Vec<ToolResult>,
    /// Set when the results belong to a subagent.
    pub parent_tool_use_id: Option<String>,
}

impl ToolResultMessage {
    /// Failed results.
    pub fn errors(&self) -> impl Iterator<Item = &ToolResult> {
        self.results.iter().filter(|result| result.is_error)
    }

    /// Successful results.
    pub fn successes(&self) -> impl Iterator<Item = &ToolResult> {
        self.results.iter().filter(|result| !result.is_error)
    }
}

/// Terminal `result` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    /// `success` or an `error_*` subtype.
    pub subtype: String,
    /// Final response text.
    pub text: String,
    /// Whether the turn ended in error.
    pub is_error: bool,
    /// Agentic turns used.
    pub num_turns: Option<u32>,
    /// Wall time of the turn.
    pub duration_ms: Option<u64>,
    /// Cost of the turn in USD.
    pub cost_usd: Option<f64>,
    /// Session id echoed by the agent.
    pub session_id: Option<String>,
    /// Names of tools whose use was denied.
    pub permission_denials: Vec<String>,
}

impl TurnResult {
    /// Human label for a failed turn's subtype, if it has one.
    #[must_use]
    pub fn error_label(&self) -> Option<&'static str> {
        if !self.is_error {
            return None;
        }
        match self.subtype.as_str() {
            "error_max_turns" => Some("hit max turns limit"),
            "error_during_execution" => Some("error during execution"),
            "error_max_budget_usd" => Some("hit budget limit"),
            "error_max_structured_output_retries" => Some("structured output validation failed"),
            _ => None,
        }
    }
}

// ── Wire shapes ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    session_id: Option<String>,
    model: Option<String>,
    message: Option<RawMessage>,
    parent_tool_use_id: Option<String>,
    compact_metadata: Option<RawCompact>,
    result: Option<String>,
    is_error: Option<bool>,
    num_turns: Option<u32>,
    duration_ms: Option<u64>,
    total_cost_usd: Option<f64>,
    permission_denials: Vec<RawDenial>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMessage {
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCompact {
    trigger: Option<String>,
    pre_tokens: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDenial {
    tool_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parse one stream-json line.
///
/// # Return value
///
/// - `Ok(Some(event))` for a recognized event.
/// - `Ok(None)` for blank lines, unknown types, and events with nothing to
///   report (a `user` echo with no tool results).
///
/// # Errors
///
/// Returns `AppError::Protocol` if the line is not a JSON object of the
/// expected shape.
pub fn parse_line(line: &str) -> Result<Option<StreamEvent>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let raw: RawEvent = serde_json::from_str(line)?;

    let event = match raw.kind.as_str() {
        "system" => parse_system(raw),
        "assistant" => Some(StreamEvent::Assistant(AssistantMessage {
            blocks: assistant_blocks(raw.message.map(|m| m.content).unwrap_or_default()),
            parent_tool_use_id: raw.parent_tool_use_id,
        })),
        "user" => {
            let results = tool_results(raw.message.map(|m| m.content).unwrap_or_default());
            if results.is_empty() {
                None
            } else {
                Some(StreamEvent::ToolResults(ToolResultMessage {
                    results,
                    parent_tool_use_id: raw.parent_tool_use_id,
                }))
            }
        }
        "result" => Some(StreamEvent::Result(TurnResult {
            subtype: raw.subtype.unwrap_or_default(),
            text: raw.result.unwrap_or_default(),
            is_error: raw.is_error.unwrap_or(false),
            num_turns: raw.num_turns,
            duration_ms: raw.duration_ms,
            cost_usd: raw.total_cost_usd,
            session_id: raw.session_id,
            permission_denials: raw
                .permission_denials
                .into_iter()
                .map(|denial| denial.tool_name.unwrap_or_else(|| "unknown".into()))
                .collect(),
        })),
        other => {
            debug!(kind = other, "skipping unknown stream event type");
            None
        }
    };

    Ok(event)
}

/// Unescape HTML entities and strip simple XML-like wrapper tags.
///
/// `"<tool_use_error>File &lt;x&gt; missing</tool_use_error>"` becomes
/// `"File <x> missing"`.
#[must_use]
pub fn clean_tool_text(text: &str) -> String {
    let unescaped = html_escape::decode_html_entities(text);
    WRAPPER_TAG.replace_all(&unescaped, "").trim().to_owned()
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn parse_system(raw: RawEvent) -> Option<StreamEvent> {
    match raw.subtype.as_deref() {
        Some("init") => Some(StreamEvent::Init {
            session_id: raw.session_id,
            model: raw.model,
        }),
        Some("compact_boundary") => {
            let meta = raw.compact_metadata.unwrap_or_default();
            Some(StreamEvent::Compaction {
                trigger: meta.trigger.unwrap_or_else(|| "auto".into()),
                pre_tokens: meta.pre_tokens,
            })
        }
        other => {
            debug!(subtype = ?other, "skipping system event");
            None
        }
    }
}

fn content_blocks(content: Value) -> Vec<RawBlock> {
    let Value::Array(items) = content else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawBlock>(item) {
            Ok(block) => Some(block),
            Err(err) => {
                debug!(%err, "skipping malformed content block");
                None
            }
        })
        .collect()
}

fn assistant_blocks(content: Value) -> Vec<ContentBlock> {
    let mut tool_index = 0_usize;
    content_blocks(content)
        .into_iter()
        .filter_map(|block| match block {
            RawBlock::Text { text } => Some(ContentBlock::Text(text)),
            RawBlock::Thinking { thinking } => Some(ContentBlock::Thinking(thinking)),
            RawBlock::ToolUse { id, name, input } => {
                tool_index += 1;
                Some(ContentBlock::ToolUse(ToolUse {
                    id: id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("tool-{tool_index}")),
                    name,
                    input,
                }))
            }
            RawBlock::ToolResult { .. } | RawBlock::Other => None,
        })
        .collect()
}

fn tool_results(content: Value) -> Vec<ToolResult> {
    content_blocks(content)
        .into_iter()
        .filter_map(|block| match block {
            RawBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = clean_tool_text(&result_text(&content));
                (!text.is_empty()).then_some(ToolResult {
                    tool_use_id,
                    text,
                    is_error: is_error.unwrap_or(false),
                })
            }
            _ => None,
        })
        .collect()
}

/// Tool-result content is either a string or a list of text blocks.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}
