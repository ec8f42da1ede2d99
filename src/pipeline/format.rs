//! Chat rendering of agent activity.
//!
//! Pure text functions: nothing here talks to Slack or the agent.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::agent::event::{ToolUse, TurnResult};
use crate::sessions::SessionTotals;

/// Longest text posted as one chat message.
pub const SLACK_MAX_LENGTH: usize = 3900;

/// Responses longer than this are uploaded as a snippet.
pub const SNIPPET_THRESHOLD: usize = 4000;

/// Tool results longer than this are uploaded as a snippet.
pub const TOOL_RESULT_SNIPPET_THRESHOLD: usize = 500;

/// Pending activities flushed as soon as the batch reaches this size.
pub const MAX_ACTIVITY_BATCH: usize = 10;

/// Prefix for activity coming from a subagent.
pub const SUBAGENT_PREFIX: &str = ":arrow_right_hook: ";

const TOOL_ERROR_PREVIEW: usize = 200;
const MAX_SUMMARY_PARAMS: usize = 6;

/// Tools never shown as activity; their results are dropped too.
const SILENT_TOOLS: &[&str] = &["EnterPlanMode", "ExitPlanMode", "AskUserQuestion"];

/// Tools whose successful output is never echoed.
const QUIET_TOOLS: &[&str] = &["Read"];

#[allow(clippy::expect_used)]
static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+>\s*").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*|__(.+?)__").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static STRIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~~(.+?)~~").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static IMAGE_OR_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!?\[([^\]]*)\]\(([^)\s]+)\)").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*#*$").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)[-*+]\s+(.*)$").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:-{3,}|\*{3,}|_{3,})\s*$").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static CAMEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z])([A-Z])").expect("hardcoded regex"));

/// A file body uploaded next to an activity line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    /// Upload file name.
    pub filename: String,
    /// File body.
    pub content: String,
}

/// One line of tool activity, optionally with a snippet to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolActivity {
    /// Chat text.
    pub text: String,
    /// Upload posted instead of the bare text.
    pub snippet: Option<Snippet>,
}

impl ToolActivity {
    fn line(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            snippet: None,
        }
    }

    /// The same activity attributed to a subagent.
    #[must_use]
    pub fn from_subagent(mut self) -> Self {
        self.text = format!("{SUBAGENT_PREFIX}{}", self.text);
        self
    }
}

/// Whether a tool is hidden from chat entirely.
#[must_use]
pub fn is_silent_tool(name: &str) -> bool {
    SILENT_TOOLS.contains(&name)
}

/// Whether a tool's successful output is suppressed.
#[must_use]
pub fn is_quiet_tool(name: &str) -> bool {
    QUIET_TOOLS.contains(&name)
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn basename(path: &str, fallback: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| fallback.to_owned(), |name| name.to_string_lossy().into_owned())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

/// Activity line for one tool invocation, or `None` for silent tools.
#[must_use]
pub fn tool_activity(tool: &ToolUse) -> Option<ToolActivity> {
    if is_silent_tool(&tool.name) {
        return None;
    }
    let input = &tool.input;
    let activity = match tool.name.as_str() {
        "Read" => {
            let file = basename(str_field(input, "file_path"), "file");
            let offset = input.get("offset").and_then(Value::as_u64);
            let limit = input.get("limit").and_then(Value::as_u64);
            let suffix = match (offset, limit) {
                (Some(from), Some(count)) => format!(" (lines {from}-{})", from + count),
                (Some(from), None) => format!(" (from line {from})"),
                (None, Some(count)) => format!(" (first {count} lines)"),
                (None, None) => String::new(),
            };
            ToolActivity::line(format!(":mag: Reading `{file}`{suffix}"))
        }
        "Bash" => {
            let description = str_field(input, "description");
            let mut text = if description.is_empty() {
                format!(":computer: Running `{}`", str_field(input, "command"))
            } else {
                format!(":computer: {description}")
            };
            if input.get("run_in_background").and_then(Value::as_bool) == Some(true) {
                text.push_str(" (background)");
            }
            ToolActivity::line(text)
        }
        "Edit" => edit_activity(input),
        "Write" => {
            let file = basename(str_field(input, "file_path"), "file");
            let content = str_field(input, "content");
            if content.is_empty() {
                ToolActivity::line(format!(":pencil2: Writing `{file}`"))
            } else {
                let lines = content.matches('\n').count() + 1;
                let plural = if lines == 1 { "" } else { "s" };
                ToolActivity::line(format!(":pencil2: Writing `{file}` ({lines} line{plural})"))
            }
        }
        "Grep" => {
            let mut scope = Vec::new();
            let glob = str_field(input, "glob");
            let kind = str_field(input, "type");
            if !glob.is_empty() {
                scope.push(format!("in `{glob}`"));
            } else if !kind.is_empty() {
                scope.push(format!("({kind} files)"));
            }
            let path = str_field(input, "path");
            if !path.is_empty() {
                scope.push(format!("in `{}/`", basename(path, path)));
            }
            let scope = if scope.is_empty() {
                String::new()
            } else {
                format!(" {}", scope.join(" "))
            };
            ToolActivity::line(format!(
                ":mag: Searching for `{}`{scope}",
                str_field(input, "pattern")
            ))
        }
        "Glob" => {
            let pattern = str_field(input, "pattern");
            let path = str_field(input, "path");
            if path.is_empty() {
                ToolActivity::line(format!(":mag: Finding files `{pattern}`"))
            } else {
                ToolActivity::line(format!(
                    ":mag: Finding files `{pattern}` in `{}/`",
                    basename(path, path)
                ))
            }
        }
        "WebFetch" => {
            let url = str_field(input, "url");
            if url.is_empty() {
                ToolActivity::line(":globe_with_meridians: Fetching URL")
            } else {
                ToolActivity::line(format!(":globe_with_meridians: Fetching `{url}`"))
            }
        }
        "WebSearch" => {
            let query = str_field(input, "query");
            if query.is_empty() {
                ToolActivity::line(":globe_with_meridians: Searching web")
            } else {
                ToolActivity::line(format!(":globe_with_meridians: Searching web for `{query}`"))
            }
        }
        "Task" => {
            let parts: Vec<&str> = [
                str_field(input, "subagent_type"),
                str_field(input, "description"),
            ]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
            if parts.is_empty() {
                ToolActivity::line(":robot_face: Spawning subagent")
            } else {
                ToolActivity::line(format!(":robot_face: Spawning {}", parts.join(": ")))
            }
        }
        "TodoWrite" => todo_activity(input),
        other => generic_activity(other, input),
    };
    Some(activity)
}

fn edit_activity(input: &Value) -> ToolActivity {
    let file = basename(str_field(input, "file_path"), "file");
    let all = if input.get("replace_all").and_then(Value::as_bool) == Some(true) {
        " (all occurrences)"
    } else {
        ""
    };
    let header = format!(":pencil2: Editing `{file}`{all}");
    let old = str_field(input, "old_string");
    let new = str_field(input, "new_string");
    if old.is_empty() && new.is_empty() {
        return ToolActivity::line(header);
    }
    let patch = diffy::create_patch(old, new).to_string();
    let body: String = patch
        .lines()
        .skip_while(|line| line.starts_with("---") || line.starts_with("+++"))
        .collect::<Vec<_>>()
        .join("\n");
    if body.trim().is_empty() {
        return ToolActivity::line(header);
    }
    ToolActivity {
        text: header,
        snippet: Some(Snippet {
            filename: format!("{file}.diff"),
            content: body,
        }),
    }
}

fn todo_activity(input: &Value) -> ToolActivity {
    let Some(todos) = input.get("todos").and_then(Value::as_array).filter(|t| !t.is_empty())
    else {
        return ToolActivity::line(":clipboard: Updating tasks");
    };
    let mut lines = vec![":clipboard: *Tasks*".to_owned()];
    for todo in todos {
        let marker = match str_field(todo, "status") {
            "completed" => ":white_check_mark:",
            "in_progress" => ":arrows_counterclockwise:",
            _ => ":white_circle:",
        };
        let label = todo.get("content").and_then(Value::as_str).unwrap_or("?");
        lines.push(format!("{marker} {label}"));
    }
    ToolActivity::line(lines.join("\n"))
}

fn generic_activity(name: &str, input: &Value) -> ToolActivity {
    let (server, tool) = match name.strip_prefix("mcp__") {
        Some(rest) => match rest.split_once("__") {
            Some((server, tool)) => (Some(server), tool.rsplit("__").next().unwrap_or(tool)),
            None => (None, name),
        },
        None => (None, name),
    };
    let spaced = CAMEL.replace_all(tool, "$1 $2").replace('_', " ");
    let display: Vec<String> = spaced
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
            })
        })
        .collect();
    let display = display.join(" ");
    let label = match server {
        Some(server) => format!("{server}: {display}"),
        None => display,
    };

    let params = summarize_input(input);
    if params.is_empty() {
        ToolActivity::line(format!(":wrench: {label}"))
    } else {
        ToolActivity::line(format!(":wrench: {label}\n{params}"))
    }
}

/// Short scalar arguments, one `  key: value` line each.
fn summarize_input(input: &Value) -> String {
    let Some(map) = input.as_object() else {
        return String::new();
    };
    let mut lines = Vec::new();
    for (key, value) in map {
        if lines.len() >= MAX_SUMMARY_PARAMS {
            break;
        }
        let snippet = match value {
            Value::String(s) if !s.is_empty() && s.chars().count() <= 120 => {
                if s.chars().count() > 60 {
                    format!("{}...", s.chars().take(57).collect::<String>())
                } else {
                    s.clone()
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        lines.push(format!("  {key}: `{snippet}`"));
    }
    lines.join("\n")
}

/// Chat line for a failed tool call.
#[must_use]
pub fn tool_error_line(tool_name: Option<&str>, message: &str) -> String {
    let name = tool_name.filter(|n| !n.is_empty()).unwrap_or("Tool");
    format!(
        ":warning: `{name}` error: {}",
        truncate_chars(message, TOOL_ERROR_PREVIEW)
    )
}

/// Label and file name used when echoing a tool's output.
#[must_use]
pub fn tool_result_label(tool_name: Option<&str>) -> (String, String) {
    let name = tool_name.filter(|n| !n.is_empty()).unwrap_or("Tool");
    (
        format!(":page_facing_up: `{name}` output"),
        format!("{}-output.txt", name.to_lowercase()),
    )
}

/// Inline rendering of a short tool result.
#[must_use]
pub fn tool_result_block(label: &str, text: &str) -> String {
    format!("{label}\n```\n{text}\n```")
}

/// Informational note for a context compaction.
#[must_use]
pub fn compaction_note(trigger: &str, pre_tokens: Option<u64>) -> String {
    let mut note = if trigger == "manual" {
        ":brain: Context was manually compacted".to_owned()
    } else {
        ":brain: Context was automatically compacted".to_owned()
    };
    if let Some(tokens) = pre_tokens.filter(|t| *t > 0) {
        note.push_str(&format!(" ({} tokens before)", group_thousands(tokens)));
    }
    note.push_str("; earlier messages may be summarized");
    note
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_duration(duration_ms: u64) -> String {
    let secs = duration_ms / 1000;
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Completion footer for a finished turn.
///
/// `totals` adds a cumulative line and should be passed from the second
/// request of a session onward. Returns `None` when the agent reported no
/// turn count.
#[must_use]
pub fn completion_summary(result: &TurnResult, totals: Option<SessionTotals>) -> Option<String> {
    let turns = result.num_turns?;
    let turns = format!("{turns} turn{}", if turns == 1 { "" } else { "s" });
    let marker = if result.is_error { ":x:" } else { ":checkered_flag:" };
    let reason = result
        .error_label()
        .map(|label| format!(" ({label})"))
        .unwrap_or_default();
    let cost = result
        .cost_usd
        .filter(|c| *c > 0.0)
        .map(|c| format!(" · ${c:.2}"))
        .unwrap_or_default();

    let mut line = match result.duration_ms {
        Some(ms) => format!("{marker} {turns} took {}{reason}{cost}", format_duration(ms)),
        None => format!("{marker} Done: {turns}{reason}{cost}"),
    };

    if let Some(totals) = totals.filter(|t| t.requests > 1) {
        let mut parts = vec![
            format!("{} requests", totals.requests),
            format!("{} turns total", totals.turns),
        ];
        if totals.cost_usd > 0.0 {
            parts.push(format!("${:.2} session total", totals.cost_usd));
        }
        line.push_str(&format!("\n:bar_chart: {}", parts.join(" · ")));
    }
    Some(line)
}

/// Warning listing tools whose use was denied, or `None` if there were none.
#[must_use]
pub fn permission_denials_note(denials: &[String]) -> Option<String> {
    if denials.is_empty() {
        return None;
    }
    let mut names: Vec<&str> = denials.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    let listed: Vec<String> = names.iter().map(|n| format!("`{n}`")).collect();
    Some(format!(
        ":no_entry_sign: {} tool permission{} denied: {}",
        denials.len(),
        if denials.len() == 1 { "" } else { "s" },
        listed.join(", ")
    ))
}

/// The only failure text allowed in chat: the error kind, never its message.
#[must_use]
pub fn generic_error(kind: &str) -> String {
    format!(":x: Error ({kind}). Check bot logs for details.")
}

/// Warning posted when a turn produced neither text nor tool use.
pub const EMPTY_RESPONSE_WARNING: &str = ":warning: The agent returned an empty response. \
This can happen when the session history is in an unexpected state. Try sending your message again.";

/// Whether the final non-blank text ends with a question mark.
#[must_use]
pub fn ends_with_question(text: &str) -> bool {
    text.trim_end().ends_with('?')
}

/// Remove `<@U123>` mentions and trim.
#[must_use]
pub fn strip_mentions(text: &str) -> String {
    MENTION.replace_all(text, "").trim().to_owned()
}

/// Drop control characters Slack would treat as binary content.
#[must_use]
pub fn sanitize_snippet(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Split `text` into chunks of at most [`SLACK_MAX_LENGTH`] characters,
/// preferring newline boundaries.
#[must_use]
pub fn split_message(text: &str) -> Vec<String> {
    split_at_limit(text, SLACK_MAX_LENGTH)
}

fn split_at_limit(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    loop {
        let Some((limit_at, _)) = remaining.char_indices().nth(limit) else {
            chunks.push(remaining.to_owned());
            break;
        };
        let half_at = remaining
            .char_indices()
            .nth(limit / 2)
            .map_or(0, |(idx, _)| idx);
        let split_at = match remaining[..limit_at].rfind('\n') {
            Some(idx) if idx >= half_at => idx,
            _ => limit_at,
        };
        chunks.push(remaining[..split_at].to_owned());
        remaining = remaining[split_at..].trim_start_matches('\n');
        if remaining.is_empty() {
            break;
        }
    }
    chunks
}

/// Rewrite common Markdown into Slack mrkdwn.
///
/// Fenced code blocks are left untouched. Outside them: headings become
/// bold lines, `**bold**` becomes `*bold*`, `~~strike~~` becomes `~strike~`,
/// links become `<url|text>`, bullets become `•`, and rules become a line.
#[must_use]
pub fn markdown_to_mrkdwn(text: &str) -> String {
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            out.push(line.to_owned());
            continue;
        }
        if in_fence {
            out.push(line.to_owned());
            continue;
        }
        out.push(convert_line(line));
    }
    out.join("\n")
}

fn convert_line(line: &str) -> String {
    if RULE.is_match(line) {
        return "───".to_owned();
    }
    // Inline code spans are kept verbatim.
    let mut converted = String::with_capacity(line.len());
    for (i, part) in line.split('`').enumerate() {
        if i > 0 {
            converted.push('`');
        }
        if i % 2 == 1 {
            converted.push_str(part);
        } else {
            converted.push_str(&convert_inline(part));
        }
    }
    if let Some(caps) = HEADING.captures(&converted) {
        return format!("*{}*", caps[1].replace('*', ""));
    }
    if let Some(caps) = BULLET.captures(&converted) {
        return format!("{}• {}", &caps[1], &caps[2]);
    }
    converted
}

fn convert_inline(text: &str) -> String {
    let linked = IMAGE_OR_LINK.replace_all(text, "<$2|$1>");
    let bolded = BOLD.replace_all(&linked, |caps: &regex::Captures<'_>| {
        let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        format!("*{inner}*")
    });
    STRIKE.replace_all(&bolded, "~$1~").into_owned()
}
