//! Summary cards derived from tool use: git commits, test runs, and images
//! the agent produced.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::agent::event::ToolUse;

/// Tools that modify files on disk.
const FILE_EDIT_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit"];

/// Extensions uploaded as images.
const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "ico", "tiff",
];

#[allow(clippy::expect_used)]
static GIT_COMMIT_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgit\b.*\bcommit\b").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static TEST_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(pytest|npm\s+test|jest|vitest|cargo\s+test|go\s+test|phpunit|mvn\s+test|gradle\s+test|mocha|rspec|prove)\b",
    )
    .expect("hardcoded regex")
});

#[allow(clippy::expect_used)]
static COMMIT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[\w./-]+\s+([0-9a-f]{7,12})\]\s+(.+)").expect("hardcoded regex"));

#[allow(clippy::expect_used)]
static COMMIT_STAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s+files?\s+changed(?:,\s*(\d+)\s+insertions?\(\+\))?(?:,\s*(\d+)\s+deletions?\(-\))?")
        .expect("hardcoded regex")
});

#[allow(clippy::expect_used)]
static IMAGE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((?:/|\.{1,2}/)[\w./-]+\.(?:png|jpe?g|gif|webp|svg|bmp|ico|tiff))\b")
        .expect("hardcoded regex")
});

/// Whether `tool` writes to a file.
#[must_use]
pub fn is_file_edit(tool: &ToolUse) -> bool {
    FILE_EDIT_TOOLS.contains(&tool.name.as_str())
}

fn bash_command(tool: &ToolUse) -> Option<&str> {
    if tool.name != "Bash" {
        return None;
    }
    tool.input.get("command").and_then(|c| c.as_str())
}

/// Whether `tool` runs `git commit`.
#[must_use]
pub fn is_git_commit(tool: &ToolUse) -> bool {
    bash_command(tool).is_some_and(|cmd| GIT_COMMIT_COMMAND.is_match(cmd))
}

/// Whether `tool` runs a known test runner.
#[must_use]
pub fn is_test_run(tool: &ToolUse) -> bool {
    bash_command(tool).is_some_and(|cmd| TEST_COMMAND.is_match(cmd))
}

/// Parsed `git commit` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Abbreviated hash.
    pub short_hash: String,
    /// First line of the commit message.
    pub message: String,
    /// Files touched.
    pub files_changed: u32,
    /// Lines added.
    pub insertions: u32,
    /// Lines removed.
    pub deletions: u32,
}

/// Parse `git commit` output such as
/// `[main abc1234] feat: x` followed by a `3 files changed, ...` line.
#[must_use]
pub fn parse_commit(output: &str) -> Option<CommitInfo> {
    let header = COMMIT_HEADER.captures(output)?;
    let (files_changed, insertions, deletions) = COMMIT_STAT
        .captures(output)
        .map_or((0, 0, 0), |stat| (count(&stat, 1), count(&stat, 2), count(&stat, 3)));
    Some(CommitInfo {
        short_hash: header[1].to_owned(),
        message: header[2].trim().to_owned(),
        files_changed,
        insertions,
        deletions,
    })
}

/// Chat card announcing a commit.
#[must_use]
pub fn commit_card(info: &CommitInfo) -> String {
    let mut card = format!(":package: *Committed*\n`{}` {}", info.short_hash, info.message);
    if info.files_changed > 0 {
        let mut stats = vec![format!(
            "{} file{} changed",
            info.files_changed,
            if info.files_changed == 1 { "" } else { "s" }
        )];
        if info.insertions > 0 {
            stats.push(format!("+{}", info.insertions));
        }
        if info.deletions > 0 {
            stats.push(format!("-{}", info.deletions));
        }
        card.push('\n');
        card.push_str(&stats.join(", "));
    }
    card
}

/// Counts from a test runner's summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSummary {
    /// Passing tests.
    pub passed: u32,
    /// Failing tests.
    pub failed: u32,
    /// Errored tests.
    pub errors: u32,
    /// Skipped or pending tests.
    pub skipped: u32,
    /// Reported wall time, as printed by the runner.
    pub duration: Option<String>,
}

impl TestSummary {
    /// No failures and no errors.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

#[allow(clippy::expect_used)]
fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("hardcoded regex")
}

struct TestPatterns {
    pytest_line: Regex,
    pytest_passed: Regex,
    pytest_failed: Regex,
    pytest_errors: Regex,
    pytest_skipped: Regex,
    pytest_duration: Regex,
    jest: Regex,
    cargo: Regex,
    phpunit: Regex,
    maven: Regex,
    go_pass: Regex,
    go_fail: Regex,
    go_skip: Regex,
    go_final: Regex,
    mocha_passing: Regex,
    mocha_failing: Regex,
    mocha_pending: Regex,
    tap_ok: Regex,
    tap_not_ok: Regex,
    tap_skip: Regex,
    tap_plan: Regex,
}

static TESTS: LazyLock<TestPatterns> = LazyLock::new(|| TestPatterns {
    pytest_line: pattern(r"={3,}\s+.+\s+={3,}"),
    pytest_passed: pattern(r"(\d+)\s+passed"),
    pytest_failed: pattern(r"(\d+)\s+failed"),
    pytest_errors: pattern(r"(\d+)\s+errors?"),
    pytest_skipped: pattern(r"(\d+)\s+skipped"),
    pytest_duration: pattern(r"in\s+([\d.]+)s"),
    jest: pattern(
        r"Tests:\s+(?:(\d+)\s+failed,?\s*)?(?:(\d+)\s+skipped,?\s*)?(?:(\d+)\s+passed,?\s*)?(\d+)\s+total",
    ),
    cargo: pattern(r"test result:\s+(?:ok|FAILED)\.\s+(\d+)\s+passed;\s+(\d+)\s+failed;\s+(\d+)\s+ignored"),
    phpunit: pattern(
        r"Tests:\s+(\d+),\s+Assertions:\s+\d+(?:,\s+Failures:\s+(\d+))?(?:,\s+Errors:\s+(\d+))?(?:,\s+Skipped:\s+(\d+))?",
    ),
    maven: pattern(
        r"Tests run:\s+(\d+),\s+Failures:\s+(\d+),\s+Errors:\s+(\d+),\s+Skipped:\s+(\d+)(?:,\s+Time elapsed:\s+([\d.]+)\s*s)?",
    ),
    go_pass: pattern(r"(?m)^---\s+PASS:"),
    go_fail: pattern(r"(?m)^---\s+FAIL:"),
    go_skip: pattern(r"(?m)^---\s+SKIP:"),
    go_final: pattern(r"(?m)^(ok|FAIL)\s+\S+\s+([\d.]+)s"),
    mocha_passing: pattern(r"(\d+)\s+passing(?:\s+\(([^)]+)\))?"),
    mocha_failing: pattern(r"(\d+)\s+failing"),
    mocha_pending: pattern(r"(\d+)\s+pending"),
    tap_ok: pattern(r"(?m)^ok\s+\d+"),
    tap_not_ok: pattern(r"(?m)^not ok\s+\d+"),
    tap_skip: pattern(r"(?m)^ok\s+\d+.*#\s*(?:skip|SKIP)"),
    tap_plan: pattern(r"(?m)^1\.\.(\d+)"),
});

fn count(caps: &regex::Captures<'_>, i: usize) -> u32 {
    caps.get(i)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn first_count(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text).map(|caps| count(&caps, 1))
}

fn occurrences(re: &Regex, text: &str) -> u32 {
    u32::try_from(re.find_iter(text).count()).unwrap_or(u32::MAX)
}

/// Whatever is left of `total` after failures, errors, and skips.
fn remainder(total: u32, failed: u32, errors: u32, skipped: u32) -> u32 {
    total.saturating_sub(failed).saturating_sub(errors).saturating_sub(skipped)
}

fn pytest(output: &str) -> Option<TestSummary> {
    let t = &*TESTS;
    output.lines().rev().find_map(|line| {
        if !t.pytest_line.is_match(line) {
            return None;
        }
        let passed = first_count(&t.pytest_passed, line);
        let failed = first_count(&t.pytest_failed, line);
        let errors = first_count(&t.pytest_errors, line);
        if passed.is_none() && failed.is_none() && errors.is_none() {
            return None;
        }
        Some(TestSummary {
            passed: passed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            errors: errors.unwrap_or(0),
            skipped: first_count(&t.pytest_skipped, line).unwrap_or(0),
            duration: t
                .pytest_duration
                .captures(line)
                .map(|caps| format!("{}s", &caps[1])),
        })
    })
}

fn jest(output: &str) -> Option<TestSummary> {
    let caps = TESTS.jest.captures(output)?;
    Some(TestSummary {
        passed: count(&caps, 3),
        failed: count(&caps, 1),
        skipped: count(&caps, 2),
        ..TestSummary::default()
    })
}

fn cargo(output: &str) -> Option<TestSummary> {
    let caps = TESTS.cargo.captures(output)?;
    Some(TestSummary {
        passed: count(&caps, 1),
        failed: count(&caps, 2),
        skipped: count(&caps, 3),
        ..TestSummary::default()
    })
}

fn phpunit(output: &str) -> Option<TestSummary> {
    let caps = TESTS.phpunit.captures(output)?;
    let (failed, errors, skipped) = (count(&caps, 2), count(&caps, 3), count(&caps, 4));
    Some(TestSummary {
        passed: remainder(count(&caps, 1), failed, errors, skipped),
        failed,
        errors,
        skipped,
        duration: None,
    })
}

fn maven(output: &str) -> Option<TestSummary> {
    // Surefire prints one line per class; the last one is the total.
    let caps = TESTS.maven.captures_iter(output).last()?;
    let (failed, errors, skipped) = (count(&caps, 2), count(&caps, 3), count(&caps, 4));
    Some(TestSummary {
        passed: remainder(count(&caps, 1), failed, errors, skipped),
        failed,
        errors,
        skipped,
        duration: caps.get(5).map(|m| format!("{}s", m.as_str())),
    })
}

fn go_test(output: &str) -> Option<TestSummary> {
    let t = &*TESTS;
    let passed = occurrences(&t.go_pass, output);
    let failed = occurrences(&t.go_fail, output);
    if passed == 0 && failed == 0 {
        return None;
    }
    Some(TestSummary {
        passed,
        failed,
        skipped: occurrences(&t.go_skip, output),
        errors: 0,
        duration: t
            .go_final
            .captures_iter(output)
            .last()
            .map(|caps| format!("{}s", &caps[2])),
    })
}

fn mocha(output: &str) -> Option<TestSummary> {
    let t = &*TESTS;
    let passing = t.mocha_passing.captures(output)?;
    Some(TestSummary {
        passed: count(&passing, 1),
        failed: first_count(&t.mocha_failing, output).unwrap_or(0),
        skipped: first_count(&t.mocha_pending, output).unwrap_or(0),
        errors: 0,
        duration: passing.get(2).map(|m| m.as_str().to_owned()),
    })
}

fn tap(output: &str) -> Option<TestSummary> {
    let t = &*TESTS;
    if !t.tap_plan.is_match(output) {
        return None;
    }
    let ok = occurrences(&t.tap_ok, output);
    let not_ok = occurrences(&t.tap_not_ok, output);
    if ok == 0 && not_ok == 0 {
        return None;
    }
    let skipped = occurrences(&t.tap_skip, output);
    Some(TestSummary {
        passed: ok.saturating_sub(skipped),
        failed: not_ok,
        skipped,
        errors: 0,
        duration: None,
    })
}

/// Parse a test runner's summary from its output.
///
/// Recognises pytest, jest/vitest, cargo test, `PHPUnit`, Maven Surefire,
/// go test, mocha, and TAP, tried in that order.
#[must_use]
pub fn parse_test_summary(output: &str) -> Option<TestSummary> {
    const PARSERS: &[fn(&str) -> Option<TestSummary>] =
        &[pytest, jest, cargo, phpunit, maven, go_test, mocha, tap];
    PARSERS.iter().find_map(|parse| parse(output))
}

/// Chat card for a test run.
#[must_use]
pub fn test_card(summary: &TestSummary) -> String {
    let mut parts = Vec::new();
    if summary.passed > 0 {
        parts.push(format!("*{} passed*", summary.passed));
    }
    if summary.failed > 0 {
        parts.push(format!("*{} failed*", summary.failed));
    }
    if summary.errors > 0 {
        parts.push(format!(
            "*{} error{}*",
            summary.errors,
            if summary.errors == 1 { "" } else { "s" }
        ));
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped));
    }
    let mut text = parts.join(", ");
    if let Some(duration) = &summary.duration {
        text.push_str(&format!(" in {duration}"));
    }
    let marker = if summary.is_success() {
        ":white_check_mark:"
    } else {
        ":x:"
    };
    format!("{marker} {text}")
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Image file written by a `Write` or `NotebookEdit` call.
#[must_use]
pub fn written_image(tool: &ToolUse) -> Option<PathBuf> {
    if !matches!(tool.name.as_str(), "Write" | "NotebookEdit") {
        return None;
    }
    let path = tool
        .input
        .get("file_path")
        .or_else(|| tool.input.get("notebook_path"))
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())?;
    let path = PathBuf::from(path);
    has_image_extension(&path).then_some(path)
}

/// Existing image files named in `text`, in order of first mention.
///
/// Absolute paths and `./` or `../` paths are recognised; relative ones are
/// resolved against `cwd`. Bare file names are ignored.
#[must_use]
pub fn image_paths(text: &str, cwd: &Path) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for caps in IMAGE_PATH.captures_iter(text) {
        let raw = &caps[1];
        if !seen.insert(raw.to_owned()) {
            continue;
        }
        let path = Path::new(raw);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        if has_image_extension(&path) && path.is_file() {
            paths.push(path);
        }
    }
    paths
}

/// Comment attached to an uploaded image.
#[must_use]
pub fn image_comment(name: &str) -> String {
    format!(":frame_with_picture: `{name}`")
}

/// Posted instead of an image that could not be uploaded.
#[must_use]
pub fn image_upload_failed(name: &str) -> String {
    format!(":frame_with_picture: `{name}` (upload failed)")
}
