use std::fs;
use std::path::PathBuf;

use serde_json::json;

use thread_relay::agent::event::ToolUse;
use thread_relay::pipeline::cards::{
    commit_card, image_comment, image_paths, image_upload_failed, is_file_edit, is_git_commit,
    is_test_run, parse_commit, parse_test_summary, test_card, written_image, CommitInfo,
    TestSummary,
};

fn tool(name: &str, input: serde_json::Value) -> ToolUse {
    ToolUse {
        id: "toolu_1".into(),
        name: name.into(),
        input,
    }
}

fn bash(command: &str) -> ToolUse {
    tool("Bash", json!({ "command": command }))
}

// ── Tool classification ──────────────────────────────────────────────────────

#[test]
fn edits_commits_and_test_runs_are_recognised() {
    assert!(is_file_edit(&tool("Edit", json!({"file_path": "/a.rs"}))));
    assert!(is_file_edit(&tool("NotebookEdit", json!({}))));
    assert!(!is_file_edit(&tool("Read", json!({"file_path": "/a.rs"}))));

    assert!(is_git_commit(&bash("git add -A && git commit -m 'x'")));
    assert!(!is_git_commit(&bash("git status")));
    assert!(!is_git_commit(&tool("Write", json!({"command": "git commit"}))));

    assert!(is_test_run(&bash("cargo test --workspace")));
    assert!(is_test_run(&bash("python -m pytest -q")));
    assert!(!is_test_run(&bash("cargo build")));
}

// ── Commits ──────────────────────────────────────────────────────────────────

#[test]
fn commit_output_is_parsed() {
    let output = "[main 3f9c2ab] fix: handle empty input\n 2 files changed, 14 insertions(+), 3 deletions(-)\n";
    let info = parse_commit(output).expect("commit");
    assert_eq!(
        info,
        CommitInfo {
            short_hash: "3f9c2ab".into(),
            message: "fix: handle empty input".into(),
            files_changed: 2,
            insertions: 14,
            deletions: 3,
        }
    );
    assert_eq!(
        commit_card(&info),
        ":package: *Committed*\n`3f9c2ab` fix: handle empty input\n2 files changed, +14, -3"
    );
}

#[test]
fn commit_card_omits_missing_stats() {
    let info = parse_commit("[feature/x 0a1b2c3d] docs only").expect("commit");
    assert_eq!(info.files_changed, 0);
    assert_eq!(commit_card(&info), ":package: *Committed*\n`0a1b2c3d` docs only");

    let one = parse_commit("[main abcdef1] tweak\n 1 file changed, 1 deletion(-)").expect("commit");
    assert_eq!(commit_card(&one), ":package: *Committed*\n`abcdef1` tweak\n1 file changed, -1");
}

#[test]
fn nothing_to_commit_is_not_a_commit() {
    assert_eq!(parse_commit("On branch main\nnothing to commit, working tree clean"), None);
}

// ── Test runs ────────────────────────────────────────────────────────────────

#[test]
fn pytest_summary_line() {
    let output = "collected 12 items\n...\n====== 10 passed, 1 failed, 1 skipped in 0.42s ======\n";
    let summary = parse_test_summary(output).expect("summary");
    assert_eq!(
        summary,
        TestSummary {
            passed: 10,
            failed: 1,
            errors: 0,
            skipped: 1,
            duration: Some("0.42s".into()),
        }
    );
    assert_eq!(test_card(&summary), ":x: *10 passed*, *1 failed*, 1 skipped in 0.42s");
}

#[test]
fn cargo_summary_line() {
    let output = "running 3 tests\n...\ntest result: ok. 3 passed; 0 failed; 1 ignored; 0 measured";
    let summary = parse_test_summary(output).expect("summary");
    assert_eq!((summary.passed, summary.failed, summary.skipped), (3, 0, 1));
    assert!(summary.is_success());
    assert_eq!(test_card(&summary), ":white_check_mark: *3 passed*, 1 skipped");
}

#[test]
fn jest_summary_line() {
    let summary = parse_test_summary("Tests:       2 failed, 1 skipped, 7 passed, 10 total").expect("summary");
    assert_eq!((summary.passed, summary.failed, summary.skipped), (7, 2, 1));
}

#[test]
fn phpunit_and_maven_derive_passes_from_totals() {
    let php = parse_test_summary("Tests: 10, Assertions: 20, Failures: 2, Errors: 1").expect("summary");
    assert_eq!((php.passed, php.failed, php.errors), (7, 2, 1));
    assert_eq!(test_card(&php), ":x: *7 passed*, *2 failed*, *1 error*");

    let output = "Tests run: 3, Failures: 0, Errors: 0, Skipped: 0, Time elapsed: 0.1 s\n\
                  Tests run: 8, Failures: 1, Errors: 0, Skipped: 2";
    let maven = parse_test_summary(output).expect("summary");
    assert_eq!((maven.passed, maven.failed, maven.skipped), (5, 1, 2));
}

#[test]
fn go_and_mocha_and_tap() {
    let go = parse_test_summary("--- PASS: TestA (0.00s)\n--- FAIL: TestB (0.01s)\nFAIL\texample.com/pkg\t0.02s")
        .expect("summary");
    assert_eq!((go.passed, go.failed), (1, 1));
    assert_eq!(go.duration.as_deref(), Some("0.02s"));

    let mocha = parse_test_summary("  4 passing (12ms)\n  1 pending").expect("summary");
    assert_eq!((mocha.passed, mocha.skipped), (4, 1));
    assert_eq!(mocha.duration.as_deref(), Some("12ms"));

    let tap = parse_test_summary("1..3\nok 1 - a\nnot ok 2 - b\nok 3 - c # SKIP later").expect("summary");
    assert_eq!((tap.passed, tap.failed, tap.skipped), (1, 1, 1));
}

#[test]
fn unrelated_output_has_no_summary() {
    assert_eq!(parse_test_summary("Compiling thread-relay v0.1.0\nFinished dev"), None);
}

// ── Images ───────────────────────────────────────────────────────────────────

#[test]
fn written_images_come_from_write_and_notebook_edits() {
    assert_eq!(
        written_image(&tool("Write", json!({"file_path": "/tmp/plot.PNG"}))),
        Some(PathBuf::from("/tmp/plot.PNG"))
    );
    assert_eq!(written_image(&tool("Write", json!({"file_path": "/tmp/notes.md"}))), None);
    assert_eq!(written_image(&tool("Edit", json!({"file_path": "/tmp/plot.png"}))), None);
}

#[test]
fn image_paths_only_names_existing_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir(dir.path().join("out")).expect("mkdir");
    fs::write(dir.path().join("out/chart.png"), b"png").expect("write");
    let absolute = dir.path().join("diagram.svg");
    fs::write(&absolute, b"<svg/>").expect("write");

    let text = format!(
        "Saved ./out/chart.png and {} (see ./out/chart.png). Also ./missing.png and logo.png.",
        absolute.display()
    );
    let found = image_paths(&text, dir.path());
    assert_eq!(found, vec![dir.path().join("./out/chart.png"), absolute]);
}

#[test]
fn image_notes() {
    assert_eq!(image_comment("chart.png"), ":frame_with_picture: `chart.png`");
    assert_eq!(
        image_upload_failed("chart.png"),
        ":frame_with_picture: `chart.png` (upload failed)"
    );
}
