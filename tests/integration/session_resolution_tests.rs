//! Handoffs by reference and reconnection to sessions found in a thread.

use crate::support::{
    bot_message, init, mention, reply, reply_mention, result_ok, say, user_message, Harness,
    Step, BOT_ID, USER,
};

const ROOT: &str = "1000.000001";

fn resume_arg(args: &[String]) -> Option<&str> {
    let at = args.iter().position(|a| a == "--resume")?;
    args.get(at + 1).map(String::as_str)
}

#[tokio::test]
async fn session_id_handoff_resumes_it() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("abc-123"))),
        Step::Emit(say("Picking up where we left off.")),
        Step::Emit(result_ok("", 1)),
    ]]);

    h.pipeline
        .handle_message(mention(ROOT, "continue the work (session_id: abc-123)"))
        .await;

    let args = &h.launcher.invocations()[0].args;
    assert_eq!(resume_arg(args), Some("abc-123"));
    assert!(
        !args.contains(&"--append-system-prompt".to_owned()),
        "resumed sessions keep their original system prompt"
    );
    assert_eq!(h.launcher.prompts(), vec!["continue the work".to_owned()]);

    let posts = h.chat.posts();
    assert!(posts[0].starts_with(":arrows_counterclockwise: Continuing session _(session: "));
    assert!(posts.iter().all(|p| !p.contains("abc-123")));
}

#[tokio::test]
async fn bare_handoff_gets_a_greeting_prompt() {
    let h = Harness::new(Vec::new());

    h.pipeline
        .handle_message(mention(ROOT, "(session_id: abc-123)"))
        .await;

    let prompts = h.launcher.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("handed off"), "{}", prompts[0]);
}

#[tokio::test]
async fn alias_handoff_resolves_through_the_map() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("sess-old"))),
        Step::Emit(say("Back again.")),
        Step::Emit(result_ok("", 1)),
    ]]);
    h.aliases()
        .save_alias("calm-velvet-otter", "sess-old")
        .await
        .expect("seed alias");

    h.pipeline
        .handle_message(mention(ROOT, "keep going (session: calm-velvet-otter)"))
        .await;

    assert_eq!(resume_arg(&h.launcher.invocations()[0].args), Some("sess-old"));
    assert_eq!(
        h.chat.posts()[0],
        ":arrows_counterclockwise: Continuing session _(session: calm-velvet-otter)_"
    );
}

#[tokio::test]
async fn unknown_alias_starts_fresh_and_says_so() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("sess-new"))),
        Step::Emit(say("Hello.")),
        Step::Emit(result_ok("", 1)),
    ]]);

    h.pipeline
        .handle_message(mention(ROOT, "keep going (session: lost-amber-heron)"))
        .await;

    assert_eq!(resume_arg(&h.launcher.invocations()[0].args), None);
    let first = &h.chat.posts()[0];
    assert!(
        first.starts_with(":warning: Session _lost-amber-heron_ could not be found"),
        "{first}"
    );
}

#[tokio::test]
async fn handoff_to_a_vanished_session_reports_it() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("fresh-0001"))),
        Step::Emit(say("Starting over.")),
        Step::Emit(result_ok("", 1)),
    ]]);

    h.pipeline
        .handle_message(mention(ROOT, "continue (session_id: dead-beef-0000)"))
        .await;

    let first = &h.chat.posts()[0];
    assert!(
        first.starts_with(":warning: Could not restore session _dead-beef-00..._"),
        "{first}"
    );
}

#[tokio::test]
async fn reply_after_restart_reconnects_to_the_bots_session() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("sess-old"))),
        Step::Emit(say("Still here.")),
        Step::Emit(result_ok("", 1)),
    ]]);
    h.aliases()
        .save_alias("calm-velvet-otter", "sess-old")
        .await
        .expect("seed alias");
    h.chat.set_replies(
        ROOT,
        vec![
            user_message(ROOT, USER, &format!("<@{BOT_ID}> start")),
            bot_message("1000.000002", ":sparkles: New session _(session: calm-velvet-otter)_"),
            bot_message("1000.000003", "Done."),
            user_message("1000.000010", USER, "and another thing"),
        ],
    );

    h.pipeline
        .handle_message(reply(ROOT, "1000.000010", "and another thing"))
        .await;

    assert_eq!(resume_arg(&h.launcher.invocations()[0].args), Some("sess-old"));
    assert_eq!(h.launcher.prompts(), vec!["and another thing".to_owned()]);
    assert_eq!(
        h.chat.posts()[0],
        ":arrows_counterclockwise: Continuing session _(session: calm-velvet-otter)_"
    );
    assert_eq!(h.chat.reactions_on(ROOT), vec!["white_check_mark"]);
    assert_eq!(h.chat.reactions_on("1000.000010"), vec!["white_check_mark"]);
}

#[tokio::test]
async fn redelivered_replies_skip_the_history_read() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("sess-old"))),
        Step::Emit(result_ok("Back.", 1)),
    ]]);
    h.aliases()
        .save_alias("calm-velvet-otter", "sess-old")
        .await
        .expect("seed alias");
    h.chat.set_replies(
        ROOT,
        vec![
            user_message(ROOT, USER, &format!("<@{BOT_ID}> start")),
            bot_message("1000.000002", ":sparkles: New session _(session: calm-velvet-otter)_"),
            user_message("1000.000010", USER, "still there?"),
        ],
    );

    h.pipeline
        .handle_message(reply(ROOT, "1000.000010", "still there?"))
        .await;
    let reads = h.chat.history_reads();
    h.pipeline
        .handle_message(reply(ROOT, "1000.000010", "still there?"))
        .await;

    assert!(reads > 0);
    assert_eq!(h.chat.history_reads(), reads);
    assert_eq!(h.launcher.invocations().len(), 1);
}

#[tokio::test]
async fn references_posted_by_other_users_are_ignored() {
    let h = Harness::new(Vec::new());
    h.aliases()
        .save_alias("calm-velvet-otter", "victim-session")
        .await
        .expect("seed alias");
    h.chat.set_replies(
        ROOT,
        vec![
            user_message(ROOT, "U2", "look at this _(session: calm-velvet-otter)_"),
            bot_message("1000.000002", "Sure."),
            user_message("1000.000003", USER, "help me"),
        ],
    );

    h.pipeline
        .handle_message(reply_mention(ROOT, "1000.000003", "help me"))
        .await;

    let invocation = &h.launcher.invocations()[0];
    assert_eq!(resume_arg(&invocation.args), None);
    assert!(invocation.args.iter().all(|a| !a.contains("victim-session")));
    let prompt = &h.launcher.prompts()[0];
    assert!(prompt.contains("BEGIN THREAD HISTORY"), "history rebuilt: {prompt}");
    assert!(prompt.contains("[Assistant] Sure."));
    assert!(!prompt.contains("look at this"), "other users are left out");
    assert!(prompt.ends_with("help me"));
}

#[tokio::test]
async fn stale_reconnect_restores_context_silently() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("sess-new"))),
        Step::Emit(say("Answer.")),
        Step::Emit(result_ok("", 1)),
    ]]);
    h.aliases()
        .save_alias("calm-velvet-otter", "sess-old")
        .await
        .expect("seed alias");
    h.chat.set_replies(
        ROOT,
        vec![
            user_message(ROOT, USER, &format!("<@{BOT_ID}> plan the release")),
            bot_message("1000.000002", "Plan drafted. _(session: calm-velvet-otter)_"),
            user_message("1000.000010", USER, "ship it"),
        ],
    );

    h.pipeline
        .handle_message(reply(ROOT, "1000.000010", "ship it"))
        .await;

    let posts = h.chat.posts();
    assert!(
        posts[0].starts_with(":warning: Could not restore session _calm-velvet-otter_"),
        "{}",
        posts[0]
    );
    assert!(posts.contains(&"Answer.".to_owned()));
    assert!(!posts.contains(&"ok".to_owned()), "context restore reply stays silent");

    let invocations = h.launcher.invocations();
    assert_eq!(invocations.len(), 2);
    assert_eq!(resume_arg(&invocations[1].args), Some("sess-new"));
    let prompts = h.launcher.prompts();
    assert_eq!(prompts[0], "ship it");
    assert!(prompts[1].contains("[User] plan the release"));
    assert!(prompts[1].contains("[Assistant] Plan drafted."));
    assert!(!prompts[1].contains("ship it"));
}
