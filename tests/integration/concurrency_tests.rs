//! Messages that arrive while a thread is busy, duplicates, and admission.

use std::sync::Arc;
use std::time::Duration;

use thread_relay::agent::event::{StreamEvent, TurnResult};

use crate::support::{
    eventually, init, mention, reply, reply_mention, result_ok, say, ChatCall, Harness, Step,
};

/// Position of the first `name` reaction added to `ts`.
fn reacted_at(h: &Harness, ts: &str, name: &str) -> usize {
    h.chat
        .calls()
        .iter()
        .position(|call| matches!(call, ChatCall::React { ts: t, name: n } if t == ts && n == name))
        .unwrap_or_else(|| panic!("{name} never added to {ts}"))
}

#[tokio::test]
async fn reply_during_a_turn_is_delivered_into_it() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("s1"))),
        Step::Emit(say("one")),
        Step::AwaitInput,
        Step::Emit(result_ok("one", 1)),
        Step::Emit(say("two")),
        Step::Emit(result_ok("two", 1)),
    ]]);

    let pipeline = Arc::clone(&h.pipeline);
    let first = tokio::spawn(async move { pipeline.handle_message(mention("1000.000001", "first")).await });
    assert!(
        eventually(|| h.chat.posts().iter().any(|p| p.contains("New session"))).await,
        "first turn never started"
    );

    h.pipeline
        .handle_message(reply_mention("1000.000001", "1000.000002", "second"))
        .await;
    first.await.expect("first turn task");

    assert_eq!(h.launcher.invocations().len(), 1, "one subprocess serves both");
    assert_eq!(h.launcher.prompts(), vec!["first".to_owned(), "second".to_owned()]);

    let posts = h.chat.posts();
    let one = posts.iter().position(|p| p == "one").expect("one posted");
    let two = posts.iter().position(|p| p == "two").expect("two posted");
    assert!(one < two);

    assert_eq!(h.chat.added("1000.000002"), vec!["eyes", "inbox_tray", "white_check_mark"]);
    assert_eq!(h.chat.reactions_on("1000.000002"), vec!["white_check_mark"]);
    assert!(h.chat.removed("1000.000002").contains(&"inbox_tray".to_owned()));
}

#[tokio::test]
async fn reply_after_stdin_closed_waits_in_backlog() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("s1"))),
        Step::Emit(say("one")),
        Step::Emit(result_ok("one", 1)),
        Step::Pause(Duration::from_millis(300)),
    ]]);

    let pipeline = Arc::clone(&h.pipeline);
    let first = tokio::spawn(async move { pipeline.handle_message(mention("1000.000001", "first")).await });
    assert!(
        eventually(|| h.chat.posts().iter().any(|p| p.starts_with(":checkered_flag:"))).await,
        "first turn never finished its request"
    );

    h.pipeline
        .handle_message(reply("1000.000001", "1000.000002", "second"))
        .await;
    assert!(h.chat.added("1000.000002").contains(&"hourglass".to_owned()));
    assert!(
        h.chat.reactions_on("1000.000001").contains(&"hourglass".to_owned()),
        "root shows the queue"
    );

    first.await.expect("first turn task");

    let invocations = h.launcher.invocations();
    assert_eq!(invocations.len(), 2);
    let args = &invocations[1].args;
    let at = args.iter().position(|a| a == "--resume").expect("resumed");
    assert_eq!(args[at + 1], "s1");
    assert_eq!(h.launcher.prompts(), vec!["first".to_owned(), "second".to_owned()]);

    assert!(h.chat.posts().contains(&"ok".to_owned()));
    assert_eq!(h.chat.reactions_on("1000.000002"), vec!["white_check_mark"]);
    assert!(
        !h.chat.reactions_on("1000.000001").contains(&"hourglass".to_owned()),
        "queue marker cleared from root"
    );
}

#[tokio::test]
async fn backlog_drains_in_arrival_order() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("s1"))),
        Step::Emit(say("one")),
        Step::Emit(result_ok("one", 1)),
        Step::Pause(Duration::from_millis(300)),
    ]]);

    tokio::join!(
        h.pipeline.handle_message(mention("1000.000001", "first")),
        async {
            assert!(
                eventually(|| h.chat.posts().iter().any(|p| p.starts_with(":checkered_flag:"))).await,
                "first turn never finished its request"
            );
            h.pipeline
                .handle_message(reply("1000.000001", "1000.000002", "second"))
                .await;
            h.pipeline
                .handle_message(reply("1000.000001", "1000.000003", "third"))
                .await;
            assert!(h.chat.added("1000.000002").contains(&"hourglass".to_owned()));
            assert!(h.chat.added("1000.000003").contains(&"hourglass".to_owned()));
        },
    );

    assert_eq!(
        h.launcher.prompts(),
        vec!["first".to_owned(), "second".to_owned(), "third".to_owned()]
    );
    assert_eq!(h.launcher.invocations().len(), 3);
    assert!(
        reacted_at(&h, "1000.000002", "white_check_mark")
            < reacted_at(&h, "1000.000003", "white_check_mark")
    );
    for ts in ["1000.000002", "1000.000003"] {
        assert_eq!(h.chat.reactions_on(ts), vec!["white_check_mark"], "{ts}");
    }
    assert!(!h.chat.reactions_on("1000.000001").contains(&"hourglass".to_owned()));
}

#[tokio::test]
async fn simultaneous_first_messages_share_one_session() {
    let h = Harness::new(vec![vec![
        Step::Emit(init(Some("s1"))),
        Step::Emit(say("one")),
        Step::AwaitInput,
        Step::Emit(result_ok("one", 1)),
        Step::Emit(say("two")),
        Step::Emit(result_ok("two", 1)),
    ]]);

    tokio::join!(
        h.pipeline.handle_message(mention("1000.000001", "first")),
        h.pipeline
            .handle_message(reply_mention("1000.000001", "1000.000002", "second")),
    );

    assert_eq!(h.launcher.invocations().len(), 1);
    assert_eq!(h.launcher.prompts(), vec!["first".to_owned(), "second".to_owned()]);
    assert_eq!(h.directory.len().await, 1);
    assert!(
        reacted_at(&h, "1000.000001", "white_check_mark")
            < reacted_at(&h, "1000.000002", "white_check_mark")
    );
    assert_eq!(h.chat.reactions_on("1000.000002"), vec!["white_check_mark"]);
    let posts = h.chat.posts();
    let one = posts.iter().position(|p| p == "one").expect("one posted");
    let two = posts.iter().position(|p| p == "two").expect("two posted");
    assert!(one < two);
}

#[tokio::test]
async fn denial_marker_stays_on_its_own_thread() {
    let denied = StreamEvent::Result(TurnResult {
        subtype: "success".into(),
        text: "Blocked.".into(),
        num_turns: Some(1),
        permission_denials: vec!["Bash".into()],
        ..TurnResult::default()
    });
    let h = Harness::new(vec![
        vec![Step::Emit(init(Some("s1"))), Step::Emit(denied)],
        vec![Step::Emit(init(Some("s2"))), Step::Emit(result_ok("Fine.", 1))],
    ]);

    tokio::join!(
        h.pipeline.handle_message(mention("1000.000001", "run it")),
        h.pipeline.handle_message(mention("1000.000010", "just chat")),
    );

    let denied_root = h.chat.reactions_on("1000.000001");
    assert!(denied_root.contains(&"warning".to_owned()), "{denied_root:?}");
    assert!(denied_root.contains(&"white_check_mark".to_owned()), "{denied_root:?}");
    assert_eq!(h.chat.reactions_on("1000.000010"), vec!["white_check_mark"]);
}

#[tokio::test]
async fn duplicate_delivery_runs_once() {
    let h = Harness::new(Vec::new());

    h.pipeline.handle_message(mention("1000.000001", "hello")).await;
    h.pipeline.handle_message(mention("1000.000001", "hello")).await;

    assert_eq!(h.launcher.invocations().len(), 1);
    assert_eq!(h.chat.added("1000.000001"), vec!["eyes", "white_check_mark"]);
}

#[tokio::test]
async fn sender_over_budget_gets_a_reaction_only() {
    let h = Harness::with_config(Vec::new(), |config| config.rate_limit = 1);

    h.pipeline.handle_message(mention("1000.000001", "one")).await;
    let posts_before = h.chat.posts().len();
    h.pipeline.handle_message(mention("1000.000002", "two")).await;

    assert_eq!(h.launcher.invocations().len(), 1);
    assert_eq!(h.chat.added("1000.000002"), vec!["no_entry_sign"]);
    assert_eq!(h.chat.posts().len(), posts_before);
}

#[tokio::test]
async fn sender_outside_allow_list_is_ignored_silently() {
    let h = Harness::with_config(Vec::new(), |config| {
        config.allowed_users = Some(vec!["U2".to_owned()]);
    });

    h.pipeline.handle_message(mention("1000.000001", "hello")).await;

    assert!(h.launcher.invocations().is_empty());
    assert!(h.chat.calls().is_empty());
}

#[tokio::test]
async fn unrelated_channel_chatter_is_not_handled() {
    let h = Harness::new(Vec::new());
    let mut chatter = reply("1000.000001", "1000.000001", "just talking");
    chatter.thread_ts = None;

    h.pipeline.handle_message(chatter).await;
    h.pipeline
        .handle_message(reply("1000.000005", "1000.000006", "a thread the bot never joined"))
        .await;

    assert!(h.launcher.invocations().is_empty());
    assert!(h.chat.calls().is_empty());
}
