//! Shared test doubles: a recording chat client and a scripted agent launcher.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use thread_relay::agent::command::SessionOptions;
use thread_relay::agent::event::{
    AssistantMessage, ContentBlock, StreamEvent, ToolResult, ToolResultMessage, ToolUse,
    TurnResult,
};
use thread_relay::agent::process::LaunchFuture;
use thread_relay::agent::{AgentLauncher, AgentRun, Invocation};
use thread_relay::config::GlobalConfig;
use thread_relay::pipeline::{InboundFile, InboundKind, InboundMessage, Pipeline};
use thread_relay::sessions::{AliasStore, SessionDirectory};
use thread_relay::slack::api::{ChatApi, ChatFuture, Download, HistoryMessage};
use thread_relay::AppError;

pub const BOT_ID: &str = "UBOT";

// ── Recording chat client ────────────────────────────────────────────────────

/// One call made against [`MockChat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    Post {
        channel: String,
        thread_ts: Option<String>,
        text: String,
        ts: String,
    },
    React {
        ts: String,
        name: String,
    },
    Unreact {
        ts: String,
        name: String,
    },
    Upload {
        thread_ts: String,
        filename: String,
        content: String,
        comment: Option<String>,
    },
}

/// In-memory [`ChatApi`] that records every call.
#[derive(Debug, Default)]
pub struct MockChat {
    calls: Mutex<Vec<ChatCall>>,
    counter: AtomicUsize,
    replies: Mutex<HashMap<String, Vec<HistoryMessage>>>,
    starters: Mutex<HashMap<String, HistoryMessage>>,
    channel_names: Mutex<HashMap<String, String>>,
    downloads: Mutex<HashMap<String, Download>>,
    download_limits: Mutex<Vec<usize>>,
    history_reads: AtomicUsize,
    rate_limited_posts: AtomicUsize,
    fail_uploads: AtomicBool,
}

impl MockChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts of every posted message, in order.
    pub fn posts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Post { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(String, String, Option<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Upload {
                    filename,
                    content,
                    comment,
                    ..
                } => Some((filename, content, comment)),
                _ => None,
            })
            .collect()
    }

    /// Reaction names added to `ts`, in order.
    pub fn added(&self, ts: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::React { ts: t, name } if t == ts => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Reaction names removed from `ts`, in order.
    pub fn removed(&self, ts: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Unreact { ts: t, name } if t == ts => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Reactions currently on `ts`, replaying adds and removes.
    pub fn reactions_on(&self, ts: &str) -> Vec<String> {
        let mut shown: Vec<String> = Vec::new();
        for call in self.calls() {
            match call {
                ChatCall::React { ts: t, name } if t == ts && !shown.contains(&name) => {
                    shown.push(name);
                }
                ChatCall::Unreact { ts: t, name } if t == ts => shown.retain(|n| *n != name),
                _ => {}
            }
        }
        shown
    }

    pub fn set_replies(&self, thread_ts: &str, messages: Vec<HistoryMessage>) {
        self.replies
            .lock()
            .unwrap()
            .insert(thread_ts.to_owned(), messages);
    }

    pub fn set_starter(&self, thread_ts: &str, message: HistoryMessage) {
        self.starters
            .lock()
            .unwrap()
            .insert(thread_ts.to_owned(), message);
    }

    pub fn set_channel_name(&self, channel: &str, name: &str) {
        self.channel_names
            .lock()
            .unwrap()
            .insert(channel.to_owned(), name.to_owned());
    }

    pub fn set_download(&self, url: &str, content_type: Option<&str>, bytes: &[u8]) {
        self.downloads.lock().unwrap().insert(
            url.to_owned(),
            Download {
                content_type: content_type.map(str::to_owned),
                bytes: bytes.to_vec(),
            },
        );
    }

    /// Calls made to read a thread's replies.
    pub fn history_reads(&self) -> usize {
        self.history_reads.load(Ordering::SeqCst)
    }

    /// Size caps passed to every download, in call order.
    pub fn download_limits(&self) -> Vec<usize> {
        self.download_limits.lock().unwrap().clone()
    }

    /// Fail the next `count` posts with a rate-limit response.
    pub fn rate_limit_next_posts(&self, count: usize) {
        self.rate_limited_posts.store(count, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: ChatCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_ts(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("2000.{n:06}")
    }
}

impl ChatApi for MockChat {
    fn post_message<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: Option<&'a str>,
        text: &'a str,
    ) -> ChatFuture<'a, String> {
        Box::pin(async move {
            let limited = self
                .rate_limited_posts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if limited {
                return Err(AppError::RateLimited(Some(Duration::from_millis(10))));
            }
            let ts = self.next_ts();
            self.record(ChatCall::Post {
                channel: channel.to_owned(),
                thread_ts: thread_ts.map(str::to_owned),
                text: text.to_owned(),
                ts: ts.clone(),
            });
            Ok(ts)
        })
    }

    fn add_reaction<'a>(
        &'a self,
        _channel: &'a str,
        ts: &'a str,
        name: &'a str,
    ) -> ChatFuture<'a, ()> {
        Box::pin(async move {
            self.record(ChatCall::React {
                ts: ts.to_owned(),
                name: name.to_owned(),
            });
            Ok(())
        })
    }

    fn remove_reaction<'a>(
        &'a self,
        _channel: &'a str,
        ts: &'a str,
        name: &'a str,
    ) -> ChatFuture<'a, ()> {
        Box::pin(async move {
            self.record(ChatCall::Unreact {
                ts: ts.to_owned(),
                name: name.to_owned(),
            });
            Ok(())
        })
    }

    fn channel_name<'a>(&'a self, channel: &'a str) -> ChatFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.channel_names.lock().unwrap().get(channel).cloned()) })
    }

    fn thread_replies<'a>(
        &'a self,
        _channel: &'a str,
        thread_ts: &'a str,
    ) -> ChatFuture<'a, Vec<HistoryMessage>> {
        Box::pin(async move {
            self.history_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .replies
                .lock()
                .unwrap()
                .get(thread_ts)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn thread_starter<'a>(
        &'a self,
        _channel: &'a str,
        thread_ts: &'a str,
    ) -> ChatFuture<'a, Option<HistoryMessage>> {
        Box::pin(async move { Ok(self.starters.lock().unwrap().get(thread_ts).cloned()) })
    }

    fn upload_snippet<'a>(
        &'a self,
        _channel: &'a str,
        thread_ts: &'a str,
        filename: &'a str,
        content: &'a str,
        comment: Option<&'a str>,
    ) -> ChatFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(AppError::Slack("upload rejected".into()));
            }
            self.record(ChatCall::Upload {
                thread_ts: thread_ts.to_owned(),
                filename: filename.to_owned(),
                content: content.to_owned(),
                comment: comment.map(str::to_owned),
            });
            Ok(())
        })
    }

    fn upload_file<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
        filename: &'a str,
        content: &'a [u8],
        comment: Option<&'a str>,
    ) -> ChatFuture<'a, ()> {
        let text = String::from_utf8_lossy(content).into_owned();
        Box::pin(async move {
            self.upload_snippet(channel, thread_ts, filename, &text, comment)
                .await
        })
    }

    fn download_file<'a>(&'a self, url: &'a str, max_bytes: usize) -> ChatFuture<'a, Download> {
        Box::pin(async move {
            self.download_limits.lock().unwrap().push(max_bytes);
            let download = self
                .downloads
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| AppError::Slack(format!("no such file: {url}")))?;
            if download.bytes.len() > max_bytes {
                return Err(AppError::Slack(format!("file is larger than {max_bytes} bytes")));
            }
            Ok(download)
        })
    }

    fn bot_user_id(&self) -> ChatFuture<'_, String> {
        Box::pin(async { Ok(BOT_ID.to_owned()) })
    }
}

pub fn bot_message(ts: &str, text: &str) -> HistoryMessage {
    HistoryMessage {
        ts: ts.to_owned(),
        user: Some(BOT_ID.to_owned()),
        bot_id: Some("B1".to_owned()),
        text: text.to_owned(),
    }
}

pub fn user_message(ts: &str, user: &str, text: &str) -> HistoryMessage {
    HistoryMessage {
        ts: ts.to_owned(),
        user: Some(user.to_owned()),
        bot_id: None,
        text: text.to_owned(),
    }
}

// ── Scripted agent ───────────────────────────────────────────────────────────

/// One step of a scripted agent run.
#[derive(Debug)]
pub enum Step {
    /// Emit an event.
    Emit(StreamEvent),
    /// Report a lifecycle failure.
    Fail(AppError),
    /// Sleep before the next step.
    Pause(Duration),
    /// Block until the next stdin line arrives (or stdin closes).
    AwaitInput,
}

#[derive(Debug, Default)]
struct LauncherState {
    scripts: VecDeque<Vec<Step>>,
    invocations: Vec<Invocation>,
    inputs: Vec<Value>,
}

/// [`AgentLauncher`] that replays scripted runs in order.
///
/// Runs beyond the scripted ones reply `ok` to a fresh session.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl ScriptedLauncher {
    pub fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(LauncherState {
                scripts: scripts.into(),
                ..LauncherState::default()
            })),
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.state.lock().unwrap().inputs.clone()
    }

    /// Text of every user message written to stdin, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.inputs()
            .iter()
            .filter(|value| value["type"] == "user")
            .filter_map(|value| value["message"]["content"].as_str().map(str::to_owned))
            .collect()
    }

    /// Whether a control request to interrupt was written to stdin.
    pub fn saw_interrupt(&self) -> bool {
        self.inputs()
            .iter()
            .any(|value| value["request"]["subtype"] == "interrupt")
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(&self, invocation: Invocation) -> LaunchFuture<'_> {
        Box::pin(async move {
            let script = {
                let mut state = self.state.lock().unwrap();
                state.invocations.push(invocation);
                state
                    .scripts
                    .pop_front()
                    .unwrap_or_else(|| vec![Step::Emit(init(None)), Step::Emit(result_ok("ok", 1))])
            };
            let (event_tx, event_rx) = mpsc::channel(64);
            let (input_tx, input_rx) = mpsc::channel(32);
            let kill = CancellationToken::new();
            tokio::spawn(play(
                script,
                event_tx,
                input_rx,
                kill.clone(),
                Arc::clone(&self.state),
            ));
            Ok(AgentRun {
                events: event_rx,
                input: input_tx,
                kill,
            })
        })
    }
}

async fn play(
    script: Vec<Step>,
    events: mpsc::Sender<thread_relay::Result<StreamEvent>>,
    mut input: mpsc::Receiver<Value>,
    kill: CancellationToken,
    state: Arc<Mutex<LauncherState>>,
) {
    let record = |value: Value| state.lock().unwrap().inputs.push(value);

    tokio::select! {
        () = kill.cancelled() => return,
        first = input.recv() => if let Some(value) = first { record(value) },
    }

    for step in script {
        match step {
            Step::Emit(event) => {
                if events.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            Step::Fail(err) => {
                let _ = events.send(Err(err)).await;
            }
            Step::Pause(delay) => tokio::select! {
                () = kill.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            },
            Step::AwaitInput => tokio::select! {
                () = kill.cancelled() => return,
                next = input.recv() => if let Some(value) = next { record(value) },
            },
        }
        if kill.is_cancelled() {
            return;
        }
    }
    while let Ok(value) = input.try_recv() {
        record(value);
    }
}

// ── Event builders ───────────────────────────────────────────────────────────

pub fn init(session_id: Option<&str>) -> StreamEvent {
    StreamEvent::Init {
        session_id: session_id.map(str::to_owned),
        model: Some("test-model".to_owned()),
    }
}

pub fn say(text: &str) -> StreamEvent {
    StreamEvent::Assistant(AssistantMessage {
        blocks: vec![ContentBlock::Text(text.to_owned())],
        parent_tool_use_id: None,
    })
}

pub fn tool(id: &str, name: &str, input: Value) -> StreamEvent {
    StreamEvent::Assistant(AssistantMessage {
        blocks: vec![ContentBlock::ToolUse(ToolUse {
            id: id.to_owned(),
            name: name.to_owned(),
            input,
        })],
        parent_tool_use_id: None,
    })
}

pub fn tool_output(id: &str, text: &str, is_error: bool) -> StreamEvent {
    StreamEvent::ToolResults(ToolResultMessage {
        results: vec![ToolResult {
            tool_use_id: id.to_owned(),
            text: text.to_owned(),
            is_error,
        }],
        parent_tool_use_id: None,
    })
}

pub fn result_ok(text: &str, turns: u32) -> StreamEvent {
    StreamEvent::Result(TurnResult {
        subtype: "success".to_owned(),
        text: text.to_owned(),
        is_error: false,
        num_turns: Some(turns),
        duration_ms: Some(1_200),
        cost_usd: Some(0.01),
        session_id: None,
        permission_denials: Vec::new(),
    })
}

pub fn bash(command: &str) -> Value {
    json!({ "command": command })
}

// ── Pipeline harness ─────────────────────────────────────────────────────────

pub const CHANNEL: &str = "C1";
pub const USER: &str = "U1";

/// A pipeline wired to a [`MockChat`] and a [`ScriptedLauncher`].
pub struct Harness {
    pub chat: Arc<MockChat>,
    pub launcher: Arc<ScriptedLauncher>,
    pub directory: Arc<SessionDirectory>,
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<GlobalConfig>,
    pub state_dir: TempDir,
}

impl Harness {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self::with_config(scripts, |_| {})
    }

    pub fn with_config(scripts: Vec<Vec<Step>>, tweak: impl FnOnce(&mut GlobalConfig)) -> Self {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let mut config = GlobalConfig::from_toml_str("").expect("default config");
        config.state_dir = state_dir.path().join("state");
        config.attachments_dir = Some(state_dir.path().join("attachments"));
        config.timing.min_post_interval_ms = 0;
        config.timing.idle_flush_ms = 10_000;
        config.timing.long_running_seconds = 3_600;
        tweak(&mut config);
        let config = Arc::new(config);

        let chat = MockChat::new();
        let launcher = ScriptedLauncher::new(scripts);
        let directory = Arc::new(SessionDirectory::new(
            Arc::clone(&launcher) as Arc<dyn AgentLauncher>,
            "agent",
            SessionOptions::from_config(&config.agent, config.verbosity),
        ));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&config),
            Arc::clone(&chat) as Arc<dyn ChatApi>,
            Arc::clone(&directory),
            AliasStore::open(config.alias_map_path()),
        ));
        Self {
            chat,
            launcher,
            directory,
            pipeline,
            config,
            state_dir,
        }
    }

    /// A second handle on the persisted alias map.
    pub fn aliases(&self) -> AliasStore {
        AliasStore::open(self.config.alias_map_path())
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.config.attachments_root()
    }
}

/// A top-level mention of the bot.
pub fn mention(ts: &str, text: &str) -> InboundMessage {
    InboundMessage {
        kind: InboundKind::Mention,
        channel: CHANNEL.to_owned(),
        channel_type: Some("channel".to_owned()),
        user: USER.to_owned(),
        ts: ts.to_owned(),
        thread_ts: None,
        text: format!("<@{BOT_ID}> {text}"),
        files: Vec::new(),
    }
}

/// A mention posted as a reply in `thread_ts`.
pub fn reply_mention(thread_ts: &str, ts: &str, text: &str) -> InboundMessage {
    InboundMessage {
        thread_ts: Some(thread_ts.to_owned()),
        ..mention(ts, text)
    }
}

/// A plain reply in `thread_ts`.
pub fn reply(thread_ts: &str, ts: &str, text: &str) -> InboundMessage {
    InboundMessage {
        kind: InboundKind::Message,
        channel: CHANNEL.to_owned(),
        channel_type: Some("channel".to_owned()),
        user: USER.to_owned(),
        ts: ts.to_owned(),
        thread_ts: Some(thread_ts.to_owned()),
        text: text.to_owned(),
        files: Vec::new(),
    }
}

pub fn file(name: &str, url: &str, mimetype: &str) -> InboundFile {
    InboundFile {
        name: name.to_owned(),
        mimetype: Some(mimetype.to_owned()),
        url: Some(url.to_owned()),
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
