//! Streaming one agent turn back into its chat thread.
//!
//! Text is buffered and posted when the agent moves on to tools, when a
//! request completes, or after the idle-flush delay. Tool activity is posted
//! as it happens: the first activity after text goes out on its own, the
//! rest are batched.
//!
//! File edits and commits are mirrored on the thread root, commit and test
//! results get a summary card, and with `post_images` images the agent writes
//! or names are uploaded into the thread.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::cards;
use super::format::{self, Snippet, ToolActivity};
use super::resolve;
use super::status::{self, ThreadStatus};
use super::timers::{IdleFlush, TurnWatchdog};
use super::{Pipeline, Resolution};
use crate::agent::event::{AssistantMessage, StreamEvent, ToolResultMessage, ToolUse, TurnResult};
use crate::agent::session::short_id;
use crate::sessions::{QueuedPrompt, SessionRecord};
use crate::{AppError, Result};

const RESPONSE_SNIPPET_NAME: &str = "response.md";
const RESPONSE_SNIPPET_COMMENT: &str = ":page_facing_up: The full response is attached.";
const INTERRUPTED_NOTE: &str = ":stop_sign: _Interrupted by user_";
const QUESTION_TOOL: &str = "AskUserQuestion";

/// How a completed request ended, for the thread-root status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done { question: bool },
    Errored,
}

impl Pipeline {
    /// Run one queued prompt as an agent turn and render it.
    pub(super) async fn run_turn(
        &self,
        record: &Arc<SessionRecord>,
        channel: &str,
        decorate_root: bool,
        job: &QueuedPrompt,
        resolution: Resolution,
    ) {
        let watchdog = {
            let decorator = self.decorator.clone();
            let record = Arc::clone(record);
            let channel = channel.to_owned();
            TurnWatchdog::start(self.config.timing.long_running(), async move {
                info!(thread_ts = record.thread_ts(), "turn is running long");
                decorator
                    .set_status(&record, &channel, ThreadStatus::LongRunning, false)
                    .await;
            })
        };

        let mut turn = Turn::new(self, record, channel, decorate_root, job, resolution);
        let outcome = turn.drive(&job.prompt).await;
        watchdog.stop().await;
        turn.finish(outcome).await;
        self.decorator
            .hide(record, channel, status::LONG_RUNNING, false)
            .await;
    }
}

/// Rendering state of one turn.
struct Turn<'a> {
    pipeline: &'a Pipeline,
    record: &'a Arc<SessionRecord>,
    channel: &'a str,
    decorate_root: bool,
    job_ts: String,
    user: String,
    resolution: Resolution,
    text: String,
    last_text: String,
    pending: Vec<ToolActivity>,
    first_activity_posted: bool,
    tool_names: HashMap<String, String>,
    commits: HashSet<String>,
    test_runs: HashSet<String>,
    edited: bool,
    committed: bool,
    written_images: Vec<PathBuf>,
    uploaded_images: HashSet<PathBuf>,
    saw_text: bool,
    had_tool_use: bool,
    results: usize,
    outcome: Option<Outcome>,
    stale_context: Option<String>,
}

impl<'a> Turn<'a> {
    fn new(
        pipeline: &'a Pipeline,
        record: &'a Arc<SessionRecord>,
        channel: &'a str,
        decorate_root: bool,
        job: &QueuedPrompt,
        resolution: Resolution,
    ) -> Self {
        Self {
            pipeline,
            record,
            channel,
            decorate_root,
            job_ts: job.message_ts.clone(),
            user: job.user.clone(),
            resolution,
            text: String::new(),
            last_text: String::new(),
            pending: Vec::new(),
            first_activity_posted: false,
            tool_names: HashMap::new(),
            commits: HashSet::new(),
            test_runs: HashSet::new(),
            edited: false,
            committed: false,
            written_images: Vec::new(),
            uploaded_images: HashSet::new(),
            saw_text: false,
            had_tool_use: false,
            results: 0,
            outcome: None,
            stale_context: None,
        }
    }

    /// Whether the thread root carries status for this turn. A top-level
    /// turn picks it up once a reply in its thread marked the root.
    fn decorates_root(&self) -> bool {
        self.decorate_root || self.record.shows_reaction(status::WORKING)
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.text.trim().is_empty()
    }

    async fn drive(&mut self, prompt: &str) -> Result<()> {
        let mut stream = self.record.session().stream(prompt).await?;
        let mut idle = IdleFlush::new(self.pipeline.config.timing.idle_flush());
        loop {
            tokio::select! {
                biased;
                item = stream.next() => {
                    match item {
                        None => break,
                        Some(Err(err)) => return Err(err),
                        Some(Ok(event)) => self.on_event(event).await?,
                    }
                    if self.has_pending() {
                        idle.arm();
                    } else {
                        idle.disarm();
                    }
                }
                () = idle.expired() => {
                    debug!(thread_ts = self.record.thread_ts(), "idle flush");
                    idle.disarm();
                    self.flush_activities().await?;
                    self.flush_text().await?;
                }
            }
        }
        Ok(())
    }

    async fn on_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Init { session_id, model } => {
                debug!(model = model.as_deref().unwrap_or("-"), "agent session ready");
                if let Some(id) = session_id {
                    self.announce(&id).await?;
                }
                Ok(())
            }
            StreamEvent::Assistant(message) => self.on_assistant(message).await,
            StreamEvent::ToolResults(message) => self.on_tool_results(message).await,
            StreamEvent::Compaction {
                trigger,
                pre_tokens,
            } => {
                self.flush_activities().await?;
                self.first_activity_posted = false;
                info!(thread_ts = self.record.thread_ts(), trigger = %trigger, pre_tokens, "context compacted");
                if self.pipeline.config.verbosity.shows_compaction() {
                    self.post(&format::compaction_note(&trigger, pre_tokens)).await?;
                }
                Ok(())
            }
            StreamEvent::Result(result) => self.on_result(result).await,
        }
    }

    /// Post the session banner the first time a thread's session starts.
    async fn announce(&mut self, session_id: &str) -> Result<()> {
        if self.record.alias().is_some() {
            return Ok(());
        }
        let aliases = &self.pipeline.aliases;
        let session = self.record.session();
        let scan = self.resolution.scan.take().unwrap_or_default();

        let (alias, text) = if let Some(lost) = session.take_stale_resume() {
            let alias = self.fresh_alias(session_id).await;
            let old = self
                .resolution
                .resumed_alias
                .clone()
                .unwrap_or_else(|| format!("{}...", lost.chars().take(12).collect::<String>()));
            self.stale_context = self
                .resolution
                .stale_history
                .take()
                .map(|history| resolve::stale_context_prompt(&history));
            let text = format!(
                ":warning: Could not restore session _{old}_ because its data is gone. \
                 Continuing in a fresh session rebuilt from this thread.\n_(session: {alias})_"
            );
            (alias, text)
        } else if session.requested_resume().is_some() {
            let alias = match self.resolution.resumed_alias.clone() {
                Some(alias) => alias,
                None => self.fresh_alias(session_id).await,
            };
            let mut text = format!(":arrows_counterclockwise: Continuing session _(session: {alias})_");
            if !scan.skipped.is_empty() {
                text.push_str(&format!("\n_Skipped older sessions: {}_", scan.skipped.join(", ")));
            }
            if !scan.unmapped.is_empty() {
                text.push_str(&format!(
                    "\n_Could not resolve: {} (the alias map may have been reset)_",
                    scan.unmapped.join(", ")
                ));
            }
            (alias, text)
        } else if let Some(missing) = scan.unmapped.first() {
            let alias = self.fresh_alias(session_id).await;
            let text = format!(
                ":warning: Session _{missing}_ could not be found; the alias map may have been \
                 reset. Starting a new session.\n_(session: {alias})_"
            );
            (alias, text)
        } else {
            let alias = self.fresh_alias(session_id).await;
            (alias.clone(), format!(":sparkles: New session _(session: {alias})_"))
        };

        self.record.set_alias(&alias);
        info!(
            thread_ts = self.record.thread_ts(),
            session_id = %short_id(session_id),
            alias = %alias,
            "session announced"
        );
        if let Err(err) = aliases.save_alias(&alias, session_id).await {
            warn!(%err, alias = %alias, "could not persist alias");
        }
        self.post(&text).await.map(drop)
    }

    async fn fresh_alias(&self, session_id: &str) -> String {
        let alias = self.pipeline.aliases.generate_alias().await;
        debug!(alias = %alias, session_id = %short_id(session_id), "alias generated");
        alias
    }

    async fn on_assistant(&mut self, message: AssistantMessage) -> Result<()> {
        let tools = message.tool_uses();
        let subagent = message.parent_tool_use_id.is_some();
        let mut activities = Vec::new();
        let mut asks_question = false;
        for tool in &tools {
            self.had_tool_use = true;
            self.tool_names.insert(tool.id.clone(), tool.name.clone());
            asks_question |= tool.name == QUESTION_TOOL;
            self.track_changes(tool).await;
            if let Some(activity) = format::tool_activity(tool) {
                activities.push(if subagent {
                    activity.from_subagent()
                } else {
                    activity
                });
            }
        }

        if asks_question {
            self.pipeline
                .decorator
                .set_status(self.record, self.channel, ThreadStatus::AwaitingAnswer, false)
                .await;
        }

        let shows_activity =
            self.pipeline.config.verbosity.shows_activity() && !activities.is_empty();
        if shows_activity && !self.text.trim().is_empty() {
            self.flush_activities().await?;
            self.flush_text().await?;
        }
        if shows_activity {
            for activity in activities {
                if self.first_activity_posted {
                    self.pending.push(activity);
                    if self.pending.len() >= format::MAX_ACTIVITY_BATCH {
                        self.flush_activities().await?;
                    }
                } else {
                    self.first_activity_posted = true;
                    self.post_activity(activity).await?;
                }
            }
        }

        let chunk = message.text();
        if !chunk.is_empty() {
            self.saw_text = true;
            self.text.push_str(&chunk);
        }
        Ok(())
    }

    /// Mirror file edits and commits on the thread root and note what their
    /// results should be checked for.
    async fn track_changes(&mut self, tool: &ToolUse) {
        let pipeline = self.pipeline;
        let decorator = &pipeline.decorator;
        if cards::is_file_edit(tool) && !self.edited {
            self.edited = true;
            decorator.show(self.record, self.channel, status::EDITED).await;
            if self.committed {
                self.committed = false;
                decorator
                    .hide(self.record, self.channel, status::COMMITTED, false)
                    .await;
            }
        }
        if cards::is_git_commit(tool) {
            self.commits.insert(tool.id.clone());
            if self.edited {
                self.edited = false;
                decorator
                    .hide(self.record, self.channel, status::EDITED, false)
                    .await;
            }
            if !self.committed {
                self.committed = true;
                decorator.show(self.record, self.channel, status::COMMITTED).await;
                if self.job_ts != self.record.thread_ts() {
                    decorator.react(self.channel, &self.job_ts, status::COMMITTED).await;
                }
            }
        }
        if cards::is_test_run(tool) {
            self.test_runs.insert(tool.id.clone());
        }
        if pipeline.config.post_images {
            if let Some(path) = cards::written_image(tool) {
                self.written_images.push(path);
            }
        }
    }

    async fn on_tool_results(&mut self, message: ToolResultMessage) -> Result<()> {
        self.flush_activities().await?;
        self.first_activity_posted = false;
        let verbosity = self.pipeline.config.verbosity;

        for result in &message.results {
            let commit = self.commits.remove(&result.tool_use_id);
            let test_run = self.test_runs.remove(&result.tool_use_id);
            if commit && !result.is_error {
                if let Some(info) = cards::parse_commit(&result.text) {
                    self.post(&cards::commit_card(&info)).await?;
                }
            }
            if test_run && !result.is_error && verbosity.shows_activity() {
                if let Some(summary) = cards::parse_test_summary(&result.text) {
                    self.post(&cards::test_card(&summary)).await?;
                }
            }

            let name = self.tool_names.get(&result.tool_use_id).cloned();
            let name = name.as_deref();
            if name.is_some_and(format::is_silent_tool) {
                continue;
            }
            if result.is_error {
                debug!(tool = name.unwrap_or("-"), "tool error");
                if verbosity.shows_activity() {
                    self.post(&format::tool_error_line(name, &result.text)).await?;
                }
                continue;
            }
            if !verbosity.shows_tool_results()
                || name.is_some_and(format::is_quiet_tool)
                || result.text.trim().is_empty()
            {
                continue;
            }
            let (label, filename) = format::tool_result_label(name);
            if result.text.chars().count() > format::TOOL_RESULT_SNIPPET_THRESHOLD {
                self.upload_or_post(
                    &Snippet {
                        filename,
                        content: result.text.clone(),
                    },
                    &label,
                )
                .await?;
            } else {
                self.post(&format::tool_result_block(&label, &result.text))
                    .await?;
            }
        }

        if self.pipeline.config.post_images {
            let cwd = self.record.session().cwd().to_path_buf();
            let written = std::mem::take(&mut self.written_images);
            for path in written {
                let path = cwd.join(path);
                if path.is_file() {
                    self.upload_image(&path).await?;
                }
            }
            for result in message.results.iter().filter(|r| !r.is_error) {
                for path in cards::image_paths(&result.text, &cwd) {
                    self.upload_image(&path).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_result(&mut self, result: TurnResult) -> Result<()> {
        self.flush_activities().await?;
        self.first_activity_posted = false;
        if self.record.session().was_interrupted() {
            debug!(thread_ts = self.record.thread_ts(), "result after interrupt");
            return Ok(());
        }

        let pipeline = self.pipeline;
        let decorator = &pipeline.decorator;
        let message_ts = if self.results == 0 {
            self.job_ts.clone()
        } else if let Some(ts) = self.record.pop_injected() {
            decorator.unreact(self.channel, &ts, status::INJECTED).await;
            ts
        } else {
            self.job_ts.clone()
        };
        self.results += 1;

        if !self.saw_text && self.text.trim().is_empty() && !result.text.trim().is_empty() {
            self.text = result.text.clone();
            self.saw_text = true;
        }
        let produced = self.saw_text || self.had_tool_use;
        self.flush_text().await?;
        if pipeline.config.post_images {
            let cwd = self.record.session().cwd().to_path_buf();
            for path in cards::image_paths(&self.last_text, &cwd) {
                self.upload_image(&path).await?;
            }
        }

        let totals = self.record.record_usage(result.num_turns, result.cost_usd);
        if let Some(summary) = format::completion_summary(&result, Some(totals)) {
            self.post(&summary).await?;
        }

        if let Some(note) = format::permission_denials_note(&result.permission_denials) {
            warn!(
                target: "security",
                thread_ts = self.record.thread_ts(),
                user = %self.user,
                tools = ?result.permission_denials,
                "tool permissions denied"
            );
            self.post(&note).await?;
            decorator.show(self.record, self.channel, status::DENIED).await;
        }

        if !produced {
            warn!(
                thread_ts = self.record.thread_ts(),
                subtype = %result.subtype,
                "agent returned an empty response"
            );
            self.post(format::EMPTY_RESPONSE_WARNING).await?;
        }

        let errored = result.is_error || !produced;
        let marker = if errored { status::ERRORED } else { status::DONE };
        decorator
            .mark(self.record, self.channel, &message_ts, status::WORKING, marker)
            .await;

        self.outcome = Some(if errored {
            Outcome::Errored
        } else {
            Outcome::Done {
                question: format::ends_with_question(&self.last_text),
            }
        });
        self.saw_text = false;
        self.had_tool_use = false;
        self.last_text.clear();
        Ok(())
    }

    async fn finish(&mut self, outcome: Result<()>) {
        if let Err(err) = outcome {
            self.fail(err).await;
            return;
        }
        if self.record.session().was_interrupted() {
            self.interrupted().await;
            return;
        }
        if self.results == 0 {
            if let Err(err) = self.flush_text().await {
                debug!(%err, "could not post partial text");
            }
            self.fail(AppError::Agent("agent exited without a result".into()))
                .await;
            return;
        }

        if let Some(prompt) = self.stale_context.take() {
            self.inject_context(&prompt).await;
        }

        if !self.decorates_root() {
            if !matches!(self.outcome, Some(Outcome::Done { .. })) {
                self.clear_change_markers().await;
            }
            return;
        }
        let pipeline = self.pipeline;
        let decorator = &pipeline.decorator;
        match self.outcome {
            Some(Outcome::Done { question }) => {
                decorator
                    .set_status(self.record, self.channel, ThreadStatus::Done, false)
                    .await;
                if question {
                    decorator
                        .set_status(self.record, self.channel, ThreadStatus::AwaitingAnswer, false)
                        .await;
                }
            }
            Some(Outcome::Errored) | None => {
                decorator
                    .set_status(self.record, self.channel, ThreadStatus::Errored, false)
                    .await;
            }
        }
    }

    async fn fail(&mut self, err: AppError) {
        error!(
            %err,
            thread_ts = self.record.thread_ts(),
            user = %self.user,
            "agent turn failed"
        );
        let text = format::generic_error(err.kind());
        if let Err(post_err) = self.post(&text).await {
            debug!(%post_err, "could not report failure");
        }
        let pipeline = self.pipeline;
        let decorator = &pipeline.decorator;
        if self.results == 0 {
            decorator
                .mark(self.record, self.channel, &self.job_ts, status::WORKING, status::ERRORED)
                .await;
        }
        while let Some(ts) = self.record.pop_injected() {
            decorator.unreact(self.channel, &ts, status::INJECTED).await;
            decorator
                .mark(self.record, self.channel, &ts, status::WORKING, status::ERRORED)
                .await;
        }
        if self.decorates_root() {
            decorator
                .set_status(self.record, self.channel, ThreadStatus::Errored, false)
                .await;
        } else {
            self.clear_change_markers().await;
        }
    }

    async fn interrupted(&mut self) {
        info!(
            thread_ts = self.record.thread_ts(),
            by = self.record.session().interrupted_by().as_deref().unwrap_or("-"),
            "turn ended by interrupt"
        );
        if let Err(err) = self.flush_activities().await {
            debug!(%err, "could not post pending activity");
        }
        if let Err(err) = self.flush_text().await {
            debug!(%err, "could not post partial text");
        }
        if let Err(err) = self.post(INTERRUPTED_NOTE).await {
            debug!(%err, "could not post interrupt note");
        }
        let pipeline = self.pipeline;
        let decorator = &pipeline.decorator;
        if self.results == 0 {
            decorator
                .mark(self.record, self.channel, &self.job_ts, status::WORKING, status::INTERRUPTED)
                .await;
        }
        while let Some(ts) = self.record.pop_injected() {
            decorator.unreact(self.channel, &ts, status::INJECTED).await;
            decorator
                .mark(self.record, self.channel, &ts, status::WORKING, status::INTERRUPTED)
                .await;
        }
        if self.decorates_root() {
            decorator
                .set_status(self.record, self.channel, ThreadStatus::Interrupted, false)
                .await;
        } else {
            self.clear_change_markers().await;
        }
    }

    async fn clear_change_markers(&self) {
        let decorator = &self.pipeline.decorator;
        for name in [status::EDITED, status::COMMITTED] {
            decorator.hide(self.record, self.channel, name, false).await;
        }
    }

    /// Feed rebuilt history to a replacement session without posting its reply.
    async fn inject_context(&self, prompt: &str) {
        info!(thread_ts = self.record.thread_ts(), "restoring thread context into new session");
        let mut stream = match self.record.session().stream(prompt).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "context restore failed to start");
                return;
            }
        };
        while let Some(item) = stream.next().await {
            if let Err(err) = item {
                warn!(%err, "context restore failed");
                return;
            }
        }
    }

    async fn post(&self, text: &str) -> Result<String> {
        self.pipeline.post(self.record, self.channel, text).await
    }

    /// Upload an image file once per turn, posting a note instead if the
    /// upload fails.
    async fn upload_image(&mut self, path: &Path) -> Result<()> {
        if !self.uploaded_images.insert(path.to_path_buf()) {
            return Ok(());
        }
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let uploaded = match tokio::fs::read(path).await {
            Ok(bytes) => {
                self.pipeline
                    .queue
                    .upload_file(
                        self.channel,
                        self.record.thread_ts(),
                        &name,
                        &bytes,
                        Some(&cards::image_comment(&name)),
                    )
                    .await
            }
            Err(err) => Err(err.into()),
        };
        match uploaded {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, path = %path.display(), "image upload failed");
                self.post(&cards::image_upload_failed(&name)).await.map(drop)
            }
        }
    }

    /// Post the buffered response text.
    async fn flush_text(&mut self) -> Result<()> {
        let text = std::mem::take(&mut self.text);
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.first_activity_posted = false;
        self.last_text = text.to_owned();

        if text.chars().count() > format::SNIPPET_THRESHOLD {
            match self
                .pipeline
                .queue
                .upload_snippet(
                    self.channel,
                    self.record.thread_ts(),
                    RESPONSE_SNIPPET_NAME,
                    &format::sanitize_snippet(text),
                    Some(RESPONSE_SNIPPET_COMMENT),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => warn!(%err, "response upload failed; posting in parts"),
            }
        }
        for chunk in format::split_message(&format::markdown_to_mrkdwn(text)) {
            self.post(&chunk).await?;
        }
        Ok(())
    }

    /// Post the batched activity lines as one message.
    async fn flush_activities(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let mut lines = Vec::new();
        for activity in batch {
            match activity.snippet {
                Some(snippet) => {
                    if !lines.is_empty() {
                        self.post(&lines.join("\n")).await?;
                        lines.clear();
                    }
                    self.upload_or_post(&snippet, &activity.text).await?;
                }
                None => lines.push(activity.text),
            }
        }
        if !lines.is_empty() {
            self.post(&lines.join("\n")).await?;
        }
        Ok(())
    }

    async fn post_activity(&self, activity: ToolActivity) -> Result<()> {
        match activity.snippet {
            Some(snippet) => self.upload_or_post(&snippet, &activity.text).await,
            None => self.post(&activity.text).await.map(drop),
        }
    }

    /// Upload a snippet with `label` as its comment, or post the label alone
    /// if the upload fails.
    async fn upload_or_post(&self, snippet: &Snippet, label: &str) -> Result<()> {
        let uploaded = self
            .pipeline
            .queue
            .upload_snippet(
                self.channel,
                self.record.thread_ts(),
                &snippet.filename,
                &format::sanitize_snippet(&snippet.content),
                Some(label),
            )
            .await;
        match uploaded {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, filename = %snippet.filename, "snippet upload failed");
                self.post(label).await.map(drop)
            }
        }
    }
}
