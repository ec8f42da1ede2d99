//! Event-processing pipeline.
//!
//! Turns inbound chat events into agent turns:
//!
//! 1. Redelivered events are dropped, then routing: DMs, replies in known
//!    threads, and mentions are handled.
//! 2. Allow-list and per-user rate limiting ([`guard`]).
//! 3. Session resolution: handoff reference, thread scan, or history
//!    rebuild ([`resolve`]).
//! 4. Attachment download ([`attachments`]).
//! 5. Between-turn delivery, or a FIFO backlog behind the running turn.
//! 6. Streaming the turn back to chat ([`stream`]), with commit, test, and
//!    image cards ([`cards`]).
//!
//! Thread status is shown as reactions on the thread root ([`status`]).

pub mod attachments;
pub mod cards;
pub mod format;
pub mod guard;
pub mod resolve;
pub mod status;
mod stream;
pub mod timers;

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent::session::short_id;
use crate::config::GlobalConfig;
use crate::sessions::{AliasStore, QueuedPrompt, SessionDirectory, SessionRecord};
use crate::slack::api::ChatApi;
use crate::slack::queue::OutputQueue;
use crate::{AppError, Result};

pub use attachments::InboundFile;
use guard::RateLimiter;
use resolve::{ScanResult, SessionReference};
use status::{Decorator, ThreadStatus};

/// Reaction that interrupts a running turn.
pub const STOP_REACTION: &str = "octagonal_sign";

/// How an inbound message reached the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// A plain message event (DM, thread reply, or channel message).
    Message,
    /// An explicit `@mention` of the bot.
    Mention,
}

/// A chat message addressed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Event source.
    pub kind: InboundKind,
    /// Channel id.
    pub channel: String,
    /// `im` for direct messages.
    pub channel_type: Option<String>,
    /// Sender id.
    pub user: String,
    /// Message timestamp, also the dedup key.
    pub ts: String,
    /// Thread root, when posted in a thread.
    pub thread_ts: Option<String>,
    /// Raw text.
    pub text: String,
    /// Attached files.
    pub files: Vec<InboundFile>,
}

impl InboundMessage {
    /// Root of the thread this message belongs to.
    #[must_use]
    pub fn thread_root(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }

    /// Whether the message is a reply inside an existing thread.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.thread_ts.as_deref().is_some_and(|root| root != self.ts)
    }

    /// Whether the message is a direct message.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
    }
}

/// A reaction added to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReaction {
    /// Who reacted.
    pub user: String,
    /// Channel of the reacted message.
    pub channel: String,
    /// Timestamp of the reacted message.
    pub item_ts: String,
    /// Reaction name without colons.
    pub reaction: String,
}

/// Context gathered while resolving a session, used for announcements.
#[derive(Debug, Clone, Default)]
struct Resolution {
    resumed_alias: Option<String>,
    scan: Option<ScanResult>,
    stale_history: Option<String>,
}

/// The message-processing engine.
pub struct Pipeline {
    config: Arc<GlobalConfig>,
    chat: Arc<dyn ChatApi>,
    queue: OutputQueue,
    decorator: Decorator,
    directory: Arc<SessionDirectory>,
    aliases: AliasStore,
    limiter: StdMutex<RateLimiter>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Assemble the pipeline.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        chat: Arc<dyn ChatApi>,
        directory: Arc<SessionDirectory>,
        aliases: AliasStore,
    ) -> Self {
        let queue = OutputQueue::new(Arc::clone(&chat), config.timing.min_post_interval());
        let limiter = StdMutex::new(RateLimiter::new(config.rate_limit));
        Self {
            decorator: Decorator::new(Arc::clone(&chat)),
            config,
            chat,
            queue,
            directory,
            aliases,
            limiter,
        }
    }

    /// The session directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Handle one inbound message end to end.
    ///
    /// Failures are reported in the thread and logged; nothing is returned.
    pub async fn handle_message(&self, message: InboundMessage) {
        // The id is claimed only after routing: an unrouted message event
        // must leave its ts free for the matching app_mention.
        if self.directory.was_seen(&message.ts).await {
            debug!(ts = %message.ts, "duplicate delivery ignored");
            return;
        }
        let Some(text) = self.route(&message).await else {
            return;
        };
        if !self.directory.mark_seen(&message.ts).await {
            debug!(ts = %message.ts, "duplicate delivery ignored");
            return;
        }
        if !self.admit(&message).await {
            return;
        }
        if let Err(err) = self.process(&message, text).await {
            warn!(%err, thread_ts = message.thread_root(), "message processing failed");
            let text = format::generic_error(err.kind());
            if let Err(post_err) = self
                .queue
                .post(&message.channel, message.thread_root(), &text)
                .await
            {
                debug!(%post_err, "could not report failure");
            }
            self.decorator
                .swap(&message.channel, &message.ts, status::WORKING, status::ERRORED)
                .await;
        }
    }

    /// Handle a reaction; a stop reaction interrupts the thread's turn.
    pub async fn handle_reaction(&self, reaction: InboundReaction) {
        if reaction.reaction != STOP_REACTION {
            return;
        }
        if !self.config.is_user_allowed(&reaction.user) {
            warn!(target: "security", user = %reaction.user, "stop reaction from user not on the allow-list ignored");
            return;
        }
        let thread_ts = match self.directory.thread_for_message(&reaction.item_ts).await {
            Some(thread) => thread,
            None if self.directory.has(&reaction.item_ts).await => reaction.item_ts.clone(),
            None => return,
        };
        let Some(record) = self.directory.get(&thread_ts).await else {
            return;
        };
        if record.session().interrupt(&format!("reaction:{}", reaction.user)) {
            info!(thread_ts, user = %reaction.user, "turn interrupted by reaction");
        }
    }

    /// Post `question` in a thread and wait for the next message there.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the thread has no session.
    /// - `AppError::Timeout` if nobody answers in time.
    /// - `AppError::Agent` if the question was replaced by a newer one.
    pub async fn ask_question(&self, channel: &str, thread_ts: &str, question: &str) -> Result<String> {
        let record = self
            .directory
            .get(thread_ts)
            .await
            .ok_or_else(|| AppError::NotFound(format!("no session for thread {thread_ts}")))?;
        let (tx, rx) = oneshot::channel();
        record.set_pending_question(tx);
        self.post(&record, channel, question).await?;
        self.decorator
            .set_status(&record, channel, ThreadStatus::AwaitingAnswer, false)
            .await;

        let outcome = tokio::time::timeout(self.config.timing.question_timeout(), rx).await;
        self.decorator
            .hide(&record, channel, status::AWAITING_ANSWER, false)
            .await;
        match outcome {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(AppError::Agent("question was superseded".into())),
            Err(_) => {
                drop(record.take_pending_question());
                Err(AppError::Timeout("no answer to question".into()))
            }
        }
    }

    /// Kill every agent subprocess.
    pub async fn shutdown(&self) {
        self.directory.shutdown().await;
    }

    async fn route(&self, message: &InboundMessage) -> Option<String> {
        let text = format::strip_mentions(&message.text);
        let has_files = !message.files.is_empty();
        match message.kind {
            InboundKind::Mention => {
                if text.is_empty() && !has_files && !message.is_reply() {
                    return None;
                }
                Some(text)
            }
            InboundKind::Message => {
                if message.text.trim().is_empty() && !has_files {
                    return None;
                }
                if message.is_direct() {
                    return Some(text);
                }
                if message.is_reply() {
                    let thread_ts = message.thread_root();
                    let known = self.directory.has(thread_ts).await
                        || resolve::bot_in_thread(self.chat.as_ref(), &message.channel, thread_ts)
                            .await;
                    return known.then_some(text);
                }
                let bot_id = self.chat.bot_user_id().await.ok()?;
                let mentioned = message.text.contains(&format!("<@{bot_id}>"));
                (mentioned && (!text.is_empty() || has_files)).then_some(text)
            }
        }
    }

    async fn admit(&self, message: &InboundMessage) -> bool {
        if !self.config.is_user_allowed(&message.user) {
            warn!(
                target: "security",
                user = %message.user,
                channel = %message.channel,
                "blocked message from user not on the allow-list"
            );
            return false;
        }
        let within_budget = self
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(&message.user);
        if !within_budget {
            warn!(
                target: "security",
                user = %message.user,
                channel = %message.channel,
                "rate limited"
            );
            self.decorator
                .react(&message.channel, &message.ts, status::RATE_LIMITED)
                .await;
            return false;
        }
        true
    }

    async fn resolve_cwd(&self, channel: &str) -> Option<PathBuf> {
        if self.config.channel_dirs.is_empty() {
            return None;
        }
        match self.chat.channel_name(channel).await {
            Ok(Some(name)) => {
                let dir = self.config.resolve_channel_dir(&name);
                if let Some(dir) = &dir {
                    debug!(channel_name = %name, cwd = %dir.display(), "channel directory");
                }
                dir
            }
            Ok(None) => None,
            Err(err) => {
                debug!(%err, channel, "could not look up channel name");
                None
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn process(&self, message: &InboundMessage, text: String) -> Result<()> {
        let channel = message.channel.as_str();
        let thread_ts = message.thread_root();
        let is_reply = message.is_reply();

        if let Some(record) = self.directory.get(thread_ts).await {
            if let Some(answer) = record.take_pending_question() {
                if answer.send(text.clone()).is_ok() {
                    info!(thread_ts, "message taken as answer to pending question");
                    self.decorator
                        .react(channel, &message.ts, status::ANSWERED)
                        .await;
                    return Ok(());
                }
            }
        }

        let mut resolution = Resolution::default();
        let (mut prompt, mut resume) = match resolve::extract_reference(&text) {
            Some((rest, SessionReference::SessionId(id))) => {
                info!(
                    target: "security",
                    user = %message.user,
                    thread_ts,
                    session_id = %short_id(&id),
                    "handoff requested"
                );
                (rest, Some(id))
            }
            Some((rest, SessionReference::Alias(alias))) => {
                match self.aliases.load_alias(&alias).await {
                    Some(id) => {
                        info!(target: "security", user = %message.user, thread_ts, alias = %alias, "handoff requested");
                        resolution.resumed_alias = Some(alias);
                        (rest, Some(id))
                    }
                    None => {
                        info!(thread_ts, alias = %alias, "handoff alias not in map");
                        resolution.scan = Some(ScanResult {
                            total_found: 1,
                            unmapped: vec![alias],
                            ..ScanResult::default()
                        });
                        (rest, None)
                    }
                }
            }
            None => (text, None),
        };
        let handoff = resume.is_some();

        self.decorator
            .react(channel, &message.ts, status::WORKING)
            .await;

        let cwd = self.resolve_cwd(channel).await;

        let mut reconnect =
            !handoff && resolution.scan.is_none() && is_reply && !self.directory.has(thread_ts).await;
        if reconnect {
            let scan =
                resolve::scan_thread(self.chat.as_ref(), &self.aliases, channel, thread_ts).await;
            if let Some(id) = scan.session_id.clone() {
                info!(thread_ts, session_id = %short_id(&id), alias = scan.alias.as_deref().unwrap_or("-"), "reconnecting to session found in thread");
                resume = Some(id);
                resolution.resumed_alias.clone_from(&scan.alias);
                resolution.stale_history = resolve::fetch_thread_history(
                    self.chat.as_ref(),
                    channel,
                    thread_ts,
                    &message.ts,
                    &message.user,
                )
                .await;
                reconnect = false;
            }
            resolution.scan = Some(scan);
        }

        let (record, created) = self
            .directory
            .get_or_create(thread_ts, cwd, resume.clone())
            .await?;

        if is_reply {
            self.decorator
                .set_status(&record, channel, ThreadStatus::Working, created)
                .await;
        } else {
            // The message is the thread root.
            record.track_reaction(status::WORKING);
        }

        if reconnect {
            if let Some(history) = resolve::fetch_thread_history(
                self.chat.as_ref(),
                channel,
                thread_ts,
                &message.ts,
                &message.user,
            )
            .await
            {
                info!(thread_ts, "rebuilding context from thread history");
                prompt = resolve::history_preamble(&history, &prompt);
            }
        }

        if prompt.is_empty() && message.files.is_empty() {
            prompt = resolve::empty_mention_prompt(resume.is_some()).to_owned();
        }

        let saved = attachments::download_all(
            self.chat.as_ref(),
            &message.files,
            &self.config.attachments_root().join(thread_ts),
        )
        .await;
        let mut prompt = attachments::with_attachments(&prompt, &saved);
        if prompt.trim().is_empty() {
            prompt = resolve::empty_mention_prompt(resume.is_some()).to_owned();
        }

        if record.session().is_streaming() && record.session().queue_message(&prompt) {
            record.push_injected(&message.ts);
            self.decorator
                .react(channel, &message.ts, status::INJECTED)
                .await;
            info!(thread_ts, "message delivered into running turn");
            return Ok(());
        }

        let contended = record.turn_active();
        if contended {
            self.decorator.react(channel, &message.ts, status::QUEUED).await;
        }
        let queued = QueuedPrompt {
            prompt,
            message_ts: message.ts.clone(),
            user: message.user.clone(),
        };
        let Some(first) = record.try_begin_turn(queued) else {
            if !contended {
                self.decorator.react(channel, &message.ts, status::QUEUED).await;
            }
            if is_reply {
                self.decorator
                    .set_status(&record, channel, ThreadStatus::QueuedBehindLock, false)
                    .await;
            }
            info!(thread_ts, backlog = record.backlog_len(), "message queued behind running turn");
            return Ok(());
        };
        if contended {
            self.decorator.unreact(channel, &message.ts, status::QUEUED).await;
        }

        self.run_turns(&record, channel, is_reply, first, resolution)
            .await;
        Ok(())
    }

    /// Run `first`, then drain the backlog in arrival order.
    async fn run_turns(
        &self,
        record: &Arc<SessionRecord>,
        channel: &str,
        decorate_root: bool,
        first: QueuedPrompt,
        resolution: Resolution,
    ) {
        let _turn = if let Ok(guard) = record.turn_lock().try_lock() {
            guard
        } else {
            if decorate_root {
                self.decorator
                    .set_status(record, channel, ThreadStatus::QueuedBehindLock, false)
                    .await;
            }
            let guard = record.turn_lock().lock().await;
            if decorate_root {
                self.decorator
                    .hide(record, channel, status::QUEUED, false)
                    .await;
            }
            guard
        };

        let mut resolution = Some(resolution);
        let mut next = Some(first);
        while let Some(job) = next {
            self.run_turn(
                record,
                channel,
                decorate_root,
                &job,
                resolution.take().unwrap_or_default(),
            )
            .await;
            next = record.next_backlog_or_release();
            if let Some(queued) = &next {
                self.decorator
                    .unreact(channel, &queued.message_ts, status::QUEUED)
                    .await;
                if decorate_root || record.shows_reaction(status::QUEUED) {
                    self.decorator
                        .set_status(record, channel, ThreadStatus::Working, false)
                        .await;
                }
            }
        }
        record.touch();
    }

    /// Post to a thread and remember the message for reaction routing.
    async fn post(&self, record: &SessionRecord, channel: &str, text: &str) -> Result<String> {
        let ts = self.queue.post(channel, record.thread_ts(), text).await?;
        self.directory
            .register_bot_message(&ts, record.thread_ts())
            .await;
        Ok(ts)
    }
}
