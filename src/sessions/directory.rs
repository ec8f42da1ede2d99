//! Thread to agent-session registry.
//!
//! The directory is the only owner of [`AgentSession`]s. Each chat thread
//! maps to one [`SessionRecord`] holding the session plus the bookkeeping
//! the pipeline needs to serialise turns: a turn flag with a FIFO backlog,
//! the between-turn delivery queue, a pending-question slot, usage totals,
//! and the thread-root reactions currently shown.
//!
//! The directory also owns the process-wide dedup set and the registry of
//! bot-authored message timestamps used to route reactions back to threads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::agent::command::SessionOptions;
use crate::agent::{AgentLauncher, AgentSession};
use crate::pipeline::guard::RecentSet;
use crate::{AppError, Result};

/// A prompt waiting for the thread's current turn to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPrompt {
    /// Prompt text as it will be sent to the agent.
    pub prompt: String,
    /// Timestamp of the user message that produced it.
    pub message_ts: String,
    /// Sender of that message.
    pub user: String,
}

/// Cumulative usage of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionTotals {
    /// Completed requests.
    pub requests: u32,
    /// Agentic turns across all requests.
    pub turns: u32,
    /// Spend across all requests in USD.
    pub cost_usd: f64,
}

#[derive(Debug)]
struct RecordState {
    turn_active: bool,
    backlog: VecDeque<QueuedPrompt>,
    injected: VecDeque<String>,
    pending_question: Option<oneshot::Sender<String>>,
    totals: SessionTotals,
    alias: Option<String>,
    thread_reactions: HashSet<String>,
    last_used: DateTime<Utc>,
}

/// Directory entry for one chat thread.
#[derive(Debug)]
pub struct SessionRecord {
    thread_ts: String,
    session: AgentSession,
    turn_lock: Mutex<()>,
    state: StdMutex<RecordState>,
    temp_dir: Option<TempDir>,
}

impl SessionRecord {
    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Thread root timestamp.
    #[must_use]
    pub fn thread_ts(&self) -> &str {
        &self.thread_ts
    }

    /// The agent session.
    #[must_use]
    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    /// Lock held for the duration of a turn and its backlog drain.
    #[must_use]
    pub fn turn_lock(&self) -> &Mutex<()> {
        &self.turn_lock
    }

    /// Whether the working directory is a scratch directory owned by the record.
    #[must_use]
    pub fn has_temp_dir(&self) -> bool {
        self.temp_dir.is_some()
    }

    /// Claim the turn for `prompt`, or queue it behind the active one.
    ///
    /// Returns the prompt back when the caller now owns the turn and must
    /// run it; returns `None` when it was queued.
    pub fn try_begin_turn(&self, prompt: QueuedPrompt) -> Option<QueuedPrompt> {
        let mut st = self.lock();
        if st.turn_active {
            st.backlog.push_back(prompt);
            debug!(thread_ts = %self.thread_ts, queued = st.backlog.len(), "prompt queued behind turn");
            return None;
        }
        st.turn_active = true;
        Some(prompt)
    }

    /// Next queued prompt, or release the turn when the backlog is empty.
    pub fn next_backlog_or_release(&self) -> Option<QueuedPrompt> {
        let mut st = self.lock();
        let next = st.backlog.pop_front();
        if next.is_none() {
            st.turn_active = false;
        }
        next
    }

    /// Whether a turn is claimed.
    #[must_use]
    pub fn turn_active(&self) -> bool {
        self.lock().turn_active
    }

    /// Number of prompts waiting behind the current turn.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Remember a message delivered between turns and not yet answered.
    pub fn push_injected(&self, message_ts: &str) {
        self.lock().injected.push_back(message_ts.to_owned());
    }

    /// Oldest between-turn message still awaiting its answer.
    pub fn pop_injected(&self) -> Option<String> {
        self.lock().injected.pop_front()
    }

    /// Install the answer slot for an agent-posed question.
    ///
    /// A previously installed slot is dropped, which fails its waiter.
    pub fn set_pending_question(&self, answer: oneshot::Sender<String>) {
        self.lock().pending_question = Some(answer);
    }

    /// Take the answer slot, if a question is waiting.
    pub fn take_pending_question(&self) -> Option<oneshot::Sender<String>> {
        self.lock().pending_question.take()
    }

    /// Whether a question is waiting for an answer.
    #[must_use]
    pub fn has_pending_question(&self) -> bool {
        self.lock().pending_question.is_some()
    }

    /// Fold one completed request into the totals and return them.
    pub fn record_usage(&self, turns: Option<u32>, cost_usd: Option<f64>) -> SessionTotals {
        let mut st = self.lock();
        st.totals.requests += 1;
        st.totals.turns += turns.unwrap_or(0);
        st.totals.cost_usd += cost_usd.unwrap_or(0.0);
        st.totals
    }

    /// Usage so far.
    #[must_use]
    pub fn totals(&self) -> SessionTotals {
        self.lock().totals
    }

    /// Public alias of the session, once assigned.
    #[must_use]
    pub fn alias(&self) -> Option<String> {
        self.lock().alias.clone()
    }

    /// Assign the public alias.
    pub fn set_alias(&self, alias: &str) {
        self.lock().alias = Some(alias.to_owned());
    }

    /// Track a reaction added to the thread root; `false` if already shown.
    pub fn track_reaction(&self, name: &str) -> bool {
        self.lock().thread_reactions.insert(name.to_owned())
    }

    /// Stop tracking a thread-root reaction; `false` if it was not shown.
    pub fn untrack_reaction(&self, name: &str) -> bool {
        self.lock().thread_reactions.remove(name)
    }

    /// Whether a reaction is shown on the thread root.
    #[must_use]
    pub fn shows_reaction(&self, name: &str) -> bool {
        self.lock().thread_reactions.contains(name)
    }

    /// Refresh the idle clock.
    pub fn touch(&self) {
        self.lock().last_used = Utc::now();
    }

    /// Last time the record was used.
    #[must_use]
    pub fn last_used(&self) -> DateTime<Utc> {
        self.lock().last_used
    }

    fn is_busy(&self) -> bool {
        self.session.is_streaming() || self.lock().turn_active
    }
}

/// Registry of live thread sessions.
pub struct SessionDirectory {
    launcher: Arc<dyn AgentLauncher>,
    program: String,
    options: SessionOptions,
    records: Mutex<HashMap<String, Arc<SessionRecord>>>,
    bot_messages: Mutex<HashMap<String, String>>,
    seen: Mutex<RecentSet>,
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl SessionDirectory {
    /// Create an empty directory whose sessions run `program` via `launcher`.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        program: impl Into<String>,
        options: SessionOptions,
    ) -> Self {
        Self {
            launcher,
            program: program.into(),
            options,
            records: Mutex::new(HashMap::new()),
            bot_messages: Mutex::new(HashMap::new()),
            seen: Mutex::new(RecentSet::default()),
        }
    }

    /// Record for `thread_ts`, creating it if absent.
    ///
    /// An existing record is touched and returned unchanged; `cwd` and
    /// `resume` only apply to a new one. Without a `cwd` the session runs
    /// in a fresh scratch directory owned by the record.
    ///
    /// Returns the record and whether it was created by this call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the scratch directory cannot be created.
    pub async fn get_or_create(
        &self,
        thread_ts: &str,
        cwd: Option<PathBuf>,
        resume: Option<String>,
    ) -> Result<(Arc<SessionRecord>, bool)> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get(thread_ts) {
            record.touch();
            debug!(thread_ts, "reusing session");
            return Ok((Arc::clone(record), false));
        }

        let (work_dir, temp_dir) = match cwd {
            Some(dir) => (dir, None),
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("thread-relay-")
                    .tempdir()
                    .map_err(|err| AppError::Io(format!("failed to create scratch dir: {err}")))?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let session = AgentSession::new(
            Arc::clone(&self.launcher),
            self.program.clone(),
            work_dir.clone(),
            self.options.clone(),
            resume,
        );
        let record = Arc::new(SessionRecord {
            thread_ts: thread_ts.to_owned(),
            session,
            turn_lock: Mutex::new(()),
            state: StdMutex::new(RecordState {
                turn_active: false,
                backlog: VecDeque::new(),
                injected: VecDeque::new(),
                pending_question: None,
                totals: SessionTotals::default(),
                alias: None,
                thread_reactions: HashSet::new(),
                last_used: Utc::now(),
            }),
            temp_dir,
        });
        records.insert(thread_ts.to_owned(), Arc::clone(&record));
        info!(thread_ts, cwd = %work_dir.display(), "new session");
        Ok((record, true))
    }

    /// Record for `thread_ts`, if present.
    pub async fn get(&self, thread_ts: &str) -> Option<Arc<SessionRecord>> {
        self.records.lock().await.get(thread_ts).cloned()
    }

    /// Whether `thread_ts` has a live record.
    pub async fn has(&self, thread_ts: &str) -> bool {
        self.records.lock().await.contains_key(thread_ts)
    }

    /// Number of live records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether there are no live records.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Remove a record, killing its subprocess.
    ///
    /// Returns whether a record was removed.
    pub async fn remove(&self, thread_ts: &str) -> bool {
        let removed = self.records.lock().await.remove(thread_ts);
        let Some(record) = removed else {
            return false;
        };
        record.session.kill();
        self.bot_messages
            .lock()
            .await
            .retain(|_, thread| thread != thread_ts);
        info!(thread_ts, "session removed");
        true
    }

    /// Remove idle records older than `max_age`; streaming ones are kept.
    ///
    /// Returns the number of records removed.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let expired: Vec<Arc<SessionRecord>> = {
            let mut records = self.records.lock().await;
            let keys: Vec<String> = records
                .iter()
                .filter(|(_, record)| record.last_used() < cutoff && !record.is_busy())
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| records.remove(key)).collect()
        };
        if expired.is_empty() {
            return 0;
        }

        for record in &expired {
            record.session.kill();
        }
        let live: HashSet<String> = self.records.lock().await.keys().cloned().collect();
        self.bot_messages
            .lock()
            .await
            .retain(|_, thread| live.contains(thread));

        info!(removed = expired.len(), "cleaned up idle sessions");
        expired.len()
    }

    /// Kill every subprocess and drop every record.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<SessionRecord>> =
            self.records.lock().await.drain().map(|(_, record)| record).collect();
        for record in &drained {
            record.session.kill();
        }
        self.bot_messages.lock().await.clear();
        info!(sessions = drained.len(), "session directory shut down");
    }

    /// Map a bot-authored message to the thread it was posted in.
    pub async fn register_bot_message(&self, message_ts: &str, thread_ts: &str) {
        self.bot_messages
            .lock()
            .await
            .insert(message_ts.to_owned(), thread_ts.to_owned());
    }

    /// Thread a bot-authored message belongs to.
    pub async fn thread_for_message(&self, message_ts: &str) -> Option<String> {
        self.bot_messages.lock().await.get(message_ts).cloned()
    }

    /// Record an inbound event id; `true` the first time it is seen.
    pub async fn mark_seen(&self, event_id: &str) -> bool {
        self.seen.lock().await.insert(event_id)
    }

    /// Whether an inbound event id was already recorded, without recording it.
    pub async fn was_seen(&self, event_id: &str) -> bool {
        self.seen.lock().await.contains(event_id)
    }
}

/// Spawn the periodic idle-session cleanup task.
#[must_use]
pub fn spawn_cleanup_task(
    directory: Arc<SessionDirectory>,
    period: Duration,
    max_age: chrono::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("cleanup task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = directory.cleanup(max_age).await;
                        debug!(removed, "cleanup pass finished");
                    }
                }
            }
        }
        .instrument(info_span!("session_cleanup")),
    )
}
