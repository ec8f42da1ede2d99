//! Thread status decorations.
//!
//! A thread's state is shown as reactions on its root message. Exactly one
//! primary marker (working, done, errored, interrupted) is visible at a
//! time; the question and denial markers can sit next to a terminal one.
//!
//! Every reaction call here is best effort: failures are logged at debug
//! and never abort message processing.

use std::sync::Arc;

use tracing::debug;

use crate::sessions::SessionRecord;
use crate::slack::api::ChatApi;

/// Turn in progress.
pub const WORKING: &str = "eyes";
/// Turn finished.
pub const DONE: &str = "white_check_mark";
/// Turn failed.
pub const ERRORED: &str = "x";
/// Turn interrupted.
pub const INTERRUPTED: &str = "octagonal_sign";
/// The agent is waiting for an answer.
pub const AWAITING_ANSWER: &str = "speech_balloon";
/// Waiting for the previous turn to release the thread.
pub const QUEUED: &str = "hourglass";
/// A tool permission was denied during the turn.
pub const DENIED: &str = "warning";
/// The turn has been running for a while.
pub const LONG_RUNNING: &str = "hourglass_flowing_sand";
/// The sender exceeded their message budget.
pub const RATE_LIMITED: &str = "no_entry_sign";
/// A message was handed to the running turn and awaits its answer.
pub const INJECTED: &str = "inbox_tray";
/// A message was taken as the answer to a pending question.
pub const ANSWERED: &str = "ballot_box_with_check";
/// The agent changed files that are not committed yet.
pub const EDITED: &str = "pencil2";
/// The agent committed its changes.
pub const COMMITTED: &str = "package";

/// Decorations cleared when a new message starts a turn.
pub const CLEARED_ON_NEW_TURN: &[&str] = &[
    DONE,
    ERRORED,
    INTERRUPTED,
    AWAITING_ANSWER,
    DENIED,
    QUEUED,
    LONG_RUNNING,
    EDITED,
    COMMITTED,
];

/// Status of a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Nothing happening.
    Idle,
    /// A turn is streaming.
    Working,
    /// The last turn finished.
    Done,
    /// The last turn failed.
    Errored,
    /// The last turn was interrupted.
    Interrupted,
    /// The agent asked a question.
    AwaitingAnswer,
    /// Waiting behind another turn.
    QueuedBehindLock,
    /// The turn has been running past the long-running threshold.
    LongRunning,
}

/// Reactions to remove and add to reach a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Removed first.
    pub remove: &'static [&'static str],
    /// Then added.
    pub add: &'static [&'static str],
}

impl ThreadStatus {
    /// Reaction changes on the thread root for entering this status.
    #[must_use]
    pub fn transition(self) -> Transition {
        match self {
            Self::Idle => Transition {
                remove: &[WORKING, QUEUED, LONG_RUNNING, AWAITING_ANSWER],
                add: &[],
            },
            Self::Working => Transition {
                remove: CLEARED_ON_NEW_TURN,
                add: &[WORKING],
            },
            Self::Done => Transition {
                remove: &[WORKING, LONG_RUNNING, AWAITING_ANSWER],
                add: &[DONE],
            },
            Self::Errored => Transition {
                remove: &[WORKING, LONG_RUNNING, AWAITING_ANSWER, EDITED, COMMITTED],
                add: &[ERRORED],
            },
            Self::Interrupted => Transition {
                remove: &[WORKING, LONG_RUNNING, AWAITING_ANSWER, EDITED, COMMITTED],
                add: &[INTERRUPTED],
            },
            Self::AwaitingAnswer => Transition {
                remove: &[],
                add: &[AWAITING_ANSWER],
            },
            Self::QueuedBehindLock => Transition {
                remove: &[],
                add: &[QUEUED],
            },
            Self::LongRunning => Transition {
                remove: &[],
                add: &[LONG_RUNNING],
            },
        }
    }
}

/// Best-effort reaction helper.
#[derive(Clone)]
pub struct Decorator {
    chat: Arc<dyn ChatApi>,
}

impl std::fmt::Debug for Decorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decorator").finish_non_exhaustive()
    }
}

impl Decorator {
    /// Decorate through `chat`.
    #[must_use]
    pub fn new(chat: Arc<dyn ChatApi>) -> Self {
        Self { chat }
    }

    /// Add a reaction to any message.
    pub async fn react(&self, channel: &str, ts: &str, name: &str) -> bool {
        match self.chat.add_reaction(channel, ts, name).await {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, name, ts, "reaction add failed");
                false
            }
        }
    }

    /// Remove a reaction from any message.
    pub async fn unreact(&self, channel: &str, ts: &str, name: &str) {
        if let Err(err) = self.chat.remove_reaction(channel, ts, name).await {
            debug!(%err, name, ts, "reaction remove failed");
        }
    }

    /// Replace reaction `from` with `to` on a message.
    pub async fn swap(&self, channel: &str, ts: &str, from: &str, to: &str) {
        self.unreact(channel, ts, from).await;
        self.react(channel, ts, to).await;
    }

    /// [`Decorator::swap`] on a message of `record`'s thread, keeping the
    /// record's view of the root in step when `ts` is the root itself.
    pub async fn mark(&self, record: &SessionRecord, channel: &str, ts: &str, from: &str, to: &str) {
        let root = ts == record.thread_ts();
        self.unreact(channel, ts, from).await;
        if root {
            record.untrack_reaction(from);
        }
        if self.react(channel, ts, to).await && root {
            record.track_reaction(to);
        }
    }

    /// Show `name` on the thread root unless it is already shown.
    pub async fn show(&self, record: &SessionRecord, channel: &str, name: &str) {
        if record.shows_reaction(name) {
            return;
        }
        if self.react(channel, record.thread_ts(), name).await {
            record.track_reaction(name);
        }
    }

    /// Remove `name` from the thread root if it is shown.
    ///
    /// With `force`, the call is made even when the record does not know
    /// about the reaction, which covers decorations left by a previous run.
    pub async fn hide(&self, record: &SessionRecord, channel: &str, name: &str, force: bool) {
        if record.untrack_reaction(name) || force {
            self.unreact(channel, record.thread_ts(), name).await;
        }
    }

    /// Apply the thread-root transition into `status`.
    pub async fn set_status(
        &self,
        record: &SessionRecord,
        channel: &str,
        status: ThreadStatus,
        force: bool,
    ) {
        let step = status.transition();
        debug!(thread_ts = record.thread_ts(), ?status, "thread status");
        for name in step.remove {
            self.hide(record, channel, name, force).await;
        }
        for name in step.add {
            self.show(record, channel, name).await;
        }
    }
}
