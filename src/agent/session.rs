//! One agent conversation and its running invocation.
//!
//! An [`AgentSession`] starts at most one subprocess at a time. While a turn
//! is streaming, follow-up messages can be written straight into the running
//! invocation ([`AgentSession::queue_message`]); stdin is closed once every
//! delivered message has produced its `result`, which lets the agent exit.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::command::{build_args, interrupt_request, user_message, SessionOptions};
use crate::agent::event::StreamEvent;
use crate::agent::process::{AgentLauncher, Invocation};
use crate::{AppError, Result};

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    id_frozen: bool,
    requested_resume: Option<String>,
    stale_resume: Option<String>,
    run: Option<ActiveRun>,
    generation: u64,
    interrupted: bool,
    interrupted_by: Option<String>,
}

#[derive(Debug)]
struct ActiveRun {
    generation: u64,
    input: Option<mpsc::Sender<serde_json::Value>>,
    kill: CancellationToken,
    pending: usize,
}

/// A resumable agent conversation rooted at one working directory.
pub struct AgentSession {
    launcher: Arc<dyn AgentLauncher>,
    program: String,
    cwd: PathBuf,
    options: SessionOptions,
    state: Arc<Mutex<SessionState>>,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("program", &self.program)
            .field("cwd", &self.cwd)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    /// Create a session; `resume` names an existing backend session to continue.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        program: impl Into<String>,
        cwd: PathBuf,
        options: SessionOptions,
        resume: Option<String>,
    ) -> Self {
        let state = SessionState {
            session_id: resume.clone(),
            requested_resume: resume,
            ..SessionState::default()
        };
        Self {
            launcher,
            program: program.into(),
            cwd,
            options,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock_state(&self.state)
    }

    /// Working directory of the subprocess.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Backend session id: the requested resume id until the first `init`,
    /// then the id the agent reported.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Resume id this session was created with.
    #[must_use]
    pub fn requested_resume(&self) -> Option<String> {
        self.lock().requested_resume.clone()
    }

    /// Whether an invocation is running.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.lock().run.is_some()
    }

    /// Whether the current or last turn was interrupted.
    #[must_use]
    pub fn was_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Who interrupted the current or last turn.
    #[must_use]
    pub fn interrupted_by(&self) -> Option<String> {
        self.lock().interrupted_by.clone()
    }

    /// Take the resume id that turned out to be gone, if the agent answered
    /// a resume request with a different session id.
    #[must_use]
    pub fn take_stale_resume(&self) -> Option<String> {
        self.lock().stale_resume.take()
    }

    /// Start an invocation for `prompt` and return its event stream.
    ///
    /// # Errors
    ///
    /// - `AppError::Agent` if a turn is already streaming, the subprocess
    ///   cannot be started, or it closes stdin before taking the prompt.
    pub async fn stream(&self, prompt: &str) -> Result<TurnStream> {
        let placeholder = CancellationToken::new();
        let (generation, resume) = {
            let mut st = self.lock();
            if st.run.is_some() {
                return Err(AppError::Agent("a turn is already streaming".into()));
            }
            st.generation += 1;
            st.interrupted = false;
            st.interrupted_by = None;
            st.run = Some(ActiveRun {
                generation: st.generation,
                input: None,
                kill: placeholder.clone(),
                pending: 1,
            });
            (st.generation, st.session_id.clone())
        };

        let args = build_args(&self.options, resume.as_deref(), true);
        info!(
            resume = resume.as_deref().unwrap_or("-"),
            cwd = %self.cwd.display(),
            "starting agent invocation"
        );

        let launched = self
            .launcher
            .launch(Invocation {
                program: self.program.clone(),
                args,
                cwd: self.cwd.clone(),
            })
            .await;

        let run = match launched {
            Ok(run) => run,
            Err(err) => {
                clear_run(&self.state, generation);
                return Err(err);
            }
        };

        if run.input.send(user_message(prompt)).await.is_err() {
            run.kill.cancel();
            clear_run(&self.state, generation);
            return Err(AppError::Agent("agent closed stdin before the prompt".into()));
        }

        {
            let mut st = self.lock();
            match st.run.as_mut() {
                Some(active) if active.generation == generation => {
                    active.input = Some(run.input);
                    active.kill = run.kill.clone();
                }
                _ => {}
            }
        }
        if placeholder.is_cancelled() {
            run.kill.cancel();
        }

        Ok(TurnStream {
            events: run.events,
            state: Arc::clone(&self.state),
            kill: run.kill,
            generation,
            finished: false,
        })
    }

    /// Deliver `text` into the running invocation as a between-turn message.
    ///
    /// Returns `false` when nothing is streaming or the invocation no longer
    /// accepts input; the caller should queue the message instead.
    pub fn queue_message(&self, text: &str) -> bool {
        let mut st = self.lock();
        let Some(run) = st.run.as_mut() else {
            return false;
        };
        let Some(input) = run.input.as_ref() else {
            return false;
        };
        if input.try_send(user_message(text)).is_err() {
            return false;
        }
        run.pending += 1;
        debug!(pending = run.pending, "between-turn message delivered");
        true
    }

    /// Ask the running invocation to stop its current turn.
    ///
    /// The session stays resumable. Falls back to killing the subprocess when
    /// its stdin is already closed. Returns `false` when nothing is running.
    pub fn interrupt(&self, by: &str) -> bool {
        let mut st = self.lock();
        if st.run.is_none() {
            return false;
        }
        st.interrupted = true;
        st.interrupted_by = Some(by.to_owned());
        let Some(run) = st.run.as_mut() else {
            return false;
        };

        let request_id = format!("interrupt-{}", uuid::Uuid::new_v4());
        let sent = run
            .input
            .take()
            .is_some_and(|input| input.try_send(interrupt_request(&request_id)).is_ok());
        if !sent {
            run.kill.cancel();
        }
        info!(by, sent, "agent turn interrupted");
        true
    }

    /// Terminate the running subprocess. No-op when idle.
    pub fn kill(&self) {
        if let Some(run) = self.lock().run.as_ref() {
            warn!("killing agent subprocess");
            run.kill.cancel();
        }
    }
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn clear_run(state: &Mutex<SessionState>, generation: u64) {
    let mut st = lock_state(state);
    if st.run.as_ref().is_some_and(|run| run.generation == generation) {
        st.run = None;
    }
}

/// Event stream of one invocation.
///
/// Dropping an unfinished stream kills its subprocess.
pub struct TurnStream {
    events: mpsc::Receiver<Result<StreamEvent>>,
    state: Arc<Mutex<SessionState>>,
    kill: CancellationToken,
    generation: u64,
    finished: bool,
}

impl TurnStream {
    /// Next event, or `None` once the subprocess is gone.
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        if self.finished {
            return None;
        }
        let item = self.events.recv().await;
        match &item {
            None => {
                self.finished = true;
                clear_run(&self.state, self.generation);
            }
            Some(Ok(StreamEvent::Init {
                session_id: Some(id),
                ..
            })) => self.capture_session_id(id),
            Some(Ok(StreamEvent::Result(_))) => self.settle_one(),
            Some(_) => {}
        }
        item
    }

    fn capture_session_id(&self, id: &str) {
        let mut st = lock_state(&self.state);
        if st.id_frozen {
            if st.session_id.as_deref() != Some(id) {
                debug!(reported = id, "ignoring later session id");
            }
            return;
        }
        if let Some(requested) = st.requested_resume.clone() {
            if requested != id {
                warn!(
                    requested = %short_id(&requested),
                    reported = %short_id(id),
                    "requested session is gone; agent started a new one"
                );
                st.stale_resume = Some(requested);
            }
        }
        st.session_id = Some(id.to_owned());
        st.id_frozen = true;
        info!(session_id = %short_id(id), "session started");
    }

    fn settle_one(&self) {
        let mut st = lock_state(&self.state);
        let Some(run) = st.run.as_mut() else {
            return;
        };
        if run.generation != self.generation {
            return;
        }
        run.pending = run.pending.saturating_sub(1);
        if run.pending == 0 && run.input.take().is_some() {
            debug!("all delivered messages answered; closing agent stdin");
        }
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.finished {
            self.kill.cancel();
            clear_run(&self.state, self.generation);
        }
    }
}

/// First eight characters of a session id, for logs.
#[must_use]
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
