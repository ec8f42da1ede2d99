//! Agent subprocess launcher.
//!
//! [`ProcessLauncher`] starts one agent CLI invocation with:
//! - `kill_on_drop(true)` so an abandoned child never outlives its handle.
//! - `env_clear()` + [`ALLOWED_ENV_VARS`] so Slack tokens are never visible
//!   to the agent.
//! - A reader task that frames stdout with [`StreamCodec`] and decodes each
//!   line with [`parse_line`].
//! - A writer task that serialises stream-json input lines to stdin.
//! - A supervisor that owns the child, enforces the shutdown grace period,
//!   and logs captured stderr when the run looks unhealthy.
//!
//! The [`AgentLauncher`] trait is the seam the rest of the crate depends on,
//! so tests can replay scripted output without spawning anything.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::codec::StreamCodec;
use crate::agent::event::{parse_line, StreamEvent};
use crate::{AppError, Result};

/// Environment variables inherited by the agent subprocess.
///
/// Everything else is stripped with `env_clear()` before launch.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "SHELL",
    "TMPDIR",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CONFIG_DIR",
];

/// Stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 32;

/// One agent CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Binary to run.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Working directory of the subprocess.
    pub cwd: PathBuf,
}

/// Handles to a running invocation.
///
/// The event channel closes once the subprocess is gone. Dropping `input`
/// closes the agent's stdin, which is how a run is told it may finish.
#[derive(Debug)]
pub struct AgentRun {
    /// Decoded events; an `Err` item reports a lifecycle failure.
    pub events: mpsc::Receiver<Result<StreamEvent>>,
    /// Stream-json input lines written to stdin.
    pub input: mpsc::Sender<Value>,
    /// Cancelling this token terminates the subprocess.
    pub kill: CancellationToken,
}

/// Future returned by [`AgentLauncher::launch`].
pub type LaunchFuture<'a> = Pin<Box<dyn Future<Output = Result<AgentRun>> + Send + 'a>>;

/// Starts agent invocations.
pub trait AgentLauncher: Send + Sync {
    /// Start `invocation` and return its handles.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` if the subprocess cannot be started.
    fn launch(&self, invocation: Invocation) -> LaunchFuture<'_>;
}

/// Launches the real agent CLI as a subprocess.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    grace: Duration,
}

impl ProcessLauncher {
    /// Create a launcher that gives subprocesses `grace` to exit on their own.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl AgentLauncher for ProcessLauncher {
    fn launch(&self, invocation: Invocation) -> LaunchFuture<'_> {
        Box::pin(async move { spawn_run(invocation, self.grace) })
    }
}

/// What the reader saw before stdout closed.
#[derive(Debug, Default, Clone, Copy)]
struct ReaderSummary {
    events: usize,
    saw_result: bool,
}

fn spawn_run(invocation: Invocation, grace: Duration) -> Result<AgentRun> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }

    cmd.current_dir(&invocation.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Agent(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Agent("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Agent("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Agent("failed to capture agent stderr".into()))?;

    let pid = child.id();
    info!(pid, cwd = %invocation.cwd.display(), "agent subprocess started");

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    let kill = CancellationToken::new();

    let span = info_span!("agent_run", pid);
    tokio::spawn(run_writer(stdin, input_rx, kill.clone()).instrument(span.clone()));
    let stderr_task = tokio::spawn(drain_stderr(stderr).instrument(span.clone()));
    let reader_task =
        tokio::spawn(run_reader(stdout, event_tx.clone(), kill.clone()).instrument(span.clone()));
    tokio::spawn(
        supervise(child, reader_task, stderr_task, event_tx, kill.clone(), grace).instrument(span),
    );

    Ok(AgentRun {
        events: event_rx,
        input: input_tx,
        kill,
    })
}

/// Reader task: frame stdout into lines and forward decoded events.
///
/// Framing and parse errors are logged and skipped. The task ends on EOF,
/// on an I/O error, on cancellation, or when the receiver is gone.
async fn run_reader<R>(
    stdout: R,
    event_tx: mpsc::Sender<Result<StreamEvent>>,
    cancel: CancellationToken,
) -> ReaderSummary
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, StreamCodec::new());
    let mut summary = ReaderSummary::default();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("agent reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => match item {
                None => {
                    debug!("agent reader: EOF");
                    break;
                }
                Some(Err(AppError::Protocol(msg))) => {
                    warn!(error = msg.as_str(), "agent reader: framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(%err, "agent reader: IO error, stopping");
                    break;
                }
                Some(Ok(line)) => match parse_line(&line) {
                    Ok(Some(event)) => {
                        summary.events += 1;
                        summary.saw_result |= matches!(event, StreamEvent::Result(_));
                        if event_tx.send(Ok(event)).await.is_err() {
                            debug!("agent reader: receiver closed, stopping");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, raw_line = %line, "agent reader: parse error, skipping line");
                    }
                },
            },
        }
    }

    summary
}

/// Writer task: serialise input lines to stdin until the channel closes.
///
/// Returning drops stdin, which signals end of input to the agent.
async fn run_writer(
    mut stdin: ChildStdin,
    mut input_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            msg = input_rx.recv() => {
                let Some(value) = msg else {
                    debug!("agent writer: input closed, closing stdin");
                    break;
                };
                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "agent writer: failed to serialise input line");
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(err) = stdin.write_all(&bytes).await {
                    warn!(%err, "agent writer: write to stdin failed");
                    break;
                }
                if let Err(err) = stdin.flush().await {
                    warn!(%err, "agent writer: flush failed");
                    break;
                }
            }
        }
    }
}

/// Keep the last [`STDERR_TAIL_LINES`] lines of stderr.
async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Own the child until it exits, then report how the run went.
async fn supervise(
    mut child: Child,
    mut reader: JoinHandle<ReaderSummary>,
    stderr: JoinHandle<String>,
    event_tx: mpsc::Sender<Result<StreamEvent>>,
    kill: CancellationToken,
    grace: Duration,
) {
    let (summary, killed) = tokio::select! {
        biased;

        () = kill.cancelled() => {
            terminate(&mut child, grace).await;
            (reader.await.unwrap_or_default(), true)
        }

        summary = &mut reader => {
            let summary = summary.unwrap_or_default();
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(?grace, "agent did not exit within grace period; killing");
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to kill agent subprocess");
                }
            }
            (summary, false)
        }
    };

    let status = child.wait().await;
    let stderr_tail = stderr.await.unwrap_or_default();
    let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
    let success = status.as_ref().is_ok_and(std::process::ExitStatus::success);

    if !killed && !success && !stderr_tail.is_empty() {
        warn!(exit_code = ?code, stderr = %stderr_tail, "agent exited with failure");
    }
    if summary.events == 0 && !killed {
        warn!(
            exit_code = ?code,
            stderr = %stderr_tail,
            "agent produced no events; session may be stuck or already in use"
        );
    }

    if !killed && !success && !summary.saw_result {
        let reason = code.map_or_else(
            || "terminated by signal".to_owned(),
            |c| format!("exited with code {c}"),
        );
        let _ = event_tx
            .send(Err(AppError::Agent(format!("agent process {reason}"))))
            .await;
    }

    info!(exit_code = ?code, events = summary.events, killed, "agent subprocess finished");
}

/// Ask the child to stop, then hard-kill it after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    send_sigterm(child);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("agent ignored termination request; killing");
        if let Err(err) = child.kill().await {
            warn!(%err, "failed to kill agent subprocess");
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(%err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(%err, "start_kill failed");
    }
}
