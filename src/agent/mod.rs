//! Agent CLI integration.
//!
//! The agent runs as a subprocess speaking stream-json: one JSON object per
//! line on stdout, user messages and control requests as JSON lines on
//! stdin.
//!
//! - [`codec`]: bounded line framing for stdout.
//! - [`event`]: decoding of output lines into [`event::StreamEvent`]s.
//! - [`command`]: argument lists and stdin message encoding.
//! - [`process`]: the [`process::AgentLauncher`] seam and the real launcher.
//! - [`session`]: per-conversation invocation lifecycle.

pub mod codec;
pub mod command;
pub mod event;
pub mod process;
pub mod session;

pub use event::StreamEvent;
pub use process::{AgentLauncher, AgentRun, Invocation, ProcessLauncher};
pub use session::{AgentSession, TurnStream};
