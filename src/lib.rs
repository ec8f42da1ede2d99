#![forbid(unsafe_code)]

//! `thread-relay`: chat threads as conversations with a streaming coding agent.
//!
//! Each Slack thread maps to one agent session. Messages in the thread are
//! streamed into the agent subprocess, and its output is streamed back as
//! posts, snippets, and status reactions.

pub mod agent;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod sessions;
pub mod slack;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
