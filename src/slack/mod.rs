//! Slack bridge layer modules.

pub mod api;
pub mod client;
pub mod events;
pub mod queue;

pub use api::ChatApi;
