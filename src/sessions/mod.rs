//! Session bookkeeping: the thread directory and the persisted alias map.

pub mod alias;
pub mod directory;

pub use alias::AliasStore;
pub use directory::{QueuedPrompt, SessionDirectory, SessionRecord, SessionTotals};
