//! Chat platform seam.
//!
//! Everything the pipeline needs from Slack goes through [`ChatApi`]. The
//! production implementation is [`super::client::SlackService`]; tests use an
//! in-memory recorder.

use std::future::Future;
use std::pin::Pin;

use crate::Result;

/// Boxed future returned by [`ChatApi`] methods.
pub type ChatFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One message from a thread's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryMessage {
    /// Message timestamp.
    pub ts: String,
    /// Human author, if any.
    pub user: Option<String>,
    /// Bot author, if posted by an integration.
    pub bot_id: Option<String>,
    /// Raw message text.
    pub text: String,
}

impl HistoryMessage {
    /// Whether the message was posted by the user `id`.
    #[must_use]
    pub fn is_from(&self, id: &str) -> bool {
        self.user.as_deref() == Some(id)
    }
}

/// A downloaded file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// `Content-Type` reported by the server.
    pub content_type: Option<String>,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

/// Outbound chat operations.
///
/// Rate-limit responses surface as `AppError::RateLimited`; every other
/// platform failure is `AppError::Slack`.
pub trait ChatApi: Send + Sync {
    /// Post `text` to `channel`, in a thread when `thread_ts` is set.
    /// Returns the new message's timestamp.
    fn post_message<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: Option<&'a str>,
        text: &'a str,
    ) -> ChatFuture<'a, String>;

    /// Add reaction `name` to a message.
    fn add_reaction<'a>(&'a self, channel: &'a str, ts: &'a str, name: &'a str)
        -> ChatFuture<'a, ()>;

    /// Remove reaction `name` from a message.
    fn remove_reaction<'a>(
        &'a self,
        channel: &'a str,
        ts: &'a str,
        name: &'a str,
    ) -> ChatFuture<'a, ()>;

    /// Human name of a channel; `None` for DMs and unnamed conversations.
    fn channel_name<'a>(&'a self, channel: &'a str) -> ChatFuture<'a, Option<String>>;

    /// Messages of a thread in chronological order, root included.
    fn thread_replies<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
    ) -> ChatFuture<'a, Vec<HistoryMessage>>;

    /// The thread root fetched from channel history.
    fn thread_starter<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
    ) -> ChatFuture<'a, Option<HistoryMessage>>;

    /// Upload `content` as a text snippet in a thread.
    fn upload_snippet<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
        filename: &'a str,
        content: &'a str,
        comment: Option<&'a str>,
    ) -> ChatFuture<'a, ()>;

    /// Upload a binary file, such as an image, in a thread.
    fn upload_file<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
        filename: &'a str,
        content: &'a [u8],
        comment: Option<&'a str>,
    ) -> ChatFuture<'a, ()>;

    /// Fetch a private file URL with the bot's credentials.
    ///
    /// Bodies larger than `max_bytes` are refused without being buffered
    /// in full.
    fn download_file<'a>(&'a self, url: &'a str, max_bytes: usize) -> ChatFuture<'a, Download>;

    /// User id of the bot itself.
    fn bot_user_id(&self) -> ChatFuture<'_, String>;
}
