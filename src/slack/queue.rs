//! Per-channel throttled output queue.
//!
//! Every outbound post goes through [`OutputQueue`]. Posts to one channel
//! are serialised by that channel's lock and spaced by a minimum interval;
//! posts to different channels never wait on each other. A rate-limit
//! response is retried exactly once after the server's `Retry-After`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::slack::api::ChatApi;
use crate::{AppError, Result};

/// Default spacing between posts to one channel.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Delay used when a rate-limit response carries no `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

type ChannelSlot = Arc<Mutex<Option<Instant>>>;

/// Throttled, serialised access to message posting.
pub struct OutputQueue {
    chat: Arc<dyn ChatApi>,
    min_interval: Duration,
    channels: StdMutex<HashMap<String, ChannelSlot>>,
}

impl std::fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputQueue")
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

impl OutputQueue {
    /// Queue posting through `chat` with `min_interval` spacing per channel.
    #[must_use]
    pub fn new(chat: Arc<dyn ChatApi>, min_interval: Duration) -> Self {
        Self {
            chat,
            min_interval,
            channels: StdMutex::new(HashMap::new()),
        }
    }

    /// The underlying chat client, for calls that are not throttled.
    #[must_use]
    pub fn chat(&self) -> &Arc<dyn ChatApi> {
        &self.chat
    }

    fn slot(&self, channel: &str) -> ChannelSlot {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(channels.entry(channel.to_owned()).or_default())
    }

    /// Post `text` to a thread and return the new message's timestamp.
    ///
    /// # Errors
    ///
    /// Returns the platform error when the post fails, or when it is rate
    /// limited twice in a row.
    pub async fn post(&self, channel: &str, thread_ts: &str, text: &str) -> Result<String> {
        let slot = self.slot(channel);
        let mut last = slot.lock().await;
        self.throttle(channel, *last).await;
        let result = retry_once(|| self.chat.post_message(channel, Some(thread_ts), text)).await;
        *last = Some(Instant::now());
        result
    }

    /// Upload a text snippet to a thread, throttled like a post.
    ///
    /// # Errors
    ///
    /// Returns the platform error when the upload fails, or when it is rate
    /// limited twice in a row.
    pub async fn upload_snippet(
        &self,
        channel: &str,
        thread_ts: &str,
        filename: &str,
        content: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(channel);
        let mut last = slot.lock().await;
        self.throttle(channel, *last).await;
        let result = retry_once(|| {
            self.chat
                .upload_snippet(channel, thread_ts, filename, content, comment)
        })
        .await;
        *last = Some(Instant::now());
        result
    }

    /// Upload a binary file to a thread, throttled like a post.
    ///
    /// # Errors
    ///
    /// Same as [`OutputQueue::upload_snippet`].
    pub async fn upload_file(
        &self,
        channel: &str,
        thread_ts: &str,
        filename: &str,
        content: &[u8],
        comment: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(channel);
        let mut last = slot.lock().await;
        self.throttle(channel, *last).await;
        let result = retry_once(|| {
            self.chat
                .upload_file(channel, thread_ts, filename, content, comment)
        })
        .await;
        *last = Some(Instant::now());
        result
    }

    async fn throttle(&self, channel: &str, last: Option<Instant>) {
        let Some(last) = last else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            let delay = self.min_interval - elapsed;
            debug!(channel, ?delay, "throttling channel");
            sleep(delay).await;
        }
    }
}

async fn retry_once<T, F, Fut>(mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match call().await {
        Err(AppError::RateLimited(retry_after)) => {
            let delay = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
            warn!(?delay, "slack rate limited; retrying once");
            sleep(delay).await;
            call().await
        }
        other => other,
    }
}
