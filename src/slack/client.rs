//! Slack Web API client and Socket Mode listener.

use std::sync::Arc;

use slack_morphism::errors::SlackClientError;
use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest,
    SlackApiConversationsHistoryRequest, SlackApiConversationsInfoRequest,
    SlackApiConversationsRepliesRequest, SlackApiFilesComplete,
    SlackApiFilesCompleteUploadExternalRequest, SlackApiFilesGetUploadUrlExternalRequest,
    SlackApiReactionsAddRequest, SlackApiReactionsRemoveRequest, SlackApiToken,
    SlackApiTokenType, SlackApiTokenValue, SlackChannelId, SlackClient,
    SlackClientEventsListenerEnvironment, SlackClientHyperHttpsConnector, SlackClientSession,
    SlackClientSocketModeConfig, SlackClientSocketModeListener, SlackHistoryMessage,
    SlackMessageContent, SlackReactionName, SlackSocketModeListenerCallbacks, SlackTs,
};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pipeline::Pipeline;
use crate::slack::api::{ChatApi, ChatFuture, Download, HistoryMessage};
use crate::slack::events;
use crate::{config::SlackConfig, AppError, Result};

/// Page size for `conversations.replies`.
const REPLIES_PAGE_SIZE: u16 = 200;

/// Upper bound on pages read from one thread.
const MAX_REPLY_PAGES: usize = 10;

/// Slack client bound to the bot and app tokens.
pub struct SlackService {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
    app_token: SlackApiToken,
    http: reqwest::Client,
    bot_user_id: OnceCell<String>,
}

impl std::fmt::Debug for SlackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackService")
            .field("bot_user_id", &self.bot_user_id.get())
            .finish_non_exhaustive()
    }
}

impl SlackService {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the HTTPS connector cannot be created.
    pub fn new(config: &SlackConfig) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Slack(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));
        let bot_token = SlackApiToken {
            token_value: SlackApiTokenValue(config.bot_token.clone()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        let app_token = SlackApiToken {
            token_value: SlackApiTokenValue(config.app_token.clone()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::App),
        };
        Ok(Self {
            client,
            bot_token,
            app_token,
            http: reqwest::Client::new(),
            bot_user_id: OnceCell::new(),
        })
    }

    fn http_session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.bot_token)
    }

    /// Slack's external upload flow: reserve an upload URL, send the body,
    /// then share the file into the thread.
    async fn upload_external(
        &self,
        channel: &str,
        thread_ts: &str,
        filename: &str,
        content: &[u8],
        content_type: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        let session = self.http_session();

        let url_request =
            SlackApiFilesGetUploadUrlExternalRequest::new(filename.into(), content.len());
        let url_response = session
            .get_upload_url_external(&url_request)
            .await
            .map_err(|err| slack_error("failed to get upload url", err))?;

        let upload = self
            .http
            .post(url_response.upload_url.0.to_string())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(content.to_vec())
            .send()
            .await
            .map_err(|err| AppError::Slack(format!("failed to upload file: {err}")))?;
        if !upload.status().is_success() {
            return Err(AppError::Slack(format!(
                "file upload rejected with status {}",
                upload.status()
            )));
        }

        let file_ref = SlackApiFilesComplete {
            id: url_response.file_id,
            title: Some(filename.into()),
        };
        let mut complete_request = SlackApiFilesCompleteUploadExternalRequest::new(vec![file_ref]);
        complete_request.channel_id = Some(SlackChannelId(channel.to_owned()));
        complete_request.thread_ts = Some(SlackTs(thread_ts.to_owned()));
        complete_request.initial_comment = comment.map(ToOwned::to_owned);
        session
            .files_complete_upload_external(&complete_request)
            .await
            .map_err(|err| slack_error("failed to complete upload", err))?;
        debug!(filename, bytes = content.len(), "file uploaded");
        Ok(())
    }

    /// Connect Socket Mode and feed push events into `pipeline` until
    /// `cancel` fires.
    #[must_use]
    pub fn spawn_socket_mode(
        &self,
        pipeline: Arc<Pipeline>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(Arc::clone(&self.client))
                .with_error_handler(|err, _client, _state| {
                    error!(?err, "socket mode error");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                })
                .with_user_state(pipeline),
        );
        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_hello_events(|event, _client, _state| async move {
                info!(?event, "socket hello");
            })
            .with_push_events(events::handle_push_event);
        let config = SlackClientSocketModeConfig {
            max_connections_count: SlackClientSocketModeConfig::DEFAULT_CONNECTIONS_COUNT,
            debug_connections: SlackClientSocketModeConfig::DEFAULT_DEBUG_CONNECTIONS,
            initial_backoff_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_INITIAL_BACKOFF_IN_SECONDS,
            reconnect_timeout_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_RECONNECT_TIMEOUT_IN_SECONDS,
            ping_interval_in_seconds: SlackClientSocketModeConfig::DEFAULT_PING_INTERVAL_IN_SECONDS,
            ping_failure_threshold_times:
                SlackClientSocketModeConfig::DEFAULT_PING_FAILURE_THRESHOLD_TIMES,
        };

        let listener = SlackClientSocketModeListener::new(&config, listener_env, callbacks);
        let app_token = self.app_token.clone();
        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                error!(?error, "socket mode listen failed");
                return;
            }
            tokio::select! {
                _ = listener.serve() => info!("socket mode listener exited"),
                () = cancel.cancelled() => {
                    listener.shutdown().await;
                    info!("socket mode listener shut down");
                }
            }
        })
    }
}

fn slack_error(context: &str, err: SlackClientError) -> AppError {
    match err {
        SlackClientError::RateLimitError(rate) => AppError::RateLimited(rate.retry_after),
        other => AppError::Slack(format!("{context}: {other}")),
    }
}

fn message_content(text: &str) -> SlackMessageContent {
    SlackMessageContent {
        text: Some(text.to_owned()),
        blocks: None,
        attachments: None,
        upload: None,
        files: None,
        reactions: None,
        metadata: None,
        markdown_text: None,
    }
}

fn to_history(message: &SlackHistoryMessage) -> HistoryMessage {
    HistoryMessage {
        ts: message.origin.ts.to_string(),
        user: message.sender.user.as_ref().map(ToString::to_string),
        bot_id: message.sender.bot_id.as_ref().map(ToString::to_string),
        text: message.content.text.clone().unwrap_or_default(),
    }
}

impl ChatApi for SlackService {
    fn post_message<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: Option<&'a str>,
        text: &'a str,
    ) -> ChatFuture<'a, String> {
        Box::pin(async move {
            let request = SlackApiChatPostMessageRequest {
                channel: SlackChannelId(channel.to_owned()),
                content: message_content(text),
                as_user: None,
                icon_emoji: None,
                icon_url: None,
                link_names: Some(true),
                parse: None,
                thread_ts: thread_ts.map(|ts| SlackTs(ts.to_owned())),
                username: None,
                reply_broadcast: None,
                unfurl_links: None,
                unfurl_media: None,
            };
            let response = self
                .http_session()
                .chat_post_message(&request)
                .await
                .map_err(|err| slack_error("failed to post message", err))?;
            Ok(response.ts.to_string())
        })
    }

    fn add_reaction<'a>(
        &'a self,
        channel: &'a str,
        ts: &'a str,
        name: &'a str,
    ) -> ChatFuture<'a, ()> {
        Box::pin(async move {
            let request = SlackApiReactionsAddRequest::new(
                SlackChannelId(channel.to_owned()),
                SlackReactionName(name.to_owned()),
                SlackTs(ts.to_owned()),
            );
            self.http_session()
                .reactions_add(&request)
                .await
                .map_err(|err| slack_error("failed to add reaction", err))?;
            Ok(())
        })
    }

    fn remove_reaction<'a>(
        &'a self,
        channel: &'a str,
        ts: &'a str,
        name: &'a str,
    ) -> ChatFuture<'a, ()> {
        Box::pin(async move {
            let request = SlackApiReactionsRemoveRequest::new(SlackReactionName(name.to_owned()))
                .with_channel(SlackChannelId(channel.to_owned()))
                .with_timestamp(SlackTs(ts.to_owned()));
            self.http_session()
                .reactions_remove(&request)
                .await
                .map_err(|err| slack_error("failed to remove reaction", err))?;
            Ok(())
        })
    }

    fn channel_name<'a>(&'a self, channel: &'a str) -> ChatFuture<'a, Option<String>> {
        Box::pin(async move {
            let request = SlackApiConversationsInfoRequest::new(SlackChannelId(channel.to_owned()));
            let response = self
                .http_session()
                .conversations_info(&request)
                .await
                .map_err(|err| slack_error("failed to read channel info", err))?;
            Ok(response.channel.name)
        })
    }

    fn thread_replies<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
    ) -> ChatFuture<'a, Vec<HistoryMessage>> {
        Box::pin(async move {
            let session = self.http_session();
            let mut messages = Vec::new();
            let mut cursor = None;
            for _ in 0..MAX_REPLY_PAGES {
                let mut request = SlackApiConversationsRepliesRequest::new(
                    SlackChannelId(channel.to_owned()),
                    SlackTs(thread_ts.to_owned()),
                )
                .with_limit(REPLIES_PAGE_SIZE);
                if let Some(next) = cursor.take() {
                    request = request.with_cursor(next);
                }
                let response = session
                    .conversations_replies(&request)
                    .await
                    .map_err(|err| slack_error("failed to read thread", err))?;
                messages.extend(response.messages.iter().map(to_history));
                cursor = response
                    .response_metadata
                    .and_then(|meta| meta.next_cursor)
                    .filter(|next| !next.0.is_empty());
                if cursor.is_none() {
                    break;
                }
            }
            debug!(thread_ts, count = messages.len(), "read thread replies");
            Ok(messages)
        })
    }

    fn thread_starter<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
    ) -> ChatFuture<'a, Option<HistoryMessage>> {
        Box::pin(async move {
            let request = SlackApiConversationsHistoryRequest {
                channel: Some(SlackChannelId(channel.to_owned())),
                cursor: None,
                latest: Some(SlackTs(thread_ts.to_owned())),
                limit: Some(1),
                oldest: None,
                inclusive: Some(true),
                include_all_metadata: None,
            };
            let response = self
                .http_session()
                .conversations_history(&request)
                .await
                .map_err(|err| slack_error("failed to read channel history", err))?;
            Ok(response.messages.first().map(to_history))
        })
    }

    fn upload_snippet<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
        filename: &'a str,
        content: &'a str,
        comment: Option<&'a str>,
    ) -> ChatFuture<'a, ()> {
        Box::pin(self.upload_external(
            channel,
            thread_ts,
            filename,
            content.as_bytes(),
            "text/plain; charset=utf-8",
            comment,
        ))
    }

    fn upload_file<'a>(
        &'a self,
        channel: &'a str,
        thread_ts: &'a str,
        filename: &'a str,
        content: &'a [u8],
        comment: Option<&'a str>,
    ) -> ChatFuture<'a, ()> {
        Box::pin(self.upload_external(
            channel,
            thread_ts,
            filename,
            content,
            "application/octet-stream",
            comment,
        ))
    }

    fn download_file<'a>(&'a self, url: &'a str, max_bytes: usize) -> ChatFuture<'a, Download> {
        Box::pin(async move {
            let mut response = self
                .http
                .get(url)
                .bearer_auth(&self.bot_token.token_value.0)
                .send()
                .await
                .map_err(|err| AppError::Slack(format!("failed to download file: {err}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(AppError::Slack(format!("file download returned {status}")));
            }
            let too_large = || AppError::Slack(format!("file is larger than {max_bytes} bytes"));
            if response
                .content_length()
                .is_some_and(|len| usize::try_from(len).map_or(true, |len| len > max_bytes))
            {
                return Err(too_large());
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned);
            let mut bytes = Vec::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|err| AppError::Slack(format!("failed to read file body: {err}")))?
            {
                if bytes.len() + chunk.len() > max_bytes {
                    return Err(too_large());
                }
                bytes.extend_from_slice(&chunk);
            }
            Ok(Download {
                content_type,
                bytes,
            })
        })
    }

    fn bot_user_id(&self) -> ChatFuture<'_, String> {
        Box::pin(async move {
            let id = self
                .bot_user_id
                .get_or_try_init(|| async {
                    let response = self
                        .http_session()
                        .auth_test()
                        .await
                        .map_err(|err| slack_error("auth.test failed", err))?;
                    Ok::<_, AppError>(response.user_id.to_string())
                })
                .await?;
            Ok(id.clone())
        })
    }
}
