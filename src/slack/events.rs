//! Socket Mode push-event dispatch.
//!
//! Converts Slack message, mention, and reaction events into pipeline
//! inputs and hands them off on their own task so the socket acknowledgement
//! is never delayed by an agent turn.

use std::sync::Arc;

use slack_morphism::prelude::{
    SlackAppMentionEvent, SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector,
    SlackEventCallbackBody, SlackFile, SlackMessageContent, SlackMessageEvent,
    SlackMessageEventType, SlackPushEventCallback, SlackReactionAddedEvent, SlackReactionsItem,
};
use tracing::{debug, warn};

use crate::pipeline::{InboundFile, InboundKind, InboundMessage, InboundReaction, Pipeline};

fn inbound_files(content: Option<&SlackMessageContent>) -> Vec<InboundFile> {
    content
        .and_then(|c| c.files.as_ref())
        .map(|files| files.iter().map(inbound_file).collect())
        .unwrap_or_default()
}

fn inbound_file(file: &SlackFile) -> InboundFile {
    InboundFile {
        name: file
            .name
            .clone()
            .unwrap_or_else(|| file.id.to_string()),
        mimetype: file.mimetype.as_ref().map(ToString::to_string),
        url: file
            .url_private_download
            .as_ref()
            .or(file.url_private.as_ref())
            .map(ToString::to_string),
    }
}

/// A plain message event, or `None` for edits, joins, and bot posts.
fn from_message(event: &SlackMessageEvent) -> Option<InboundMessage> {
    if !matches!(event.subtype, None | Some(SlackMessageEventType::FileShare)) {
        debug!(subtype = ?event.subtype, "message subtype ignored");
        return None;
    }
    if event.sender.bot_id.is_some() {
        return None;
    }
    let user = event.sender.user.as_ref()?.to_string();
    let channel = event.origin.channel.as_ref()?.to_string();
    let content = event.content.as_ref();
    Some(InboundMessage {
        kind: InboundKind::Message,
        channel,
        channel_type: event.origin.channel_type.as_ref().map(ToString::to_string),
        user,
        ts: event.origin.ts.to_string(),
        thread_ts: event.origin.thread_ts.as_ref().map(ToString::to_string),
        text: content.and_then(|c| c.text.clone()).unwrap_or_default(),
        files: inbound_files(content),
    })
}

fn from_mention(event: &SlackAppMentionEvent) -> InboundMessage {
    InboundMessage {
        kind: InboundKind::Mention,
        channel: event.channel.to_string(),
        channel_type: event.origin.channel_type.as_ref().map(ToString::to_string),
        user: event.user.to_string(),
        ts: event.origin.ts.to_string(),
        thread_ts: event.origin.thread_ts.as_ref().map(ToString::to_string),
        text: event.content.text.clone().unwrap_or_default(),
        files: inbound_files(Some(&event.content)),
    }
}

fn from_reaction(event: &SlackReactionAddedEvent) -> Option<InboundReaction> {
    let SlackReactionsItem::Message(item) = &event.item else {
        return None;
    };
    Some(InboundReaction {
        user: event.user.to_string(),
        channel: item.origin.channel.as_ref()?.to_string(),
        item_ts: item.origin.ts.to_string(),
        reaction: event.reaction.to_string(),
    })
}

/// Handle push events delivered via Socket Mode.
///
/// # Errors
///
/// Never fails; unusable events are logged and dropped.
pub async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let pipeline: Option<Arc<Pipeline>> = {
        let guard = state.read().await;
        guard.get_user_state::<Arc<Pipeline>>().cloned()
    };
    let Some(pipeline) = pipeline else {
        warn!("pipeline not available; dropping event");
        return Ok(());
    };

    match &event.event {
        SlackEventCallbackBody::Message(message) => {
            if let Some(inbound) = from_message(message) {
                tokio::spawn(async move { pipeline.handle_message(inbound).await });
            }
        }
        SlackEventCallbackBody::AppMention(mention) => {
            let inbound = from_mention(mention);
            tokio::spawn(async move { pipeline.handle_message(inbound).await });
        }
        SlackEventCallbackBody::ReactionAdded(reaction) => {
            if let Some(inbound) = from_reaction(reaction) {
                tokio::spawn(async move { pipeline.handle_reaction(inbound).await });
            }
        }
        other => debug!(event = ?other, "push event ignored"),
    }
    Ok(())
}
