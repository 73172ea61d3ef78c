//! Outbound collaborators: chat replies, notification fan-out and the
//! clip-buffer callback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use url::Url;

use kick_bridge_kick::{KickApiClient, KickApiError, SendChatMessageRequest};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("kick api error: {0}")]
    KickApi(#[from] KickApiError),
    #[error("sink rejected payload: {0}")]
    Rejected(String),
}

/// Sends chat messages into a broadcaster's channel.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, broadcaster_user_id: i64, content: &str) -> Result<(), SinkError>;
}

/// Receives event notifications (Discord, dashboard).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Receives livestream status transitions so recording can start or stop.
#[async_trait]
pub trait ClipBuffer: Send + Sync {
    async fn stream_status_changed(
        &self,
        is_live: bool,
        stream_title: Option<&str>,
    ) -> Result<(), SinkError>;
}

/// Looks up current channel metadata, used to backfill a missing stream
/// title on live notifications.
#[async_trait]
pub trait ChannelLookup: Send + Sync {
    async fn stream_title(&self, broadcaster_user_id: i64) -> Result<Option<String>, SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Follow,
    Subscription,
    GiftedSubs,
    Tip,
    Ban,
    StreamLive,
    StreamOffline,
}

/// A single event notification fanned out to the sinks.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub tenant_id: String,
    pub broadcaster: String,
    pub title: String,
    pub body: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

/// In-process notification hub backing the dashboard feed.
///
/// Thin wrapper over a broadcast channel; publishing with no subscribers is
/// not an error.
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for NotificationBus {
    async fn publish(&self, notification: &Notification) -> Result<(), SinkError> {
        if self.sender.send(notification.clone()).is_err() {
            debug!(stage = "notify", kind = ?notification.kind, "no dashboard subscribers");
        }
        Ok(())
    }
}

/// Posts notifications to a Discord webhook as a single embed.
#[derive(Clone)]
pub struct DiscordWebhookSink {
    http: reqwest::Client,
    webhook_url: Url,
}

impl DiscordWebhookSink {
    pub fn new(webhook_url: Url, http: reqwest::Client) -> Self {
        Self { http, webhook_url }
    }
}

#[async_trait]
impl NotificationSink for DiscordWebhookSink {
    async fn publish(&self, notification: &Notification) -> Result<(), SinkError> {
        let body = json!({
            "embeds": [{
                "title": notification.title,
                "description": notification.body,
                "color": embed_color(notification.kind),
                "timestamp": notification.ts.to_rfc3339(),
            }]
        });
        let response = self
            .http
            .post(self.webhook_url.clone())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(format!(
                "discord webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn embed_color(kind: NotificationKind) -> u32 {
    match kind {
        NotificationKind::Follow => 0x53FC18,
        NotificationKind::Subscription | NotificationKind::GiftedSubs => 0x9B59B6,
        NotificationKind::Tip => 0xF1C40F,
        NotificationKind::Ban => 0xE74C3C,
        NotificationKind::StreamLive => 0x3498DB,
        NotificationKind::StreamOffline => 0x95A5A6,
    }
}

/// HTTP clip-buffer integration; posts stream status transitions.
#[derive(Clone)]
pub struct HttpClipBuffer {
    http: reqwest::Client,
    url: Url,
}

impl HttpClipBuffer {
    pub fn new(url: Url, http: reqwest::Client) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl ClipBuffer for HttpClipBuffer {
    async fn stream_status_changed(
        &self,
        is_live: bool,
        stream_title: Option<&str>,
    ) -> Result<(), SinkError> {
        let body = json!({
            "event": if is_live { "stream_online" } else { "stream_offline" },
            "title": stream_title,
        });
        let response = self.http.post(self.url.clone()).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(format!(
                "clip buffer returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Chat sender backed by the Kick public API bot endpoint.
#[derive(Clone)]
pub struct KickChatSender {
    client: KickApiClient,
    bot_token: String,
}

impl KickChatSender {
    pub fn new(client: KickApiClient, bot_token: String) -> Self {
        Self { client, bot_token }
    }
}

#[async_trait]
impl ChatSender for KickChatSender {
    async fn send(&self, broadcaster_user_id: i64, content: &str) -> Result<(), SinkError> {
        self.client
            .send_chat_message(
                &self.bot_token,
                &SendChatMessageRequest {
                    broadcaster_user_id,
                    content,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelLookup for KickChatSender {
    async fn stream_title(&self, broadcaster_user_id: i64) -> Result<Option<String>, SinkError> {
        let channel = self
            .client
            .get_channel(&self.bot_token, broadcaster_user_id)
            .await?;
        Ok(channel.and_then(|c| c.stream_title))
    }
}

/// No-op implementations used when an integration is not configured.
#[derive(Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ChatSender for NullSink {
    async fn send(&self, _broadcaster_user_id: i64, _content: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for NullSink {
    async fn publish(&self, _notification: &Notification) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl ClipBuffer for NullSink {
    async fn stream_status_changed(
        &self,
        _is_live: bool,
        _stream_title: Option<&str>,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl ChannelLookup for NullSink {
    async fn stream_title(&self, _broadcaster_user_id: i64) -> Result<Option<String>, SinkError> {
        Ok(None)
    }
}
