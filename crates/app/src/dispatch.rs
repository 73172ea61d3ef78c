//! Domain dispatch for decoded webhook events: notification fan-out, raffle
//! ticket credit for gifted subs and livestream status side effects.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use kick_bridge_core::event::{KickEvent, KickUser};
use kick_bridge_storage::WebhookSubscription;

use crate::clock::Clock;
use crate::raffle::{RaffleEngine, RaffleError};
use crate::sinks::{
    ChannelLookup, ClipBuffer, Notification, NotificationBus, NotificationKind, NotificationSink,
};

/// Budget for one external notification attempt.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// How many giftee names a gift notification spells out.
const GIFTEE_DISPLAY_CAP: usize = 5;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Raffle(#[from] RaffleError),
}

pub struct EventDispatcher {
    raffles: Arc<RaffleEngine>,
    discord: Arc<dyn NotificationSink>,
    dashboard: NotificationBus,
    clip_buffer: Arc<dyn ClipBuffer>,
    channels: Arc<dyn ChannelLookup>,
    clock: Clock,
}

impl EventDispatcher {
    pub fn new(
        raffles: Arc<RaffleEngine>,
        discord: Arc<dyn NotificationSink>,
        dashboard: NotificationBus,
        clip_buffer: Arc<dyn ClipBuffer>,
        channels: Arc<dyn ChannelLookup>,
        clock: Clock,
    ) -> Self {
        Self {
            raffles,
            discord,
            dashboard,
            clip_buffer,
            channels,
            clock,
        }
    }

    pub fn raffles(&self) -> &RaffleEngine {
        &self.raffles
    }

    /// Handles one decoded event for a resolved subscription.
    ///
    /// Notification failures are logged and absorbed; only storage-level
    /// failures bubble up so the delivery can be retried.
    pub async fn dispatch(
        &self,
        subscription: &WebhookSubscription,
        message_id: &str,
        event: &KickEvent,
    ) -> Result<(), DispatchError> {
        let tenant_id = subscription.tenant_id.as_str();
        match event {
            KickEvent::ChatMessageSent { sender, .. } => {
                // Chat rides a separate realtime transport; a webhook copy
                // is ignored.
                debug!(stage = "dispatch", tenant_id, sender = %sender.username, "chat event ignored");
            }
            KickEvent::ChannelFollowed { broadcaster, follower } => {
                self.notify(Notification {
                    kind: NotificationKind::Follow,
                    tenant_id: tenant_id.to_string(),
                    broadcaster: broadcaster.username.clone(),
                    title: "New follower".to_string(),
                    body: format!("{} followed the channel", follower.username),
                    payload: json!({"follower": follower.username}),
                    ts: (self.clock)(),
                })
                .await;
            }
            KickEvent::SubscriptionNew {
                broadcaster,
                subscriber,
                duration_months,
                ..
            }
            | KickEvent::SubscriptionRenewal {
                broadcaster,
                subscriber,
                duration_months,
                ..
            } => {
                let months = *duration_months;
                self.notify(Notification {
                    kind: NotificationKind::Subscription,
                    tenant_id: tenant_id.to_string(),
                    broadcaster: broadcaster.username.clone(),
                    title: "Subscription".to_string(),
                    body: format!("{} subscribed ({months} months)", subscriber.username),
                    payload: json!({
                        "subscriber": subscriber.username,
                        "duration_months": months,
                    }),
                    ts: (self.clock)(),
                })
                .await;
            }
            KickEvent::SubscriptionGifts {
                broadcaster,
                gifter,
                giftees,
                ..
            } => {
                let names: Vec<String> =
                    giftees.iter().map(|g| g.username.clone()).collect();
                self.raffles
                    .award_gift_tickets(tenant_id, message_id, &names)
                    .await?;

                let gifter_name = gifter
                    .as_ref()
                    .map(|g| g.username.as_str())
                    .unwrap_or("An anonymous gifter");
                self.notify(Notification {
                    kind: NotificationKind::GiftedSubs,
                    tenant_id: tenant_id.to_string(),
                    broadcaster: broadcaster.username.clone(),
                    title: "Gifted subs".to_string(),
                    body: format!(
                        "{gifter_name} gifted {} subs to {}",
                        names.len(),
                        display_giftees(&names)
                    ),
                    payload: json!({
                        "gifter": gifter.as_ref().map(|g| g.username.clone()),
                        "giftees": names,
                    }),
                    ts: (self.clock)(),
                })
                .await;
            }
            KickEvent::KicksGifted {
                broadcaster,
                sender,
                amount,
                kick_count,
                message,
            } => {
                self.notify(Notification {
                    kind: NotificationKind::Tip,
                    tenant_id: tenant_id.to_string(),
                    broadcaster: broadcaster.username.clone(),
                    title: "Kicks gifted".to_string(),
                    body: format!("{} sent {kick_count} kicks (${amount:.2})", sender.username),
                    payload: json!({
                        "sender": sender.username,
                        "amount": amount,
                        "kick_count": kick_count,
                        "message": message,
                    }),
                    ts: (self.clock)(),
                })
                .await;
            }
            KickEvent::ModerationBanned {
                broadcaster,
                moderator,
                banned_user,
                reason,
                expires_at,
            } => {
                let verb = if expires_at.is_some() { "timed out" } else { "banned" };
                self.notify(Notification {
                    kind: NotificationKind::Ban,
                    tenant_id: tenant_id.to_string(),
                    broadcaster: broadcaster.username.clone(),
                    title: "Moderation".to_string(),
                    body: format!(
                        "{} {verb} {}{}",
                        moderator.username,
                        banned_user.username,
                        reason
                            .as_deref()
                            .map(|r| format!(": {r}"))
                            .unwrap_or_default()
                    ),
                    payload: json!({
                        "moderator": moderator.username,
                        "banned_user": banned_user.username,
                        "reason": reason,
                        "expires_at": expires_at,
                    }),
                    ts: (self.clock)(),
                })
                .await;
            }
            KickEvent::LivestreamStatusUpdated {
                broadcaster,
                is_live,
                stream_title,
                ..
            } => {
                let mut title = stream_title.clone();
                if *is_live && title.is_none() {
                    title = self.lookup_title(broadcaster).await;
                }
                self.livestream_status(tenant_id, broadcaster, *is_live, title.as_deref())
                    .await;
            }
            KickEvent::Unknown { event_type, .. } => {
                debug!(stage = "dispatch", tenant_id, event_type, "unknown event dropped");
            }
        }
        Ok(())
    }

    /// Online payloads sometimes arrive without a title; asks the API for
    /// the current one. Failure just leaves the title empty.
    async fn lookup_title(&self, broadcaster: &KickUser) -> Option<String> {
        let user_id = broadcaster.user_id?;
        match tokio::time::timeout(NOTIFY_TIMEOUT, self.channels.stream_title(user_id)).await {
            Ok(Ok(title)) => title,
            Ok(Err(err)) => {
                warn!(stage = "dispatch", user_id, error = %err, "channel title lookup failed");
                None
            }
            Err(_) => {
                warn!(stage = "dispatch", user_id, "channel title lookup timed out");
                None
            }
        }
    }

    /// Fans a livestream transition out to three independent collaborators.
    /// Each attempt has its own timeout; one failing never stops the others.
    async fn livestream_status(
        &self,
        tenant_id: &str,
        broadcaster: &KickUser,
        is_live: bool,
        stream_title: Option<&str>,
    ) {
        let notification = Notification {
            kind: if is_live {
                NotificationKind::StreamLive
            } else {
                NotificationKind::StreamOffline
            },
            tenant_id: tenant_id.to_string(),
            broadcaster: broadcaster.username.clone(),
            title: if is_live { "Stream live" } else { "Stream offline" }.to_string(),
            body: stream_title.unwrap_or("").to_string(),
            payload: json!({"is_live": is_live, "title": stream_title}),
            ts: (self.clock)(),
        };

        let discord = async {
            log_outcome(
                "discord",
                tokio::time::timeout(NOTIFY_TIMEOUT, self.discord.publish(&notification)).await,
            );
        };
        let dashboard = async {
            log_outcome(
                "dashboard",
                tokio::time::timeout(NOTIFY_TIMEOUT, self.dashboard.publish(&notification)).await,
            );
        };
        let clips = async {
            log_outcome(
                "clip_buffer",
                tokio::time::timeout(
                    NOTIFY_TIMEOUT,
                    self.clip_buffer.stream_status_changed(is_live, stream_title),
                )
                .await,
            );
        };
        tokio::join!(discord, dashboard, clips);
    }

    /// Best-effort delivery to Discord and the dashboard feed.
    async fn notify(&self, notification: Notification) {
        log_outcome(
            "discord",
            tokio::time::timeout(NOTIFY_TIMEOUT, self.discord.publish(&notification)).await,
        );
        log_outcome(
            "dashboard",
            tokio::time::timeout(NOTIFY_TIMEOUT, self.dashboard.publish(&notification)).await,
        );
    }
}

fn log_outcome<E: std::fmt::Display>(
    sink: &'static str,
    outcome: Result<Result<(), E>, tokio::time::error::Elapsed>,
) {
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(_) => "timed out".to_string(),
    };
    counter!("notification_failures_total", "sink" => sink).increment(1);
    warn!(stage = "notify", sink, error = %failure, "notification delivery failed");
}

fn display_giftees(names: &[String]) -> String {
    if names.len() <= GIFTEE_DISPLAY_CAP {
        return names.join(", ");
    }
    let shown = names[..GIFTEE_DISPLAY_CAP].join(", ");
    format!("{shown} and {} more", names.len() - GIFTEE_DISPLAY_CAP)
}
