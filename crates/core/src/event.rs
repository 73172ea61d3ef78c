use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type labels as they appear in the `Kick-Event-Type` header.
pub const CHAT_MESSAGE_SENT: &str = "chat.message.sent";
pub const CHANNEL_FOLLOWED: &str = "channel.followed";
pub const SUBSCRIPTION_NEW: &str = "channel.subscription.new";
pub const SUBSCRIPTION_RENEWAL: &str = "channel.subscription.renewal";
pub const SUBSCRIPTION_GIFTS: &str = "channel.subscription.gifts";
pub const LIVESTREAM_STATUS_UPDATED: &str = "livestream.status.updated";
pub const MODERATION_BANNED: &str = "moderation.banned";
pub const KICKS_GIFTED: &str = "kicks.gifted";

/// All event types the pipeline decodes into a typed variant.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    CHAT_MESSAGE_SENT,
    CHANNEL_FOLLOWED,
    SUBSCRIPTION_NEW,
    SUBSCRIPTION_RENEWAL,
    SUBSCRIPTION_GIFTS,
    LIVESTREAM_STATUS_UPDATED,
    MODERATION_BANNED,
    KICKS_GIFTED,
];

pub fn is_known_event_type(event_type: &str) -> bool {
    KNOWN_EVENT_TYPES.contains(&event_type)
}

/// A Kick user reference as carried in webhook payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickUser {
    #[serde(default)]
    pub user_id: Option<i64>,
    pub username: String,
}

/// A decoded webhook event.
///
/// The set of variants is closed on purpose: dispatch matches exhaustively,
/// and anything Kick ships that we do not model lands in [`KickEvent::Unknown`]
/// with the raw payload preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KickEvent {
    ChatMessageSent {
        broadcaster: KickUser,
        sender: KickUser,
        message_id: String,
        content: String,
    },
    ChannelFollowed {
        broadcaster: KickUser,
        follower: KickUser,
    },
    SubscriptionNew {
        broadcaster: KickUser,
        subscriber: KickUser,
        duration_months: u32,
        created_at: Option<DateTime<Utc>>,
    },
    SubscriptionRenewal {
        broadcaster: KickUser,
        subscriber: KickUser,
        duration_months: u32,
        created_at: Option<DateTime<Utc>>,
    },
    SubscriptionGifts {
        broadcaster: KickUser,
        /// `None` for anonymous gifts.
        gifter: Option<KickUser>,
        giftees: Vec<KickUser>,
        created_at: Option<DateTime<Utc>>,
    },
    LivestreamStatusUpdated {
        broadcaster: KickUser,
        is_live: bool,
        stream_title: Option<String>,
        started_at: Option<DateTime<Utc>>,
    },
    ModerationBanned {
        broadcaster: KickUser,
        moderator: KickUser,
        banned_user: KickUser,
        reason: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    KicksGifted {
        broadcaster: KickUser,
        sender: KickUser,
        amount: f64,
        kick_count: u64,
        message: Option<String>,
    },
    Unknown {
        event_type: String,
        payload: Value,
    },
}

impl KickEvent {
    /// Returns the wire label for the event, used in logs and metrics.
    pub fn event_type(&self) -> &str {
        match self {
            Self::ChatMessageSent { .. } => CHAT_MESSAGE_SENT,
            Self::ChannelFollowed { .. } => CHANNEL_FOLLOWED,
            Self::SubscriptionNew { .. } => SUBSCRIPTION_NEW,
            Self::SubscriptionRenewal { .. } => SUBSCRIPTION_RENEWAL,
            Self::SubscriptionGifts { .. } => SUBSCRIPTION_GIFTS,
            Self::LivestreamStatusUpdated { .. } => LIVESTREAM_STATUS_UPDATED,
            Self::ModerationBanned { .. } => MODERATION_BANNED,
            Self::KicksGifted { .. } => KICKS_GIFTED,
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    /// The broadcaster the event belongs to, when the payload carries one.
    pub fn broadcaster(&self) -> Option<&KickUser> {
        match self {
            Self::ChatMessageSent { broadcaster, .. }
            | Self::ChannelFollowed { broadcaster, .. }
            | Self::SubscriptionNew { broadcaster, .. }
            | Self::SubscriptionRenewal { broadcaster, .. }
            | Self::SubscriptionGifts { broadcaster, .. }
            | Self::LivestreamStatusUpdated { broadcaster, .. }
            | Self::ModerationBanned { broadcaster, .. }
            | Self::KicksGifted { broadcaster, .. } => Some(broadcaster),
            Self::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_types_are_recognized() {
        for label in KNOWN_EVENT_TYPES {
            assert!(is_known_event_type(label));
        }
        assert!(!is_known_event_type("channel.points.redeemed"));
    }

    #[test]
    fn unknown_events_keep_their_wire_label() {
        let event = KickEvent::Unknown {
            event_type: "channel.raid".to_string(),
            payload: serde_json::json!({"visitors": 12}),
        };
        assert_eq!(event.event_type(), "channel.raid");
        assert!(event.broadcaster().is_none());
    }
}
