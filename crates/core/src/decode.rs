//! Payload decoding for verified webhook bodies.
//!
//! Decoding happens after signature verification and deduplication, so a
//! payload that fails here is recorded as consumed and never retried.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::event::{self, KickEvent, KickUser};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload does not match the {event_type} shape: {source}")]
    Shape {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct ChatMessagePayload {
    broadcaster: KickUser,
    sender: KickUser,
    message_id: String,
    content: String,
}

#[derive(Deserialize)]
struct FollowPayload {
    broadcaster: KickUser,
    follower: KickUser,
}

#[derive(Deserialize)]
struct SubscriptionPayload {
    broadcaster: KickUser,
    subscriber: KickUser,
    #[serde(default = "default_duration")]
    duration: u32,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

fn default_duration() -> u32 {
    1
}

#[derive(Deserialize)]
struct GiftsPayload {
    broadcaster: KickUser,
    #[serde(default)]
    gifter: Option<KickUser>,
    #[serde(default)]
    giftees: Vec<KickUser>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct LivestreamBlock {
    #[serde(default)]
    session_title: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct LivestreamStatusPayload {
    broadcaster: KickUser,
    #[serde(default)]
    is_live: bool,
    #[serde(default)]
    livestream: Option<LivestreamBlock>,
    // Flat variants of the same fields, seen on newer payloads.
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct BanMetadata {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct BanPayload {
    broadcaster: KickUser,
    moderator: KickUser,
    banned_user: KickUser,
    #[serde(default)]
    metadata: Option<BanMetadata>,
}

#[derive(Deserialize)]
struct KicksGiftedPayload {
    broadcaster: KickUser,
    sender: KickUser,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    kick_count: u64,
    #[serde(default)]
    message: Option<String>,
}

fn shaped<T: serde::de::DeserializeOwned>(
    event_type: &'static str,
    payload: &Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload.clone()).map_err(|source| DecodeError::Shape {
        event_type,
        source,
    })
}

/// Decodes a raw payload into a typed [`KickEvent`].
///
/// Unrecognized event types are not an error; they decode to
/// [`KickEvent::Unknown`] so the dispatcher can count and skip them.
pub fn decode_event(event_type: &str, payload: &Value) -> Result<KickEvent, DecodeError> {
    if !payload.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let event = match event_type {
        event::CHAT_MESSAGE_SENT => {
            let p: ChatMessagePayload = shaped(event::CHAT_MESSAGE_SENT, payload)?;
            KickEvent::ChatMessageSent {
                broadcaster: p.broadcaster,
                sender: p.sender,
                message_id: p.message_id,
                content: p.content,
            }
        }
        event::CHANNEL_FOLLOWED => {
            let p: FollowPayload = shaped(event::CHANNEL_FOLLOWED, payload)?;
            KickEvent::ChannelFollowed {
                broadcaster: p.broadcaster,
                follower: p.follower,
            }
        }
        event::SUBSCRIPTION_NEW => {
            let p: SubscriptionPayload = shaped(event::SUBSCRIPTION_NEW, payload)?;
            KickEvent::SubscriptionNew {
                broadcaster: p.broadcaster,
                subscriber: p.subscriber,
                duration_months: p.duration,
                created_at: p.created_at,
            }
        }
        event::SUBSCRIPTION_RENEWAL => {
            let p: SubscriptionPayload = shaped(event::SUBSCRIPTION_RENEWAL, payload)?;
            KickEvent::SubscriptionRenewal {
                broadcaster: p.broadcaster,
                subscriber: p.subscriber,
                duration_months: p.duration,
                created_at: p.created_at,
            }
        }
        event::SUBSCRIPTION_GIFTS => {
            let p: GiftsPayload = shaped(event::SUBSCRIPTION_GIFTS, payload)?;
            KickEvent::SubscriptionGifts {
                broadcaster: p.broadcaster,
                gifter: p.gifter,
                giftees: p.giftees,
                created_at: p.created_at,
            }
        }
        event::LIVESTREAM_STATUS_UPDATED => {
            let p: LivestreamStatusPayload = shaped(event::LIVESTREAM_STATUS_UPDATED, payload)?;
            let (nested_title, nested_start) = p
                .livestream
                .map(|l| (l.session_title, l.created_at))
                .unwrap_or((None, None));
            KickEvent::LivestreamStatusUpdated {
                broadcaster: p.broadcaster,
                is_live: p.is_live,
                stream_title: nested_title.or(p.title),
                started_at: nested_start.or(p.started_at),
            }
        }
        event::MODERATION_BANNED => {
            let p: BanPayload = shaped(event::MODERATION_BANNED, payload)?;
            let metadata = p.metadata.unwrap_or_default();
            KickEvent::ModerationBanned {
                broadcaster: p.broadcaster,
                moderator: p.moderator,
                banned_user: p.banned_user,
                reason: metadata.reason,
                expires_at: metadata.expires_at,
            }
        }
        event::KICKS_GIFTED => {
            let p: KicksGiftedPayload = shaped(event::KICKS_GIFTED, payload)?;
            KickEvent::KicksGifted {
                broadcaster: p.broadcaster,
                sender: p.sender,
                amount: p.amount,
                kick_count: p.kick_count,
                message: p.message,
            }
        }
        other => KickEvent::Unknown {
            event_type: other.to_string(),
            payload: payload.clone(),
        },
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_chat_message() {
        let payload = json!({
            "message_id": "msg-1",
            "broadcaster": {"user_id": 7, "username": "streamer"},
            "sender": {"user_id": 42, "username": "viewer"},
            "content": "!gtb 1500"
        });
        let event = decode_event(event::CHAT_MESSAGE_SENT, &payload).unwrap();
        match event {
            KickEvent::ChatMessageSent {
                sender, content, ..
            } => {
                assert_eq!(sender.username, "viewer");
                assert_eq!(content, "!gtb 1500");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_anonymous_gift_batch() {
        let payload = json!({
            "broadcaster": {"user_id": 7, "username": "streamer"},
            "gifter": null,
            "giftees": [
                {"user_id": 1, "username": "a"},
                {"user_id": 2, "username": "b"},
                {"user_id": 3, "username": "c"}
            ]
        });
        let event = decode_event(event::SUBSCRIPTION_GIFTS, &payload).unwrap();
        match event {
            KickEvent::SubscriptionGifts {
                gifter, giftees, ..
            } => {
                assert!(gifter.is_none());
                assert_eq!(giftees.len(), 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_livestream_title_from_nested_block() {
        let payload = json!({
            "broadcaster": {"user_id": 7, "username": "streamer"},
            "is_live": true,
            "livestream": {"id": 99, "session_title": "degen hours"}
        });
        let event = decode_event(event::LIVESTREAM_STATUS_UPDATED, &payload).unwrap();
        match event {
            KickEvent::LivestreamStatusUpdated {
                is_live,
                stream_title,
                ..
            } => {
                assert!(is_live);
                assert_eq!(stream_title.as_deref(), Some("degen hours"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_preserved_not_rejected() {
        let payload = json!({"anything": true});
        let event = decode_event("channel.raid", &payload).unwrap();
        match event {
            KickEvent::Unknown { event_type, payload } => {
                assert_eq!(event_type, "channel.raid");
                assert_eq!(payload["anything"], json!(true));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_a_shape_error() {
        let payload = json!({
            "broadcaster": {"user_id": 7, "username": "streamer"}
        });
        let err = decode_event(event::CHANNEL_FOLLOWED, &payload).unwrap_err();
        assert!(matches!(err, DecodeError::Shape { .. }));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = decode_event(event::CHANNEL_FOLLOWED, &json!("nope")).unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject));
    }
}
