//! Inbound Kick webhook pipeline.
//!
//! Stage order is fixed: signature, early event-type filter, subscription
//! resolution, dedup claim, decode, dispatch. Duplicates and unknown
//! subscriptions are acknowledged with 200 so the platform stops resending.

use std::collections::HashMap;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{info, warn};

use kick_bridge_core::decode::decode_event;
use kick_bridge_core::event::CHAT_MESSAGE_SENT;
use kick_bridge_storage::{ClaimOutcome, WebhookSubscription};

use crate::problem::ApiError;
use crate::router::AppState;
use crate::signature::is_simulated_signature;

const HEADER_EVENT_TYPE: &str = "Kick-Event-Type";
const HEADER_MESSAGE_ID: &str = "Kick-Event-Message-Id";
const HEADER_TIMESTAMP: &str = "Kick-Event-Message-Timestamp";
const HEADER_SUBSCRIPTION_ID: &str = "Kick-Event-Subscription-Id";
const HEADER_SIGNATURE: &str = "Kick-Event-Signature";

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let start = Instant::now();

    let event_type = required_header(&headers, HEADER_EVENT_TYPE)?.to_string();
    let message_id = required_header(&headers, HEADER_MESSAGE_ID)?.to_string();
    let timestamp = required_header(&headers, HEADER_TIMESTAMP)?.to_string();
    let subscription_id = required_header(&headers, HEADER_SUBSCRIPTION_ID)?.to_string();
    let signature = required_header(&headers, HEADER_SIGNATURE)?.to_string();

    // The simulated trust domain is keyed per subscription, so its secret
    // has to be in hand before verification.
    let mut subscription: Option<WebhookSubscription> = None;
    let mut secret: Option<String> = None;
    if is_simulated_signature(&signature) {
        let found = fetch_subscription(&state, &subscription_id).await?;
        match found {
            Some(sub) => {
                secret = sub.secret.clone();
                subscription = Some(sub);
            }
            None => {
                counter!("webhook_invalid_signature_total", "type" => event_type.clone())
                    .increment(1);
                return Err(ApiError::unauthorized(
                    "simulated delivery for unknown subscription",
                ));
            }
        }
    }

    if let Err(err) = state.verifier().verify(
        &message_id,
        &timestamp,
        &body,
        &signature,
        secret.as_deref(),
    ) {
        warn!(stage = "ingress", %message_id, error = %err, "signature rejected");
        counter!("webhook_invalid_signature_total", "type" => event_type.clone()).increment(1);
        record_latency(start, &event_type);
        return Err(ApiError::unauthorized("invalid signature"));
    }

    counter!("webhook_ingress_total", "type" => event_type.clone()).increment(1);

    // Chat rides its own realtime transport; the webhook copy is acked
    // before it can touch the marker table.
    if event_type == CHAT_MESSAGE_SENT {
        record_latency(start, &event_type);
        return Ok(ok_body(json!({"status": "ok", "message": "ignored"})));
    }

    let subscription = match subscription {
        Some(sub) => Some(sub),
        None => fetch_subscription(&state, &subscription_id).await?,
    };
    let Some(subscription) = subscription.filter(WebhookSubscription::is_active) else {
        info!(stage = "resolve", %subscription_id, "unknown subscription acked");
        counter!("webhook_unknown_subscription_total").increment(1);
        record_latency(start, &event_type);
        return Ok(ok_body(json!({"status": "ok", "message": "unknown subscription"})));
    };
    let broadcaster_id = subscription.broadcaster_id.clone();

    // The marker insert is the only concurrency guard; a failure to even
    // check is deliberately fail-open (a duplicate notification beats a
    // dropped event).
    let mut claimed = false;
    match state
        .storage()
        .processed_messages()
        .claim(&message_id, &broadcaster_id, &event_type, state.now())
        .await
    {
        Ok(ClaimOutcome::Claimed) => claimed = true,
        Ok(ClaimOutcome::Duplicate) => {
            counter!("webhook_duplicate_total", "type" => event_type.clone()).increment(1);
            record_latency(start, &event_type);
            return Ok(ok_body(json!({"status": "ok", "message": "duplicate"})));
        }
        Err(err) => {
            warn!(stage = "dedup", %message_id, error = %err, "dedup check failed, processing anyway");
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            // A poison payload will never parse; complete the marker so
            // retries stop burning cycles on it.
            if claimed {
                complete_marker(&state, &message_id, &broadcaster_id).await;
            }
            record_latency(start, &event_type);
            return Err(ApiError::bad_request(format!("invalid JSON payload: {err}")));
        }
    };

    let event = match decode_event(&event_type, &payload) {
        Ok(event) => event,
        Err(err) => {
            if claimed {
                complete_marker(&state, &message_id, &broadcaster_id).await;
            }
            record_latency(start, &event_type);
            return Err(ApiError::bad_request(format!("malformed event payload: {err}")));
        }
    };

    // A payload naming a different broadcaster than the subscription it
    // arrived on is suspicious but still handled; the subscription wins.
    if let Some(broadcaster) = event.broadcaster() {
        if let Some(user_id) = broadcaster.user_id {
            if user_id.to_string() != broadcaster_id {
                warn!(
                    stage = "resolve",
                    %message_id,
                    payload_broadcaster = user_id,
                    subscription_broadcaster = %broadcaster_id,
                    "payload broadcaster differs from subscription"
                );
            }
        }
    }

    if let Err(err) = state.dispatcher().dispatch(&subscription, &message_id, &event).await {
        warn!(stage = "dispatch", %message_id, error = %err, "handler failed, releasing claim");
        counter!("dispatch_failures_total", "type" => event_type.clone()).increment(1);
        if claimed {
            if let Err(release_err) = state
                .storage()
                .processed_messages()
                .release(&message_id, &broadcaster_id)
                .await
            {
                warn!(stage = "dispatch", %message_id, error = %release_err, "claim release failed");
            }
        }
        record_latency(start, &event_type);
        return Err(ApiError::internal("event handler failed"));
    }

    if claimed {
        complete_marker(&state, &message_id, &broadcaster_id).await;
    }
    info!(stage = "dispatch", %message_id, event_type = event.event_type(), "delivery handled");
    record_latency(start, &event_type);
    Ok(ok_body(json!({"status": "ok", "message_id": message_id})))
}

/// Webhook registration handshake: echo the challenge as plain text when
/// one is supplied by query parameter or JSON body.
pub async fn challenge(Query(params): Query<HashMap<String, String>>, body: Bytes) -> Response {
    let challenge = params.get("challenge").cloned().or_else(|| {
        serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("challenge").and_then(Value::as_str).map(str::to_string))
    });

    match challenge {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        None => Json(json!({"status": "ready"})).into_response(),
    }
}

/// Reachability probe used when registering the endpoint.
pub async fn test_probe() -> Json<Value> {
    Json(json!({"status": "ok", "message": "webhook endpoint reachable"}))
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::unauthorized(format!("missing required header {name}")))
}

async fn fetch_subscription(
    state: &AppState,
    subscription_id: &str,
) -> Result<Option<WebhookSubscription>, ApiError> {
    state
        .storage()
        .subscriptions()
        .fetch(subscription_id)
        .await
        .map_err(|err| {
            warn!(stage = "resolve", %subscription_id, error = %err, "subscription lookup failed");
            ApiError::internal("subscription lookup failed")
        })
}

async fn complete_marker(state: &AppState, message_id: &str, broadcaster_id: &str) {
    if let Err(err) = state
        .storage()
        .processed_messages()
        .mark_completed(message_id, broadcaster_id, state.now())
        .await
    {
        warn!(stage = "dedup", %message_id, error = %err, "marker completion failed");
    }
}

fn record_latency(start: Instant, event_type: &str) {
    histogram!("webhook_ack_latency_seconds", "type" => event_type.to_string())
        .record(start.elapsed().as_secs_f64());
}

fn ok_body(value: Value) -> Response {
    Json(value).into_response()
}
