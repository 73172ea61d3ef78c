//! Management endpoints used by the dashboard: giveaway lifecycle, the
//! raffle period draw and the provably-fair roll surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use kick_bridge_core::event;
use kick_bridge_core::fair::{self, FairProof, Verification};
use kick_bridge_core::types::EntryMethod;
use kick_bridge_storage::{NewSubscription, SubscriptionError};

use crate::giveaway::{GiveawayError, GiveawaySpec};
use crate::problem::ApiError;
use crate::router::AppState;

/// Body accepted when opening a giveaway.
#[derive(Debug, Deserialize)]
pub struct CreateGiveawayBody {
    pub tenant_id: String,
    pub title: String,
    pub entry_method: EntryMethod,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default = "default_messages_required")]
    pub messages_required: u32,
    #[serde(default = "default_time_window_minutes")]
    pub time_window_minutes: u32,
    #[serde(default)]
    pub allow_multiple_entries: bool,
    #[serde(default = "default_max_entries_per_user")]
    pub max_entries_per_user: u32,
}

fn default_messages_required() -> u32 {
    3
}

fn default_time_window_minutes() -> u32 {
    30
}

fn default_max_entries_per_user() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct TenantBody {
    pub tenant_id: String,
}

/// Creates a giveaway and activates it immediately.
pub async fn create_giveaway(
    State(state): State<AppState>,
    Json(body): Json<CreateGiveawayBody>,
) -> Result<Json<Value>, ApiError> {
    if body.entry_method == EntryMethod::Keyword && body.keyword.is_none() {
        return Err(ApiError::bad_request("keyword entry requires a keyword"));
    }

    let giveaways = state.chat().giveaways();
    let id = giveaways
        .create(
            &body.tenant_id,
            GiveawaySpec {
                title: &body.title,
                entry_method: body.entry_method,
                keyword: body.keyword.as_deref(),
                messages_required: body.messages_required,
                time_window_minutes: body.time_window_minutes,
                allow_multiple_entries: body.allow_multiple_entries,
                max_entries_per_user: body.max_entries_per_user,
            },
        )
        .await
        .map_err(store_error)?;
    giveaways.activate(id).await.map_err(store_error)?;
    let giveaway = state
        .storage()
        .giveaways()
        .fetch(id)
        .await
        .map_err(|err| store_error(err.into()))?;
    Ok(Json(json!({"status": "ok", "giveaway_id": id, "giveaway": giveaway})))
}

/// Draws and announces the active giveaway's winner. A giveaway with no
/// entries stays active and reports a null winner.
pub async fn draw_giveaway(
    State(state): State<AppState>,
    Json(body): Json<TenantBody>,
) -> Result<Json<Value>, ApiError> {
    let giveaways = state.chat().giveaways();
    if giveaways
        .active(&body.tenant_id)
        .await
        .map_err(store_error)?
        .is_none()
    {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "no active giveaway"));
    }
    let winner = giveaways
        .draw_winner(&body.tenant_id)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({"status": "ok", "winner": winner})))
}

/// Returns a completed session's podium for the dashboard.
pub async fn gtb_winners(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .storage()
        .gtb()
        .fetch(session_id)
        .await
        .map_err(|err| {
            warn!(stage = "admin", error = %err, "session lookup failed");
            ApiError::internal("session lookup failed")
        })?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no such session"))?;
    let winners = state
        .storage()
        .gtb()
        .winners(session_id)
        .await
        .map_err(|err| {
            warn!(stage = "admin", error = %err, "winner lookup failed");
            ApiError::internal("winner lookup failed")
        })?;
    Ok(Json(json!({"status": "ok", "session": session, "winners": winners})))
}

/// Draws the raffle period winner and publishes the fairness proof.
pub async fn draw_raffle(
    State(state): State<AppState>,
    Json(body): Json<TenantBody>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .dispatcher()
        .raffles()
        .draw_winner(&body.tenant_id)
        .await
        .map_err(|err| {
            warn!(stage = "admin", error = %err, "raffle draw failed");
            ApiError::internal("raffle draw failed")
        })?;

    let Some(result) = result else {
        return Ok(Json(json!({"status": "ok", "winner": Value::Null})));
    };
    Ok(Json(json!({
        "status": "ok",
        "winner": result.winner,
        "period_id": result.period_id,
        "proof": {
            "server_seed": result.draw.server_seed,
            "client_seed": result.draw.client_seed,
            "nonce": result.draw.nonce,
            "hash": result.draw.proof_hash,
            "winning_ticket": result.draw.winning_ticket,
            "total_tickets": result.draw.total_tickets,
        },
    })))
}

/// Body accepted when registering a webhook subscription.
#[derive(Debug, Deserialize)]
pub struct RegisterSubscriptionBody {
    pub subscription_id: String,
    pub tenant_id: String,
    pub broadcaster_id: String,
    pub broadcaster_username: String,
    pub event_type: String,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Records a subscription so its deliveries resolve and dispatch.
pub async fn register_subscription(
    State(state): State<AppState>,
    Json(body): Json<RegisterSubscriptionBody>,
) -> Result<Json<Value>, ApiError> {
    if !event::is_known_event_type(&body.event_type) {
        return Err(ApiError::bad_request("unrecognized event type"));
    }
    state
        .storage()
        .subscriptions()
        .insert(NewSubscription {
            subscription_id: &body.subscription_id,
            tenant_id: &body.tenant_id,
            broadcaster_id: &body.broadcaster_id,
            broadcaster_username: &body.broadcaster_username,
            event_type: &body.event_type,
            secret: body.secret.as_deref(),
            created_at: state.now(),
        })
        .await
        .map_err(|err| match err {
            SubscriptionError::ActiveExists => ApiError::new(
                StatusCode::CONFLICT,
                "an active subscription already exists for this broadcaster and event type",
            ),
            other => {
                warn!(stage = "admin", error = %other, "subscription insert failed");
                ApiError::internal("subscription registration failed")
            }
        })?;
    Ok(Json(json!({"status": "ok", "subscription_id": body.subscription_id})))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionIdBody {
    pub subscription_id: String,
}

/// Revokes a subscription; its future deliveries are ACKed but ignored.
pub async fn revoke_subscription(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionIdBody>,
) -> Result<Json<Value>, ApiError> {
    let revoked = state
        .storage()
        .subscriptions()
        .deactivate(&body.subscription_id, state.now())
        .await
        .map_err(|err| {
            warn!(stage = "admin", error = %err, "subscription revoke failed");
            ApiError::internal("subscription revoke failed")
        })?;
    if !revoked {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no active subscription with that id",
        ));
    }
    Ok(Json(json!({"status": "ok"})))
}

/// Body accepted when requesting a provably-fair roll.
#[derive(Debug, Deserialize)]
pub struct FairRollBody {
    pub username: String,
    pub request_id: String,
    pub context: String,
    pub win_chance: f64,
}

/// Rolls with a fresh server seed and returns the full proof.
pub async fn fair_roll(Json(body): Json<FairRollBody>) -> Result<Json<Value>, ApiError> {
    if !(0.0..=100.0).contains(&body.win_chance) {
        return Err(ApiError::bad_request("win_chance must be between 0 and 100"));
    }
    let proof = fair::generate(&body.username, &body.request_id, &body.context, body.win_chance);
    Ok(Json(json!({"status": "ok", "proof": proof})))
}

/// Recomputes a published proof so anyone can audit an outcome.
pub async fn fair_verify(Json(proof): Json<FairProof>) -> Json<Value> {
    let verdict = fair::verify(&proof);
    let label = match verdict {
        Verification::Valid => "valid",
        Verification::HashMismatch => "hash_mismatch",
        Verification::ValueMismatch => "value_mismatch",
    };
    Json(json!({"status": "ok", "valid": verdict.is_valid(), "verdict": label}))
}

fn store_error(err: GiveawayError) -> ApiError {
    match err {
        GiveawayError::Storage(kick_bridge_storage::GiveawayStoreError::AlreadyActive) => {
            ApiError::new(StatusCode::CONFLICT, "an active giveaway already exists")
        }
        GiveawayError::Storage(kick_bridge_storage::GiveawayStoreError::NotFound) => {
            ApiError::new(StatusCode::NOT_FOUND, "giveaway not found")
        }
        other => {
            warn!(stage = "admin", error = %other, "giveaway operation failed");
            ApiError::internal("giveaway operation failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatCommandRouter;
    use crate::clock::fixed_clock;
    use crate::dispatch::EventDispatcher;
    use crate::giveaway::GiveawayEngine;
    use crate::gtb::GtbEngine;
    use crate::raffle::RaffleEngine;
    use crate::router::app_router;
    use crate::signature::WebhookVerifier;
    use crate::sinks::{NotificationBus, NullSink};
    use crate::telemetry::init_metrics;
    use axum::http::header;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use kick_bridge_storage::Database;
    use kick_bridge_util::config::Environment;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state(name: &str) -> (AppState, Database) {
        let db = Database::connect(&format!("sqlite:file:admin_{name}?mode=memory&cache=shared"))
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        let clock = fixed_clock(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let verifier =
            WebhookVerifier::new(crate::signature::KICK_PUBLIC_KEY_PEM, Environment::Test)
                .expect("verifier");
        let dispatcher = EventDispatcher::new(
            Arc::new(RaffleEngine::new(db.clone(), clock.clone())),
            Arc::new(NullSink),
            NotificationBus::new(),
            Arc::new(NullSink),
            Arc::new(NullSink),
            clock.clone(),
        );
        let chat = Arc::new(ChatCommandRouter::new(
            Arc::new(GtbEngine::new(db.clone(), clock.clone())),
            Arc::new(GiveawayEngine::new(db.clone(), clock.clone())),
            Arc::new(NullSink),
        ));
        let state = AppState::with_clock(
            init_metrics().expect("metrics"),
            db.clone(),
            verifier,
            dispatcher,
            chat,
            clock,
        );
        (state, db)
    }

    async fn post_json(
        app: axum::Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn subscription_registers_and_revokes() {
        let (state, db) = test_state("subs").await;
        let body = json!({
            "subscription_id": "sub-9",
            "tenant_id": "t-1",
            "broadcaster_id": "b-1",
            "broadcaster_username": "streamer",
            "event_type": "channel.followed",
            "secret": "shh",
        });

        let (status, _) =
            post_json(app_router(state.clone()), "/admin/subscriptions", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let stored = db
            .subscriptions()
            .fetch("sub-9")
            .await
            .expect("fetch")
            .expect("present");
        assert!(stored.is_active());
        assert_eq!(stored.secret.as_deref(), Some("shh"));

        // Same broadcaster and event type cannot register twice while active.
        let (status, _) = post_json(app_router(state.clone()), "/admin/subscriptions", body).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post_json(
            app_router(state.clone()),
            "/admin/subscriptions/revoke",
            json!({"subscription_id": "sub-9"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post_json(
            app_router(state),
            "/admin/subscriptions/revoke",
            json!({"subscription_id": "sub-9"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unrecognized_event_type_is_rejected() {
        let (state, _db) = test_state("badevent").await;
        let (status, _) = post_json(
            app_router(state),
            "/admin/subscriptions",
            json!({
                "subscription_id": "sub-1",
                "tenant_id": "t-1",
                "broadcaster_id": "b-1",
                "broadcaster_username": "streamer",
                "event_type": "channel.points.redeemed",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn giveaway_runs_end_to_end_over_http() {
        let (state, _db) = test_state("giveaway").await;

        let (status, created) = post_json(
            app_router(state.clone()),
            "/admin/giveaways",
            json!({
                "tenant_id": "t-1",
                "title": "Sub gift drop",
                "entry_method": "keyword",
                "keyword": "!enter",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(created["giveaway_id"].is_i64());

        // A keyword match through the chat router becomes an entry.
        state
            .chat()
            .giveaways()
            .handle_chat_message("t-1", "viewer", "!enter")
            .await
            .expect("entry");

        let (status, drawn) = post_json(
            app_router(state.clone()),
            "/admin/giveaways/draw",
            json!({"tenant_id": "t-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(drawn["winner"], "viewer");
    }

    #[tokio::test]
    async fn drawing_without_an_active_giveaway_is_not_found() {
        let (state, _db) = test_state("nodraw").await;
        let (status, _) = post_json(
            app_router(state),
            "/admin/giveaways/draw",
            json!({"tenant_id": "t-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn second_active_giveaway_is_a_conflict() {
        let (state, _db) = test_state("conflict").await;
        let body = json!({
            "tenant_id": "t-1",
            "title": "First",
            "entry_method": "keyword",
            "keyword": "!go",
        });

        let (status, _) = post_json(app_router(state.clone()), "/admin/giveaways", body.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, error) = post_json(app_router(state), "/admin/giveaways", body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(error["error"]
            .as_str()
            .expect("message")
            .contains("already exists"));
    }

    #[tokio::test]
    async fn keyword_giveaway_without_keyword_is_rejected() {
        let (state, _db) = test_state("nokeyword").await;
        let (status, _) = post_json(
            app_router(state),
            "/admin/giveaways",
            json!({
                "tenant_id": "t-1",
                "title": "Broken",
                "entry_method": "keyword",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn raffle_draw_publishes_the_proof() {
        let (state, _db) = test_state("raffle").await;
        state
            .dispatcher()
            .raffles()
            .award_gift_tickets("t-1", "msg-1", &["alice".to_string(), "bob".to_string()])
            .await
            .expect("award");

        let (status, drawn) = post_json(
            app_router(state),
            "/admin/raffle/draw",
            json!({"tenant_id": "t-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let winner = drawn["winner"].as_str().expect("winner");
        assert!(winner == "alice" || winner == "bob");
        assert_eq!(drawn["proof"]["total_tickets"], 2);
        assert_eq!(drawn["proof"]["hash"].as_str().expect("hash").len(), 64);
    }

    #[tokio::test]
    async fn completed_session_winners_are_served() {
        let (state, db) = test_state("winners").await;
        let clock = fixed_clock(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let gtb = GtbEngine::new(db, clock);
        gtb.open_session("t-1", "admin").await.expect("open");
        gtb.submit_guess("t-1", "alice", 1000.0).await.expect("guess");
        gtb.close_session("t-1").await.expect("close");
        gtb.set_result("t-1", None, 1100.0).await.expect("result");

        let response = app_router(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/gtb/1/winners")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["session"]["status"], "completed");
        assert_eq!(value["winners"][0]["kick_username"], "alice");
        assert_eq!(value["winners"][0]["rank"], 1);
    }

    #[tokio::test]
    async fn fair_roll_round_trips_through_verify() {
        let (state, _db) = test_state("fair").await;
        let (status, rolled) = post_json(
            app_router(state.clone()),
            "/fair/roll",
            json!({
                "username": "viewer",
                "request_id": "req-1",
                "context": "duel",
                "win_chance": 49.5,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rolled["proof"]["win_chance"], 49.5);

        let (status, verified) =
            post_json(app_router(state.clone()), "/fair/verify", rolled["proof"].clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified["valid"], true);

        // A doctored hash no longer verifies.
        let mut tampered = rolled["proof"].clone();
        tampered["proof_hash"] = json!("0".repeat(64));
        let (_, verified) = post_json(app_router(state), "/fair/verify", tampered).await;
        assert_eq!(verified["valid"], false);
        assert_eq!(verified["verdict"], "hash_mismatch");
    }

    #[tokio::test]
    async fn out_of_range_win_chance_is_rejected() {
        let (state, _db) = test_state("chance").await;
        let (status, _) = post_json(
            app_router(state),
            "/fair/roll",
            json!({
                "username": "viewer",
                "request_id": "req-1",
                "context": "duel",
                "win_chance": 150.0,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn raffle_draw_with_no_tickets_reports_no_winner() {
        let (state, _db) = test_state("empty").await;
        let (status, drawn) = post_json(
            app_router(state),
            "/admin/raffle/draw",
            json!({"tenant_id": "t-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(drawn["winner"].is_null());
    }
}
