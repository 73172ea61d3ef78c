use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use kick_bridge_storage::Database;

use crate::admin;
use crate::chat::{self, ChatCommandRouter};
use crate::clock::{system_clock, Clock};
use crate::dispatch::EventDispatcher;
use crate::signature::WebhookVerifier;
use crate::telemetry::render_metrics;
use crate::webhook;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    metrics: PrometheusHandle,
    storage: Database,
    verifier: WebhookVerifier,
    dispatcher: EventDispatcher,
    chat: Arc<ChatCommandRouter>,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        verifier: WebhookVerifier,
        dispatcher: EventDispatcher,
        chat: Arc<ChatCommandRouter>,
    ) -> Self {
        Self::with_clock(metrics, storage, verifier, dispatcher, chat, system_clock())
    }

    pub fn with_clock(
        metrics: PrometheusHandle,
        storage: Database,
        verifier: WebhookVerifier,
        dispatcher: EventDispatcher,
        chat: Arc<ChatCommandRouter>,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                metrics,
                storage,
                verifier,
                dispatcher,
                chat,
                clock,
            }),
        }
    }

    pub fn storage(&self) -> &Database {
        &self.inner.storage
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.inner.verifier
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn chat(&self) -> &ChatCommandRouter {
        &self.inner.chat
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/kick", post(webhook::handle))
        .route(
            "/webhooks/kick/challenge",
            get(webhook::challenge).post(webhook::challenge),
        )
        .route("/webhooks/kick/test", get(webhook::test_probe))
        .route("/chat/message", post(chat::relay))
        .route("/admin/subscriptions", post(admin::register_subscription))
        .route(
            "/admin/subscriptions/revoke",
            post(admin::revoke_subscription),
        )
        .route("/admin/giveaways", post(admin::create_giveaway))
        .route("/admin/giveaways/draw", post(admin::draw_giveaway))
        .route("/admin/gtb/:session_id/winners", get(admin::gtb_winners))
        .route("/admin/raffle/draw", post(admin::draw_raffle))
        .route("/fair/roll", post(admin::fair_roll))
        .route("/fair/verify", post(admin::fair_verify))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = render_metrics(&state.inner.metrics);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use crate::giveaway::GiveawayEngine;
    use crate::gtb::GtbEngine;
    use crate::raffle::RaffleEngine;
    use crate::sinks::{NotificationBus, NullSink};
    use crate::telemetry::init_metrics;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use kick_bridge_util::config::Environment;
    use tower::ServiceExt;

    async fn test_state(name: &str) -> AppState {
        let db = Database::connect(&format!("sqlite:file:router_{name}?mode=memory&cache=shared"))
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        let clock = fixed_clock(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let verifier = WebhookVerifier::new(crate::signature::KICK_PUBLIC_KEY_PEM, Environment::Test)
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
        AppState::with_clock(
            init_metrics().expect("metrics"),
            db,
            verifier,
            dispatcher,
            chat,
            clock,
        )
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = app_router(test_state("healthz").await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_exposes_build_info() {
        let app = app_router(test_state("metrics").await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("app_build_info"));
        assert!(text.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn chat_relay_round_trips_a_command() {
        let app = app_router(test_state("chat_relay").await);
        let body = serde_json::json!({
            "tenant_id": "t-1",
            "broadcaster_user_id": 42,
            "sender_username": "modded",
            "is_moderator": true,
            "content": "!gtbopen",
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/chat/message")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["status"], "ok");
        assert!(value["reply"].as_str().expect("reply").contains("opened"));
    }
}
