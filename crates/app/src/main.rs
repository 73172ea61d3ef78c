mod admin;
mod chat;
mod clock;
mod dispatch;
mod giveaway;
mod gtb;
mod maintenance;
mod problem;
mod raffle;
mod router;
mod signature;
mod sinks;
mod telemetry;
mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use url::Url;

use kick_bridge_kick::KickApiClient;
use kick_bridge_storage::Database;
use kick_bridge_util::{load_env_file, AppConfig};

use crate::chat::ChatCommandRouter;
use crate::dispatch::EventDispatcher;
use crate::giveaway::GiveawayEngine;
use crate::gtb::GtbEngine;
use crate::maintenance::RetentionWorker;
use crate::raffle::RaffleEngine;
use crate::sinks::{
    ChannelLookup, ChatSender, ClipBuffer, DiscordWebhookSink, HttpClipBuffer, KickChatSender,
    NotificationBus, NotificationSink, NullSink,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let verifier = signature::WebhookVerifier::from_config(&config)?;
    let clock = clock::system_clock();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let discord: Arc<dyn NotificationSink> = match &config.discord_webhook_url {
        Some(url) => Arc::new(DiscordWebhookSink::new(Url::parse(url)?, http.clone())),
        None => Arc::new(NullSink),
    };
    let clip_buffer: Arc<dyn ClipBuffer> = match &config.clip_buffer_url {
        Some(url) => Arc::new(HttpClipBuffer::new(Url::parse(url)?, http.clone())),
        None => Arc::new(NullSink),
    };
    let (chat_sender, channels): (Arc<dyn ChatSender>, Arc<dyn ChannelLookup>) =
        match &config.kick_bot_token {
            Some(token) => {
                let sender = Arc::new(KickChatSender::new(
                    KickApiClient::new(Url::parse(&config.kick_api_base_url)?, http),
                    token.clone(),
                ));
                (sender.clone(), sender)
            }
            None => (Arc::new(NullSink), Arc::new(NullSink)),
        };

    let dashboard = NotificationBus::new();
    let dispatcher = EventDispatcher::new(
        Arc::new(RaffleEngine::new(database.clone(), clock.clone())),
        discord,
        dashboard,
        clip_buffer,
        channels,
        clock.clone(),
    );
    let chat_router = Arc::new(ChatCommandRouter::new(
        Arc::new(GtbEngine::new(database.clone(), clock.clone())),
        Arc::new(GiveawayEngine::new(database.clone(), clock.clone())),
        chat_sender,
    ));

    RetentionWorker::new(database.clone()).spawn();

    let state = router::AppState::new(metrics, database, verifier, dispatcher, chat_router);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
