//! Entry point for the realtime chat transport. Routes recognized commands
//! to the engines and feeds plain chatter into the active giveaway.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use kick_bridge_core::command::ChatCommand;

use crate::giveaway::{ChatOutcome, GiveawayEngine, GiveawayError};
use crate::gtb::{GtbEngine, GtbError};
use crate::problem::ApiError;
use crate::router::AppState;
use crate::sinks::ChatSender;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Gtb(#[from] GtbError),
    #[error(transparent)]
    Giveaway(#[from] GiveawayError),
}

/// An inbound chat message as delivered by the realtime transport.
pub struct InboundChatMessage<'a> {
    pub tenant_id: &'a str,
    pub broadcaster_user_id: i64,
    pub sender_username: &'a str,
    pub is_moderator: bool,
    pub content: &'a str,
}

pub struct ChatCommandRouter {
    gtb: Arc<GtbEngine>,
    giveaways: Arc<GiveawayEngine>,
    chat: Arc<dyn ChatSender>,
}

impl ChatCommandRouter {
    pub fn new(
        gtb: Arc<GtbEngine>,
        giveaways: Arc<GiveawayEngine>,
        chat: Arc<dyn ChatSender>,
    ) -> Self {
        Self { gtb, giveaways, chat }
    }

    pub fn giveaways(&self) -> &GiveawayEngine {
        &self.giveaways
    }

    /// Handles one chat message, returning the reply posted to chat, if any.
    ///
    /// Session administration commands require moderator status; ordinary
    /// viewers get no reply for them. Non-command messages are offered to
    /// the giveaway engine as potential entries.
    pub async fn handle_message(
        &self,
        message: InboundChatMessage<'_>,
    ) -> Result<Option<String>, ChatError> {
        let reply = match ChatCommand::parse(message.content) {
            Some(ChatCommand::Guess { amount }) => Some(
                self.gtb
                    .submit_guess(message.tenant_id, message.sender_username, amount)
                    .await?,
            ),
            Some(ChatCommand::OpenSession) => {
                if !message.is_moderator {
                    debug!(
                        stage = "chat",
                        sender = message.sender_username,
                        "ignoring admin command from non-moderator"
                    );
                    return Ok(None);
                }
                Some(
                    self.gtb
                        .open_session(message.tenant_id, message.sender_username)
                        .await?,
                )
            }
            Some(ChatCommand::CloseSession) => {
                if !message.is_moderator {
                    return Ok(None);
                }
                Some(self.gtb.close_session(message.tenant_id).await?)
            }
            Some(ChatCommand::SetResult { session_id, amount }) => {
                if !message.is_moderator {
                    return Ok(None);
                }
                Some(
                    self.gtb
                        .set_result(message.tenant_id, session_id, amount)
                        .await?,
                )
            }
            None => {
                let outcome = self
                    .giveaways
                    .handle_chat_message(
                        message.tenant_id,
                        message.sender_username,
                        message.content,
                    )
                    .await?;
                match outcome {
                    ChatOutcome::Entered { entry_count: 1 } => Some(format!(
                        "@{} you're in the giveaway!",
                        message.sender_username
                    )),
                    ChatOutcome::Entered { entry_count } => Some(format!(
                        "@{} giveaway entries: {entry_count}",
                        message.sender_username
                    )),
                    ChatOutcome::None => None,
                }
            }
        };

        if let Some(text) = &reply {
            if let Err(err) = self.chat.send(message.broadcaster_user_id, text).await {
                warn!(stage = "chat", error = %err, "failed to send chat reply");
            }
        }
        Ok(reply)
    }
}

/// Body accepted on the internal chat relay endpoint.
#[derive(Debug, Deserialize)]
pub struct ChatRelayBody {
    pub tenant_id: String,
    pub broadcaster_user_id: i64,
    pub sender_username: String,
    #[serde(default)]
    pub is_moderator: bool,
    pub content: String,
}

/// Internal endpoint the realtime chat relay posts each message to.
pub async fn relay(
    State(state): State<AppState>,
    Json(body): Json<ChatRelayBody>,
) -> Result<Json<Value>, ApiError> {
    let reply = state
        .chat()
        .handle_message(InboundChatMessage {
            tenant_id: &body.tenant_id,
            broadcaster_user_id: body.broadcaster_user_id,
            sender_username: &body.sender_username,
            is_moderator: body.is_moderator,
            content: &body.content,
        })
        .await
        .map_err(|err| {
            warn!(stage = "chat", error = %err, "chat message handling failed");
            ApiError::internal("chat message handling failed")
        })?;
    Ok(Json(json!({"status": "ok", "reply": reply})))
}
