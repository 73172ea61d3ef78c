//! Giveaway flow: keyword and active-chatter entry, activity tracking and
//! the weighted winner draw.

use chrono::Duration;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use kick_bridge_core::types::{EntryMethod, Giveaway};
use kick_bridge_storage::{Database, GiveawayStoreError, NewGiveaway};

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum GiveawayError {
    #[error("storage error: {0}")]
    Storage(#[from] GiveawayStoreError),
}

/// What a chat message did for the active giveaway, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    /// No active giveaway, or the message did not qualify.
    None,
    /// The sender gained an entry; holds their entry count afterwards.
    Entered { entry_count: u32 },
}

/// Parameters accepted when creating a giveaway.
pub struct GiveawaySpec<'a> {
    pub title: &'a str,
    pub entry_method: EntryMethod,
    pub keyword: Option<&'a str>,
    pub messages_required: u32,
    pub time_window_minutes: u32,
    pub allow_multiple_entries: bool,
    pub max_entries_per_user: u32,
}

pub struct GiveawayEngine {
    storage: Database,
    clock: Clock,
}

impl GiveawayEngine {
    pub fn new(storage: Database, clock: Clock) -> Self {
        Self { storage, clock }
    }

    /// Creates a giveaway in `pending` state and returns its id.
    pub async fn create(
        &self,
        tenant_id: &str,
        spec: GiveawaySpec<'_>,
    ) -> Result<i64, GiveawayError> {
        let id = self
            .storage
            .giveaways()
            .create(NewGiveaway {
                tenant_id,
                title: spec.title,
                entry_method: spec.entry_method,
                keyword: spec.keyword,
                messages_required: spec.messages_required,
                time_window_minutes: spec.time_window_minutes,
                allow_multiple_entries: spec.allow_multiple_entries,
                max_entries_per_user: spec.max_entries_per_user.max(1),
                created_at: (self.clock)(),
            })
            .await?;
        info!(stage = "giveaway", tenant_id, giveaway_id = id, "giveaway created");
        Ok(id)
    }

    pub async fn activate(&self, giveaway_id: i64) -> Result<(), GiveawayError> {
        self.storage
            .giveaways()
            .activate(giveaway_id, (self.clock)())
            .await?;
        info!(stage = "giveaway", giveaway_id, "giveaway activated");
        Ok(())
    }

    pub async fn active(&self, tenant_id: &str) -> Result<Option<Giveaway>, GiveawayError> {
        Ok(self.storage.giveaways().fetch_active(tenant_id).await?)
    }

    /// Feeds one chat message into the active giveaway.
    ///
    /// Keyword giveaways enter the sender when the trimmed message matches
    /// the keyword case-insensitively. Active-chatter giveaways log the
    /// message and enter the sender exactly once, when their distinct-message
    /// count inside the sliding window first reaches the threshold.
    pub async fn handle_chat_message(
        &self,
        tenant_id: &str,
        kick_username: &str,
        content: &str,
    ) -> Result<ChatOutcome, GiveawayError> {
        let Some(giveaway) = self.storage.giveaways().fetch_active(tenant_id).await? else {
            return Ok(ChatOutcome::None);
        };

        match giveaway.entry_method {
            EntryMethod::Keyword => {
                let Some(keyword) = giveaway.keyword.as_deref() else {
                    return Ok(ChatOutcome::None);
                };
                if !content.trim().eq_ignore_ascii_case(keyword.trim()) {
                    return Ok(ChatOutcome::None);
                }
                self.enter(&giveaway, kick_username, EntryMethod::Keyword).await
            }
            EntryMethod::ActiveChatter => {
                let now = (self.clock)();
                let hash = message_hash(content);
                let fresh = self
                    .storage
                    .giveaways()
                    .record_chat_message(giveaway.id, kick_username, &hash, now)
                    .await?;
                if !fresh {
                    debug!(
                        stage = "giveaway",
                        giveaway_id = giveaway.id,
                        kick_username,
                        "duplicate message ignored"
                    );
                    return Ok(ChatOutcome::None);
                }
                let since = now - Duration::minutes(i64::from(giveaway.time_window_minutes));
                let count = self
                    .storage
                    .giveaways()
                    .distinct_message_count(giveaway.id, kick_username, since)
                    .await?;
                if count < u64::from(giveaway.messages_required) {
                    return Ok(ChatOutcome::None);
                }
                // The auto-entry fires once; messages past the threshold
                // change nothing for a user who already holds an entry.
                if self
                    .storage
                    .giveaways()
                    .has_entry(giveaway.id, kick_username)
                    .await?
                {
                    return Ok(ChatOutcome::None);
                }
                self.enter(&giveaway, kick_username, EntryMethod::ActiveChatter)
                    .await
            }
        }
    }

    async fn enter(
        &self,
        giveaway: &Giveaway,
        kick_username: &str,
        method: EntryMethod,
    ) -> Result<ChatOutcome, GiveawayError> {
        let entry_count = self
            .storage
            .giveaways()
            .add_entry(
                giveaway.id,
                kick_username,
                method,
                giveaway.allow_multiple_entries,
                giveaway.max_entries_per_user,
                (self.clock)(),
            )
            .await?;
        info!(
            stage = "giveaway",
            giveaway_id = giveaway.id,
            kick_username,
            entry_count,
            "entry recorded"
        );
        Ok(ChatOutcome::Entered { entry_count })
    }

    /// Draws a winner weighted by entry count and completes the giveaway.
    /// Returns `None` when the giveaway has no entries.
    pub async fn draw_winner(
        &self,
        tenant_id: &str,
    ) -> Result<Option<String>, GiveawayError> {
        let Some(giveaway) = self.storage.giveaways().fetch_active(tenant_id).await? else {
            return Ok(None);
        };
        let entries = self.storage.giveaways().entries(giveaway.id).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let mut weighted: Vec<&str> = Vec::new();
        for entry in &entries {
            for _ in 0..entry.entry_count.max(1) {
                weighted.push(&entry.kick_username);
            }
        }
        let pick = rand::thread_rng().gen_range(0..weighted.len());
        let winner = weighted[pick].to_string();

        self.storage
            .giveaways()
            .complete(giveaway.id, &winner, (self.clock)())
            .await?;
        info!(
            stage = "giveaway",
            giveaway_id = giveaway.id,
            winner = %winner,
            "winner drawn"
        );
        Ok(Some(winner))
    }
}

/// Hash used to deduplicate chat messages; whitespace and case variations
/// of the same text collapse to one hash.
pub fn message_hash(content: &str) -> String {
    let normalized = content.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use chrono::{TimeZone, Utc};

    async fn engine(name: &str) -> GiveawayEngine {
        let db = Database::connect(&format!(
            "sqlite:file:giveaway_{name}?mode=memory&cache=shared"
        ))
        .await
        .expect("connect");
        db.run_migrations().await.expect("migrations");
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        GiveawayEngine::new(db, fixed_clock(at))
    }

    fn keyword_spec<'a>() -> GiveawaySpec<'a> {
        GiveawaySpec {
            title: "skin drop",
            entry_method: EntryMethod::Keyword,
            keyword: Some("!enter"),
            messages_required: 0,
            time_window_minutes: 0,
            allow_multiple_entries: false,
            max_entries_per_user: 1,
        }
    }

    #[test]
    fn hash_collapses_case_and_whitespace() {
        assert_eq!(message_hash("  Hello World "), message_hash("hello world"));
        assert_ne!(message_hash("hello"), message_hash("world"));
    }

    #[tokio::test]
    async fn keyword_match_enters_once() {
        let engine = engine("keyword").await;
        let id = engine.create("t-1", keyword_spec()).await.expect("create");
        engine.activate(id).await.expect("activate");

        let outcome = engine
            .handle_chat_message("t-1", "alice", "  !ENTER ")
            .await
            .expect("chat");
        assert_eq!(outcome, ChatOutcome::Entered { entry_count: 1 });

        let outcome = engine
            .handle_chat_message("t-1", "alice", "!enter")
            .await
            .expect("repeat");
        assert_eq!(outcome, ChatOutcome::Entered { entry_count: 1 });

        let outcome = engine
            .handle_chat_message("t-1", "alice", "unrelated chatter")
            .await
            .expect("miss");
        assert_eq!(outcome, ChatOutcome::None);
    }

    #[tokio::test]
    async fn active_chatter_qualifies_at_threshold() {
        let engine = engine("chatter").await;
        let id = engine
            .create(
                "t-1",
                GiveawaySpec {
                    title: "lurker reward",
                    entry_method: EntryMethod::ActiveChatter,
                    keyword: None,
                    messages_required: 3,
                    time_window_minutes: 30,
                    allow_multiple_entries: false,
                    max_entries_per_user: 1,
                },
            )
            .await
            .expect("create");
        engine.activate(id).await.expect("activate");

        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "first message")
                .await
                .expect("one"),
            ChatOutcome::None
        );
        // Copy-paste of the first message does not advance the count.
        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "FIRST MESSAGE")
                .await
                .expect("dup"),
            ChatOutcome::None
        );
        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "second message")
                .await
                .expect("two"),
            ChatOutcome::None
        );
        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "third message")
                .await
                .expect("three"),
            ChatOutcome::Entered { entry_count: 1 }
        );
        // The auto-entry fired; more distinct messages do not enter again.
        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "fourth message")
                .await
                .expect("four"),
            ChatOutcome::None
        );
        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "fifth message")
                .await
                .expect("five"),
            ChatOutcome::None
        );
    }

    #[tokio::test]
    async fn draw_completes_and_reports_winner() {
        let engine = engine("draw").await;
        let id = engine.create("t-1", keyword_spec()).await.expect("create");
        engine.activate(id).await.expect("activate");
        engine
            .handle_chat_message("t-1", "alice", "!enter")
            .await
            .expect("enter");

        let winner = engine.draw_winner("t-1").await.expect("draw");
        assert_eq!(winner.as_deref(), Some("alice"));

        // Giveaway is completed; drawing again finds nothing active.
        assert_eq!(engine.draw_winner("t-1").await.expect("redraw"), None);
        assert_eq!(
            engine
                .handle_chat_message("t-1", "bob", "!enter")
                .await
                .expect("late"),
            ChatOutcome::None
        );
    }

    #[tokio::test]
    async fn draw_with_no_entries_returns_none() {
        let engine = engine("empty").await;
        let id = engine.create("t-1", keyword_spec()).await.expect("create");
        engine.activate(id).await.expect("activate");
        assert_eq!(engine.draw_winner("t-1").await.expect("draw"), None);
    }
}
