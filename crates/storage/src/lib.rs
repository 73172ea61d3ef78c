use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use kick_bridge_core::types::{
    EntryMethod, Giveaway, GiveawayEntry, GiveawayStatus, GtbSession, GtbSessionStatus, GtbWinner,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for the processed-message ledger.
    pub fn processed_messages(&self) -> ProcessedMessageRepository {
        ProcessedMessageRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for webhook subscription records.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for Guess-the-Balance sessions, guesses and winners.
    pub fn gtb(&self) -> GtbRepository {
        GtbRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for giveaways, entries and chat activity.
    pub fn giveaways(&self) -> GiveawayRepository {
        GiveawayRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for raffle periods and the ticket ledger.
    pub fn raffles(&self) -> RaffleRepository {
        RaffleRepository {
            pool: self.pool.clone(),
        }
    }

    /// Forces a WAL checkpoint, truncating the log.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// SQLite reports unique-index violations as 2067 and primary-key
// violations as 1555; both mean "this row already exists".
fn unique_violation_code(code: Option<Cow<'_, str>>) -> bool {
    matches!(code.as_deref(), Some("2067") | Some("1555"))
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Repository for the webhook dedup ledger.
#[derive(Clone)]
pub struct ProcessedMessageRepository {
    pool: SqlitePool,
}

/// Result of attempting to claim a message for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate,
}

impl ClaimOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

impl ProcessedMessageRepository {
    /// Claims a message for processing by inserting a `received` marker.
    ///
    /// The insert is the concurrency guard: a second delivery of the same
    /// (message, broadcaster) pair hits the primary key and reports
    /// [`ClaimOutcome::Duplicate`] whether the first is in flight or done.
    pub async fn claim(
        &self,
        message_id: &str,
        broadcaster_id: &str,
        event_type: &str,
        received_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError> {
        let result = sqlx::query(
            "INSERT INTO processed_messages \
             (message_id, broadcaster_id, event_type, status, received_at) \
             VALUES (?, ?, ?, 'received', ?)",
        )
        .bind(message_id)
        .bind(broadcaster_id)
        .bind(event_type)
        .bind(to_rfc3339(received_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(sqlx::Error::Database(db_err)) => {
                if unique_violation_code(db_err.code()) {
                    return Ok(ClaimOutcome::Duplicate);
                }
                Err(StorageError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(StorageError::Database(err)),
        }
    }

    /// Marks a claimed message as fully processed.
    pub async fn mark_completed(
        &self,
        message_id: &str,
        broadcaster_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE processed_messages \
             SET status = 'completed', completed_at = ? \
             WHERE message_id = ? AND broadcaster_id = ?",
        )
        .bind(to_rfc3339(completed_at))
        .bind(message_id)
        .bind(broadcaster_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases a claim after a processing failure so the sender's retry
    /// can go through. Completed markers are never released.
    pub async fn release(
        &self,
        message_id: &str,
        broadcaster_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "DELETE FROM processed_messages \
             WHERE message_id = ? AND broadcaster_id = ? AND status = 'received'",
        )
        .bind(message_id)
        .bind(broadcaster_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads the marker status for a message, if any.
    pub async fn fetch_status(
        &self,
        message_id: &str,
        broadcaster_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            "SELECT status FROM processed_messages \
             WHERE message_id = ? AND broadcaster_id = ?",
        )
        .bind(message_id)
        .bind(broadcaster_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("status")))
    }

    /// Deletes completed markers older than the cutoff, at most `limit` rows.
    pub async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM processed_messages \
             WHERE rowid IN (\
                 SELECT rowid FROM processed_messages \
                 WHERE status = 'completed' AND received_at < ? \
                 LIMIT ?\
             )",
        )
        .bind(to_rfc3339(cutoff))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// A registered webhook subscription.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookSubscription {
    pub subscription_id: String,
    pub tenant_id: String,
    pub broadcaster_id: String,
    pub broadcaster_username: String,
    pub event_type: String,
    pub status: String,
    pub secret: Option<String>,
}

impl WebhookSubscription {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Data required to register a subscription.
pub struct NewSubscription<'a> {
    pub subscription_id: &'a str,
    pub tenant_id: &'a str,
    pub broadcaster_id: &'a str,
    pub broadcaster_username: &'a str,
    pub event_type: &'a str,
    pub secret: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Errors for subscription operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("an active subscription already exists for this broadcaster and event type")]
    ActiveExists,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Repository for webhook subscription records.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    /// Registers a new active subscription.
    pub async fn insert(&self, record: NewSubscription<'_>) -> Result<(), SubscriptionError> {
        let now = to_rfc3339(record.created_at);
        let result = sqlx::query(
            "INSERT INTO webhook_subscriptions \
             (subscription_id, tenant_id, broadcaster_id, broadcaster_username, \
              event_type, status, secret, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?)",
        )
        .bind(record.subscription_id)
        .bind(record.tenant_id)
        .bind(record.broadcaster_id)
        .bind(record.broadcaster_username)
        .bind(record.event_type)
        .bind(record.secret)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) => {
                if unique_violation_code(db_err.code()) {
                    return Err(SubscriptionError::ActiveExists);
                }
                Err(SubscriptionError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(SubscriptionError::Database(err)),
        }
    }

    /// Looks up a subscription by the id carried in the webhook headers.
    pub async fn fetch(
        &self,
        subscription_id: &str,
    ) -> Result<Option<WebhookSubscription>, StorageError> {
        let row = sqlx::query_as::<_, WebhookSubscription>(
            "SELECT subscription_id, tenant_id, broadcaster_id, broadcaster_username, \
                    event_type, status, secret \
             FROM webhook_subscriptions WHERE subscription_id = ?",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Marks a subscription revoked so future deliveries are ignored.
    pub async fn deactivate(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE webhook_subscriptions \
             SET status = 'revoked', updated_at = ? \
             WHERE subscription_id = ? AND status = 'active'",
        )
        .bind(to_rfc3339(now))
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GtbSessionRow {
    id: i64,
    tenant_id: String,
    opened_by: String,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    result_amount: Option<f64>,
    status: String,
}

impl GtbSessionRow {
    fn into_domain(self) -> GtbSession {
        GtbSession {
            id: self.id,
            tenant_id: self.tenant_id,
            opened_by: self.opened_by,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            result_amount: self.result_amount,
            status: GtbSessionStatus::parse(&self.status).unwrap_or(GtbSessionStatus::Completed),
        }
    }
}

const GTB_SESSION_COLUMNS: &str =
    "id, tenant_id, opened_by, opened_at, closed_at, result_amount, status";

/// A guess joined with its distance from the session result.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RankedGuess {
    pub kick_username: String,
    pub amount: f64,
    pub difference: f64,
}

/// Errors for Guess-the-Balance storage operations.
#[derive(Debug, Error)]
pub enum GtbStoreError {
    #[error("an open session already exists for this tenant")]
    AlreadyOpen,
    #[error("session not found or not in the expected state")]
    NotFound,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for GtbStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

/// Repository for Guess-the-Balance sessions, guesses and winners.
#[derive(Clone)]
pub struct GtbRepository {
    pool: SqlitePool,
}

impl GtbRepository {
    /// Opens a new session; the partial unique index rejects a second open
    /// session for the same tenant.
    pub async fn open_session(
        &self,
        tenant_id: &str,
        opened_by: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, GtbStoreError> {
        let result = sqlx::query(
            "INSERT INTO gtb_sessions (tenant_id, opened_by, opened_at, status) \
             VALUES (?, ?, ?, 'open') RETURNING id",
        )
        .bind(tenant_id)
        .bind(opened_by)
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.get("id")),
            Err(sqlx::Error::Database(db_err)) => {
                if unique_violation_code(db_err.code()) {
                    return Err(GtbStoreError::AlreadyOpen);
                }
                Err(GtbStoreError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(GtbStoreError::Database(err)),
        }
    }

    /// Fetches the single open session for a tenant, if any.
    pub async fn fetch_open(&self, tenant_id: &str) -> Result<Option<GtbSession>, GtbStoreError> {
        let row = sqlx::query_as::<_, GtbSessionRow>(&format!(
            "SELECT {GTB_SESSION_COLUMNS} FROM gtb_sessions \
             WHERE tenant_id = ? AND status = 'open'"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GtbSessionRow::into_domain))
    }

    /// Fetches a session by id.
    pub async fn fetch(&self, session_id: i64) -> Result<Option<GtbSession>, GtbStoreError> {
        let row = sqlx::query_as::<_, GtbSessionRow>(&format!(
            "SELECT {GTB_SESSION_COLUMNS} FROM gtb_sessions WHERE id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GtbSessionRow::into_domain))
    }

    /// Lists sessions in `closed` state, oldest first.
    pub async fn closed_sessions(&self, tenant_id: &str) -> Result<Vec<GtbSession>, GtbStoreError> {
        let rows = sqlx::query_as::<_, GtbSessionRow>(&format!(
            "SELECT {GTB_SESSION_COLUMNS} FROM gtb_sessions \
             WHERE tenant_id = ? AND status = 'closed' ORDER BY opened_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(GtbSessionRow::into_domain).collect())
    }

    /// Moves the open session to `closed`, returning it.
    pub async fn close_open_session(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<GtbSession, GtbStoreError> {
        let row = sqlx::query_as::<_, GtbSessionRow>(&format!(
            "UPDATE gtb_sessions SET status = 'closed', closed_at = ? \
             WHERE tenant_id = ? AND status = 'open' \
             RETURNING {GTB_SESSION_COLUMNS}"
        ))
        .bind(to_rfc3339(now))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(GtbSessionRow::into_domain)
            .ok_or(GtbStoreError::NotFound)
    }

    /// Records or replaces a user's guess for an open session.
    pub async fn upsert_guess(
        &self,
        session_id: i64,
        kick_username: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<(), GtbStoreError> {
        sqlx::query(
            "INSERT INTO gtb_guesses (session_id, kick_username, amount, guessed_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (session_id, kick_username) DO UPDATE \
             SET amount = excluded.amount, guessed_at = excluded.guessed_at",
        )
        .bind(session_id)
        .bind(kick_username)
        .bind(amount)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts the guesses recorded for a session.
    pub async fn guess_count(&self, session_id: i64) -> Result<u64, GtbStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM gtb_guesses WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    /// Moves a closed session to `completed` with its result amount.
    pub async fn complete_with_result(
        &self,
        session_id: i64,
        result_amount: f64,
    ) -> Result<(), GtbStoreError> {
        let result = sqlx::query(
            "UPDATE gtb_sessions SET status = 'completed', result_amount = ? \
             WHERE id = ? AND status = 'closed'",
        )
        .bind(result_amount)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GtbStoreError::NotFound);
        }
        Ok(())
    }

    /// Ranks guesses by distance to the result, ties broken by guess time.
    pub async fn top_guesses(
        &self,
        session_id: i64,
        result_amount: f64,
        limit: u32,
    ) -> Result<Vec<RankedGuess>, GtbStoreError> {
        let rows = sqlx::query_as::<_, RankedGuess>(
            "SELECT kick_username, amount, ABS(amount - ?) AS difference \
             FROM gtb_guesses WHERE session_id = ? \
             ORDER BY difference ASC, guessed_at ASC LIMIT ?",
        )
        .bind(result_amount)
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Replaces the winner rows for a session. Clearing first makes result
    /// recomputation idempotent.
    pub async fn replace_winners(
        &self,
        session_id: i64,
        winners: &[GtbWinner],
        now: DateTime<Utc>,
    ) -> Result<(), GtbStoreError> {
        let mut tx: Transaction<'_, Sqlite> = self.pool.begin().await?;
        sqlx::query("DELETE FROM gtb_winners WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for winner in winners {
            sqlx::query(
                "INSERT INTO gtb_winners \
                 (session_id, \"rank\", kick_username, guess_amount, difference, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(winner.rank)
            .bind(&winner.kick_username)
            .bind(winner.guess_amount)
            .bind(winner.difference)
            .bind(to_rfc3339(now))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Lists the recorded winners for a session in rank order.
    pub async fn winners(&self, session_id: i64) -> Result<Vec<GtbWinner>, GtbStoreError> {
        let rows = sqlx::query(
            "SELECT w.\"rank\", w.kick_username, w.guess_amount, w.difference, s.result_amount \
             FROM gtb_winners AS w \
             JOIN gtb_sessions AS s ON s.id = w.session_id \
             WHERE w.session_id = ? ORDER BY w.\"rank\" ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| GtbWinner {
                rank: row.get::<i64, _>("rank") as u32,
                kick_username: row.get("kick_username"),
                guess_amount: row.get("guess_amount"),
                result_amount: row.get::<Option<f64>, _>("result_amount").unwrap_or(0.0),
                difference: row.get("difference"),
            })
            .collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GiveawayRow {
    id: i64,
    tenant_id: String,
    title: String,
    entry_method: String,
    keyword: Option<String>,
    messages_required: i64,
    time_window_minutes: i64,
    allow_multiple_entries: i64,
    max_entries_per_user: i64,
    status: String,
    winner: Option<String>,
}

impl GiveawayRow {
    fn into_domain(self) -> Giveaway {
        Giveaway {
            id: self.id,
            tenant_id: self.tenant_id,
            title: self.title,
            entry_method: EntryMethod::parse(&self.entry_method).unwrap_or(EntryMethod::Keyword),
            keyword: self.keyword,
            messages_required: self.messages_required as u32,
            time_window_minutes: self.time_window_minutes as u32,
            allow_multiple_entries: self.allow_multiple_entries != 0,
            max_entries_per_user: self.max_entries_per_user as u32,
            status: GiveawayStatus::parse(&self.status).unwrap_or(GiveawayStatus::Completed),
            winner: self.winner,
        }
    }
}

const GIVEAWAY_COLUMNS: &str = "id, tenant_id, title, entry_method, keyword, messages_required, \
     time_window_minutes, allow_multiple_entries, max_entries_per_user, status, winner";

/// Parameters to create a giveaway in `pending` state.
pub struct NewGiveaway<'a> {
    pub tenant_id: &'a str,
    pub title: &'a str,
    pub entry_method: EntryMethod,
    pub keyword: Option<&'a str>,
    pub messages_required: u32,
    pub time_window_minutes: u32,
    pub allow_multiple_entries: bool,
    pub max_entries_per_user: u32,
    pub created_at: DateTime<Utc>,
}

/// Errors for giveaway storage operations.
#[derive(Debug, Error)]
pub enum GiveawayStoreError {
    #[error("an active giveaway already exists for this tenant")]
    AlreadyActive,
    #[error("giveaway not found or not in the expected state")]
    NotFound,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for GiveawayStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

/// Repository for giveaways, entries and chat activity.
#[derive(Clone)]
pub struct GiveawayRepository {
    pool: SqlitePool,
}

impl GiveawayRepository {
    /// Creates a giveaway in `pending` state and returns its id.
    pub async fn create(&self, record: NewGiveaway<'_>) -> Result<i64, GiveawayStoreError> {
        let now = to_rfc3339(record.created_at);
        let row = sqlx::query(
            "INSERT INTO giveaways \
             (tenant_id, title, entry_method, keyword, messages_required, time_window_minutes, \
              allow_multiple_entries, max_entries_per_user, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?) RETURNING id",
        )
        .bind(record.tenant_id)
        .bind(record.title)
        .bind(record.entry_method.as_str())
        .bind(record.keyword)
        .bind(record.messages_required)
        .bind(record.time_window_minutes)
        .bind(if record.allow_multiple_entries { 1 } else { 0 })
        .bind(record.max_entries_per_user)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Moves a pending giveaway to `active`; the partial unique index rejects
    /// a second active giveaway for the tenant.
    pub async fn activate(
        &self,
        giveaway_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), GiveawayStoreError> {
        let result = sqlx::query(
            "UPDATE giveaways SET status = 'active', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(to_rfc3339(now))
        .bind(giveaway_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => Ok(()),
            Ok(_) => Err(GiveawayStoreError::NotFound),
            Err(sqlx::Error::Database(db_err)) => {
                if unique_violation_code(db_err.code()) {
                    return Err(GiveawayStoreError::AlreadyActive);
                }
                Err(GiveawayStoreError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(GiveawayStoreError::Database(err)),
        }
    }

    /// Fetches the single active giveaway for a tenant, if any.
    pub async fn fetch_active(
        &self,
        tenant_id: &str,
    ) -> Result<Option<Giveaway>, GiveawayStoreError> {
        let row = sqlx::query_as::<_, GiveawayRow>(&format!(
            "SELECT {GIVEAWAY_COLUMNS} FROM giveaways \
             WHERE tenant_id = ? AND status = 'active'"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GiveawayRow::into_domain))
    }

    /// Fetches a giveaway by id.
    pub async fn fetch(&self, giveaway_id: i64) -> Result<Option<Giveaway>, GiveawayStoreError> {
        let row = sqlx::query_as::<_, GiveawayRow>(&format!(
            "SELECT {GIVEAWAY_COLUMNS} FROM giveaways WHERE id = ?"
        ))
        .bind(giveaway_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GiveawayRow::into_domain))
    }

    /// Completes an active giveaway, recording the drawn winner.
    pub async fn complete(
        &self,
        giveaway_id: i64,
        winner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GiveawayStoreError> {
        let result = sqlx::query(
            "UPDATE giveaways SET status = 'completed', winner = ?, updated_at = ? \
             WHERE id = ? AND status = 'active'",
        )
        .bind(winner)
        .bind(to_rfc3339(now))
        .bind(giveaway_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GiveawayStoreError::NotFound);
        }
        Ok(())
    }

    /// Records an entry for a user.
    ///
    /// With multiple entries allowed the count grows up to `max_entries`;
    /// otherwise a repeat entry is a no-op. Returns the user's entry count
    /// after the call.
    pub async fn add_entry(
        &self,
        giveaway_id: i64,
        kick_username: &str,
        method: EntryMethod,
        allow_multiple: bool,
        max_entries: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, GiveawayStoreError> {
        let stamp = to_rfc3339(now);
        let row = if allow_multiple {
            sqlx::query(
                "INSERT INTO giveaway_entries \
                 (giveaway_id, kick_username, entry_count, entry_method, first_entered_at, updated_at) \
                 VALUES (?, ?, 1, ?, ?, ?) \
                 ON CONFLICT (giveaway_id, kick_username) DO UPDATE \
                 SET entry_count = MIN(entry_count + 1, ?), updated_at = excluded.updated_at \
                 RETURNING entry_count",
            )
            .bind(giveaway_id)
            .bind(kick_username)
            .bind(method.as_str())
            .bind(&stamp)
            .bind(&stamp)
            .bind(max_entries)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query(
                "INSERT INTO giveaway_entries \
                 (giveaway_id, kick_username, entry_count, entry_method, first_entered_at, updated_at) \
                 VALUES (?, ?, 1, ?, ?, ?) \
                 ON CONFLICT (giveaway_id, kick_username) DO UPDATE \
                 SET updated_at = giveaway_entries.updated_at \
                 RETURNING entry_count",
            )
            .bind(giveaway_id)
            .bind(kick_username)
            .bind(method.as_str())
            .bind(&stamp)
            .bind(&stamp)
            .fetch_one(&self.pool)
            .await?
        };

        let count: i64 = row.get("entry_count");
        Ok(count as u32)
    }

    /// Lists entries for a giveaway.
    pub async fn entries(&self, giveaway_id: i64) -> Result<Vec<GiveawayEntry>, GiveawayStoreError> {
        let rows = sqlx::query(
            "SELECT kick_username, entry_count, entry_method \
             FROM giveaway_entries WHERE giveaway_id = ? ORDER BY first_entered_at ASC",
        )
        .bind(giveaway_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| GiveawayEntry {
                kick_username: row.get("kick_username"),
                entry_count: row.get::<i64, _>("entry_count") as u32,
                entry_method: EntryMethod::parse(row.get("entry_method"))
                    .unwrap_or(EntryMethod::Keyword),
            })
            .collect())
    }

    /// Returns whether the user already holds an entry in the giveaway.
    pub async fn has_entry(
        &self,
        giveaway_id: i64,
        kick_username: &str,
    ) -> Result<bool, GiveawayStoreError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM giveaway_entries \
             WHERE giveaway_id = ? AND kick_username = ?",
        )
        .bind(giveaway_id)
        .bind(kick_username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Records one distinct chat message toward active-chatter qualification.
    ///
    /// Returns `false` when the same content hash was already seen for this
    /// user in this giveaway.
    pub async fn record_chat_message(
        &self,
        giveaway_id: i64,
        kick_username: &str,
        message_hash: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, GiveawayStoreError> {
        let result = sqlx::query(
            "INSERT INTO giveaway_chat_activity \
             (giveaway_id, kick_username, message_hash, sent_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(giveaway_id)
        .bind(kick_username)
        .bind(message_hash)
        .bind(to_rfc3339(sent_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) => {
                if unique_violation_code(db_err.code()) {
                    return Ok(false);
                }
                Err(GiveawayStoreError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(GiveawayStoreError::Database(err)),
        }
    }

    /// Counts a user's distinct messages since the cutoff.
    pub async fn distinct_message_count(
        &self,
        giveaway_id: i64,
        kick_username: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, GiveawayStoreError> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT message_hash) AS n FROM giveaway_chat_activity \
             WHERE giveaway_id = ? AND kick_username = ? AND sent_at >= ?",
        )
        .bind(giveaway_id)
        .bind(kick_username)
        .bind(to_rfc3339(since))
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    /// Deletes chat activity older than the cutoff, at most `limit` rows.
    pub async fn delete_chat_activity_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, GiveawayStoreError> {
        let result = sqlx::query(
            "DELETE FROM giveaway_chat_activity \
             WHERE rowid IN (\
                 SELECT rowid FROM giveaway_chat_activity WHERE sent_at < ? LIMIT ?\
             )",
        )
        .bind(to_rfc3339(cutoff))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Result of attempting to award raffle tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwardOutcome {
    Awarded,
    Duplicate,
}

impl AwardOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Per-user ticket total within a period.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TicketStanding {
    pub kick_username: String,
    pub tickets: i64,
}

/// Repository for raffle periods and the ticket ledger.
#[derive(Clone)]
pub struct RaffleRepository {
    pool: SqlitePool,
}

impl RaffleRepository {
    /// Returns the active period for a tenant, creating one when absent.
    pub async fn ensure_active_period(
        &self,
        tenant_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        if let Some(id) = self.active_period(tenant_id).await? {
            return Ok(id);
        }

        let result = sqlx::query(
            "INSERT INTO raffle_periods (tenant_id, label, started_at, status) \
             VALUES (?, ?, ?, 'active') RETURNING id",
        )
        .bind(tenant_id)
        .bind(label)
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.get("id")),
            Err(sqlx::Error::Database(db_err)) if unique_violation_code(db_err.code()) => {
                // Lost the race to a concurrent insert; the period now exists.
                self.active_period(tenant_id)
                    .await?
                    .ok_or_else(|| StorageError::Database(sqlx::Error::RowNotFound))
            }
            Err(err) => Err(StorageError::Database(err)),
        }
    }

    async fn active_period(&self, tenant_id: &str) -> Result<Option<i64>, StorageError> {
        let row = sqlx::query(
            "SELECT id FROM raffle_periods WHERE tenant_id = ? AND status = 'active'",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Closes the active period so the next award opens a fresh one.
    pub async fn close_active_period(&self, tenant_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE raffle_periods SET status = 'completed' \
             WHERE tenant_id = ? AND status = 'active'",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Awards tickets to a user, keyed by the originating webhook message so
    /// replays of the same delivery award nothing.
    pub async fn award_tickets(
        &self,
        period_id: i64,
        kick_username: &str,
        tickets: u32,
        source: &str,
        source_event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AwardOutcome, StorageError> {
        let result = sqlx::query(
            "INSERT INTO raffle_ticket_awards \
             (period_id, kick_username, tickets, source, source_event_id, awarded_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(period_id)
        .bind(kick_username)
        .bind(tickets)
        .bind(source)
        .bind(source_event_id)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(AwardOutcome::Awarded),
            Err(sqlx::Error::Database(db_err)) => {
                if unique_violation_code(db_err.code()) {
                    return Ok(AwardOutcome::Duplicate);
                }
                Err(StorageError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(StorageError::Database(err)),
        }
    }

    /// Sums a user's tickets within a period.
    pub async fn total_tickets(
        &self,
        period_id: i64,
        kick_username: &str,
    ) -> Result<u64, StorageError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(tickets), 0) AS total FROM raffle_ticket_awards \
             WHERE period_id = ? AND kick_username = ?",
        )
        .bind(period_id)
        .bind(kick_username)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        Ok(total as u64)
    }

    /// Lists ticket totals per user, highest first.
    pub async fn standings(&self, period_id: i64) -> Result<Vec<TicketStanding>, StorageError> {
        let rows = sqlx::query_as::<_, TicketStanding>(
            "SELECT kick_username, SUM(tickets) AS tickets FROM raffle_ticket_awards \
             WHERE period_id = ? GROUP BY kick_username \
             ORDER BY tickets DESC, kick_username ASC",
        )
        .bind(period_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
