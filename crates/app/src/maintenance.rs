//! Background retention worker: TTL deletion for the dedup ledger and the
//! giveaway chat-activity log, plus periodic WAL checkpoints.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use kick_bridge_storage::{Database, GiveawayStoreError, StorageError};

use crate::clock::{system_clock, Clock};

const TTL_HOURS: i64 = 72;
const BATCH_LIMIT: u32 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("TTL delete failed for {table}: {source}")]
    TtlDelete {
        table: &'static str,
        source: StorageError,
    },
    #[error("WAL checkpoint failed: {0}")]
    Checkpoint(StorageError),
}

/// Periodically deletes expired rows and truncates the WAL.
#[derive(Clone)]
pub struct RetentionWorker {
    database: Database,
    clock: Clock,
    interval: Duration,
}

impl RetentionWorker {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            clock: system_clock(),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "retention run failed");
            }
        }
    }

    /// Executes one retention cycle.
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let threshold = (self.clock)() - ChronoDuration::hours(TTL_HOURS);

        let markers = self
            .sweep("processed_messages", |limit| async move {
                self.database
                    .processed_messages()
                    .delete_completed_before(threshold, limit)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "processed_messages",
            deleted = markers,
            threshold = %threshold.to_rfc3339(),
            "marker TTL sweep completed"
        );

        let activity = self
            .sweep("giveaway_chat_activity", |limit| async move {
                self.database
                    .giveaways()
                    .delete_chat_activity_before(threshold, limit)
                    .await
                    .map_err(|err| match err {
                        GiveawayStoreError::Database(inner) => StorageError::Database(inner),
                        other => StorageError::Database(sqlx::Error::Protocol(other.to_string())),
                    })
            })
            .await?;
        info!(
            stage = "storage",
            table = "giveaway_chat_activity",
            deleted = activity,
            threshold = %threshold.to_rfc3339(),
            "chat activity TTL sweep completed"
        );

        self.run_checkpoint().await
    }

    async fn sweep<Fut>(
        &self,
        table: &'static str,
        mut delete_fn: impl FnMut(u32) -> Fut,
    ) -> Result<u64, MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, StorageError>>,
    {
        let mut total = 0u64;
        loop {
            match delete_fn(BATCH_LIMIT).await {
                Ok(0) => break,
                Ok(deleted) => {
                    total += deleted;
                    counter!("db_ttl_deleted_total", "table" => table).increment(deleted);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", %table, error = %err, "ttl delete hit busy timeout");
                    break;
                }
                Err(source) => return Err(MaintenanceError::TtlDelete { table, source }),
            }
        }
        Ok(total)
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        match self.database.checkpoint().await {
            Ok(()) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                info!(stage = "storage", duration_secs = duration, "WAL checkpoint completed");
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint(err)),
        }
    }
}

fn is_sqlite_busy(err: &StorageError) -> bool {
    let sqlx_err = match err {
        StorageError::Database(inner)
        | StorageError::Pragma(inner)
        | StorageError::Connect(inner) => inner,
        StorageError::Migration(_) => return false,
    };
    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY is 5, SQLITE_LOCKED is 6.
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    // File-backed database so the WAL checkpoint has real work to do.
    async fn setup_db(dir: &TempDir) -> Database {
        let path = dir.path().join("retention.sqlite3");
        let db = Database::connect(&format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn expired_markers_and_activity_are_swept() {
        let dir = TempDir::new().expect("tempdir");
        let db = setup_db(&dir).await;
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        let old = now - ChronoDuration::hours(TTL_HOURS + 1);
        let recent = now - ChronoDuration::hours(1);

        let markers = db.processed_messages();
        markers.claim("old", "b-1", "channel.followed", old).await.expect("claim");
        markers.mark_completed("old", "b-1", old).await.expect("complete");
        markers.claim("fresh", "b-1", "channel.followed", recent).await.expect("claim");
        markers.mark_completed("fresh", "b-1", recent).await.expect("complete");
        // Still-claimed markers survive the sweep regardless of age.
        markers.claim("stuck", "b-1", "channel.followed", old).await.expect("claim");

        let worker = RetentionWorker::new(db.clone()).with_clock(fixed_clock(now));
        worker.run_once().await.expect("run");

        assert_eq!(markers.fetch_status("old", "b-1").await.expect("status"), None);
        assert_eq!(
            markers.fetch_status("fresh", "b-1").await.expect("status").as_deref(),
            Some("completed")
        );
        assert_eq!(
            markers.fetch_status("stuck", "b-1").await.expect("status").as_deref(),
            Some("received")
        );
    }

    #[tokio::test]
    async fn run_once_on_an_empty_database_is_clean() {
        let dir = TempDir::new().expect("tempdir");
        let db = setup_db(&dir).await;
        let worker = RetentionWorker::new(db)
            .with_clock(fixed_clock(Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap()));
        worker.run_once().await.expect("run");
    }
}
