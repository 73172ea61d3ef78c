//! Guess-the-Balance session flow: open, collect guesses, close, set the
//! revealed result and rank winners.

use thiserror::Error;
use tracing::info;

use kick_bridge_core::types::{GtbSessionStatus, GtbWinner, MAX_GTB_AMOUNT};
use kick_bridge_storage::{Database, GtbStoreError};

use crate::clock::Clock;

const WINNER_LIMIT: u32 = 3;

#[derive(Debug, Error)]
pub enum GtbError {
    #[error("storage error: {0}")]
    Storage(#[from] GtbStoreError),
}

/// Session logic on top of the store. All outcomes, including validation
/// refusals, come back as chat reply strings.
pub struct GtbEngine {
    storage: Database,
    clock: Clock,
}

impl GtbEngine {
    pub fn new(storage: Database, clock: Clock) -> Self {
        Self { storage, clock }
    }

    /// Opens a new session for the tenant. At most one session may be open.
    pub async fn open_session(&self, tenant_id: &str, opened_by: &str) -> Result<String, GtbError> {
        let now = (self.clock)();
        match self.storage.gtb().open_session(tenant_id, opened_by, now).await {
            Ok(session_id) => {
                info!(stage = "gtb", tenant_id, session_id, opened_by, "session opened");
                Ok(format!(
                    "Session #{session_id} opened! Users can now guess with !gtb <amount>"
                ))
            }
            Err(GtbStoreError::AlreadyOpen) => {
                let open = self.storage.gtb().fetch_open(tenant_id).await?;
                let opened_by = open.map(|s| s.opened_by).unwrap_or_default();
                Ok(format!("A session is already open (opened by {opened_by})"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Closes the open session, freezing its guess list.
    pub async fn close_session(&self, tenant_id: &str) -> Result<String, GtbError> {
        let now = (self.clock)();
        match self.storage.gtb().close_open_session(tenant_id, now).await {
            Ok(session) => {
                let guesses = self.storage.gtb().guess_count(session.id).await?;
                info!(stage = "gtb", tenant_id, session_id = session.id, guesses, "session closed");
                Ok(format!(
                    "Session #{} closed with {guesses} guesses. \
                     Use !gtbresult <amount> to set the result.",
                    session.id
                ))
            }
            Err(GtbStoreError::NotFound) => Ok("No active session to close".to_string()),
            Err(err) => Err(err.into()),
        }
    }

    /// Records a guess in the open session. Resubmitting overwrites the
    /// user's prior guess.
    pub async fn submit_guess(
        &self,
        tenant_id: &str,
        kick_username: &str,
        amount: f64,
    ) -> Result<String, GtbError> {
        if !(amount > 0.0) || !amount.is_finite() {
            return Ok("Guess amount must be greater than 0".to_string());
        }
        if amount > MAX_GTB_AMOUNT {
            return Ok("Guess amount is too large".to_string());
        }
        let Some(session) = self.storage.gtb().fetch_open(tenant_id).await? else {
            return Ok("No active GTB session. Wait for an admin to start one!".to_string());
        };
        let now = (self.clock)();
        self.storage
            .gtb()
            .upsert_guess(session.id, kick_username, amount, now)
            .await?;
        info!(
            stage = "gtb",
            tenant_id,
            session_id = session.id,
            kick_username,
            amount,
            "guess recorded"
        );
        Ok(format!("Guess recorded: ${}", format_amount(amount)))
    }

    /// Sets the revealed result on a closed session and ranks the top three
    /// closest guesses. With no explicit id, exactly one closed session must
    /// exist; otherwise the caller is told to disambiguate.
    pub async fn set_result(
        &self,
        tenant_id: &str,
        session_id: Option<i64>,
        result_amount: f64,
    ) -> Result<String, GtbError> {
        if !(result_amount > 0.0) || !result_amount.is_finite() {
            return Ok("Result amount must be greater than 0".to_string());
        }

        let session = match session_id {
            Some(id) => match self.storage.gtb().fetch(id).await? {
                Some(session) if session.tenant_id == tenant_id => session,
                _ => return Ok(format!("Session #{id} not found")),
            },
            None => {
                let mut closed = self.storage.gtb().closed_sessions(tenant_id).await?;
                match closed.len() {
                    0 => {
                        return Ok(
                            "No closed session found. Close a session first with !gtbclose"
                                .to_string(),
                        )
                    }
                    1 => closed.remove(0),
                    _ => {
                        return Ok(
                            "Multiple closed sessions exist. \
                             Use !gtbresult #<session_id> <amount> to pick one."
                                .to_string(),
                        )
                    }
                }
            }
        };

        if session.status != GtbSessionStatus::Closed {
            return Ok(format!(
                "Session #{} is {}, not closed",
                session.id,
                session.status.as_str()
            ));
        }

        let ranked = self
            .storage
            .gtb()
            .top_guesses(session.id, result_amount, WINNER_LIMIT)
            .await?;
        if ranked.is_empty() {
            return Ok(format!("Session #{} has no guesses!", session.id));
        }

        let winners: Vec<GtbWinner> = ranked
            .into_iter()
            .enumerate()
            .map(|(i, guess)| GtbWinner {
                rank: i as u32 + 1,
                kick_username: guess.kick_username,
                guess_amount: guess.amount,
                result_amount,
                difference: guess.difference,
            })
            .collect();

        let now = (self.clock)();
        self.storage
            .gtb()
            .replace_winners(session.id, &winners, now)
            .await?;
        self.storage
            .gtb()
            .complete_with_result(session.id, result_amount)
            .await?;

        info!(
            stage = "gtb",
            tenant_id,
            session_id = session.id,
            result_amount,
            winners = winners.len(),
            "result set"
        );

        let podium = winners
            .iter()
            .map(|w| {
                format!(
                    "#{} {} (${}, off by ${})",
                    w.rank,
                    w.kick_username,
                    format_amount(w.guess_amount),
                    format_amount(w.difference)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "Results set! Balance was ${}. Winners: {podium}",
            format_amount(result_amount)
        ))
    }
}

/// Formats a dollar amount with thousands separators and two decimals.
pub fn format_amount(amount: f64) -> String {
    let negative = amount < 0.0;
    let cents = (amount.abs() * 100.0).round() as u128;
    let whole = cents / 100;
    let frac = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}{grouped}.{frac:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use chrono::{TimeZone, Utc};

    async fn engine(name: &str) -> GtbEngine {
        let db = Database::connect(&format!("sqlite:file:gtb_{name}?mode=memory&cache=shared"))
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        GtbEngine::new(db, fixed_clock(at))
    }

    #[test]
    fn amounts_format_with_thousands_separators() {
        assert_eq!(format_amount(1234567.5), "1,234,567.50");
        assert_eq!(format_amount(0.01), "0.01");
        assert_eq!(format_amount(999.0), "999.00");
    }

    #[tokio::test]
    async fn guess_without_open_session_yields_wait_reply() {
        let engine = engine("no_session").await;
        let reply = engine
            .submit_guess("t-1", "viewer", 100.0)
            .await
            .expect("submit");
        assert_eq!(reply, "No active GTB session. Wait for an admin to start one!");
    }

    #[tokio::test]
    async fn full_session_lifecycle_ranks_winners() {
        let engine = engine("lifecycle").await;

        let opened = engine.open_session("t-1", "admin").await.expect("open");
        assert!(opened.contains("opened"));

        engine.submit_guess("t-1", "alice", 900.0).await.expect("guess");
        engine.submit_guess("t-1", "bob", 1100.0).await.expect("guess");
        engine.submit_guess("t-1", "carol", 5000.0).await.expect("guess");

        let closed = engine.close_session("t-1").await.expect("close");
        assert!(closed.contains("3 guesses"));

        let reply = engine
            .set_result("t-1", None, 1000.0)
            .await
            .expect("result");
        assert!(reply.contains("Results set!"), "{reply}");
        assert!(reply.contains("#1 alice"), "{reply}");
        assert!(reply.contains("#2 bob"), "{reply}");
        assert!(reply.contains("#3 carol"), "{reply}");
    }

    #[tokio::test]
    async fn second_open_session_is_refused() {
        let engine = engine("second_open").await;
        engine.open_session("t-1", "admin").await.expect("open");
        let reply = engine.open_session("t-1", "other").await.expect("second");
        assert_eq!(reply, "A session is already open (opened by admin)");
    }

    #[tokio::test]
    async fn resubmitted_guess_overwrites() {
        let engine = engine("resubmit").await;
        engine.open_session("t-1", "admin").await.expect("open");
        engine.submit_guess("t-1", "alice", 500.0).await.expect("guess");
        engine.submit_guess("t-1", "alice", 990.0).await.expect("guess");
        engine.close_session("t-1").await.expect("close");

        let reply = engine
            .set_result("t-1", None, 1000.0)
            .await
            .expect("result");
        assert!(reply.contains("990.00"), "{reply}");
        assert!(!reply.contains("500.00"), "{reply}");
    }

    #[tokio::test]
    async fn ambiguous_result_requires_explicit_session_id() {
        let engine = engine("ambiguous").await;
        engine.open_session("t-1", "admin").await.expect("open");
        engine.submit_guess("t-1", "alice", 100.0).await.expect("guess");
        engine.close_session("t-1").await.expect("close");
        engine.open_session("t-1", "admin").await.expect("open");
        engine.submit_guess("t-1", "bob", 200.0).await.expect("guess");
        engine.close_session("t-1").await.expect("close");

        let reply = engine
            .set_result("t-1", None, 150.0)
            .await
            .expect("result");
        assert!(reply.contains("Multiple closed sessions"), "{reply}");

        let reply = engine
            .set_result("t-1", Some(1), 150.0)
            .await
            .expect("explicit");
        assert!(reply.contains("Results set!"), "{reply}");
    }

    #[tokio::test]
    async fn rejects_out_of_range_amounts() {
        let engine = engine("bounds").await;
        engine.open_session("t-1", "admin").await.expect("open");

        let reply = engine.submit_guess("t-1", "alice", 0.0).await.expect("zero");
        assert_eq!(reply, "Guess amount must be greater than 0");

        let reply = engine
            .submit_guess("t-1", "alice", MAX_GTB_AMOUNT + 1.0)
            .await
            .expect("huge");
        assert_eq!(reply, "Guess amount is too large");
    }
}
