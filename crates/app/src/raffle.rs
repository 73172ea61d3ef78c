//! Raffle ticket ledger: gift-sub ticket fan-out and the provably-fair
//! period draw.

use chrono::Datelike;
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use kick_bridge_core::fair::{self, TicketDraw};
use kick_bridge_storage::{AwardOutcome, Database, StorageError};

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum RaffleError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome of a period draw, publishable for independent verification.
#[derive(Debug, Clone)]
pub struct RaffleDrawResult {
    pub period_id: i64,
    pub winner: String,
    pub draw: TicketDraw,
}

pub struct RaffleEngine {
    storage: Database,
    clock: Clock,
}

impl RaffleEngine {
    pub fn new(storage: Database, clock: Clock) -> Self {
        Self { storage, clock }
    }

    /// Credits one ticket per giftee against the tenant's active period,
    /// opening a period when none exists.
    ///
    /// Awards are keyed by the originating webhook message, so replays award
    /// nothing. A failure for one giftee is logged and the rest of the batch
    /// still runs.
    pub async fn award_gift_tickets(
        &self,
        tenant_id: &str,
        source_event_id: &str,
        giftees: &[String],
    ) -> Result<u32, RaffleError> {
        let now = (self.clock)();
        let label = format!("{:04}-{:02}", now.year(), now.month());
        let period_id = self
            .storage
            .raffles()
            .ensure_active_period(tenant_id, &label, now)
            .await?;

        let mut awarded = 0u32;
        for giftee in giftees {
            match self
                .storage
                .raffles()
                .award_tickets(period_id, giftee, 1, "gifted_sub", source_event_id, now)
                .await
            {
                Ok(AwardOutcome::Awarded) => {
                    awarded += 1;
                    counter!("ticket_awards_total", "source" => "gifted_sub").increment(1);
                }
                Ok(AwardOutcome::Duplicate) => {
                    info!(stage = "raffle", tenant_id, giftee, "duplicate award skipped");
                }
                Err(err) => {
                    warn!(
                        stage = "raffle",
                        tenant_id,
                        giftee,
                        error = %err,
                        "ticket award failed, continuing batch"
                    );
                }
            }
        }
        Ok(awarded)
    }

    /// Draws a winning ticket over the active period's standings and closes
    /// the period.
    ///
    /// Each participant holds a contiguous ticket range sized by their total;
    /// the winning ticket number comes from a seeded SHA-256 draw that anyone
    /// can recompute from the published proof.
    pub async fn draw_winner(
        &self,
        tenant_id: &str,
    ) -> Result<Option<RaffleDrawResult>, RaffleError> {
        let now = (self.clock)();
        let label = format!("{:04}-{:02}", now.year(), now.month());
        let period_id = self
            .storage
            .raffles()
            .ensure_active_period(tenant_id, &label, now)
            .await?;
        let standings = self.storage.raffles().standings(period_id).await?;
        if standings.is_empty() {
            return Ok(None);
        }

        let total_tickets: u64 = standings.iter().map(|s| s.tickets as u64).sum();
        let client_seed = format!("{period_id}:{total_tickets}:{}", standings.len());
        let nonce = period_id.to_string();
        let Some(draw) = fair::draw_ticket(&client_seed, &nonce, total_tickets) else {
            return Ok(None);
        };

        // Walk the contiguous ranges until the winning ticket falls inside.
        let mut cursor = 0u64;
        let mut winner = standings[0].kick_username.clone();
        for standing in &standings {
            cursor += standing.tickets as u64;
            if draw.winning_ticket <= cursor {
                winner = standing.kick_username.clone();
                break;
            }
        }

        self.storage.raffles().close_active_period(tenant_id).await?;
        info!(
            stage = "raffle",
            tenant_id,
            period_id,
            total_tickets,
            winning_ticket = draw.winning_ticket,
            winner = %winner,
            proof_hash = %draw.proof_hash,
            "raffle drawn"
        );
        Ok(Some(RaffleDrawResult { period_id, winner, draw }))
    }
}
