//! Provably-fair roll generation and verification.
//!
//! A roll commits to a server seed, a client seed derived from the request,
//! and a nonce. Publishing the proof lets anyone recompute the SHA-256 digest
//! and confirm the outcome was not picked after the fact.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A complete, publishable proof for one roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairProof {
    pub server_seed: String,
    pub client_seed: String,
    pub nonce: String,
    pub proof_hash: String,
    /// Uniform value in `[0.0, 100.0)` with two decimals of resolution.
    pub random_value: f64,
    pub win_chance: f64,
    pub won: bool,
}

/// Outcome of re-checking a published proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    HashMismatch,
    ValueMismatch,
}

impl Verification {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Builds the client seed from the request identity.
pub fn client_seed(username: &str, request_id: &str, context: &str) -> String {
    format!("{username}:{request_id}:{context}")
}

fn roll(server_seed: &str, client_seed: &str, nonce: &str) -> (String, f64) {
    let combined = format!("{server_seed}:{client_seed}:{nonce}");
    let digest = Sha256::digest(combined.as_bytes());
    let hash = hex::encode(digest);
    // The first 8 hex characters give 32 bits of entropy, folded into
    // a value on [0, 100) with 0.01 steps.
    let head = u32::from_str_radix(&hash[..8], 16).unwrap_or(0);
    let value = f64::from(head % 10_000) / 100.0;
    (hash, value)
}

/// Generates a fresh proof for one roll against `win_chance` percent.
///
/// The win condition is a strict inequality, so a chance of 0.0 can never
/// win and a chance of 100.0 always does.
pub fn generate(username: &str, request_id: &str, context: &str, win_chance: f64) -> FairProof {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    generate_with_seed(&hex::encode(seed), username, request_id, context, win_chance)
}

/// Same as [`generate`] but with a caller-supplied server seed.
pub fn generate_with_seed(
    server_seed: &str,
    username: &str,
    request_id: &str,
    context: &str,
    win_chance: f64,
) -> FairProof {
    let client_seed = client_seed(username, request_id, context);
    let nonce = request_id.to_string();
    let (proof_hash, random_value) = roll(server_seed, &client_seed, &nonce);
    FairProof {
        server_seed: server_seed.to_string(),
        client_seed,
        nonce,
        proof_hash,
        random_value,
        win_chance,
        won: random_value < win_chance,
    }
}

/// A provably-fair ticket draw over `total_tickets` numbered tickets.
///
/// The winning ticket is in `1..=total_tickets`, derived from the first 16
/// hex characters of the proof hash so large ticket pools stay unbiased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketDraw {
    pub server_seed: String,
    pub client_seed: String,
    pub nonce: String,
    pub proof_hash: String,
    pub total_tickets: u64,
    pub winning_ticket: u64,
}

/// Draws a winning ticket with a fresh server seed.
pub fn draw_ticket(client_seed: &str, nonce: &str, total_tickets: u64) -> Option<TicketDraw> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    draw_ticket_with_seed(&hex::encode(seed), client_seed, nonce, total_tickets)
}

/// Same as [`draw_ticket`] but with a caller-supplied server seed.
pub fn draw_ticket_with_seed(
    server_seed: &str,
    client_seed: &str,
    nonce: &str,
    total_tickets: u64,
) -> Option<TicketDraw> {
    if total_tickets == 0 {
        return None;
    }
    let combined = format!("{server_seed}:{client_seed}:{nonce}");
    let proof_hash = hex::encode(Sha256::digest(combined.as_bytes()));
    let head = u64::from_str_radix(&proof_hash[..16], 16).unwrap_or(0);
    Some(TicketDraw {
        server_seed: server_seed.to_string(),
        client_seed: client_seed.to_string(),
        nonce: nonce.to_string(),
        proof_hash,
        total_tickets,
        winning_ticket: head % total_tickets + 1,
    })
}

/// Recomputes a ticket draw and checks the published outcome.
pub fn verify_ticket_draw(draw: &TicketDraw) -> bool {
    draw_ticket_with_seed(
        &draw.server_seed,
        &draw.client_seed,
        &draw.nonce,
        draw.total_tickets,
    )
    .map(|fresh| fresh == *draw)
    .unwrap_or(false)
}

/// Recomputes the roll and checks it against the published proof.
///
/// The hash must match exactly; the value is allowed a tolerance of 0.01
/// to absorb decimal formatting differences.
pub fn verify(proof: &FairProof) -> Verification {
    let (hash, value) = roll(&proof.server_seed, &proof.client_seed, &proof.nonce);
    if hash != proof.proof_hash {
        return Verification::HashMismatch;
    }
    if (value - proof.random_value).abs() > 0.01 {
        return Verification::ValueMismatch;
    }
    Verification::Valid
}
