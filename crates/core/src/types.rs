use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest accepted guess/result amount: 12 integer digits, 2 decimals.
pub const MAX_GTB_AMOUNT: f64 = 999_999_999_999.99;

/// Lifecycle of a Guess-the-Balance session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GtbSessionStatus {
    Open,
    Closed,
    Completed,
}

impl GtbSessionStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A Guess-the-Balance session as persisted per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtbSession {
    pub id: i64,
    pub tenant_id: String,
    pub opened_by: String,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_amount: Option<f64>,
    pub status: GtbSessionStatus,
}

/// Winner row derived from guesses and the session result.
///
/// Ranking is ascending |guess - result| with ties broken by the earliest
/// guess timestamp; recomputation is idempotent (clear-then-reinsert).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtbWinner {
    pub rank: u32,
    pub kick_username: String,
    pub guess_amount: f64,
    pub result_amount: f64,
    pub difference: f64,
}

/// Lifecycle of a giveaway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveawayStatus {
    Pending,
    Active,
    Completed,
}

impl GiveawayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// How viewers qualify for a giveaway entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMethod {
    Keyword,
    ActiveChatter,
}

impl EntryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::ActiveChatter => "active_chatter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keyword" => Some(Self::Keyword),
            "active_chatter" => Some(Self::ActiveChatter),
            _ => None,
        }
    }
}

/// A giveaway as persisted per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Giveaway {
    pub id: i64,
    pub tenant_id: String,
    pub title: String,
    pub entry_method: EntryMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    pub messages_required: u32,
    pub time_window_minutes: u32,
    pub allow_multiple_entries: bool,
    pub max_entries_per_user: u32,
    pub status: GiveawayStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
}

/// A single user's entries in a giveaway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiveawayEntry {
    pub kick_username: String,
    pub entry_count: u32,
    pub entry_method: EntryMethod,
}
