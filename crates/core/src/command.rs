//! Chat command parsing for the Guess-the-Balance commands.

/// A recognized chat command.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// `!gtb <amount>` submits or replaces the sender's guess.
    Guess { amount: f64 },
    /// `!gtbopen` opens a new session (moderator only).
    OpenSession,
    /// `!gtbclose` stops accepting guesses (moderator only).
    CloseSession,
    /// `!gtbresult [#<id>] <amount>` records the result (moderator only).
    SetResult {
        session_id: Option<i64>,
        amount: f64,
    },
}

impl ChatCommand {
    /// Parses a chat line into a command, or `None` for ordinary chatter.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let mut parts = text.split_whitespace();
        let word = parts.next()?;
        if !word.starts_with('!') {
            return None;
        }

        match word.to_ascii_lowercase().as_str() {
            "!gtb" | "!guess" => {
                let amount = parse_amount(parts.next()?)?;
                Some(Self::Guess { amount })
            }
            "!gtbopen" => Some(Self::OpenSession),
            "!gtbclose" => Some(Self::CloseSession),
            "!gtbresult" => {
                let first = parts.next()?;
                if let Some(id_text) = first.strip_prefix('#') {
                    let session_id = id_text.parse::<i64>().ok().filter(|id| *id > 0)?;
                    let amount = parse_amount(parts.next()?)?;
                    Some(Self::SetResult {
                        session_id: Some(session_id),
                        amount,
                    })
                } else {
                    let amount = parse_amount(first)?;
                    Some(Self::SetResult {
                        session_id: None,
                        amount,
                    })
                }
            }
            _ => None,
        }
    }
}

/// Parses a dollar amount, tolerating a leading `$` and thousands commas.
///
/// Rejects non-positive amounts and anything above
/// [`crate::types::MAX_GTB_AMOUNT`].
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let amount = cleaned.parse::<f64>().ok()?;
    if !amount.is_finite() || amount <= 0.0 || amount > crate::types::MAX_GTB_AMOUNT {
        return None;
    }
    Some(amount)
}
