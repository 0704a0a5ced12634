//! Types for the signal engine

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::governor::Suppression;
use crate::notifier::NotificationRef;

/// One observed round. Ids are assigned by the ingestion side in strictly increasing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub multiplier: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl Round {
    pub fn new(id: i64, multiplier: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            multiplier,
            observed_at,
        }
    }
}

/// Parse a multiplier, tolerating a trailing `x` and thousands separators
pub fn parse_multiplier(raw: &str) -> EngineResult<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_end_matches(['x', 'X'])
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let value = Decimal::from_str(cleaned.trim())
        .map_err(|e| EngineError::Malformed(format!("multiplier {raw:?}: {e}")))?;
    if value.is_sign_negative() {
        return Err(EngineError::Malformed(format!("negative multiplier {raw:?}")));
    }
    Ok(value)
}

/// How an open signal ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub round_id: i64,
    pub multiplier: Decimal,
    /// Gale depth at the moment of resolution (0 = first entry)
    pub depth: u8,
    pub resolved_at: DateTime<Utc>,
}

/// Lifecycle of a signal. `Active` and `Gale` are open, `Won` and `Lost` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalStatus {
    Active,
    Gale { depth: u8 },
    Won(Resolution),
    Lost(Resolution),
}

impl SignalStatus {
    pub fn depth(&self) -> u8 {
        match self {
            SignalStatus::Active => 0,
            SignalStatus::Gale { depth } => *depth,
            SignalStatus::Won(r) | SignalStatus::Lost(r) => r.depth,
        }
    }

    /// Stored status label
    pub fn label(&self) -> String {
        match self {
            SignalStatus::Active => "active".to_string(),
            SignalStatus::Gale { depth } => format!("gale{depth}"),
            SignalStatus::Won(_) => "won".to_string(),
            SignalStatus::Lost(_) => "lost".to_string(),
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One notification lifecycle instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub trigger_round_id: i64,
    pub target: Decimal,
    pub status: SignalStatus,
    pub notification_ref: Option<NotificationRef>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn is_won(&self) -> bool {
        matches!(self.status, SignalStatus::Won(_))
    }

    pub fn is_lost(&self) -> bool {
        matches!(self.status, SignalStatus::Lost(_))
    }
}

/// Per-day counters in the engine timezone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub wins: u32,
    pub losses: u32,
    pub signals_sent: u32,
    pub today_wins: u32,
    pub today_losses: u32,
}

impl DailyStats {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            wins: 0,
            losses: 0,
            signals_sent: 0,
            today_wins: 0,
            today_losses: 0,
        }
    }
}

/// `today_wins` as stored: signals sent minus today's losses, floored at zero
pub fn derive_today_wins(signals_sent: u32, today_losses: u32) -> u32 {
    signals_sent.saturating_sub(today_losses)
}

/// Consecutive sub-threshold rounds from the newest and how many are still missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMonitoring {
    pub count: usize,
    pub remaining: usize,
}

/// What happened to an open signal on a new round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    Won { signal_id: i64, depth: u8 },
    Gale { signal_id: i64, depth: u8 },
    Lost { signal_id: i64 },
    /// Another caller already moved the signal on
    Superseded { signal_id: i64 },
}

/// Result of feeding one round to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Round id already processed
    Duplicate,
    Resolved(Transition),
    SignalCreated { signal_id: i64 },
    PreSignalSent,
    RunInterrupted { announced: bool },
    VolatilityEntered { minutes: u32 },
    Suppressed { reason: Suppression },
    /// Nothing to do for this round
    Idle,
    /// Store or state failure; the cycle was skipped
    Skipped,
}

/// Result of a keep-alive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "keep_alive", rename_all = "snake_case")]
pub enum KeepAlive {
    Sent { variant: u8 },
    Suppressed { reason: Suppression },
    /// Channel not silent long enough, or nothing was ever sent
    NotDue,
}
