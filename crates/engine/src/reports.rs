//! Read-only summaries for the periodic reporting side

use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{DailyStats, Signal};

/// Aggregate of one reporting period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodSummary {
    pub date: NaiveDate,
    pub wins: u32,
    pub losses: u32,
    pub best_streak: u32,
    pub signals_sent: u32,
}

impl PeriodSummary {
    /// Win rate in percent, `None` when nothing resolved
    pub fn win_rate(&self) -> Option<f64> {
        let total = self.wins + self.losses;
        (total > 0).then(|| f64::from(self.wins) * 100.0 / f64::from(total))
    }
}

/// Wins and losses for reporting, as stored for the day. A stored zero is a
/// real count.
pub fn wins_losses(stats: &DailyStats) -> (u32, u32) {
    (stats.today_wins, stats.today_losses)
}

/// Longest run of consecutive wins, signals ordered oldest first
pub fn best_streak(signals: &[Signal]) -> u32 {
    let mut best = 0;
    let mut current = 0;
    for signal in signals {
        if signal.is_won() {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}

/// Resolved results over a rolling window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeriodCounts {
    pub wins: u32,
    pub losses: u32,
}

pub fn period_counts(signals: &[Signal]) -> PeriodCounts {
    signals.iter().fold(PeriodCounts::default(), |mut counts, s| {
        if s.is_won() {
            counts.wins += 1;
        } else if s.is_lost() {
            counts.losses += 1;
        }
        counts
    })
}

pub fn summarize(stats: &DailyStats, signals: &[Signal]) -> PeriodSummary {
    let (wins, losses) = wins_losses(stats);
    PeriodSummary {
        date: stats.date,
        wins,
        losses,
        best_streak: best_streak(signals),
        signals_sent: stats.signals_sent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ts;
    use crate::types::{Resolution, SignalStatus};
    use rust_decimal_macros::dec;

    fn signal(id: i64, won: bool) -> Signal {
        let resolution = Resolution {
            round_id: id,
            multiplier: if won { dec!(2.0) } else { dec!(1.0) },
            depth: 0,
            resolved_at: ts(id * 60),
        };
        Signal {
            id,
            trigger_round_id: id,
            target: dec!(1.5),
            status: if won {
                SignalStatus::Won(resolution)
            } else {
                SignalStatus::Lost(resolution)
            },
            notification_ref: None,
            created_at: ts(id * 60),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_best_streak() {
        let outcomes = [true, true, false, true, true, true, false, true];
        let signals: Vec<Signal> = outcomes
            .iter()
            .enumerate()
            .map(|(i, won)| signal(i as i64 + 1, *won))
            .collect();
        assert_eq!(best_streak(&signals), 3);
        assert_eq!(best_streak(&[]), 0);
        assert_eq!(
            period_counts(&signals),
            PeriodCounts { wins: 6, losses: 2 }
        );
    }

    #[test]
    fn test_wins_losses_prefers_today_counters() {
        let stats = DailyStats {
            today_wins: 4,
            today_losses: 1,
            signals_sent: 6,
            ..DailyStats::empty(day())
        };
        assert_eq!(wins_losses(&stats), (4, 1));
    }

    #[test]
    fn test_stored_zero_wins_are_kept() {
        let stats = DailyStats {
            losses: 2,
            today_losses: 2,
            signals_sent: 7,
            ..DailyStats::empty(day())
        };
        assert_eq!(wins_losses(&stats), (0, 2));
        assert_eq!(wins_losses(&DailyStats::empty(day())), (0, 0));
    }

    #[test]
    fn test_summarize() {
        let stats = DailyStats {
            today_wins: 2,
            today_losses: 1,
            signals_sent: 3,
            ..DailyStats::empty(day())
        };
        let signals = vec![signal(1, true), signal(2, false), signal(3, true)];
        let summary = summarize(&stats, &signals);
        assert_eq!(summary.best_streak, 1);
        assert_eq!((summary.wins, summary.losses), (2, 1));
        assert_eq!(summary.signals_sent, 3);
        let rate = summary.win_rate().unwrap();
        assert!((rate - 66.666).abs() < 0.01);
    }
}
