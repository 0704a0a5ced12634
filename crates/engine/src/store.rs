//! Store adapter: the persistence repositories seen through engine types
//!
//! Every call is bounded by the configured store timeout. Rows that cannot be
//! turned into engine types are skipped with a warning.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use persistence::repository::{
    DailyStatsRecord, DailyStatsRepository, EngineStateRepository, RoundRecord, RoundRepository,
    SignalRecord, SignalRepository, SignalResolution, STATUS_ACTIVE, STATUS_LOST, STATUS_WON,
};
use persistence::{timed, DbError, SqlitePool};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notifier::NotificationRef;
use crate::state::EngineState;
use crate::streak;
use crate::types::{DailyStats, Resolution, Round, Signal, SignalStatus};

/// Resolved signals scanned when restoring the streak
const STREAK_SCAN_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    timeout: Duration,
    timezone: Tz,
}

impl Store {
    pub fn new(pool: SqlitePool, config: &EngineConfig) -> Self {
        Self {
            pool,
            timeout: config.store_timeout(),
            timezone: config.timezone,
        }
    }

    /// Calendar day of `at` in the engine timezone
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// `[start, end)` of a local calendar day in unix milliseconds
    fn day_bounds(&self, date: NaiveDate) -> EngineResult<(i64, i64)> {
        let start = self.local_midnight(date)?;
        let next = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| EngineError::Malformed(format!("date out of range: {date}")))?;
        Ok((start, self.local_midnight(next)?))
    }

    fn local_midnight(&self, date: NaiveDate) -> EngineResult<i64> {
        date.and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.timezone.from_local_datetime(&midnight).earliest())
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| EngineError::Malformed(format!("no local midnight on {date}")))
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    /// Returns false when the round id is already stored
    pub async fn insert_round(&self, round: &Round) -> EngineResult<bool> {
        let record = RoundRecord {
            id: round.id,
            multiplier: round.multiplier.to_string(),
            observed_at: round.observed_at.timestamp_millis(),
        };
        let inserted = timed(self.timeout, RoundRepository::new(&self.pool).insert(&record)).await?;
        Ok(inserted)
    }

    /// The newest rounds, newest first
    pub async fn recent_rounds(&self, limit: usize) -> EngineResult<Vec<Round>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = timed(self.timeout, RoundRepository::new(&self.pool).recent(limit)).await?;

        Ok(records
            .into_iter()
            .filter_map(|record| match round_from_record(&record) {
                Ok(round) => Some(round),
                Err(e) => {
                    warn!(round_id = record.id, error = %e, "Skipping malformed round");
                    None
                }
            })
            .collect())
    }

    pub async fn latest_round_id(&self) -> EngineResult<Option<i64>> {
        let latest = timed(self.timeout, RoundRepository::new(&self.pool).latest_id()).await?;
        Ok(latest)
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    pub async fn open_signal(&self) -> EngineResult<Option<Signal>> {
        let record = timed(self.timeout, SignalRepository::new(&self.pool).find_open()).await?;
        record.as_ref().map(signal_from_record).transpose()
    }

    /// Insert a new active signal. `None` when the store already holds an open one.
    pub async fn insert_signal(
        &self,
        trigger_round_id: i64,
        target: Decimal,
        created_at: DateTime<Utc>,
    ) -> EngineResult<Option<i64>> {
        let target = target.to_string();
        let result = timed(
            self.timeout,
            SignalRepository::new(&self.pool).insert_open(
                trigger_round_id,
                &target,
                created_at.timestamp_millis(),
            ),
        )
        .await;

        match result {
            Ok(id) => Ok(Some(id)),
            Err(DbError::Conflict(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move `signal` to gale `to_depth`. False if someone else already moved it.
    pub async fn escalate(&self, signal: &Signal, to_depth: u8) -> EngineResult<bool> {
        let to_status = SignalStatus::Gale { depth: to_depth }.label();
        let moved = timed(
            self.timeout,
            SignalRepository::new(&self.pool).escalate(
                signal.id,
                i64::from(signal.status.depth()),
                &to_status,
                i64::from(to_depth),
            ),
        )
        .await?;
        Ok(moved)
    }

    /// Close `signal` with a terminal status. False if it was no longer open at its depth.
    pub async fn resolve(&self, signal: &Signal, outcome: &SignalStatus) -> EngineResult<bool> {
        let (status, resolution) = match outcome {
            SignalStatus::Won(r) => (STATUS_WON, r),
            SignalStatus::Lost(r) => (STATUS_LOST, r),
            open => {
                return Err(EngineError::Malformed(format!(
                    "cannot resolve signal {} as {open}",
                    signal.id
                )))
            }
        };
        let multiplier = resolution.multiplier.to_string();
        let write = SignalResolution {
            status,
            result_round_id: resolution.round_id,
            result_multiplier: &multiplier,
            resolved_at: resolution.resolved_at.timestamp_millis(),
        };
        let closed = timed(
            self.timeout,
            SignalRepository::new(&self.pool).resolve(
                signal.id,
                i64::from(signal.status.depth()),
                &write,
            ),
        )
        .await?;
        Ok(closed)
    }

    pub async fn set_notification_ref(
        &self,
        signal_id: i64,
        reference: &NotificationRef,
    ) -> EngineResult<()> {
        timed(
            self.timeout,
            SignalRepository::new(&self.pool).set_notification_ref(signal_id, reference.as_str()),
        )
        .await?;
        Ok(())
    }

    /// Resolved signals created on a local calendar day, oldest first
    pub async fn signals_for_date(&self, date: NaiveDate) -> EngineResult<Vec<Signal>> {
        let (start, end) = self.day_bounds(date)?;
        let records = timed(
            self.timeout,
            SignalRepository::new(&self.pool).resolved_created_between(start, end),
        )
        .await?;
        Ok(signals_from_records(records))
    }

    /// Resolved signals created at or after `since`, oldest first
    pub async fn signals_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<Signal>> {
        let records = timed(
            self.timeout,
            SignalRepository::new(&self.pool).resolved_created_since(since.timestamp_millis()),
        )
        .await?;
        Ok(signals_from_records(records))
    }

    /// Current run of wins in resolved history, newest first
    pub async fn consecutive_wins(&self) -> EngineResult<u32> {
        let statuses = timed(
            self.timeout,
            SignalRepository::new(&self.pool).recent_resolved_statuses(STREAK_SCAN_LIMIT),
        )
        .await?;
        Ok(streak::leading_wins(statuses.iter().map(String::as_str)))
    }

    // -----------------------------------------------------------------------
    // Daily stats
    // -----------------------------------------------------------------------

    /// Counters for `date`, zeroed when the day has no row yet
    pub async fn daily_stats(&self, date: NaiveDate) -> EngineResult<DailyStats> {
        let key = date.to_string();
        let record = timed(self.timeout, DailyStatsRepository::new(&self.pool).get(&key)).await?;
        Ok(record
            .map(|r| stats_from_record(date, &r))
            .unwrap_or_else(|| DailyStats::empty(date)))
    }

    pub async fn record_signal_sent(&self, date: NaiveDate) -> EngineResult<()> {
        let key = date.to_string();
        timed(
            self.timeout,
            DailyStatsRepository::new(&self.pool).record_signal_sent(&key),
        )
        .await?;
        Ok(())
    }

    pub async fn record_win(&self, date: NaiveDate) -> EngineResult<()> {
        let key = date.to_string();
        timed(self.timeout, DailyStatsRepository::new(&self.pool).record_win(&key)).await?;
        Ok(())
    }

    pub async fn record_loss(&self, date: NaiveDate) -> EngineResult<()> {
        let key = date.to_string();
        timed(self.timeout, DailyStatsRepository::new(&self.pool).record_loss(&key)).await?;
        Ok(())
    }

    pub async fn reset_display_counters(&self, date: NaiveDate) -> EngineResult<()> {
        let key = date.to_string();
        timed(
            self.timeout,
            DailyStatsRepository::new(&self.pool).reset_display_counters(&key),
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Engine state
    // -----------------------------------------------------------------------

    /// The state document and its version (`None` before the first write)
    pub async fn load_state(&self) -> EngineResult<(EngineState, Option<i64>)> {
        let record = timed(self.timeout, EngineStateRepository::new(&self.pool).load()).await?;
        match record {
            Some(record) => {
                let state = serde_json::from_str(&record.document)?;
                Ok((state, Some(record.version)))
            }
            None => Ok((EngineState::default(), None)),
        }
    }

    /// Write `state` if the stored version is still `expected`
    pub async fn swap_state(&self, expected: Option<i64>, state: &EngineState) -> EngineResult<bool> {
        let document = serde_json::to_string(state)?;
        let swapped = timed(
            self.timeout,
            EngineStateRepository::new(&self.pool).compare_and_swap(expected, &document),
        )
        .await?;
        Ok(swapped)
    }
}

// ---------------------------------------------------------------------------
// Record conversion
// ---------------------------------------------------------------------------

fn timestamp(ms: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::Malformed(format!("timestamp out of range: {ms}")))
}

fn decimal(text: &str) -> EngineResult<Decimal> {
    Decimal::from_str(text).map_err(|e| EngineError::Malformed(format!("decimal {text:?}: {e}")))
}

fn round_from_record(record: &RoundRecord) -> EngineResult<Round> {
    Ok(Round::new(
        record.id,
        decimal(&record.multiplier)?,
        timestamp(record.observed_at)?,
    ))
}

fn signal_from_record(record: &SignalRecord) -> EngineResult<Signal> {
    let depth = u8::try_from(record.gale_depth)
        .map_err(|_| EngineError::Malformed(format!("gale depth {}", record.gale_depth)))?;

    let resolution = || -> EngineResult<Resolution> {
        let missing = || EngineError::Malformed(format!("signal {} lacks its result", record.id));
        Ok(Resolution {
            round_id: record.result_round_id.ok_or_else(missing)?,
            multiplier: decimal(record.result_multiplier.as_deref().ok_or_else(missing)?)?,
            depth,
            resolved_at: timestamp(record.resolved_at.ok_or_else(missing)?)?,
        })
    };

    let status = match record.status.as_str() {
        STATUS_ACTIVE => SignalStatus::Active,
        STATUS_WON => SignalStatus::Won(resolution()?),
        STATUS_LOST => SignalStatus::Lost(resolution()?),
        gale if gale.starts_with("gale") && depth > 0 => SignalStatus::Gale { depth },
        other => {
            return Err(EngineError::Malformed(format!(
                "signal {} has unknown status {other:?}",
                record.id
            )))
        }
    };

    Ok(Signal {
        id: record.id,
        trigger_round_id: record.trigger_round_id,
        target: decimal(&record.target)?,
        status,
        notification_ref: record.notification_ref.clone().map(NotificationRef::new),
        created_at: timestamp(record.created_at)?,
    })
}

fn signals_from_records(records: Vec<SignalRecord>) -> Vec<Signal> {
    records
        .iter()
        .filter_map(|record| match signal_from_record(record) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(signal_id = record.id, error = %e, "Skipping malformed signal");
                None
            }
        })
        .collect()
}

fn stats_from_record(date: NaiveDate, record: &DailyStatsRecord) -> DailyStats {
    let count = |v: i64| u32::try_from(v.max(0)).unwrap_or(u32::MAX);
    DailyStats {
        date,
        wins: count(record.wins),
        losses: count(record.losses),
        signals_sent: count(record.signals_sent),
        today_wins: count(record.today_wins),
        today_losses: count(record.today_losses),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_store, ts};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_second_insert_reports_conflict_as_none() {
        let store = test_store().await;
        let first = store.insert_signal(3, dec!(1.5), ts(0)).await.unwrap();
        assert!(first.is_some());
        assert_eq!(store.insert_signal(4, dec!(1.5), ts(1)).await.unwrap(), None);

        let open = store.open_signal().await.unwrap().unwrap();
        assert_eq!(open.id, first.unwrap());
        assert_eq!(open.status, SignalStatus::Active);
    }

    #[tokio::test]
    async fn test_resolution_round_trips_through_store() {
        let store = test_store().await;
        let id = store.insert_signal(3, dec!(1.8), ts(0)).await.unwrap().unwrap();
        let open = store.open_signal().await.unwrap().unwrap();
        assert!(store.escalate(&open, 1).await.unwrap());

        let gale = store.open_signal().await.unwrap().unwrap();
        assert_eq!(gale.status, SignalStatus::Gale { depth: 1 });

        let won = SignalStatus::Won(Resolution {
            round_id: 5,
            multiplier: dec!(1.9),
            depth: 1,
            resolved_at: ts(120),
        });
        assert!(store.resolve(&gale, &won).await.unwrap());
        // Stale copy cannot resolve again
        assert!(!store.resolve(&gale, &won).await.unwrap());
        assert!(store.open_signal().await.unwrap().is_none());

        let today = store.local_date(ts(0));
        let signals = store.signals_for_date(today).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].id, id);
        assert_eq!(signals[0].status, won);
    }

    #[tokio::test]
    async fn test_malformed_round_rows_are_skipped() {
        let store = test_store().await;
        store
            .insert_round(&Round::new(1, dec!(1.5), ts(0)))
            .await
            .unwrap();
        insert_raw_round(&store, 2, "not-a-number").await;

        let rounds = store.recent_rounds(10).await.unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].id, 1);
        assert_eq!(store.latest_round_id().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_missing_day_reads_as_zero() {
        let store = test_store().await;
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(store.daily_stats(date).await.unwrap(), DailyStats::empty(date));
    }

    #[tokio::test]
    async fn test_day_bounds_follow_local_midnight() {
        let store = test_store().await;
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let (start, end) = store.day_bounds(date).unwrap();
        // Sao Paulo midnight is 03:00 UTC
        let expected = Utc.with_ymd_and_hms(2026, 3, 14, 3, 0, 0).unwrap();
        assert_eq!(start, expected.timestamp_millis());
        assert_eq!(end - start, 24 * 3600 * 1000);
    }

    async fn insert_raw_round(store: &Store, id: i64, multiplier: &str) {
        let record = RoundRecord {
            id,
            multiplier: multiplier.to_string(),
            observed_at: 0,
        };
        RoundRepository::new(&store.pool).insert(&record).await.unwrap();
    }
}
