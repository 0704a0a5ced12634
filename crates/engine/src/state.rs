//! Persisted engine state
//!
//! All cross-invocation governance state lives in one versioned JSON document.
//! Changes go through [`update`], a compare-and-set loop against the stored
//! version, so a keep-alive tick and a round evaluation never overwrite each other.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::governor::{HourlyCounter, TimeWindow};
use crate::notifier::NotificationRef;
use crate::store::Store;

/// Attempts before an update gives up with `EngineError::Contention`
const MAX_CAS_ATTEMPTS: usize = 5;

/// Volatility cooldown as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatilityWindow {
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub until: DateTime<Utc>,
    /// One-shot flag for the midpoint notice
    pub midpoint_sent: bool,
}

impl VolatilityWindow {
    pub fn new(started_at: DateTime<Utc>, minutes: u32) -> Self {
        let duration_secs = i64::from(minutes) * 60;
        Self {
            started_at,
            duration_secs,
            until: started_at + Duration::seconds(duration_secs),
            midpoint_sent: false,
        }
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.started_at,
            length: self.until - self.started_at,
        }
    }

    pub fn minutes(&self) -> u32 {
        u32::try_from(self.duration_secs / 60).unwrap_or(u32::MAX)
    }

    /// Whole minutes left at `now`, rounded up
    pub fn minutes_left(&self, now: DateTime<Utc>) -> u32 {
        let secs = (self.until - now).num_seconds().max(0);
        u32::try_from((secs + 59) / 60).unwrap_or(u32::MAX)
    }
}

/// The pre-signal marker of the current run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreSignalRun {
    pub sent: bool,
    pub reference: Option<NotificationRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineState {
    /// Highest round id already evaluated
    pub last_round_id: Option<i64>,
    /// Last daily open event
    pub session_reopened_at: Option<DateTime<Utc>>,
    pub cooldown_until_round_id: Option<i64>,
    pub volatility: Option<VolatilityWindow>,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub last_keep_alive_variant: Option<u8>,
    pub pre_signal: PreSignalRun,
    pub last_pre_signal_at: Option<DateTime<Utc>>,
    pub interrupted_at: Option<DateTime<Utc>>,
    pub hourly: HourlyCounter,
    pub streak: u32,
    pub last_celebrated: u32,
}

impl EngineState {
    /// Clear the run marker, returning the reference of its pre-signal
    pub fn take_pre_signal(&mut self) -> Option<NotificationRef> {
        std::mem::take(&mut self.pre_signal).reference
    }
}

pub async fn load(store: &Store) -> EngineResult<EngineState> {
    let (state, _) = store.load_state().await?;
    Ok(state)
}

/// Apply `change` to the stored state with compare-and-set, retrying on lost races.
///
/// `change` is re-run against the freshly loaded state on every attempt, so its
/// return value always describes the write that was committed. When `change`
/// leaves the state as it was nothing is written.
pub async fn update<T, F>(store: &Store, mut change: F) -> EngineResult<T>
where
    F: FnMut(&mut EngineState) -> T,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let (current, version) = store.load_state().await?;
        let mut next = current.clone();
        let outcome = change(&mut next);
        if next == current {
            return Ok(outcome);
        }
        if store.swap_state(version, &next).await? {
            return Ok(outcome);
        }
        debug!(attempt, "Engine state changed concurrently, retrying");
    }
    Err(EngineError::Contention(MAX_CAS_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_store;

    #[tokio::test]
    async fn test_missing_document_loads_default() {
        let store = test_store().await;
        assert_eq!(load(&store).await.unwrap(), EngineState::default());
    }

    #[tokio::test]
    async fn test_update_persists_and_returns_closure_value() {
        let store = test_store().await;

        let claimed = update(&store, |state| {
            state.streak += 1;
            state.streak
        })
        .await
        .unwrap();
        assert_eq!(claimed, 1);

        update(&store, |state| state.streak += 1).await.unwrap();
        assert_eq!(load(&store).await.unwrap().streak, 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let store = test_store().await;
        update(&store, |state| state.streak = 1).await.unwrap();

        let (a, b) = tokio::join!(
            update(&store, |state| state.streak += 1),
            update(&store, |state| state.last_celebrated += 3),
        );
        a.unwrap();
        b.unwrap();

        let state = load(&store).await.unwrap();
        assert_eq!(state.streak, 2);
        assert_eq!(state.last_celebrated, 3);
    }

    #[tokio::test]
    async fn test_stale_swap_is_rejected() {
        let store = test_store().await;
        update(&store, |state| state.streak = 1).await.unwrap();
        let (state, version) = store.load_state().await.unwrap();

        assert!(store.swap_state(version, &state).await.unwrap());
        assert!(!store.swap_state(version, &state).await.unwrap());
    }

    #[test]
    fn test_unknown_fields_tolerated_and_missing_defaulted() {
        let state: EngineState =
            serde_json::from_str(r#"{"streak": 4, "legacy_flag": true}"#).unwrap();
        assert_eq!(state.streak, 4);
        assert_eq!(state.pre_signal, PreSignalRun::default());
    }

    #[test]
    fn test_volatility_minutes_left_rounds_up() {
        let start = Utc::now();
        let window = VolatilityWindow::new(start, 6);
        assert_eq!(window.minutes(), 6);
        assert_eq!(window.minutes_left(start + Duration::seconds(30)), 6);
        assert_eq!(window.minutes_left(start + Duration::minutes(3)), 3);
        assert_eq!(window.minutes_left(start + Duration::minutes(7)), 0);
    }
}
