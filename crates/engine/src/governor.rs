//! Cooldown and rate governance
//!
//! Every suppressor is answered here from the persisted [`EngineState`] and
//! the current time. Three window primitives cover all of them: a window
//! counted in round ids, a wall-clock window, and an integer hour bucket.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::state::{EngineState, VolatilityWindow};

const SECS_PER_BUCKET: i64 = 3600;

// ---------------------------------------------------------------------------
// Window primitives
// ---------------------------------------------------------------------------

/// Active while the newest round id is below `until`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundWindow {
    pub until: i64,
}

impl RoundWindow {
    /// An unknown latest round counts as inside the window
    pub fn is_active(&self, latest_round_id: Option<i64>) -> bool {
        latest_round_id.map_or(true, |latest| latest < self.until)
    }
}

/// Active from `start` for `length`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub length: Duration,
}

impl TimeWindow {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.length
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.start && now < self.end()
    }

    pub fn midpoint(&self) -> DateTime<Utc> {
        self.start + self.length / 2
    }
}

/// Integer hour bucket of a timestamp
pub fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(SECS_PER_BUCKET)
}

/// Cancellations and confirmations inside one hour bucket.
/// A counter from an older bucket reads as empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyCounter {
    pub bucket: i64,
    pub interrupts: u32,
    pub confirms: u32,
}

impl HourlyCounter {
    /// The counter as seen from `bucket`
    pub fn current(&self, bucket: i64) -> HourlyCounter {
        if self.bucket == bucket {
            *self
        } else {
            HourlyCounter {
                bucket,
                interrupts: 0,
                confirms: 0,
            }
        }
    }

    pub fn record_interrupt(&mut self, at: DateTime<Utc>) {
        *self = self.current(hour_bucket(at));
        self.interrupts += 1;
    }

    pub fn record_confirm(&mut self, at: DateTime<Utc>) {
        *self = self.current(hour_bucket(at));
        self.confirms += 1;
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Why the engine held back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    PostLoss,
    Volatility,
    Interrupted,
    SessionClosed,
    PreSignalInterval,
    /// Trigger reached without a pre-signal for the run
    NoPreSignal,
    SignalOpen,
}

#[derive(Debug, Clone)]
pub struct Governor {
    cooldown_rounds: i64,
    volatility_min_minutes: u32,
    volatility_max_minutes: u32,
    interrupted_cooldown: Duration,
    pre_signal_min_interval: Duration,
    max_interrupts_per_hour: u32,
    max_interrupt_rate: f64,
    keep_alive_silence: Duration,
    operating_hours_only: bool,
    session_open_hour: u32,
    session_close_hour: u32,
    timezone: Tz,
}

impl Governor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cooldown_rounds: config.cooldown_rounds,
            volatility_min_minutes: config.volatility_min_minutes,
            volatility_max_minutes: config.volatility_max_minutes,
            interrupted_cooldown: Duration::seconds(config.interrupted_cooldown_secs),
            pre_signal_min_interval: Duration::seconds(config.pre_signal_min_interval_secs),
            max_interrupts_per_hour: config.max_interrupts_per_hour,
            max_interrupt_rate: config.max_interrupt_rate,
            keep_alive_silence: Duration::minutes(config.keep_alive_silence_minutes),
            operating_hours_only: config.operating_hours_only,
            session_open_hour: config.session_open_hour,
            session_close_hour: config.session_close_hour,
            timezone: config.timezone,
        }
    }

    /// Post-loss window starting at the losing round
    pub fn post_loss_window(&self, lost_round_id: i64) -> RoundWindow {
        RoundWindow {
            until: lost_round_id + self.cooldown_rounds,
        }
    }

    pub fn post_loss_active(&self, state: &EngineState, latest_round_id: Option<i64>) -> bool {
        state
            .cooldown_until_round_id
            .map(|until| RoundWindow { until })
            .is_some_and(|window| window.is_active(latest_round_id))
    }

    pub fn volatility_active(&self, state: &EngineState, now: DateTime<Utc>) -> bool {
        state
            .volatility
            .as_ref()
            .is_some_and(|v| v.window().is_active(now))
    }

    /// New volatility window starting at `now`, random length within the configured minutes
    pub fn open_volatility(&self, now: DateTime<Utc>) -> VolatilityWindow {
        let minutes = rand::thread_rng()
            .gen_range(self.volatility_min_minutes..=self.volatility_max_minutes);
        VolatilityWindow::new(now, minutes)
    }

    pub fn interrupted_active(&self, state: &EngineState, now: DateTime<Utc>) -> bool {
        state.interrupted_at.is_some_and(|at| {
            TimeWindow {
                start: at,
                length: self.interrupted_cooldown,
            }
            .is_active(now)
        })
    }

    /// Inside the nightly closed window and not reopened since it began
    pub fn session_closed(&self, state: &EngineState, now: DateTime<Utc>) -> bool {
        if !self.operating_hours_only {
            return false;
        }
        let Some(closed_since) = self.closed_window_start(now) else {
            return false;
        };
        !state
            .session_reopened_at
            .is_some_and(|reopened| reopened >= closed_since)
    }

    /// Start of the closed window containing `now`, if `now` is inside one
    fn closed_window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (open, close) = (self.session_open_hour, self.session_close_hour);
        if open == close {
            return None;
        }
        let local = now.with_timezone(&self.timezone);
        let hour = local.hour();
        let inside = if close > open {
            hour >= close || hour < open
        } else {
            hour >= close && hour < open
        };
        if !inside {
            return None;
        }

        let mut day = local.date_naive();
        if hour < close {
            day = day.pred_opt()?;
        }
        let naive = day.and_time(NaiveTime::from_hms_opt(close, 0, 0)?);
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .map(|start| start.with_timezone(&Utc))
    }

    /// Whether a pre-signal may go out now
    pub fn pre_signal_block(&self, state: &EngineState, now: DateTime<Utc>) -> Option<Suppression> {
        if self.interrupted_active(state, now) {
            return Some(Suppression::Interrupted);
        }
        let too_soon = state
            .last_pre_signal_at
            .is_some_and(|at| now - at < self.pre_signal_min_interval);
        too_soon.then_some(Suppression::PreSignalInterval)
    }

    /// Whether an interrupted run may be announced, or must be retracted instead
    pub fn cancellation_allowed(&self, state: &EngineState, now: DateTime<Utc>) -> bool {
        let counter = state.hourly.current(hour_bucket(now));
        if counter.interrupts >= self.max_interrupts_per_hour {
            return false;
        }
        let total = counter.interrupts + counter.confirms;
        if total == 0 {
            return true;
        }
        f64::from(counter.interrupts) / f64::from(total) < self.max_interrupt_rate
    }

    /// Cooldowns that silence keep-alives
    pub fn keep_alive_block(
        &self,
        state: &EngineState,
        latest_round_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Option<Suppression> {
        if self.post_loss_active(state, latest_round_id) {
            Some(Suppression::PostLoss)
        } else if self.volatility_active(state, now) {
            Some(Suppression::Volatility)
        } else if self.interrupted_active(state, now) {
            Some(Suppression::Interrupted)
        } else {
            None
        }
    }

    /// Channel silent long enough for a keep-alive. Never true before the first message.
    pub fn keep_alive_due(&self, state: &EngineState, now: DateTime<Utc>) -> bool {
        state
            .last_notification_at
            .is_some_and(|last| now - last >= self.keep_alive_silence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    fn governor() -> Governor {
        Governor::new(&EngineConfig::default())
    }

    #[test]
    fn test_round_window_boundary() {
        let window = governor().post_loss_window(100);
        assert!(window.is_active(Some(100)));
        assert!(window.is_active(Some(102)));
        assert!(!window.is_active(Some(103)));
        assert!(window.is_active(None));
    }

    #[test]
    fn test_hourly_counter_rolls_over_on_new_bucket() {
        let mut counter = HourlyCounter::default();
        counter.record_interrupt(at(10, 5));
        counter.record_interrupt(at(10, 50));
        counter.record_confirm(at(10, 55));
        assert_eq!(counter.current(hour_bucket(at(10, 59))).interrupts, 2);

        let next_hour = counter.current(hour_bucket(at(11, 0)));
        assert_eq!((next_hour.interrupts, next_hour.confirms), (0, 0));

        counter.record_interrupt(at(11, 1));
        assert_eq!(counter.interrupts, 1);
        assert_eq!(counter.confirms, 0);
    }

    #[test]
    fn test_cancellation_rate_and_cap() {
        let g = governor();
        let now = at(10, 30);
        let mut state = EngineState::default();
        assert!(g.cancellation_allowed(&state, now));

        // 1 of 1 is above the 30% rate
        state.hourly.record_interrupt(now);
        assert!(!g.cancellation_allowed(&state, now));

        // 1 of 4 is below it
        for _ in 0..3 {
            state.hourly.record_confirm(now);
        }
        assert!(g.cancellation_allowed(&state, now));

        // Hard cap regardless of rate
        state.hourly = HourlyCounter {
            bucket: hour_bucket(now),
            interrupts: 5,
            confirms: 100,
        };
        assert!(!g.cancellation_allowed(&state, now));
        // A new hour starts fresh
        assert!(g.cancellation_allowed(&state, at(11, 0)));
    }

    #[test]
    fn test_pre_signal_block_order() {
        let g = governor();
        let now = at(10, 0);
        let mut state = EngineState::default();
        assert_eq!(g.pre_signal_block(&state, now), None);

        state.last_pre_signal_at = Some(now - Duration::seconds(60));
        assert_eq!(
            g.pre_signal_block(&state, now),
            Some(Suppression::PreSignalInterval)
        );
        state.last_pre_signal_at = Some(now - Duration::seconds(90));
        assert_eq!(g.pre_signal_block(&state, now), None);

        state.interrupted_at = Some(now - Duration::seconds(119));
        assert_eq!(g.pre_signal_block(&state, now), Some(Suppression::Interrupted));
        state.interrupted_at = Some(now - Duration::seconds(120));
        assert_eq!(g.pre_signal_block(&state, now), None);
    }

    #[test]
    fn test_session_closed_window_and_reopen() {
        let g = Governor::new(&EngineConfig {
            operating_hours_only: true,
            ..EngineConfig::default()
        });
        let mut state = EngineState::default();

        // Sao Paulo is UTC-3: 02:00 UTC is 23:00 local, 11:00 UTC is 08:00 local
        assert!(!g.session_closed(&state, at(1, 59)));
        assert!(g.session_closed(&state, at(2, 0)));
        assert!(g.session_closed(&state, at(10, 59)));
        assert!(!g.session_closed(&state, at(11, 0)));

        // Reopened during the current closed window
        state.session_reopened_at = Some(at(5, 0));
        assert!(!g.session_closed(&state, at(6, 0)));

        // A reopen from the previous night does not carry over
        let next_night = at(2, 0) + Duration::days(1);
        assert!(g.session_closed(&state, next_night));
    }

    #[test]
    fn test_session_never_closed_without_operating_hours() {
        let g = governor();
        assert!(!g.session_closed(&EngineState::default(), at(4, 0)));
    }

    #[test]
    fn test_volatility_window_length_in_bounds() {
        let g = governor();
        let now = at(12, 0);
        for _ in 0..50 {
            let window = g.open_volatility(now);
            let minutes = window.duration_secs / 60;
            assert!((5..=8).contains(&minutes));
            assert_eq!(window.until, now + Duration::seconds(window.duration_secs));
        }
    }

    #[test]
    fn test_keep_alive_needs_prior_message() {
        let g = governor();
        let now = at(12, 0);
        let mut state = EngineState::default();
        assert!(!g.keep_alive_due(&state, now));

        state.last_notification_at = Some(now - Duration::minutes(4));
        assert!(!g.keep_alive_due(&state, now));
        state.last_notification_at = Some(now - Duration::minutes(5));
        assert!(g.keep_alive_due(&state, now));

        state.cooldown_until_round_id = Some(10);
        assert_eq!(
            g.keep_alive_block(&state, Some(9), now),
            Some(Suppression::PostLoss)
        );
        assert_eq!(g.keep_alive_block(&state, Some(10), now), None);
    }
}
