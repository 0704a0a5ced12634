//! Engine configuration
//!
//! Defaults mirror the production tuning. Every field can be overridden from
//! a `SIGNAL_*` environment variable (see [`EngineConfig::from_env`]).

use anyhow::{bail, Context};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

/// Tunables for trigger detection, signal lifecycle and governance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive sub-threshold rounds needed for a trigger
    pub sequence_length: usize,
    /// Multiplier below which a round counts toward a run
    pub threshold: Decimal,
    /// Cash-out target of new signals
    pub target: Decimal,
    /// Deepest gale step before a miss is a loss
    pub max_gale: u8,
    /// Rounds suppressed after a loss, counted by round id
    pub cooldown_rounds: i64,

    /// Multiplier below which a round counts as volatile
    pub volatility_threshold: Decimal,
    /// Newest rounds that must all be volatile
    pub volatility_window: usize,
    pub volatility_min_minutes: u32,
    pub volatility_max_minutes: u32,

    /// Quiet period after an interrupted run
    pub interrupted_cooldown_secs: i64,
    /// Minimum spacing between pre-signals
    pub pre_signal_min_interval_secs: i64,
    /// Cancellation notices allowed per hour bucket
    pub max_interrupts_per_hour: u32,
    /// Cancellations / (cancellations + confirmations) at which notices stop
    pub max_interrupt_rate: f64,

    pub keep_alive_silence_minutes: i64,

    /// Suppress new signals outside operating hours
    pub operating_hours_only: bool,
    pub session_open_hour: u32,
    pub session_close_hour: u32,
    /// Timezone for the session window and daily stats
    pub timezone: Tz,

    /// Upper bound for every store call
    pub store_timeout_ms: u64,
    /// Rounds read per evaluation
    pub recent_rounds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sequence_length: 3,
            threshold: dec!(2.0),
            target: dec!(1.50),
            max_gale: 2,
            cooldown_rounds: 3,
            volatility_threshold: dec!(1.20),
            volatility_window: 3,
            volatility_min_minutes: 5,
            volatility_max_minutes: 8,
            interrupted_cooldown_secs: 120,
            pre_signal_min_interval_secs: 90,
            max_interrupts_per_hour: 5,
            max_interrupt_rate: 0.30,
            keep_alive_silence_minutes: 5,
            operating_hours_only: false,
            session_open_hour: 8,
            session_close_hour: 23,
            timezone: chrono_tz::America::Sao_Paulo,
            store_timeout_ms: 2000,
            recent_rounds: 10,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `SIGNAL_*` variables present in the environment
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        override_from("SIGNAL_SEQUENCE_LENGTH", &mut config.sequence_length)?;
        override_from("SIGNAL_THRESHOLD", &mut config.threshold)?;
        override_from("SIGNAL_TARGET", &mut config.target)?;
        override_from("SIGNAL_MAX_GALE", &mut config.max_gale)?;
        override_from("SIGNAL_COOLDOWN_ROUNDS", &mut config.cooldown_rounds)?;
        override_from("SIGNAL_VOLATILITY_THRESHOLD", &mut config.volatility_threshold)?;
        override_from("SIGNAL_VOLATILITY_WINDOW", &mut config.volatility_window)?;
        override_from("SIGNAL_VOLATILITY_MIN_MINUTES", &mut config.volatility_min_minutes)?;
        override_from("SIGNAL_VOLATILITY_MAX_MINUTES", &mut config.volatility_max_minutes)?;
        override_from(
            "SIGNAL_INTERRUPTED_COOLDOWN_SECS",
            &mut config.interrupted_cooldown_secs,
        )?;
        override_from(
            "SIGNAL_PRE_SIGNAL_MIN_INTERVAL_SECS",
            &mut config.pre_signal_min_interval_secs,
        )?;
        override_from(
            "SIGNAL_MAX_INTERRUPTS_PER_HOUR",
            &mut config.max_interrupts_per_hour,
        )?;
        override_from("SIGNAL_MAX_INTERRUPT_RATE", &mut config.max_interrupt_rate)?;
        override_from(
            "SIGNAL_KEEP_ALIVE_SILENCE_MINUTES",
            &mut config.keep_alive_silence_minutes,
        )?;
        override_from("SIGNAL_OPERATING_HOURS_ONLY", &mut config.operating_hours_only)?;
        override_from("SIGNAL_SESSION_OPEN_HOUR", &mut config.session_open_hour)?;
        override_from("SIGNAL_SESSION_CLOSE_HOUR", &mut config.session_close_hour)?;
        override_from("SIGNAL_TIMEZONE", &mut config.timezone)?;
        override_from("SIGNAL_STORE_TIMEOUT_MS", &mut config.store_timeout_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sequence_length < 2 {
            bail!("sequence_length must be at least 2, got {}", self.sequence_length);
        }
        if self.volatility_window == 0 {
            bail!("volatility_window must be at least 1");
        }
        if self.volatility_min_minutes == 0
            || self.volatility_min_minutes > self.volatility_max_minutes
        {
            bail!(
                "volatility minutes must satisfy 0 < min <= max, got {}..={}",
                self.volatility_min_minutes,
                self.volatility_max_minutes
            );
        }
        if self.session_open_hour >= 24 || self.session_close_hour >= 24 {
            bail!("session hours must be below 24");
        }
        if !(0.0..=1.0).contains(&self.max_interrupt_rate) {
            bail!("max_interrupt_rate must be within 0..=1");
        }
        // Enough history to evaluate both detectors
        if self.recent_rounds < self.sequence_length.max(self.volatility_window) {
            bail!("recent_rounds must cover sequence_length and volatility_window");
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms)
    }
}

fn override_from<T>(key: &str, slot: &mut T) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
    }
    Ok(())
}
