//! Trigger detection over the newest rounds
//!
//! All functions take rounds newest first.

use rust_decimal::Decimal;

use crate::config::EngineConfig;
use crate::types::{PatternMonitoring, Round};

#[derive(Debug, Clone)]
pub struct TriggerDetector {
    sequence_length: usize,
    threshold: Decimal,
    volatility_threshold: Decimal,
    volatility_window: usize,
}

impl TriggerDetector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            sequence_length: config.sequence_length,
            threshold: config.threshold,
            volatility_threshold: config.volatility_threshold,
            volatility_window: config.volatility_window,
        }
    }

    /// Count of consecutive sub-threshold rounds starting at the newest
    pub fn consecutive_below(&self, recent: &[Round]) -> usize {
        recent
            .iter()
            .take_while(|r| r.multiplier < self.threshold)
            .count()
    }

    /// True when the newest `sequence_length` rounds are all below the threshold
    pub fn is_triggered(&self, recent: &[Round]) -> bool {
        recent.len() >= self.sequence_length
            && self.consecutive_below(recent) >= self.sequence_length
    }

    /// Progress toward a trigger, reported from one round before a full trigger onward
    pub fn monitoring(&self, recent: &[Round]) -> Option<PatternMonitoring> {
        if recent.len() < self.sequence_length {
            return None;
        }
        let count = self.consecutive_below(recent);
        if count < self.pre_signal_point() {
            return None;
        }
        Some(PatternMonitoring {
            count,
            remaining: self.sequence_length.saturating_sub(count),
        })
    }

    /// Newest `volatility_window` rounds all below the volatility threshold
    pub fn is_volatile(&self, recent: &[Round]) -> bool {
        recent.len() >= self.volatility_window
            && recent
                .iter()
                .take(self.volatility_window)
                .all(|r| r.multiplier < self.volatility_threshold)
    }

    /// Run length at which a pre-signal goes out
    pub fn pre_signal_point(&self) -> usize {
        self.sequence_length.saturating_sub(1).max(1)
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }
}
