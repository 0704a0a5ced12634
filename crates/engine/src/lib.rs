//! Signal Engine: round-driven pattern detection with governed notifications
//!
//! Provides:
//! - Trigger detection over recent rounds with an early pre-signal
//! - Signal lifecycle with a gale ladder, backed by a single-open store invariant
//! - Cooldown, session and rate governance in one persisted state document
//! - Streak tracking with milestone announcements
//! - A notifier seam (log or webhook) and read-only report helpers

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod governor;
pub mod notifier;
pub mod reports;
pub mod state;
pub mod store;
pub mod streak;
pub mod trigger;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use engine::SignalEngine;
pub use error::{EngineError, EngineResult};
pub use governor::Suppression;
pub use notifier::{LogNotifier, Notification, NotificationRef, Notifier, WebhookNotifier};
pub use reports::{PeriodCounts, PeriodSummary};
pub use state::EngineState;
pub use store::Store;
pub use types::*;
