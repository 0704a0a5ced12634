//! Shared fixtures for the engine tests

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use persistence::Database;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::SignalEngine;
use crate::notifier::{Notification, NotificationRef, Notifier};
use crate::store::Store;
use crate::types::{Round, RoundOutcome};

/// 2026-03-14 15:00 UTC, mid-session in Sao Paulo
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(secs)
}

/// Rounds with ids `1..=n` from multipliers given oldest first, returned
/// newest first the way the store serves them
pub fn rounds_oldest_first(multipliers: &[Decimal]) -> Vec<Round> {
    let mut rounds: Vec<Round> = multipliers
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let id = i as i64 + 1;
            Round::new(id, *m, ts(id * 30))
        })
        .collect();
    rounds.reverse();
    rounds
}

pub async fn test_store() -> Store {
    store_with(&EngineConfig::default()).await
}

async fn store_with(config: &EngineConfig) -> Store {
    let db = Database::in_memory().await.unwrap();
    Store::new(db.pool_clone(), config)
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Keeps every delivered notification. Failing mode rejects emits.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Notification, Option<NotificationRef>, NotificationRef)>>,
    deleted: Mutex<Vec<NotificationRef>>,
    failing: AtomicBool,
    next: AtomicU64,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delivered notifications with the reference they replied to
    pub fn sent(&self) -> Vec<(Notification, Option<NotificationRef>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(n, reply, _)| (n.clone(), reply.clone()))
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent().into_iter().map(|(n, _)| n).collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|(n, _, _)| n.kind()).collect()
    }

    pub fn last(&self) -> Option<Notification> {
        self.notifications().pop()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    /// Reference issued for the first notification of `kind`
    pub fn reference_of(&self, kind: &str) -> Option<NotificationRef> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _, _)| n.kind() == kind)
            .map(|(_, _, reference)| reference.clone())
    }

    pub fn deleted(&self) -> Vec<NotificationRef> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn emit(
        &self,
        notification: &Notification,
        reply_to: Option<&NotificationRef>,
    ) -> Result<NotificationRef> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("channel unavailable");
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let reference = NotificationRef::new(format!("msg-{id}"));
        self.sent.lock().unwrap().push((
            notification.clone(),
            reply_to.cloned(),
            reference.clone(),
        ));
        Ok(reference)
    }

    async fn delete(&self, reference: &NotificationRef) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("channel unavailable");
        }
        self.deleted.lock().unwrap().push(reference.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Engine over an in-memory store with a manual clock and a recording notifier
pub struct Harness {
    pub engine: SignalEngine,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    next_id: AtomicI64,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store = store_with(&config).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(base_time()));
        let engine = SignalEngine::with_clock(store, config, notifier.clone(), clock.clone());
        Self {
            engine,
            notifier,
            clock,
            next_id: AtomicI64::new(1),
        }
    }

    /// Rounds with fresh ids at the current time, not yet ingested
    pub fn rounds(&self, multipliers: &[Decimal]) -> Vec<Round> {
        let now = self.clock.now();
        multipliers
            .iter()
            .map(|m| Round::new(self.next_id.fetch_add(1, Ordering::SeqCst), *m, now))
            .collect()
    }

    /// Advance 30 seconds and ingest one round
    pub async fn feed(&self, multiplier: Decimal) -> RoundOutcome {
        self.clock.advance(Duration::seconds(30));
        let round = Round::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            multiplier,
            self.clock.now(),
        );
        self.engine.ingest_round(&round).await
    }

    pub async fn feed_all(&self, multipliers: &[Decimal]) -> Vec<RoundOutcome> {
        let mut outcomes = Vec::with_capacity(multipliers.len());
        for m in multipliers {
            outcomes.push(self.feed(*m).await);
        }
        outcomes
    }

    pub fn today(&self) -> NaiveDate {
        self.engine.store().local_date(self.clock.now())
    }

    /// Midnight UTC of the base day
    pub fn day_start(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
    }
}
