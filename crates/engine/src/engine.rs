//! Round-driven signal engine
//!
//! `on_new_round` runs once per observed round. An open signal is resolved
//! against the round; otherwise the volatility cooldown, the post-loss
//! cooldown, the session window and finally the pattern run are evaluated in
//! that order. Every transition is written to the store before anything is
//! announced, and announcements never roll a transition back.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::governor::{Governor, Suppression};
use crate::notifier::{Notification, NotificationRef, Notifier};
use crate::reports::{self, PeriodCounts, PeriodSummary};
use crate::state::{self, EngineState, PreSignalRun};
use crate::store::Store;
use crate::streak;
use crate::trigger::TriggerDetector;
use crate::types::{
    DailyStats, KeepAlive, PatternMonitoring, Resolution, Round, RoundOutcome, Signal,
    SignalStatus, Transition,
};

pub struct SignalEngine {
    store: Store,
    config: EngineConfig,
    detector: TriggerDetector,
    governor: Governor,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl SignalEngine {
    pub fn new(store: Store, config: EngineConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_clock(store, config, notifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Store,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            detector: TriggerDetector::new(&config),
            governor: Governor::new(&config),
            store,
            config,
            notifier,
            clock,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -----------------------------------------------------------------------
    // Round entry points
    // -----------------------------------------------------------------------

    /// Record a round on behalf of the ingestion side, then evaluate it
    pub async fn ingest_round(&self, round: &Round) -> RoundOutcome {
        match self.store.insert_round(round).await {
            Ok(true) => {}
            Ok(false) => debug!(round_id = round.id, "Round already stored"),
            Err(e) => {
                warn!(round_id = round.id, error = %e, "Failed to store round, skipping");
                return RoundOutcome::Skipped;
            }
        }
        self.on_new_round(round).await
    }

    /// Evaluate one new round. Never fails: store trouble skips the cycle.
    pub async fn on_new_round(&self, round: &Round) -> RoundOutcome {
        match self.process_round(round).await {
            Ok(outcome) => {
                debug!(round_id = round.id, multiplier = %round.multiplier, ?outcome, "Round evaluated");
                outcome
            }
            Err(e) => {
                warn!(round_id = round.id, error = %e, "Round evaluation skipped");
                RoundOutcome::Skipped
            }
        }
    }

    async fn process_round(&self, round: &Round) -> EngineResult<RoundOutcome> {
        // Claim the round so redelivery and concurrent callers evaluate it once
        let claimed = state::update(&self.store, |s| {
            if s.last_round_id.is_some_and(|last| last >= round.id) {
                false
            } else {
                s.last_round_id = Some(round.id);
                true
            }
        })
        .await?;
        if !claimed {
            debug!(round_id = round.id, "Round already evaluated");
            return Ok(RoundOutcome::Duplicate);
        }

        if let Some(signal) = self.store.open_signal().await? {
            let transition = self.resolve_signal(&signal, round).await?;
            return Ok(RoundOutcome::Resolved(transition));
        }

        self.evaluate(round).await
    }

    async fn evaluate(&self, round: &Round) -> EngineResult<RoundOutcome> {
        let now = self.clock.now();
        let recent = self.store.recent_rounds(self.config.recent_rounds).await?;
        let state = state::load(&self.store).await?;

        if self.governor.volatility_active(&state, now) {
            self.check_volatility_midpoint(now).await?;
            return Ok(suppressed(Suppression::Volatility));
        }
        if self.detector.is_volatile(&recent) {
            return self.enter_volatility(now).await;
        }

        // An unreadable latest round propagates and skips the cycle
        let latest = self.store.latest_round_id().await?;
        if self.governor.post_loss_active(&state, latest) {
            return Ok(suppressed(Suppression::PostLoss));
        }
        if self.governor.session_closed(&state, now) {
            // A run that breaks while closed is still settled, so its marker
            // cannot confirm a later run
            if state.pre_signal.sent
                && self.detector.consecutive_below(&recent) < self.detector.pre_signal_point()
            {
                return self.interrupt_run(now).await;
            }
            return Ok(suppressed(Suppression::SessionClosed));
        }

        self.advance_run(round, &recent, &state, now).await
    }

    // -----------------------------------------------------------------------
    // Signal lifecycle
    // -----------------------------------------------------------------------

    async fn resolve_signal(&self, signal: &Signal, round: &Round) -> EngineResult<Transition> {
        let now = self.clock.now();
        let depth = signal.status.depth();
        let reply_to = signal.notification_ref.as_ref();
        let resolution = Resolution {
            round_id: round.id,
            multiplier: round.multiplier,
            depth,
            resolved_at: now,
        };

        if round.multiplier >= signal.target {
            if !self
                .store
                .resolve(signal, &SignalStatus::Won(resolution))
                .await?
            {
                return Ok(Transition::Superseded {
                    signal_id: signal.id,
                });
            }
            info!(
                signal_id = signal.id,
                depth,
                result = %round.multiplier,
                target = %signal.target,
                "Signal won"
            );

            let today = self.store.local_date(now);
            logged(self.store.record_win(today).await, "record win");
            let milestone = logged(self.record_streak_win().await, "streak update").flatten();
            let stats = self.stats_or_empty(today).await;

            let notification = if depth == 0 {
                Notification::Win {
                    result: round.multiplier,
                    target: signal.target,
                    wins: stats.wins,
                    losses: stats.losses,
                }
            } else {
                Notification::Recovery {
                    depth,
                    result: round.multiplier,
                    target: signal.target,
                    wins: stats.wins,
                    losses: stats.losses,
                }
            };
            self.notify(&notification, reply_to).await;
            if let Some(streak) = milestone {
                info!(streak, "Streak milestone");
                self.notify(&Notification::StreakMilestone { streak }, reply_to)
                    .await;
            }
            return Ok(Transition::Won {
                signal_id: signal.id,
                depth,
            });
        }

        if depth < self.config.max_gale {
            let next = depth + 1;
            if !self.store.escalate(signal, next).await? {
                return Ok(Transition::Superseded {
                    signal_id: signal.id,
                });
            }
            info!(signal_id = signal.id, depth = next, result = %round.multiplier, "Signal escalated");
            self.notify(
                &Notification::Gale {
                    depth: next,
                    result: round.multiplier,
                    target: signal.target,
                },
                reply_to,
            )
            .await;
            return Ok(Transition::Gale {
                signal_id: signal.id,
                depth: next,
            });
        }

        if !self
            .store
            .resolve(signal, &SignalStatus::Lost(resolution))
            .await?
        {
            return Ok(Transition::Superseded {
                signal_id: signal.id,
            });
        }
        let window = self.governor.post_loss_window(round.id);
        info!(
            signal_id = signal.id,
            result = %round.multiplier,
            cooldown_until = window.until,
            "Signal lost"
        );

        let today = self.store.local_date(now);
        logged(self.store.record_loss(today).await, "record loss");
        logged(
            state::update(&self.store, |s| {
                s.cooldown_until_round_id = Some(window.until);
                streak::record_loss(s);
            })
            .await,
            "post-loss cooldown",
        );
        let stats = self.stats_or_empty(today).await;
        self.notify(
            &Notification::Loss {
                result: round.multiplier,
                wins: stats.wins,
                losses: stats.losses,
            },
            reply_to,
        )
        .await;

        if stats.losses == 2 {
            info!("Second loss of the day, resetting display counters");
            logged(
                self.store.reset_display_counters(today).await,
                "display counter reset",
            );
        }

        Ok(Transition::Lost {
            signal_id: signal.id,
        })
    }

    async fn create_signal(
        &self,
        round: &Round,
        recent: &[Round],
        now: DateTime<Utc>,
    ) -> EngineResult<RoundOutcome> {
        let target = self.config.target;
        let newest = recent.first().unwrap_or(round);

        let Some(signal_id) = self.store.insert_signal(newest.id, target, now).await? else {
            warn!(trigger_round_id = newest.id, "A signal is already open, creation abandoned");
            return Ok(suppressed(Suppression::SignalOpen));
        };
        info!(signal_id, trigger_round_id = newest.id, target = %target, "Signal created");

        let today = self.store.local_date(now);
        logged(self.store.record_signal_sent(today).await, "record signal sent");
        logged(
            state::update(&self.store, |s| {
                s.pre_signal = PreSignalRun::default();
                s.hourly.record_confirm(now);
            })
            .await,
            "close pattern run",
        );

        let notification = Notification::Signal {
            last_multiplier: newest.multiplier,
            target,
        };
        if let Some(reference) = self.notify(&notification, None).await {
            logged(
                self.store.set_notification_ref(signal_id, &reference).await,
                "store notification reference",
            );
        }

        Ok(RoundOutcome::SignalCreated { signal_id })
    }

    async fn record_streak_win(&self) -> EngineResult<Option<u32>> {
        let current = state::load(&self.store).await?;
        let backfill = if current.streak == 0 {
            Some(self.store.consecutive_wins().await?)
        } else {
            None
        };
        state::update(&self.store, |s| streak::record_win(s, backfill)).await
    }

    // -----------------------------------------------------------------------
    // Pattern run
    // -----------------------------------------------------------------------

    async fn advance_run(
        &self,
        round: &Round,
        recent: &[Round],
        state: &EngineState,
        now: DateTime<Utc>,
    ) -> EngineResult<RoundOutcome> {
        if self.detector.is_triggered(recent) {
            if !state.pre_signal.sent {
                debug!(round_id = round.id, "Trigger without a pre-signal for this run");
                return Ok(suppressed(Suppression::NoPreSignal));
            }
            return self.create_signal(round, recent, now).await;
        }

        let count = self.detector.consecutive_below(recent);
        if count >= self.detector.pre_signal_point() {
            if state.pre_signal.sent {
                return Ok(RoundOutcome::Idle);
            }
            return self.send_pre_signal(count, now).await;
        }

        if state.pre_signal.sent {
            return self.interrupt_run(now).await;
        }
        Ok(RoundOutcome::Idle)
    }

    async fn send_pre_signal(&self, count: usize, now: DateTime<Utc>) -> EngineResult<RoundOutcome> {
        let claim = state::update(&self.store, |s| {
            if s.pre_signal.sent {
                return Err(None);
            }
            if let Some(reason) = self.governor.pre_signal_block(s, now) {
                return Err(Some(reason));
            }
            s.pre_signal = PreSignalRun {
                sent: true,
                reference: None,
            };
            s.last_pre_signal_at = Some(now);
            Ok(())
        })
        .await?;

        match claim {
            Ok(()) => {}
            Err(Some(reason)) => {
                debug!(?reason, "Pre-signal held back");
                return Ok(suppressed(reason));
            }
            Err(None) => return Ok(RoundOutcome::Idle),
        }

        let remaining = self.detector.sequence_length().saturating_sub(count);
        info!(consecutive = count, remaining, "Pre-signal");
        let notification = Notification::PreSignal {
            consecutive: count,
            remaining,
        };
        if let Some(reference) = self.notify(&notification, None).await {
            logged(
                state::update(&self.store, |s| {
                    if s.pre_signal.sent && s.pre_signal.reference.is_none() {
                        s.pre_signal.reference = Some(reference.clone());
                    }
                })
                .await,
                "store pre-signal reference",
            );
        }
        Ok(RoundOutcome::PreSignalSent)
    }

    /// The run broke before confirming: announce it, or retract the pre-signal
    /// when cancellations are over budget for this hour
    async fn interrupt_run(&self, now: DateTime<Utc>) -> EngineResult<RoundOutcome> {
        let claim = state::update(&self.store, |s| {
            if !s.pre_signal.sent {
                return None;
            }
            let announce = self.governor.cancellation_allowed(s, now);
            if announce {
                s.hourly.record_interrupt(now);
            }
            s.interrupted_at = Some(now);
            Some((s.take_pre_signal(), announce))
        })
        .await?;

        let Some((reference, announced)) = claim else {
            return Ok(RoundOutcome::Idle);
        };
        info!(announced, "Pattern run interrupted");
        if announced {
            self.notify(&Notification::Cancelled, reference.as_ref()).await;
        } else if let Some(reference) = reference {
            self.retract(&reference).await;
        }
        Ok(RoundOutcome::RunInterrupted { announced })
    }

    // -----------------------------------------------------------------------
    // Volatility
    // -----------------------------------------------------------------------

    async fn enter_volatility(&self, now: DateTime<Utc>) -> EngineResult<RoundOutcome> {
        let window = self.governor.open_volatility(now);
        let entered = state::update(&self.store, |s| {
            if self.governor.volatility_active(s, now) {
                return None;
            }
            s.volatility = Some(window.clone());
            Some(s.take_pre_signal())
        })
        .await?;

        let Some(pending) = entered else {
            return Ok(suppressed(Suppression::Volatility));
        };
        let minutes = window.minutes();
        info!(minutes, until = %window.until, "Volatility cooldown entered");
        if let Some(reference) = pending {
            self.retract(&reference).await;
        }
        self.notify(&Notification::CooldownEntered { minutes }, None)
            .await;
        Ok(RoundOutcome::VolatilityEntered { minutes })
    }

    /// Send the midpoint notice once per volatility window
    async fn check_volatility_midpoint(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let claim = state::update(&self.store, |s| match s.volatility.as_mut() {
            Some(v)
                if !v.midpoint_sent
                    && v.window().is_active(now)
                    && now >= v.window().midpoint() =>
            {
                v.midpoint_sent = true;
                Some(v.minutes_left(now))
            }
            _ => None,
        })
        .await?;

        if let Some(minutes_left) = claim {
            info!(minutes_left, "Volatility cooldown midpoint");
            self.notify(&Notification::CooldownMidpoint { minutes_left }, None)
                .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduler surface
    // -----------------------------------------------------------------------

    pub async fn get_daily_stats(&self, date: NaiveDate) -> EngineResult<DailyStats> {
        self.store.daily_stats(date).await
    }

    pub async fn get_signals_for_date(&self, date: NaiveDate) -> EngineResult<Vec<Signal>> {
        self.store.signals_for_date(date).await
    }

    pub async fn get_signals_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<Signal>> {
        self.store.signals_since(since).await
    }

    /// Resolved wins and losses of signals created since `since`
    pub async fn get_period_counts(&self, since: DateTime<Utc>) -> EngineResult<PeriodCounts> {
        let signals = self.store.signals_since(since).await?;
        Ok(reports::period_counts(&signals))
    }

    /// Wins, losses and best streak of a local day
    pub async fn get_day_summary(&self, date: NaiveDate) -> EngineResult<PeriodSummary> {
        let stats = self.store.daily_stats(date).await?;
        let signals = self.store.signals_for_date(date).await?;
        Ok(reports::summarize(&stats, &signals))
    }

    /// Daily open event: accept signals again even inside the closed hours
    pub async fn clear_session_closed(&self) -> EngineResult<()> {
        let now = self.clock.now();
        state::update(&self.store, |s| s.session_reopened_at = Some(now)).await?;
        info!("Session opened");
        Ok(())
    }

    /// Current run progress, when worth announcing
    pub async fn get_pattern_monitoring_data(&self) -> EngineResult<Option<PatternMonitoring>> {
        let now = self.clock.now();
        if self.store.open_signal().await?.is_some() {
            return Ok(None);
        }
        let state = state::load(&self.store).await?;
        let latest = self.store.latest_round_id().await?;
        if self.governor.post_loss_active(&state, latest)
            || self.governor.volatility_active(&state, now)
        {
            return Ok(None);
        }
        let recent = self.store.recent_rounds(self.config.recent_rounds).await?;
        Ok(self.detector.monitoring(&recent))
    }

    /// Announce the current run progress if there is any
    pub async fn send_pattern_monitoring(&self) -> EngineResult<Option<PatternMonitoring>> {
        let Some(data) = self.get_pattern_monitoring_data().await? else {
            return Ok(None);
        };
        self.notify(
            &Notification::PatternMonitoring {
                count: data.count,
                remaining: data.remaining,
            },
            None,
        )
        .await;
        Ok(Some(data))
    }

    /// Timer tick: volatility midpoint check, then a keep-alive if the channel went quiet
    pub async fn check_and_send_keep_alive(&self) -> EngineResult<KeepAlive> {
        let now = self.clock.now();
        self.check_volatility_midpoint(now).await?;

        let state = state::load(&self.store).await?;
        let latest = self.store.latest_round_id().await?;
        if let Some(reason) = self.governor.keep_alive_block(&state, latest, now) {
            return Ok(KeepAlive::Suppressed { reason });
        }
        if self.store.open_signal().await?.is_some() {
            return Ok(KeepAlive::Suppressed {
                reason: Suppression::SignalOpen,
            });
        }

        // Claim the variant first so concurrent ticks send one keep-alive
        let claim = state::update(&self.store, |s| {
            if !self.governor.keep_alive_due(s, now) {
                return None;
            }
            let variant = s.last_keep_alive_variant.map_or(0, |last| (last + 1) % 3);
            s.last_keep_alive_variant = Some(variant);
            s.last_notification_at = Some(now);
            Some(variant)
        })
        .await?;

        let Some(variant) = claim else {
            return Ok(KeepAlive::NotDue);
        };
        info!(variant, "Keep-alive");
        self.notify(&Notification::KeepAlive { variant }, None).await;
        Ok(KeepAlive::Sent { variant })
    }

    /// Current governance document
    pub async fn snapshot(&self) -> EngineResult<EngineState> {
        state::load(&self.store).await
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Fire-and-forget delivery. A sent notification refreshes the silence timer.
    async fn notify(
        &self,
        notification: &Notification,
        reply_to: Option<&NotificationRef>,
    ) -> Option<NotificationRef> {
        match self.notifier.emit(notification, reply_to).await {
            Ok(reference) => {
                let now = self.clock.now();
                logged(
                    state::update(&self.store, |s| s.last_notification_at = Some(now)).await,
                    "record notification time",
                );
                Some(reference)
            }
            Err(e) => {
                warn!(kind = notification.kind(), error = %e, "Notification delivery failed");
                None
            }
        }
    }

    async fn retract(&self, reference: &NotificationRef) {
        if let Err(e) = self.notifier.delete(reference).await {
            warn!(reference = %reference, error = %e, "Notification retraction failed");
        }
    }

    async fn stats_or_empty(&self, date: NaiveDate) -> DailyStats {
        logged(self.store.daily_stats(date).await, "read daily stats")
            .unwrap_or_else(|| DailyStats::empty(date))
    }
}

fn suppressed(reason: Suppression) -> RoundOutcome {
    RoundOutcome::Suppressed { reason }
}

/// Follow-up writes after a committed transition: log failures and carry on
fn logged<T>(result: EngineResult<T>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Failed to {}", what);
            None
        }
    }
}
