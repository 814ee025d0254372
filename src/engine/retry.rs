//! Failure classification, per-item backoff and the global cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::error::FailureKind;

use super::item::{ItemId, Outcome};

/// What the scheduler should do with an item after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Back to Pending, not eligible before the given delay has passed.
    Requeue(Duration),
    Abandon(AbandonReason),
    /// Success; hand the result to the buffer pool.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbandonReason {
    /// Ran out of attempts on recoverable failures.
    Exhausted { attempts: u32 },
    /// Will never succeed.
    Fatal(String),
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::Exhausted { attempts } => write!(f, "gave up after {attempts} attempts"),
            AbandonReason::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Retry bookkeeping for an item that has failed at least once.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub attempts: u32,
    pub next_eligible: Instant,
    pub last_failure: FailureKind,
}

#[derive(Debug, Default)]
struct CooldownInner {
    started_at: Option<Instant>,
    resume_at: Option<Instant>,
    trips: u32,
}

/// Process-wide dispatch pause. Active while `now < resume_at`.
#[derive(Debug, Default)]
pub struct CooldownState {
    inner: Mutex<CooldownInner>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// When dispatch may resume, or `None` if no cooldown is in force.
    /// An expired cooldown is cleared on read.
    pub fn resume_at(&self) -> Option<Instant> {
        let mut inner = self.lock();
        match inner.resume_at {
            Some(at) if at > Instant::now() => Some(at),
            Some(_) => {
                inner.resume_at = None;
                inner.started_at = None;
                tracing::info!("cooldown elapsed, resuming dispatch");
                None
            }
            None => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.resume_at().is_some()
    }

    /// Consecutive trips since the last reset.
    pub fn trips(&self) -> u32 {
        self.lock().trips
    }

    /// Starts (or extends) a cooldown. `duration_for` maps the new trip count
    /// to the pause length.
    pub fn trip(&self, duration_for: impl FnOnce(u32) -> Duration) -> Duration {
        let mut inner = self.lock();
        inner.trips += 1;
        let duration = duration_for(inner.trips);
        let now = Instant::now();
        let until = now + duration;
        if inner.resume_at.is_none_or(|at| at <= now) {
            inner.started_at = Some(now);
        }
        inner.resume_at = Some(inner.resume_at.map_or(until, |at| at.max(until)));
        duration
    }

    /// Ends an active cooldown ahead of time if `dispatched_at` shows the
    /// successful request went out after the pause began. Responses to
    /// requests already in flight when it tripped leave it in place. Returns
    /// whether the cooldown was cleared.
    pub fn clear_early(&self, dispatched_at: Instant) -> bool {
        let mut inner = self.lock();
        let active = inner.resume_at.is_some_and(|at| at > Instant::now());
        if !active || inner.started_at.is_none_or(|start| dispatched_at < start) {
            return false;
        }
        inner.resume_at = None;
        inner.started_at = None;
        inner.trips = 0;
        true
    }

    pub fn reset_trips(&self) {
        self.lock().trips = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CooldownInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decides requeue vs abandon for every outcome and trips the global cooldown
/// when rate limits get dense. Owned by the dispatch loop.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    cooldown: Arc<CooldownState>,
    records: HashMap<ItemId, RetryRecord>,
    /// `true` for each rate-limited outcome among the most recent ones.
    recent: VecDeque<bool>,
    clean_streak: usize,
    cooldowns_triggered: u32,
}

impl RetryManager {
    pub fn new(config: RetryConfig, cooldown: Arc<CooldownState>) -> Self {
        let window = config.rate_limit_window;
        Self {
            config,
            cooldown,
            records: HashMap::new(),
            recent: VecDeque::with_capacity(window),
            clean_streak: 0,
            cooldowns_triggered: 0,
        }
    }

    pub fn cooldowns_triggered(&self) -> u32 {
        self.cooldowns_triggered
    }

    pub fn record(&self, id: &ItemId) -> Option<&RetryRecord> {
        self.records.get(id)
    }

    /// `dispatched_at` is when the attempt that produced `outcome` was sent.
    pub fn classify_and_route(
        &mut self,
        id: &ItemId,
        outcome: &Outcome,
        dispatched_at: Option<Instant>,
    ) -> Action {
        let Some(kind) = outcome.failure_kind() else {
            self.records.remove(id);
            self.note_clean();
            if dispatched_at.is_some_and(|sent| self.cooldown.clear_early(sent)) {
                tracing::info!(item = %id, "request sent during cooldown succeeded, resuming dispatch");
            }
            return Action::Passthrough;
        };

        match kind {
            FailureKind::Fatal => {
                self.records.remove(id);
                self.note_clean();
                let reason = match outcome {
                    Outcome::FatalError(reason) => reason.clone(),
                    _ => kind.to_string(),
                };
                Action::Abandon(AbandonReason::Fatal(reason))
            }
            FailureKind::Transient => {
                self.note_clean();
                self.retry_or_abandon(id, kind, None)
            }
            FailureKind::RateLimited => {
                self.note_rate_limited();
                let retry_after = match outcome {
                    Outcome::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                self.retry_or_abandon(id, kind, retry_after)
            }
        }
    }

    fn retry_or_abandon(
        &mut self,
        id: &ItemId,
        kind: FailureKind,
        retry_after: Option<Duration>,
    ) -> Action {
        let now = Instant::now();
        let record = self.records.entry(id.clone()).or_insert(RetryRecord {
            attempts: 0,
            next_eligible: now,
            last_failure: kind,
        });
        record.attempts += 1;
        record.last_failure = kind;

        if record.attempts >= self.config.max_attempts {
            let attempts = record.attempts;
            self.records.remove(id);
            return Action::Abandon(AbandonReason::Exhausted { attempts });
        }

        let mut delay = self.config.delay_for_attempt(record.attempts);
        if let Some(server) = retry_after {
            delay = delay.max(server);
        }
        record.next_eligible = now + delay;
        tracing::debug!(
            item = %id,
            attempt = record.attempts,
            kind = %kind,
            delay_ms = delay.as_millis() as u64,
            "requeueing"
        );
        Action::Requeue(delay)
    }

    fn note_clean(&mut self) {
        self.push_sample(false);
        self.clean_streak += 1;
        if self.clean_streak >= self.config.rate_limit_window && self.cooldown.trips() > 0 {
            self.cooldown.reset_trips();
        }
    }

    fn note_rate_limited(&mut self) {
        self.clean_streak = 0;
        // Responses to requests sent before the pause say nothing new.
        if self.cooldown.is_active() {
            return;
        }
        self.push_sample(true);

        let samples = self.recent.len();
        if samples < self.config.rate_limit_min_samples {
            return;
        }
        let limited = self.recent.iter().filter(|&&rl| rl).count();
        let ratio = limited as f64 / samples as f64;
        if ratio > self.config.rate_limit_threshold {
            let config = &self.config;
            let duration = self.cooldown.trip(|trip| config.cooldown_for_trip(trip));
            self.cooldowns_triggered += 1;
            self.recent.clear();
            tracing::warn!(
                ratio,
                samples,
                trip = self.cooldown.trips(),
                cooldown_ms = duration.as_millis() as u64,
                "rate limit density exceeded, pausing dispatch"
            );
        }
    }

    fn push_sample(&mut self, rate_limited: bool) {
        if self.recent.len() == self.config.rate_limit_window {
            self.recent.pop_front();
        }
        self.recent.push_back(rate_limited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::MatchDecision;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            rate_limit_window: 4,
            rate_limit_min_samples: 3,
            rate_limit_threshold: 0.5,
            cooldown_base_duration_ms: 10_000,
            cooldown_max_duration_ms: 25_000,
            max_consecutive_fatal: 3,
        }
    }

    fn manager() -> (RetryManager, Arc<CooldownState>) {
        let cooldown = Arc::new(CooldownState::new());
        (RetryManager::new(config(), cooldown.clone()), cooldown)
    }

    fn route(mgr: &mut RetryManager, id: &ItemId, outcome: &Outcome) -> Action {
        mgr.classify_and_route(id, outcome, Some(Instant::now()))
    }

    fn rl() -> Outcome {
        Outcome::RateLimited { retry_after: None }
    }

    fn ok() -> Outcome {
        Outcome::Success(MatchDecision::NoMatch)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_backs_off_exponentially_then_abandons() {
        let (mut mgr, _) = manager();
        let id = ItemId::from("a");
        let err = Outcome::TransientError("timeout".into());

        assert_eq!(route(&mut mgr, &id, &err), Action::Requeue(Duration::from_secs(1)));
        assert_eq!(route(&mut mgr, &id, &err), Action::Requeue(Duration::from_secs(2)));
        assert_eq!(
            route(&mut mgr, &id, &err),
            Action::Abandon(AbandonReason::Exhausted { attempts: 3 })
        );
        assert!(mgr.record(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_a_lower_bound() {
        let (mut mgr, _) = manager();
        let action = route(
            &mut mgr,
            &ItemId::from("a"),
            &Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            },
        );
        assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_abandoned_immediately() {
        let (mut mgr, _) = manager();
        let action = route(&mut mgr, &ItemId::from("a"), &Outcome::FatalError("404".into()));
        assert_eq!(action, Action::Abandon(AbandonReason::Fatal("404".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn success_discards_retry_record() {
        let (mut mgr, _) = manager();
        let id = ItemId::from("a");
        route(&mut mgr, &id, &Outcome::TransientError("x".into()));
        assert_eq!(mgr.record(&id).map(|r| r.attempts), Some(1));
        assert_eq!(route(&mut mgr, &id, &ok()), Action::Passthrough);
        assert!(mgr.record(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dense_rate_limits_trip_cooldown() {
        let (mut mgr, cooldown) = manager();
        route(&mut mgr, &ItemId::from("a"), &ok());
        route(&mut mgr, &ItemId::from("b"), &rl());
        assert!(!cooldown.is_active());
        // 2 of 3 samples rate limited > 0.5
        route(&mut mgr, &ItemId::from("c"), &rl());
        assert!(cooldown.is_active());
        assert_eq!(mgr.cooldowns_triggered(), 1);

        let resume = cooldown.resume_at().unwrap();
        assert_eq!(resume - Instant::now(), Duration::from_secs(10));

        // Stale rate limits while paused neither count nor extend the pause.
        route(&mut mgr, &ItemId::from("d"), &rl());
        route(&mut mgr, &ItemId::from("e"), &rl());
        route(&mut mgr, &ItemId::from("f"), &rl());
        assert_eq!(mgr.cooldowns_triggered(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!cooldown.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_trips_double_up_to_the_cap() {
        let (mut mgr, cooldown) = manager();
        let mut expected = vec![10, 20, 25].into_iter();
        for round in 0..3 {
            for i in 0..3 {
                route(&mut mgr, &ItemId::new(format!("{round}-{i}")), &rl());
            }
            let resume = cooldown.resume_at().unwrap();
            assert_eq!(
                resume - Instant::now(),
                Duration::from_secs(expected.next().unwrap())
            );
            tokio::time::advance(resume - Instant::now()).await;
        }
        assert_eq!(cooldown.trips(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_sent_during_cooldown_clears_it() {
        let (mut mgr, cooldown) = manager();
        for i in 0..3 {
            route(&mut mgr, &ItemId::new(i.to_string()), &rl());
        }
        assert!(cooldown.is_active());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(route(&mut mgr, &ItemId::from("0"), &ok()), Action::Passthrough);
        assert!(!cooldown.is_active());
        assert_eq!(cooldown.trips(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_sent_before_cooldown_leaves_it_in_place() {
        let (mut mgr, cooldown) = manager();
        let sent = Instant::now();
        tokio::time::advance(Duration::from_millis(100)).await;
        for i in 0..3 {
            route(&mut mgr, &ItemId::new(i.to_string()), &rl());
        }
        tokio::time::advance(Duration::from_millis(50)).await;

        let action = mgr.classify_and_route(&ItemId::from("late"), &ok(), Some(sent));
        assert_eq!(action, Action::Passthrough);
        assert!(cooldown.is_active());
        assert_eq!(cooldown.trips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_window_resets_trip_counter() {
        let (mut mgr, cooldown) = manager();
        for i in 0..3 {
            route(&mut mgr, &ItemId::new(i.to_string()), &rl());
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cooldown.trips(), 1);
        for i in 0..4 {
            route(&mut mgr, &ItemId::new(format!("ok{i}")), &ok());
        }
        assert_eq!(cooldown.trips(), 0);
    }
}
