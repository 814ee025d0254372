//! The dispatch loop.
//!
//! One task owns every work item. It dispatches fetch units into a
//! [`JoinSet`] while the congestion window, pacing delay and cooldown allow,
//! routes each completion through the retry manager, hands successes to the
//! buffer pool and commits terminal states to the checkpoint. Nothing else
//! writes the checkpoint.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::{BufferConfig, CrawlConfig};
use crate::error::{BufferError, CrawlError};
use crate::matching::MatchingEngine;
use crate::ymgal::ApiClient;

use super::buffer::{BufferPool, BufferedRecord, DataSink, FlushReport};
use super::checkpoint::{CheckpointStore, TerminalState};
use super::congestion::{CongestionController, CongestionWindow};
use super::item::{ItemState, Outcome, WorkItem};
use super::retry::{AbandonReason, Action, CooldownState, RetryManager};

/// Why the loop stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Every admitted item reached a terminal state.
    Completed,
    StopRequested,
    /// Too many fatal errors in a row.
    CircuitBreaker,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Completed => write!(f, "completed"),
            HaltReason::StopRequested => write!(f, "stop requested"),
            HaltReason::CircuitBreaker => write!(f, "circuit breaker"),
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Admitted but not terminal when the loop stopped.
    pub pending: usize,
    /// Already terminal in the checkpoint.
    pub skipped: usize,
    pub fetches: u64,
    pub flush_batches: u64,
    pub records_written: u64,
    pub initial_window: CongestionWindow,
    pub final_window: CongestionWindow,
    pub cooldowns: u32,
    /// Rate-limited responses seen by the congestion controller.
    pub rate_limited: u64,
    pub halt_reason: HaltReason,
    pub elapsed: Duration,
}

struct Deferred {
    eligible_at: Instant,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.eligible_at, self.seq).cmp(&(other.eligible_at, other.seq))
    }
}

/// Pending items: FIFO for eligible ones, a min-heap for those backing off.
#[derive(Default)]
struct PendingQueue {
    ready: VecDeque<WorkItem>,
    deferred: BinaryHeap<Reverse<Deferred>>,
    seq: u64,
}

impl PendingQueue {
    fn push(&mut self, item: WorkItem) {
        self.ready.push_back(item);
    }

    fn defer(&mut self, item: WorkItem, eligible_at: Instant) {
        self.seq += 1;
        self.deferred.push(Reverse(Deferred {
            eligible_at,
            seq: self.seq,
            item,
        }));
    }

    /// Moves items whose backoff has passed to the back of the FIFO.
    fn promote(&mut self, now: Instant) {
        while self
            .deferred
            .peek()
            .is_some_and(|Reverse(d)| d.eligible_at <= now)
        {
            if let Some(Reverse(d)) = self.deferred.pop() {
                self.ready.push_back(d.item);
            }
        }
    }

    fn next_eligible_at(&self) -> Option<Instant> {
        self.deferred.peek().map(|Reverse(d)| d.eligible_at)
    }

    fn pop_ready(&mut self) -> Option<WorkItem> {
        self.ready.pop_front()
    }

    fn len(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutable state of a single `run` call.
struct RunState {
    queue: PendingQueue,
    in_flight: JoinSet<(WorkItem, Outcome)>,
    buffer: BufferPool,
    flushed: mpsc::UnboundedReceiver<FlushReport>,
    last_dispatch: Option<Instant>,
    consecutive_fatal: u32,
    halt: Option<HaltReason>,
    fetches: u64,
    succeeded: usize,
    failed: usize,
    abandoned: usize,
    /// Items lost to a failed fetch task; reported as pending.
    lost: usize,
}

pub struct Scheduler<C, M> {
    client: Arc<C>,
    matcher: Arc<M>,
    controller: Arc<CongestionController>,
    cooldown: Arc<CooldownState>,
    retry: RetryManager,
    checkpoint: CheckpointStore,
    buffer_config: BufferConfig,
    request_timeout: Duration,
    max_consecutive_fatal: u32,
    readmit_failed: bool,
    progress: ProgressBar,
}

impl<C: ApiClient, M: MatchingEngine> Scheduler<C, M> {
    pub fn new(client: C, matcher: M, checkpoint: CheckpointStore, config: &CrawlConfig) -> Self {
        let cooldown = Arc::new(CooldownState::new());
        Self {
            client: Arc::new(client),
            matcher: Arc::new(matcher),
            controller: Arc::new(CongestionController::new(config.congestion.clone())),
            retry: RetryManager::new(config.retry.clone(), cooldown.clone()),
            cooldown,
            checkpoint,
            buffer_config: config.buffer.clone(),
            request_timeout: config.api.request_timeout(),
            max_consecutive_fatal: config.retry.max_consecutive_fatal,
            readmit_failed: false,
            progress: ProgressBar::hidden(),
        }
    }

    /// Re-admit items the checkpoint records as Failed or Abandoned.
    pub fn readmit_failed(mut self, readmit: bool) -> Self {
        self.readmit_failed = readmit;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Crawls `items` until all are terminal or `stop` fires, then drains
    /// in-flight fetches and the buffer pool before returning.
    pub async fn run<S: DataSink>(
        &mut self,
        items: Vec<WorkItem>,
        sink: S,
        stop: CancellationToken,
    ) -> Result<Summary, CrawlError> {
        let started = Instant::now();
        let initial_window = self.controller.current_window();
        let (flush_tx, flushed) = mpsc::unbounded_channel();

        let mut state = RunState {
            queue: PendingQueue::default(),
            in_flight: JoinSet::new(),
            buffer: BufferPool::start(sink, self.buffer_config.clone(), flush_tx),
            flushed,
            last_dispatch: None,
            consecutive_fatal: 0,
            halt: None,
            fetches: 0,
            succeeded: 0,
            failed: 0,
            abandoned: 0,
            lost: 0,
        };

        let mut skipped = 0;
        let mut unsearchable = Vec::new();
        for item in items {
            if self.checkpoint.is_done(&item.id, self.readmit_failed) {
                skipped += 1;
            } else if item.query.is_empty() {
                unsearchable.push(item);
            } else {
                state.queue.push(item);
            }
        }
        self.progress
            .set_length((state.queue.len() + unsearchable.len()) as u64);
        tracing::info!(
            admitted = state.queue.len(),
            skipped,
            unsearchable = unsearchable.len(),
            concurrency = initial_window.concurrency,
            "starting crawl"
        );

        for mut item in unsearchable {
            tracing::warn!(item = %item.id, "record has no searchable name");
            item.finish(ItemState::Failed);
            self.checkpoint.commit(&item.id, TerminalState::Failed).await?;
            state.failed += 1;
            self.progress.inc(1);
        }

        loop {
            if state.halt.is_none() && stop.is_cancelled() {
                state.halt = Some(HaltReason::StopRequested);
            }
            let wake = if state.halt.is_none() {
                self.dispatch_ready(&mut state)
            } else {
                None
            };
            if state.in_flight.is_empty() && (state.halt.is_some() || state.queue.is_empty()) {
                break;
            }

            tokio::select! {
                biased;

                _ = stop.cancelled(), if state.halt.is_none() => {
                    tracing::info!(in_flight = state.in_flight.len(), "stop requested, draining");
                    state.halt = Some(HaltReason::StopRequested);
                }
                Some(report) = state.flushed.recv() => {
                    self.commit_flushed(&mut state, report).await?;
                }
                Some(joined) = state.in_flight.join_next() => match joined {
                    Ok((item, outcome)) => self.complete(&mut state, item, outcome).await?,
                    Err(e) => {
                        tracing::error!(error = %e, "fetch task failed, item left pending");
                        state.lost += 1;
                    }
                },
                _ = sleep_until(wake.unwrap_or(started)), if wake.is_some() => {}
                else => break,
            }
        }

        // Accepted records must be flushed and checkpointed even when the sink
        // gives up halfway; report whatever made it.
        let stopped = state.buffer.stop().await;
        self.drain_flushed(&mut state).await?;
        self.checkpoint.sync().await?;
        let stats = stopped?;

        let summary = Summary {
            succeeded: state.succeeded,
            failed: state.failed,
            abandoned: state.abandoned,
            pending: state.queue.len() + state.lost,
            skipped,
            fetches: state.fetches,
            flush_batches: stats.batches,
            records_written: stats.written,
            initial_window,
            final_window: self.controller.current_window(),
            cooldowns: self.retry.cooldowns_triggered(),
            rate_limited: self.controller.stats().rate_limited,
            halt_reason: state.halt.unwrap_or(HaltReason::Completed),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            abandoned = summary.abandoned,
            pending = summary.pending,
            halt = %summary.halt_reason,
            "crawl finished"
        );
        Ok(summary)
    }

    /// Dispatches everything the window allows right now. Returns when the
    /// next dispatch becomes possible if only time stands in the way, `None`
    /// if the loop must wait for a completion instead.
    fn dispatch_ready(&self, state: &mut RunState) -> Option<Instant> {
        loop {
            let window = self.controller.current_window();
            if state.in_flight.len() >= window.concurrency {
                return None;
            }

            let now = Instant::now();
            let mut gate = now;
            if let Some(resume_at) = self.cooldown.resume_at() {
                gate = gate.max(resume_at);
            }
            if let Some(last) = state.last_dispatch {
                gate = gate.max(last + window.delay);
            }
            state.queue.promote(now);
            if state.queue.ready.is_empty() {
                gate = gate.max(state.queue.next_eligible_at()?);
            }
            if gate > now {
                return Some(gate);
            }

            let mut item = state.queue.pop_ready()?;
            item.mark_in_flight(now);
            state.fetches += 1;
            state.last_dispatch = Some(now);
            tracing::debug!(
                item = %item.id,
                attempt = item.attempts,
                in_flight = state.in_flight.len() + 1,
                concurrency = window.concurrency,
                "dispatching"
            );
            self.spawn_fetch(&mut state.in_flight, item);
        }
    }

    fn spawn_fetch(&self, in_flight: &mut JoinSet<(WorkItem, Outcome)>, item: WorkItem) {
        let client = self.client.clone();
        let matcher = self.matcher.clone();
        let controller = self.controller.clone();
        let request_timeout = self.request_timeout;
        let fallback = item.clone();

        // The inner task isolates panics in the client or matcher so the item
        // comes back either way.
        in_flight.spawn(async move {
            let unit = tokio::spawn(fetch_unit(
                client,
                matcher,
                controller.clone(),
                request_timeout,
                item,
            ));
            match unit.await {
                Ok(done) => done,
                Err(e) => {
                    let outcome = Outcome::TransientError(format!("fetch unit failed: {e}"));
                    controller.observe(&outcome);
                    (fallback, outcome)
                }
            }
        });
    }

    async fn complete(
        &mut self,
        state: &mut RunState,
        mut item: WorkItem,
        outcome: Outcome,
    ) -> Result<(), CrawlError> {
        if matches!(outcome, Outcome::FatalError(_)) {
            state.consecutive_fatal += 1;
        } else {
            state.consecutive_fatal = 0;
        }

        let action = self
            .retry
            .classify_and_route(&item.id, &outcome, item.dispatched_at);
        match (action, outcome) {
            (Action::Passthrough, Outcome::Success(decision)) => {
                let record = BufferedRecord::from_item(&item, decision, self.checkpoint.run_id());
                item.finish(ItemState::Succeeded);
                if let Err(BufferError::Stopped) = state.buffer.put(record).await {
                    // The flush task only exits early when the sink gave up.
                    // Batches it wrote before that still get checkpointed.
                    let stopped = state.buffer.stop().await;
                    self.drain_flushed(state).await?;
                    stopped?;
                    return Err(CrawlError::Buffer("flush task exited early".into()));
                }
            }
            (Action::Passthrough, other) => {
                unreachable!("passthrough for non-success outcome {other:?}")
            }
            (Action::Requeue(delay), _) => {
                item.requeue();
                state.queue.defer(item, Instant::now() + delay);
            }
            (Action::Abandon(reason), _) => {
                let terminal = match &reason {
                    AbandonReason::Exhausted { .. } => TerminalState::Abandoned,
                    AbandonReason::Fatal(_) => TerminalState::Failed,
                };
                tracing::warn!(item = %item.id, reason = %reason, "item given up");
                item.finish(terminal.into());
                self.checkpoint.commit(&item.id, terminal).await?;
                match terminal {
                    TerminalState::Failed => state.failed += 1,
                    _ => state.abandoned += 1,
                }
                self.progress.inc(1);
            }
        }

        if self.max_consecutive_fatal > 0
            && state.consecutive_fatal >= self.max_consecutive_fatal
            && state.halt.is_none()
        {
            tracing::error!(
                consecutive = state.consecutive_fatal,
                "too many fatal errors in a row, halting dispatch"
            );
            state.halt = Some(HaltReason::CircuitBreaker);
        }
        Ok(())
    }

    /// Commits every flush report already queued, without waiting for more.
    async fn drain_flushed(&mut self, state: &mut RunState) -> Result<(), CrawlError> {
        while let Ok(report) = state.flushed.try_recv() {
            self.commit_flushed(state, report).await?;
        }
        Ok(())
    }

    async fn commit_flushed(
        &mut self,
        state: &mut RunState,
        report: FlushReport,
    ) -> Result<(), CrawlError> {
        for id in &report.ids {
            self.checkpoint.commit(id, TerminalState::Succeeded).await?;
        }
        self.checkpoint.sync().await?;
        state.succeeded += report.ids.len();
        self.progress.inc(report.ids.len() as u64);
        let window = self.controller.current_window();
        self.progress.set_message(format!(
            "window {} / {}ms",
            window.concurrency,
            window.delay.as_millis()
        ));
        Ok(())
    }
}

/// One attempt: fetch under the request timeout, score, report to the
/// controller.
async fn fetch_unit<C: ApiClient, M: MatchingEngine>(
    client: Arc<C>,
    matcher: Arc<M>,
    controller: Arc<CongestionController>,
    request_timeout: Duration,
    item: WorkItem,
) -> (WorkItem, Outcome) {
    let outcome = match timeout(request_timeout, client.fetch(&item.query)).await {
        Ok(Ok(raw)) => Outcome::Success(matcher.score(&raw, &item.record)),
        Ok(Err(failure)) => Outcome::from(failure),
        Err(_) => Outcome::TransientError(format!(
            "request timed out after {}ms",
            request_timeout.as_millis()
        )),
    };
    controller.observe(&outcome);
    (item, outcome)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use uuid::Uuid;

    use super::*;
    use crate::engine::testing::{MemorySink, ScriptedClient, game, items, success_for};
    use crate::engine::{ItemId, QueryMode};
    use crate::matching::BestScoreMatcher;
    use crate::ymgal::HttpFailure;

    fn config() -> CrawlConfig {
        let mut config = CrawlConfig::default();
        config.api.request_timeout_ms = 5_000;
        config.congestion.min_concurrency = 1;
        config.congestion.max_concurrency = 16;
        config.congestion.initial_concurrency = 4;
        config.congestion.min_delay_ms = 0;
        config.congestion.initial_delay_ms = 0;
        config.congestion.success_threshold = 5;
        config.retry.max_attempts = 3;
        config.buffer.buffer_size_threshold = 5;
        config.buffer.buffer_flush_interval_ms = 3_600_000;
        config
    }

    async fn scheduler(
        client: ScriptedClient,
        config: &CrawlConfig,
        dir: &tempfile::TempDir,
    ) -> Scheduler<ScriptedClient, BestScoreMatcher> {
        let checkpoint = CheckpointStore::open(dir.path().join("checkpoint.jsonl"), Uuid::new_v4())
            .await
            .unwrap();
        Scheduler::new(
            client,
            BestScoreMatcher::new(0.0, QueryMode::Names),
            checkpoint,
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_items_are_retried_and_flushed_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let client = ScriptedClient::new(Duration::from_millis(100), |key, attempt| {
            let n: u32 = key.parse().unwrap();
            if (3..=7).contains(&n) && attempt == 1 {
                Err(HttpFailure::RateLimited { retry_after: None })
            } else {
                Ok(success_for(key))
            }
        });
        let sink = MemorySink::default();

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..10), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.halt_reason, HaltReason::Completed);
        assert_eq!(summary.succeeded, 10);
        assert_eq!(summary.failed + summary.abandoned + summary.pending, 0);
        assert_eq!(summary.fetches, 15);
        assert_eq!(summary.flush_batches, 2);
        assert_eq!(sink.batch_sizes(), vec![5, 5]);
        let written: BTreeSet<ItemId> = sink.ids().into_iter().collect();
        assert_eq!(written.len(), 10);
        assert!(summary.final_window.concurrency < summary.initial_window.concurrency);
        assert_eq!(sched.checkpoint().counts().succeeded, 10);
        drop(sched);

        // A second run over the same checkpoint has nothing to do.
        let rerun_client = ScriptedClient::new(Duration::from_millis(100), |key, _| Ok(success_for(key)));
        let rerun_sink = MemorySink::default();
        let mut sched = scheduler(rerun_client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..10), rerun_sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 10);
        assert_eq!(summary.fetches, 0);
        assert_eq!(rerun_client.fetches(), 0);
        assert!(rerun_sink.ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_is_abandoned_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let client = ScriptedClient::new(Duration::from_millis(10), |_, _| Err(HttpFailure::Timeout));
        let sink = MemorySink::default();

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..1), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.fetches(), 3);
        assert_eq!(summary.abandoned, 1);
        assert!(sink.ids().is_empty());
        assert_eq!(
            sched.checkpoint().state_of(&ItemId::from("0")),
            Some(TerminalState::Abandoned)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out_as_transient() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.api.request_timeout_ms = 500;
        let client = ScriptedClient::new(Duration::from_secs(2), |key, _| Ok(success_for(key)));

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..1), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_pauses_all_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.congestion.initial_concurrency = 3;
        config.retry.rate_limit_window = 3;
        config.retry.rate_limit_min_samples = 3;
        config.retry.rate_limit_threshold = 0.5;
        config.retry.cooldown_base_duration_ms = 60_000;
        config.retry.cooldown_max_duration_ms = 60_000;
        let client = ScriptedClient::new(Duration::from_millis(100), |key, attempt| {
            if attempt == 1 {
                Err(HttpFailure::RateLimited { retry_after: None })
            } else {
                Ok(success_for(key))
            }
        });

        let start = Instant::now();
        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..3), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.cooldowns, 1);
        assert_eq!(summary.succeeded, 3);
        let times = client.fetch_times();
        assert_eq!(times.len(), 6);
        assert!(times[..3].iter().all(|t| *t == start));
        // Cooldown started when the third response arrived at 100ms.
        assert!(
            times[3..]
                .iter()
                .all(|t| *t >= start + Duration::from_millis(60_100))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_already_in_flight_does_not_lift_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.congestion.initial_concurrency = 4;
        config.retry.rate_limit_window = 3;
        config.retry.rate_limit_min_samples = 3;
        config.retry.rate_limit_threshold = 0.5;
        config.retry.cooldown_base_duration_ms = 60_000;
        config.retry.cooldown_max_duration_ms = 60_000;
        // Items 0-2 are throttled at 100ms; item 3 was sent alongside them
        // and succeeds at 150ms, after the cooldown tripped.
        let client = ScriptedClient::new(Duration::ZERO, |key, attempt| {
            if key != "3" && attempt == 1 {
                Err(HttpFailure::RateLimited { retry_after: None })
            } else {
                Ok(success_for(key))
            }
        })
        .with_latency(|key| match key {
            "3" => Duration::from_millis(150),
            _ => Duration::from_millis(100),
        });

        let start = Instant::now();
        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..4), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.cooldowns, 1);
        assert_eq!(summary.succeeded, 4);
        let times = client.fetch_times();
        assert_eq!(times.len(), 7);
        assert!(times[..4].iter().all(|t| *t == start));
        assert!(
            times[4..]
                .iter()
                .all(|t| *t >= start + Duration::from_millis(60_100))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_still_checkpoints_written_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.congestion.initial_concurrency = 5;
        config.buffer.buffer_size_threshold = 2;
        config.buffer.buffer_capacity = 4;
        config.buffer.sink_max_attempts = 1;
        let client = ScriptedClient::new(Duration::from_millis(10), |key, _| Ok(success_for(key)));
        // The first batch lands, the second one kills the flush task.
        let sink = MemorySink::failing_after(1);

        let mut sched = scheduler(client, &config, &dir).await;
        let result = sched
            .run(items(0..5), sink.clone(), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(CrawlError::SinkExhausted { .. })));
        let written = sink.ids();
        assert_eq!(written.len(), 2);
        for id in &written {
            assert_eq!(sched.checkpoint().state_of(id), Some(TerminalState::Succeeded));
        }
        assert_eq!(sched.checkpoint().counts().succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_in_flight_and_reports_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.congestion.initial_concurrency = 2;
        config.buffer.buffer_size_threshold = 100;
        let client = ScriptedClient::new(Duration::from_secs(1), |key, _| Ok(success_for(key)));
        let sink = MemorySink::default();

        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            trigger.cancel();
        });

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched.run(items(0..20), sink.clone(), stop).await.unwrap();

        assert_eq!(summary.halt_reason, HaltReason::StopRequested);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.pending, 16);
        assert_eq!(sink.ids().len(), 4);
        assert_eq!(sched.checkpoint().counts().succeeded, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_fatal_errors_trip_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.congestion.initial_concurrency = 1;
        config.retry.max_consecutive_fatal = 3;
        let client = ScriptedClient::new(Duration::from_millis(10), |_, _| {
            Err(HttpFailure::Status {
                status: 404,
                message: "gone".into(),
            })
        });

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..5), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.halt_reason, HaltReason::CircuitBreaker);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.pending, 2);
        assert_eq!(client.fetches(), 3);
        assert_eq!(
            sched.checkpoint().state_of(&ItemId::from("0")),
            Some(TerminalState::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsearchable_records_fail_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let client = ScriptedClient::new(Duration::from_millis(10), |key, _| Ok(success_for(key)));
        let mut blank = game("blank");
        blank.jp_name = None;
        blank.cn_name = None;

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(
                vec![WorkItem::new(blank, QueryMode::Names)],
                MemorySink::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(client.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_fetch_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let client = ScriptedClient::new(Duration::from_millis(10), |key, attempt| {
            if attempt == 1 {
                panic!("client bug");
            }
            Ok(success_for(key))
        });
        let sink = MemorySink::default();

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..1), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.fetches, 2);
        assert_eq!(sink.ids(), vec![ItemId::from("0")]);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_max_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.congestion.max_concurrency = 3;
        config.congestion.initial_concurrency = 1;
        config.congestion.success_threshold = 1;
        let client = ScriptedClient::new(Duration::from_millis(50), |key, _| Ok(success_for(key)));

        let mut sched = scheduler(client.clone(), &config, &dir).await;
        let summary = sched
            .run(items(0..30), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 30);
        assert_eq!(client.max_in_flight(), 3);
        assert_eq!(summary.final_window.concurrency, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_items_are_readmitted_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let failing = ScriptedClient::new(Duration::from_millis(10), |_, _| {
            Err(HttpFailure::Status {
                status: 400,
                message: "bad".into(),
            })
        });
        let mut sched = scheduler(failing, &config, &dir).await;
        sched
            .run(items(0..2), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();
        drop(sched);

        let client = ScriptedClient::new(Duration::from_millis(10), |key, _| Ok(success_for(key)));
        let mut sched = scheduler(client.clone(), &config, &dir)
            .await
            .readmit_failed(true);
        let summary = sched
            .run(items(0..2), MemorySink::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.succeeded, 2);
    }
}
