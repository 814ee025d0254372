//! Buffered write pipeline between the dispatch loop and the data sink.
//!
//! Results go into a bounded channel (the front buffer). A single flush task
//! drains it into a batch (the back buffer) and writes the batch when it is
//! full, when the flush interval has passed, or on stop. The channel keeps
//! accepting while a batch is being written, so producers only wait when it
//! is full.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::error::{BufferError, CrawlError, SinkError};
use crate::matching::{MatchDecision, MatchedGame};

use super::item::{ItemId, WorkItem};

/// A finished result row. Immutable once handed to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub item_id: ItemId,
    pub title: String,
    pub jp_name: Option<String>,
    pub cn_name: Option<String>,
    /// `None` when the archive had no acceptable candidate.
    pub matched: Option<MatchedGame>,
    pub attempts: u32,
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl BufferedRecord {
    pub fn from_item(item: &WorkItem, decision: MatchDecision, run_id: Uuid) -> Self {
        let record = &item.record;
        Self {
            item_id: item.id.clone(),
            title: record.title.clone(),
            jp_name: record.jp_name.clone(),
            cn_name: record.cn_name.clone(),
            matched: match decision {
                MatchDecision::Matched(game) => Some(game),
                MatchDecision::NoMatch => None,
            },
            attempts: item.attempts,
            run_id,
            recorded_at: Utc::now(),
        }
    }
}

/// Destination of flushed batches.
pub trait DataSink: Send + Sync + 'static {
    /// Writes the whole batch or fails; partial writes must not be reported
    /// as success.
    fn append_batch(
        &self,
        batch: &[BufferedRecord],
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Sent to the scheduler after each successful flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// 1-based flush sequence number.
    pub batch: u64,
    pub ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub accepted: u64,
    pub written: u64,
    pub batches: u64,
    pub sink_retries: u64,
}

/// Handle to the flush task.
pub struct BufferPool {
    tx: Option<mpsc::Sender<BufferedRecord>>,
    handle: Option<JoinHandle<Result<BufferStats, CrawlError>>>,
    stopped: Option<BufferStats>,
}

impl BufferPool {
    /// Spawns the flush task. Flush reports are sent on `reports`.
    pub fn start<S: DataSink>(
        sink: S,
        config: BufferConfig,
        reports: mpsc::UnboundedSender<FlushReport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let flusher = Flusher {
            sink,
            config,
            reports,
            stats: BufferStats::default(),
        };
        let handle = tokio::spawn(flusher.run(rx));
        Self {
            tx: Some(tx),
            handle: Some(handle),
            stopped: None,
        }
    }

    /// Hands a record to the flush task, waiting only while the channel is
    /// full. Fails once the pool is stopped or the flush task has died.
    pub async fn put(&self, record: BufferedRecord) -> Result<(), BufferError> {
        let tx = self.tx.as_ref().ok_or(BufferError::Stopped)?;
        tx.send(record).await.map_err(|_| BufferError::Stopped)
    }

    /// Closes the channel and waits until everything accepted so far has been
    /// flushed. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<BufferStats, CrawlError> {
        self.tx.take();
        let Some(handle) = self.handle.take() else {
            return self
                .stopped
                .ok_or_else(|| CrawlError::Buffer("flush task already failed".into()));
        };
        let stats = handle
            .await
            .map_err(|e| CrawlError::Buffer(format!("flush task panicked: {e}")))??;
        self.stopped = Some(stats);
        Ok(stats)
    }
}

struct Flusher<S> {
    sink: S,
    config: BufferConfig,
    reports: mpsc::UnboundedSender<FlushReport>,
    stats: BufferStats,
}

impl<S: DataSink> Flusher<S> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<BufferedRecord>,
    ) -> Result<BufferStats, CrawlError> {
        let threshold = self.config.buffer_size_threshold.max(1);
        let interval = self.config.flush_interval();
        let mut batch: Vec<BufferedRecord> = Vec::with_capacity(threshold);
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(record) = received else { break };
                    self.stats.accepted += 1;
                    batch.push(record);
                    if batch.len() >= threshold {
                        self.flush(&mut batch, &mut rx).await?;
                        last_flush = Instant::now();
                    }
                }
                _ = sleep_until(last_flush + interval), if !batch.is_empty() => {
                    self.flush(&mut batch, &mut rx).await?;
                    last_flush = Instant::now();
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut rx).await?;
        }
        tracing::debug!(
            written = self.stats.written,
            batches = self.stats.batches,
            "buffer pool drained"
        );
        Ok(self.stats)
    }

    async fn flush(
        &mut self,
        batch: &mut Vec<BufferedRecord>,
        rx: &mut mpsc::Receiver<BufferedRecord>,
    ) -> Result<(), CrawlError> {
        let max_attempts = self.config.sink_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.append_batch(batch).await {
                Ok(()) => break,
                Err(e) if attempt < max_attempts => {
                    let delay = self.config.sink_retry_delay(attempt);
                    tracing::warn!(
                        attempt,
                        records = batch.len(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "sink write failed, retrying"
                    );
                    self.stats.sink_retries += 1;
                    sleep(delay).await;
                }
                Err(source) => {
                    // Nothing more will be written; count what is lost.
                    rx.close();
                    let mut unwritten = batch.len();
                    while rx.try_recv().is_ok() {
                        unwritten += 1;
                    }
                    tracing::error!(attempts = attempt, unwritten, error = %source, "sink exhausted");
                    return Err(CrawlError::SinkExhausted {
                        attempts: attempt,
                        unwritten,
                        source,
                    });
                }
            }
        }

        self.stats.batches += 1;
        self.stats.written += batch.len() as u64;
        let ids: Vec<ItemId> = batch.drain(..).map(|r| r.item_id).collect();
        tracing::debug!(batch = self.stats.batches, records = ids.len(), "flushed batch");
        // The scheduler may already be gone during shutdown.
        let _ = self.reports.send(FlushReport {
            batch: self.stats.batches,
            ids,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::engine::testing::{MemorySink, row};

    fn config(threshold: usize, interval_ms: u64) -> BufferConfig {
        BufferConfig {
            buffer_size_threshold: threshold,
            buffer_flush_interval_ms: interval_ms,
            buffer_capacity: 16,
            sink_max_attempts: 3,
            sink_retry_base_delay_ms: 500,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<FlushReport>) -> Vec<FlushReport> {
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }

    #[tokio::test]
    async fn every_accepted_record_is_written_once() {
        let sink = MemorySink::default();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut pool = BufferPool::start(sink.clone(), config(10, 3_600_000), report_tx);

        for i in 0..47 {
            pool.put(row(&i.to_string())).await.unwrap();
        }
        let stats = pool.stop().await.unwrap();

        assert_eq!(stats.accepted, 47);
        assert_eq!(stats.written, 47);
        assert_eq!(stats.batches, 5);
        assert_eq!(sink.batch_sizes(), vec![10, 10, 10, 10, 7]);
        let expected: Vec<ItemId> = (0..47).map(|i| ItemId::new(i.to_string())).collect();
        assert_eq!(sink.ids(), expected);

        let reports = drain(&mut report_rx);
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[4].batch, 5);
        assert_eq!(reports[4].ids.len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_interval() {
        let sink = MemorySink::default();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut pool = BufferPool::start(sink.clone(), config(100, 3_000), report_tx);

        for i in 0..3 {
            pool.put(row(&i.to_string())).await.unwrap();
        }
        sleep(Duration::from_millis(2_000)).await;
        assert!(sink.batch_sizes().is_empty());

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(sink.batch_sizes(), vec![3]);
        assert_eq!(drain(&mut report_rx).len(), 1);

        pool.stop().await.unwrap();
        assert_eq!(sink.batch_sizes(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_sink_is_retried_without_loss() {
        let sink = MemorySink::failing(2);
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let mut pool = BufferPool::start(sink.clone(), config(4, 3_600_000), report_tx);

        for i in 0..4 {
            pool.put(row(&i.to_string())).await.unwrap();
        }
        let stats = pool.stop().await.unwrap();
        assert_eq!(stats.sink_retries, 2);
        assert_eq!(stats.written, 4);
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sink_surfaces_error() {
        let sink = MemorySink::failing(u32::MAX);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut pool = BufferPool::start(sink.clone(), config(2, 3_600_000), report_tx);

        pool.put(row("a")).await.unwrap();
        pool.put(row("b")).await.unwrap();
        let err = pool.stop().await.unwrap_err();
        match err {
            CrawlError::SinkExhausted {
                attempts, unwritten, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(unwritten, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(drain(&mut report_rx).is_empty());
        assert!(matches!(pool.stop().await, Err(CrawlError::Buffer(_))));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_rejects_late_puts() {
        let sink = MemorySink::default();
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let mut pool = BufferPool::start(sink.clone(), config(10, 3_600_000), report_tx);

        pool.put(row("x")).await.unwrap();
        let first = pool.stop().await.unwrap();
        let second = pool.stop().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.put(row("y")).await, Err(BufferError::Stopped));
        assert_eq!(sink.ids(), vec![ItemId::from("x")]);
    }

    #[tokio::test(start_paused = true)]
    async fn producers_keep_going_while_a_batch_is_written() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let sink = MemorySink::gated(gate.clone());
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let mut pool = BufferPool::start(sink.clone(), config(2, 3_600_000), report_tx);

        pool.put(row("0")).await.unwrap();
        pool.put(row("1")).await.unwrap();
        // The first batch is now stuck in the sink.
        for i in 2..9 {
            tokio::time::timeout(Duration::from_secs(1), pool.put(row(&i.to_string())))
                .await
                .expect("put blocked behind a slow flush")
                .unwrap();
        }

        gate.add_permits(1);
        let stats = pool.stop().await.unwrap();
        assert_eq!(stats.written, 9);
        assert_eq!(sink.ids().len(), 9);
    }
}
