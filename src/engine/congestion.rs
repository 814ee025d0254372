//! AIMD congestion control for the dispatch loop.
//!
//! The window is a pair of knobs: how many fetches may be in flight and how
//! long to wait between two dispatches. Successes open it slowly, throttling
//! closes it fast.

use std::sync::Mutex;
use std::time::Duration;

use crate::config::CongestionConfig;

use super::item::Outcome;

/// Current dispatch limits. Always within the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionWindow {
    pub concurrency: usize,
    pub delay: Duration,
}

/// Snapshot for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionStats {
    pub window: CongestionWindow,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
}

#[derive(Debug)]
struct WindowState {
    window: CongestionWindow,
    success_streak: u32,
    successes: u64,
    failures: u64,
    rate_limited: u64,
}

/// Shared between the dispatch loop (reads) and fetch units (report outcomes).
#[derive(Debug)]
pub struct CongestionController {
    config: CongestionConfig,
    state: Mutex<WindowState>,
}

impl CongestionController {
    pub fn new(config: CongestionConfig) -> Self {
        let window = CongestionWindow {
            concurrency: config
                .initial_concurrency
                .clamp(config.min_concurrency, config.max_concurrency),
            delay: config
                .initial_delay()
                .clamp(config.min_delay(), config.max_delay()),
        };
        Self {
            config,
            state: Mutex::new(WindowState {
                window,
                success_streak: 0,
                successes: 0,
                failures: 0,
                rate_limited: 0,
            }),
        }
    }

    pub fn current_window(&self) -> CongestionWindow {
        self.lock().window
    }

    pub fn stats(&self) -> CongestionStats {
        let state = self.lock();
        CongestionStats {
            window: state.window,
            successes: state.successes,
            failures: state.failures,
            rate_limited: state.rate_limited,
        }
    }

    /// Folds one attempt's outcome into the window.
    pub fn observe(&self, outcome: &Outcome) {
        let c = &self.config;
        let mut state = self.lock();
        let before = state.window;

        match outcome {
            Outcome::Success(_) => {
                state.successes += 1;
                state.success_streak += 1;
                if state.success_streak >= c.success_threshold {
                    state.success_streak = 0;
                    let w = &mut state.window;
                    w.concurrency = (w.concurrency + 1).min(c.max_concurrency);
                    w.delay = scale(w.delay, 1.0 - c.delay_decrease_ratio)
                        .clamp(c.min_delay(), c.max_delay());
                }
            }
            Outcome::RateLimited { .. } => {
                state.failures += 1;
                state.rate_limited += 1;
                state.success_streak = 0;
                let floor = c.rate_limit_delay_floor().clamp(c.min_delay(), c.max_delay());
                let w = &mut state.window;
                w.concurrency = (w.concurrency / 2).max(c.min_concurrency);
                w.delay = scale(w.delay, c.backoff_factor)
                    .max(floor)
                    .clamp(c.min_delay(), c.max_delay());
            }
            Outcome::TransientError(_) => {
                state.failures += 1;
                state.success_streak = 0;
                let w = &mut state.window;
                w.concurrency = w.concurrency.saturating_sub(1).max(c.min_concurrency);
                w.delay = scale(w.delay, 1.0 + c.delay_decrease_ratio)
                    .clamp(c.min_delay(), c.max_delay());
            }
            // Says nothing about server load.
            Outcome::FatalError(_) => {
                state.failures += 1;
            }
        }

        let after = state.window;
        if after != before {
            match outcome {
                Outcome::RateLimited { .. } => tracing::warn!(
                    concurrency = after.concurrency,
                    delay_ms = after.delay.as_millis() as u64,
                    "rate limited, shrinking window"
                ),
                _ => tracing::debug!(
                    concurrency = after.concurrency,
                    delay_ms = after.delay.as_millis() as u64,
                    "congestion window adjusted"
                ),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        // A panic while holding the lock leaves the window in a valid state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Multiplies at nanosecond resolution, rounding to the nearest nanosecond.
fn scale(delay: Duration, factor: f64) -> Duration {
    let nanos = (delay.as_nanos() as f64 * factor).round();
    Duration::from_nanos(nanos.clamp(0.0, u64::MAX as f64) as u64)
}
