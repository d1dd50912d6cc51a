//! Named wall-clock timers for engine calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// Aggregate timing for one name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSummary {
    /// Calls counted after warmup.
    pub count: usize,
    pub total: Duration,
    pub average: Duration,
}

impl TimingSummary {
    pub fn fps(&self) -> f64 {
        let secs = self.average.as_secs_f64();
        if secs > 0.0 { 1.0 / secs } else { 0.0 }
    }
}

#[derive(Debug, Default)]
struct Record {
    calls: usize,
    count: usize,
    total: Duration,
}

/// Accumulates per-name durations and logs the running average.
///
/// The first `warmup` calls of each name are timed but not counted. After
/// that, every `log_interval` counted calls emit
/// `[name]-N times per count: X ms, Y FPS` at info level. A `log_interval`
/// of 0 keeps the counters without logging; that is the default.
#[derive(Debug)]
pub struct TimeCounter {
    warmup: usize,
    log_interval: usize,
    records: Mutex<HashMap<String, Record>>,
}

impl TimeCounter {
    pub fn new(warmup: usize, log_interval: usize) -> Self {
        Self {
            warmup,
            log_interval,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` and record its duration under `name`.
    pub fn measure<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(name, start.elapsed());
        out
    }

    /// Record an externally measured duration.
    pub fn record(&self, name: &str, elapsed: Duration) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(name.to_string()).or_default();
        record.calls += 1;
        if record.calls <= self.warmup {
            return;
        }

        record.count += 1;
        record.total += elapsed;
        if self.logs_at(record.count) {
            let avg_ms = record.total.as_secs_f64() * 1000.0 / record.count as f64;
            let fps = if avg_ms > 0.0 { 1000.0 / avg_ms } else { 0.0 };
            info!(
                "[{}]-{} times per count: {:.2} ms, {:.2} FPS",
                name, record.count, avg_ms, fps
            );
        }
    }

    /// Whether the `count`-th counted call emits a log line.
    fn logs_at(&self, count: usize) -> bool {
        self.log_interval > 0 && count % self.log_interval == 0
    }

    /// Counted calls for `name`, or `None` if nothing was counted yet.
    pub fn summary(&self, name: &str) -> Option<TimingSummary> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.get(name).filter(|r| r.count > 0)?;
        Some(TimingSummary {
            count: record.count,
            total: record.total,
            average: record.total / record.count as u32,
        })
    }

    /// Calls seen for `name`, warmup included.
    pub fn calls(&self, name: &str) -> usize {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(name).map_or(0, |r| r.calls)
    }

    pub fn reset(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for TimeCounter {
    fn default() -> Self {
        Self::new(1, 0)
    }
}
