//! Usage accounting metrics for Prometheus
//!
//! Counters are plain atomics; `export_prometheus` renders them in the text
//! exposition format for the admin endpoint.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Stage of an `update_usage` call, timed separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageStage {
    Seed,
    Increment,
    MarkDirty,
}

impl UsageStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Increment => "increment",
            Self::MarkDirty => "mark_dirty",
        }
    }
}

/// Counters for the usage accountant
#[derive(Debug)]
pub struct UsageMetrics {
    start_time: Instant,
    increments_total: AtomicU64,
    increment_failures_total: AtomicU64,
    slow_seed_total: AtomicU64,
    slow_increment_total: AtomicU64,
    slow_mark_dirty_total: AtomicU64,
    negative_usage_total: AtomicU64,
    flush_cycles_total: AtomicU64,
    flush_skipped_total: AtomicU64,
    flushed_buckets_total: AtomicU64,
    flush_failed_buckets_total: AtomicU64,
    dropped_buckets_total: AtomicU64,
    reconcile_seeded_total: AtomicU64,
    reconcile_flushed_total: AtomicU64,
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

impl UsageMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            increments_total: AtomicU64::new(0),
            increment_failures_total: AtomicU64::new(0),
            slow_seed_total: AtomicU64::new(0),
            slow_increment_total: AtomicU64::new(0),
            slow_mark_dirty_total: AtomicU64::new(0),
            negative_usage_total: AtomicU64::new(0),
            flush_cycles_total: AtomicU64::new(0),
            flush_skipped_total: AtomicU64::new(0),
            flushed_buckets_total: AtomicU64::new(0),
            flush_failed_buckets_total: AtomicU64::new(0),
            dropped_buckets_total: AtomicU64::new(0),
            reconcile_seeded_total: AtomicU64::new(0),
            reconcile_flushed_total: AtomicU64::new(0),
        }
    }

    pub fn record_increment(&self) {
        self.increments_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment_failure(&self) {
        self.increment_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_stage(&self, stage: UsageStage) {
        let counter = match stage {
            UsageStage::Seed => &self.slow_seed_total,
            UsageStage::Increment => &self.slow_increment_total,
            UsageStage::MarkDirty => &self.slow_mark_dirty_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_usage(&self) {
        self.negative_usage_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, flushed: usize, failed: usize, dropped: usize) {
        self.flush_cycles_total.fetch_add(1, Ordering::Relaxed);
        self.flushed_buckets_total
            .fetch_add(flushed as u64, Ordering::Relaxed);
        self.flush_failed_buckets_total
            .fetch_add(failed as u64, Ordering::Relaxed);
        self.dropped_buckets_total
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn record_flush_skipped(&self) {
        self.flush_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile(&self, seeded: usize, flushed: usize, dropped: usize) {
        self.reconcile_seeded_total
            .fetch_add(seeded as u64, Ordering::Relaxed);
        self.reconcile_flushed_total
            .fetch_add(flushed as u64, Ordering::Relaxed);
        self.dropped_buckets_total
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn increments(&self) -> u64 {
        self.increments_total.load(Ordering::Relaxed)
    }

    pub fn increment_failures(&self) -> u64 {
        self.increment_failures_total.load(Ordering::Relaxed)
    }

    pub fn slow_stages(&self, stage: UsageStage) -> u64 {
        match stage {
            UsageStage::Seed => self.slow_seed_total.load(Ordering::Relaxed),
            UsageStage::Increment => self.slow_increment_total.load(Ordering::Relaxed),
            UsageStage::MarkDirty => self.slow_mark_dirty_total.load(Ordering::Relaxed),
        }
    }

    pub fn negative_usages(&self) -> u64 {
        self.negative_usage_total.load(Ordering::Relaxed)
    }

    pub fn flush_cycles(&self) -> u64 {
        self.flush_cycles_total.load(Ordering::Relaxed)
    }

    pub fn flush_skipped(&self) -> u64 {
        self.flush_skipped_total.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(2 * 1024);

        let _ = writeln!(
            output,
            "# HELP objmeta_uptime_seconds Process uptime in seconds"
        );
        let _ = writeln!(output, "# TYPE objmeta_uptime_seconds counter");
        let _ = writeln!(
            output,
            "objmeta_uptime_seconds {}",
            self.start_time.elapsed().as_secs()
        );

        counter(
            &mut output,
            "objmeta_usage_increments_total",
            "Usage deltas applied to the cache",
            self.increments(),
        );
        counter(
            &mut output,
            "objmeta_usage_increment_failures_total",
            "Usage updates that failed",
            self.increment_failures(),
        );

        let _ = writeln!(
            output,
            "# HELP objmeta_usage_slow_stages_total Usage update stages over the slow threshold"
        );
        let _ = writeln!(output, "# TYPE objmeta_usage_slow_stages_total counter");
        for stage in [UsageStage::Seed, UsageStage::Increment, UsageStage::MarkDirty] {
            let _ = writeln!(
                output,
                "objmeta_usage_slow_stages_total{{stage=\"{}\"}} {}",
                stage.as_str(),
                self.slow_stages(stage)
            );
        }

        counter(
            &mut output,
            "objmeta_usage_negative_total",
            "Increments that left a bucket with negative usage",
            self.negative_usages(),
        );
        counter(
            &mut output,
            "objmeta_usage_flush_cycles_total",
            "Completed usage flush cycles",
            self.flush_cycles(),
        );
        counter(
            &mut output,
            "objmeta_usage_flush_skipped_total",
            "Flush requests skipped because a flush was running",
            self.flush_skipped(),
        );
        counter(
            &mut output,
            "objmeta_usage_flushed_buckets_total",
            "Bucket usages persisted by flush cycles",
            self.flushed_buckets_total.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "objmeta_usage_flush_failed_buckets_total",
            "Bucket usages that failed to persist and stay dirty",
            self.flush_failed_buckets_total.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "objmeta_usage_dropped_buckets_total",
            "Counters dropped because the bucket no longer exists",
            self.dropped_buckets_total.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "objmeta_usage_reconcile_seeded_total",
            "Counters seeded from the store at startup",
            self.reconcile_seeded_total.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "objmeta_usage_reconcile_flushed_total",
            "Cached counters persisted at startup",
            self.reconcile_flushed_total.load(Ordering::Relaxed),
        );

        output
    }
}
