//! Metrics collection for observability
//!
//! Prometheus metrics for the sync loop. They mirror the tick summary and
//! carry no correctness meaning.
//!
//! # Metrics
//!
//! - `ledger_ticks_total` - Ticks completed
//! - `ledger_confirmed_total` - Transactions persisted by ticks
//! - `ledger_duplicates_total` - Transactions found already persisted
//! - `ledger_failed_total` - Entries classified Failed
//! - `ledger_abandoned_total` - Entries dropped by a retry bound
//! - `ledger_queue_depth` - Queue length after the last tick
//! - `ledger_tick_duration_seconds` - Histogram of tick latencies

use crate::sync::TickSummary;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Ticks completed
    pub ticks_total: IntCounter,

    /// Transactions persisted by ticks
    pub confirmed_total: IntCounter,

    /// Duplicates dropped
    pub duplicates_total: IntCounter,

    /// Failed entries seen
    pub failed_total: IntCounter,

    /// Entries abandoned by retry policy
    pub abandoned_total: IntCounter,

    /// Queue depth after the last tick
    pub queue_depth: IntGauge,

    /// Tick duration histogram
    pub tick_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("ticks_total", &self.ticks_total.get())
            .field("queue_depth", &self.queue_depth.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let ticks_total = IntCounter::new("ledger_ticks_total", "Ticks completed")?;
        registry.register(Box::new(ticks_total.clone()))?;

        let confirmed_total =
            IntCounter::new("ledger_confirmed_total", "Transactions persisted by ticks")?;
        registry.register(Box::new(confirmed_total.clone()))?;

        let duplicates_total = IntCounter::new(
            "ledger_duplicates_total",
            "Transactions found already persisted",
        )?;
        registry.register(Box::new(duplicates_total.clone()))?;

        let failed_total = IntCounter::new("ledger_failed_total", "Entries classified Failed")?;
        registry.register(Box::new(failed_total.clone()))?;

        let abandoned_total =
            IntCounter::new("ledger_abandoned_total", "Entries dropped by a retry bound")?;
        registry.register(Box::new(abandoned_total.clone()))?;

        let queue_depth = IntGauge::new("ledger_queue_depth", "Queue length after the last tick")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("ledger_tick_duration_seconds", "Histogram of tick latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(tick_duration.clone()))?;

        Ok(Self {
            ticks_total,
            confirmed_total,
            duplicates_total,
            failed_total,
            abandoned_total,
            queue_depth,
            tick_duration,
            registry,
        })
    }

    /// Record a finished tick
    pub fn record_tick(&self, summary: &TickSummary, queue_depth: usize, duration_seconds: f64) {
        self.ticks_total.inc();
        self.confirmed_total.inc_by(summary.confirmed as u64);
        self.duplicates_total.inc_by(summary.duplicates as u64);
        self.failed_total.inc_by(summary.failed as u64);
        self.abandoned_total.inc_by(summary.abandoned as u64);
        self.queue_depth.set(queue_depth as i64);
        self.tick_duration.observe(duration_seconds);
    }

    /// Render in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.ticks_total.get(), 0);
        assert_eq!(metrics.queue_depth.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        // Each node owns its registry, so two collectors can coexist
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.ticks_total.inc();
        assert_eq!(b.ticks_total.get(), 0);
    }

    #[test]
    fn test_record_tick() {
        let metrics = Metrics::new().unwrap();
        let summary = TickSummary {
            total: 5,
            initiated: 2,
            requested: 1,
            confirmed: 1,
            duplicates: 1,
            failed: 0,
            abandoned: 0,
        };
        metrics.record_tick(&summary, 3, 0.02);

        assert_eq!(metrics.ticks_total.get(), 1);
        assert_eq!(metrics.confirmed_total.get(), 1);
        assert_eq!(metrics.duplicates_total.get(), 1);
        assert_eq!(metrics.queue_depth.get(), 3);

        let text = metrics.render();
        assert!(text.contains("ledger_ticks_total 1"));
    }
}
