//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `points_postings_total{type}` - Committed transactions
//! - `points_rejections_total{type,reason}` - Rejected operations
//! - `points_moved_total{type}` - Absolute points moved
//! - `points_posting_duration_seconds` - Histogram of posting latencies
//! - `points_expired_by_sweep_total` - Points removed by the expiry sweep

use crate::types::{PointTransaction, TransactionType};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
///
/// Each collector owns its registry, so several ledgers (or tests) can live
/// in one process.
#[derive(Clone)]
pub struct Metrics {
    /// Committed transactions by type
    pub postings_total: IntCounterVec,

    /// Rejected operations by type and error kind
    pub rejections_total: IntCounterVec,

    /// Absolute points moved by type
    pub points_moved: IntCounterVec,

    /// Posting duration histogram
    pub posting_duration: Histogram,

    /// Points expired by the sweep
    pub swept_points: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("swept_points", &self.swept_points.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let postings_total = IntCounterVec::new(
            Opts::new("points_postings_total", "Committed ledger transactions"),
            &["type"],
        )?;
        registry.register(Box::new(postings_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("points_rejections_total", "Rejected ledger operations"),
            &["type", "reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let points_moved = IntCounterVec::new(
            Opts::new("points_moved_total", "Absolute points moved by committed transactions"),
            &["type"],
        )?;
        registry.register(Box::new(points_moved.clone()))?;

        let posting_duration = Histogram::with_opts(
            HistogramOpts::new(
                "points_posting_duration_seconds",
                "Histogram of posting latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(posting_duration.clone()))?;

        let swept_points = IntCounter::new(
            "points_expired_by_sweep_total",
            "Points removed by the expiry sweep",
        )?;
        registry.register(Box::new(swept_points.clone()))?;

        Ok(Self {
            postings_total,
            rejections_total,
            points_moved,
            posting_duration,
            swept_points,
            registry,
        })
    }

    /// Record a committed transaction
    pub fn record_posting(&self, tx: &PointTransaction) {
        let label = tx.tx_type.as_str();
        self.postings_total.with_label_values(&[label]).inc();
        self.points_moved
            .with_label_values(&[label])
            .inc_by(tx.amount.unsigned_abs());
    }

    /// Record a rejected operation
    pub fn record_rejection(&self, tx_type: TransactionType, reason: &str) {
        self.rejections_total
            .with_label_values(&[tx_type.as_str(), reason])
            .inc();
    }

    /// Record posting duration
    pub fn record_posting_duration(&self, duration_seconds: f64) {
        self.posting_duration.observe(duration_seconds);
    }

    /// Record points removed by one sweep
    pub fn record_swept(&self, points: u64) {
        self.swept_points.inc_by(points);
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
