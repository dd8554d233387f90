use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Process-wide metrics; `None` if registration failed (metrics are then skipped)
pub static METRICS: Lazy<Option<GateMetrics>> = Lazy::new(|| match GateMetrics::init() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        log::warn!("failed to register schemagate metrics, continuing without them: {e}");
        None
    }
});

pub struct GateMetrics {
    pub registry: Registry,
    pub migrations_applied: IntCounter,
    pub migrations_failed: IntCounter,
    pub migration_duration: Histogram,
    pub readiness_checks: IntCounterVec,
    pub pending_migrations: IntGauge,
}

impl GateMetrics {
    pub fn init() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let migrations_applied = IntCounter::new(
            "schemagate_migrations_applied_total",
            "Migration scripts applied successfully",
        )?;
        let migrations_failed = IntCounter::new(
            "schemagate_migrations_failed_total",
            "Migration scripts whose transformation failed",
        )?;
        let migration_duration = Histogram::with_opts(
            HistogramOpts::new(
                "schemagate_migration_duration_seconds",
                "Duration of a single migration script",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )?;
        let readiness_checks = IntCounterVec::new(
            Opts::new(
                "schemagate_readiness_checks_total",
                "Readiness checks by result",
            ),
            &["result"],
        )?;
        let pending_migrations = IntGauge::new(
            "schemagate_pending_migrations",
            "Pending migration scripts seen by the last readiness check",
        )?;

        registry.register(Box::new(migrations_applied.clone()))?;
        registry.register(Box::new(migrations_failed.clone()))?;
        registry.register(Box::new(migration_duration.clone()))?;
        registry.register(Box::new(readiness_checks.clone()))?;
        registry.register(Box::new(pending_migrations.clone()))?;

        Ok(Self {
            registry,
            migrations_applied,
            migrations_failed,
            migration_duration,
            readiness_checks,
            pending_migrations,
        })
    }

    pub fn record_applied(&self, elapsed: Duration) {
        self.migrations_applied.inc();
        self.migration_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_failed(&self) {
        self.migrations_failed.inc();
    }

    pub fn record_readiness(&self, result: &str, pending: Option<usize>) {
        self.readiness_checks.with_label_values(&[result]).inc();
        if let Some(pending) = pending {
            self.pending_migrations
                .set(i64::try_from(pending).unwrap_or(i64::MAX));
        }
    }
}

pub(crate) fn record_applied(elapsed: Duration) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.record_applied(elapsed);
    }
}

pub(crate) fn record_failed() {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.record_failed();
    }
}

pub(crate) fn record_readiness(result: &str, pending: Option<usize>) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.record_readiness(result, pending);
    }
}

/// Prometheus text exposition of every schemagate metric
///
/// # Errors
///
/// Returns `prometheus::Error` if encoding fails.
pub fn encode() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = METRICS
        .as_ref()
        .map(|m| m.registry.gather())
        .unwrap_or_default();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_counters() {
        record_applied(Duration::from_millis(20));
        record_readiness("ready", Some(0));

        let (content_type, body) = encode().expect("encode");
        let text = String::from_utf8(body).expect("utf8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("schemagate_migrations_applied_total"));
        assert!(text.contains("schemagate_readiness_checks_total{result=\"ready\"}"));
    }
}
