//! Prometheus metrics
//!
//! Counters for block attempts, segment outcomes, healing and the archive
//! cache, held in a registry owned by the client rather than the process
//! default registry.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Metric handles for one client instance.
#[derive(Clone)]
pub struct ClientMetrics {
    registry: Registry,
    block_attempts: IntCounterVec,
    segments: IntCounterVec,
    healing: IntCounterVec,
    archive_cache: IntCounterVec,
    fec_jobs: IntCounterVec,
}

impl ClientMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let block_attempts = IntCounterVec::new(
            Opts::new("splitfec_block_attempts_total", "Block attempts by outcome"),
            &["kind", "outcome"],
        )?;
        let segments = IntCounterVec::new(
            Opts::new("splitfec_segments_total", "Finished segments by outcome"),
            &["kind", "outcome"],
        )?;
        let healing = IntCounterVec::new(
            Opts::new("splitfec_healing_inserts_total", "Healing inserts by outcome"),
            &["outcome"],
        )?;
        let archive_cache = IntCounterVec::new(
            Opts::new("splitfec_archive_cache_total", "Archive cache lookups and evictions"),
            &["event"],
        )?;
        let fec_jobs = IntCounterVec::new(
            Opts::new("splitfec_fec_jobs_total", "FEC jobs by operation"),
            &["op"],
        )?;

        registry.register(Box::new(block_attempts.clone()))?;
        registry.register(Box::new(segments.clone()))?;
        registry.register(Box::new(healing.clone()))?;
        registry.register(Box::new(archive_cache.clone()))?;
        registry.register(Box::new(fec_jobs.clone()))?;

        Ok(Self {
            registry,
            block_attempts,
            segments,
            healing,
            archive_cache,
            fec_jobs,
        })
    }

    pub fn record_block(&self, kind: &str, outcome: &str) {
        self.block_attempts.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_segment(&self, kind: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.segments.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_healing(&self, outcome: &str) {
        self.healing.with_label_values(&[outcome]).inc();
    }

    /// Count `n` healing inserts with the same outcome.
    pub fn record_healing_n(&self, outcome: &str, n: usize) {
        self.healing.with_label_values(&[outcome]).inc_by(n as u64);
    }

    pub fn record_cache(&self, event: &str) {
        self.archive_cache.with_label_values(&[event]).inc();
    }

    pub fn record_fec_job(&self, op: &str) {
        self.fec_jobs.with_label_values(&[op]).inc();
    }

    /// Block attempts recorded with `kind` and `outcome`.
    pub fn block_count(&self, kind: &str, outcome: &str) -> u64 {
        self.block_attempts.with_label_values(&[kind, outcome]).get()
    }

    /// Segments that finished with the given result.
    pub fn segment_count(&self, kind: &str, success: bool) -> u64 {
        let outcome = if success { "success" } else { "failure" };
        self.segments.with_label_values(&[kind, outcome]).get()
    }

    /// Healing inserts recorded with `outcome`.
    pub fn healing_count(&self, outcome: &str) -> u64 {
        self.healing.with_label_values(&[outcome]).get()
    }

    /// Archive cache events of one kind.
    pub fn cache_count(&self, event: &str) -> u64 {
        self.archive_cache.with_label_values(&[event]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ClientMetrics::new().unwrap();
        metrics.record_block("fetch", "success");
        metrics.record_block("fetch", "success");
        metrics.record_block("fetch", "fatal");
        metrics.record_segment("fetch", true);
        metrics.record_cache("hit");

        assert_eq!(metrics.block_count("fetch", "success"), 2);
        assert_eq!(metrics.block_count("fetch", "fatal"), 1);
        assert_eq!(metrics.block_count("insert", "success"), 0);
        assert_eq!(metrics.segment_count("fetch", true), 1);
        assert_eq!(metrics.cache_count("hit"), 1);
    }

    #[test]
    fn test_record_healing_batch() {
        let metrics = ClientMetrics::new().unwrap();
        metrics.record_healing_n("queued", 4);
        metrics.record_healing("queued");
        metrics.record_healing_n("success", 0);
        assert_eq!(metrics.healing_count("queued"), 5);
        assert_eq!(metrics.healing_count("success"), 0);
    }

    #[test]
    fn test_gather_text() {
        let metrics = ClientMetrics::new().unwrap();
        metrics.record_healing("queued");
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("splitfec_healing_inserts_total"));
        assert!(text.contains("outcome=\"queued\""));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ClientMetrics::new().unwrap();
        let b = ClientMetrics::new().unwrap();
        a.record_fec_job("decode");
        assert!(a.gather_text().unwrap().contains("op=\"decode\""));
        assert!(!b.gather_text().unwrap().contains("op=\"decode\""));
    }
}
