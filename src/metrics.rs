//! The `MetricsSink` capability (§6).
//!
//! The Prometheus exporter HTTP surface is explicitly out of scope (§1);
//! only this capability contract is in scope. Components record through
//! `&dyn MetricsSink` and never assume a particular backend.

pub type Tags = &'static [(&'static str, &'static str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, tags: Tags);
    fn record_gauge(&self, name: &str, value: f64, tags: Tags);
    fn record_histogram(&self, name: &str, value: f64, tags: Tags);
}

/// Discards every recording. Used by tests and callers with no metrics backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn increment_counter(&self, _name: &str, _tags: Tags) {}
    fn record_gauge(&self, _name: &str, _value: f64, _tags: Tags) {}
    fn record_histogram(&self, _name: &str, _value: f64, _tags: Tags) {}
}

/// In-process metrics recorder used by tests that assert on recorded values.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counters: std::sync::Mutex<std::collections::BTreeMap<String, u64>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for CountingMetrics {
    fn increment_counter(&self, name: &str, _tags: Tags) {
        *self
            .counters
            .lock()
            .expect("metrics lock poisoned")
            .entry(name.to_string())
            .or_insert(0) += 1;
    }
    fn record_gauge(&self, _name: &str, _value: f64, _tags: Tags) {}
    fn record_histogram(&self, _name: &str, _value: f64, _tags: Tags) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_metrics_increments() {
        let m = CountingMetrics::new();
        m.increment_counter("retry_attempt", &[]);
        m.increment_counter("retry_attempt", &[]);
        assert_eq!(m.get("retry_attempt"), 2);
        assert_eq!(m.get("unused"), 0);
    }
}
