use metrics::{counter, gauge};

use vp_audit::AuditMetrics;

pub struct AuditMetricsImpl {
    ns: &'static str,
}

impl AuditMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }
}

impl AuditMetrics for AuditMetricsImpl {
    fn set_queue_depth(&self, depth: usize) {
        gauge!(format!("{}_audit_queue_depth", self.ns)).set(depth as f64);
    }

    fn record_dropped(&self) {
        counter!(format!("{}_audit_dropped_total", self.ns)).increment(1);
    }
}
