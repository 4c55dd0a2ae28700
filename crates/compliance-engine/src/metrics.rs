//! Fire-and-forget metrics seam.
//!
//! The engine reports counters and timings through this trait so a host can
//! wire in its own collector. Emission must never block or fail validation.

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, value: u64);
    fn observe(&self, name: &'static str, value: f64);
}

/// Default sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _value: u64) {}
    fn observe(&self, _name: &'static str, _value: f64) {}
}
