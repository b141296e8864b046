//! Prometheus counters and gauges for one broker instance.
//!
//! Each broker owns its own registry so tests can run several brokers in
//! one process without metric name collisions.

use prometheus::{IntCounter, IntGauge, Registry};

use crate::error::{GearError, Result};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub jobs_submitted: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub queued: IntGauge,
    pub running: IntGauge,
    pub workers: IntGauge,
    pub connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_submitted =
            IntCounter::new("jobs_submitted_total", "Jobs accepted from clients")
                .map_err(|e| GearError::Internal(e.to_string()))?;
        let jobs_completed = IntCounter::new("jobs_completed_total", "Jobs finished successfully")
            .map_err(|e| GearError::Internal(e.to_string()))?;
        let jobs_failed = IntCounter::new("jobs_failed_total", "Jobs that failed or raised")
            .map_err(|e| GearError::Internal(e.to_string()))?;
        let queued = IntGauge::new("queued", "Jobs waiting in queues")
            .map_err(|e| GearError::Internal(e.to_string()))?;
        let running = IntGauge::new("running", "Jobs currently assigned to workers")
            .map_err(|e| GearError::Internal(e.to_string()))?;
        let workers = IntGauge::new("workers", "Connected worker sessions")
            .map_err(|e| GearError::Internal(e.to_string()))?;
        let connections = IntGauge::new("connections", "Open TCP sessions")
            .map_err(|e| GearError::Internal(e.to_string()))?;

        for collector in [&jobs_submitted, &jobs_completed, &jobs_failed] {
            registry
                .register(Box::new(collector.clone()))
                .map_err(|e| GearError::Internal(e.to_string()))?;
        }
        for gauge in [&queued, &running, &workers, &connections] {
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| GearError::Internal(e.to_string()))?;
        }

        Ok(Self {
            registry,
            jobs_submitted,
            jobs_completed,
            jobs_failed,
            queued,
            running,
            workers,
            connections,
        })
    }
}
