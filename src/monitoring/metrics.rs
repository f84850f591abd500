// src/monitoring/metrics.rs - Prometheus counters for the coordination core

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct MarketplaceMetrics {
    registry: Registry,

    pub jobs_admitted: IntCounter,
    pub jobs_assigned: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_reassigned: IntCounter,
    pub jobs_abandoned: IntCounter,

    pub payments_confirmed: IntCounter,
    pub payments_failed: IntCounter,
    pub payments_parked: IntCounter,

    pub agents_registered: IntCounter,
    pub heartbeats: IntCounter,

    pub queue_depth: IntGauge,
    pub jobs_active: IntGauge,
    pub agents_healthy: IntGauge,
}

impl MarketplaceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_admitted =
            IntCounter::new("marketplace_jobs_admitted_total", "Jobs accepted into the queue")?;
        let jobs_assigned =
            IntCounter::new("marketplace_jobs_assigned_total", "Job assignments committed")?;
        let jobs_completed =
            IntCounter::new("marketplace_jobs_completed_total", "Jobs completed successfully")?;
        let jobs_reassigned = IntCounter::new(
            "marketplace_jobs_reassigned_total",
            "Jobs requeued after failure, timeout or heartbeat loss",
        )?;
        let jobs_abandoned = IntCounter::new(
            "marketplace_jobs_abandoned_total",
            "Jobs abandoned after exhausting their retry budget",
        )?;
        let payments_confirmed = IntCounter::new(
            "marketplace_payments_confirmed_total",
            "Payments confirmed by the settlement transport",
        )?;
        let payments_failed = IntCounter::new(
            "marketplace_payments_failed_total",
            "Payment submissions that failed",
        )?;
        let payments_parked = IntCounter::new(
            "marketplace_payments_parked_total",
            "Payments parked for manual review",
        )?;
        let agents_registered =
            IntCounter::new("marketplace_agents_registered_total", "Agent registrations")?;
        let heartbeats =
            IntCounter::new("marketplace_heartbeats_total", "Agent heartbeats received")?;
        let queue_depth = IntGauge::new("marketplace_queue_depth", "Jobs currently queued")?;
        let jobs_active = IntGauge::new(
            "marketplace_jobs_active",
            "Jobs currently assigned or running",
        )?;
        let agents_healthy = IntGauge::new("marketplace_agents_healthy", "Healthy agents")?;

        registry.register(Box::new(jobs_admitted.clone()))?;
        registry.register(Box::new(jobs_assigned.clone()))?;
        registry.register(Box::new(jobs_completed.clone()))?;
        registry.register(Box::new(jobs_reassigned.clone()))?;
        registry.register(Box::new(jobs_abandoned.clone()))?;
        registry.register(Box::new(payments_confirmed.clone()))?;
        registry.register(Box::new(payments_failed.clone()))?;
        registry.register(Box::new(payments_parked.clone()))?;
        registry.register(Box::new(agents_registered.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(agents_healthy.clone()))?;

        Ok(Self {
            registry,
            jobs_admitted,
            jobs_assigned,
            jobs_completed,
            jobs_reassigned,
            jobs_abandoned,
            payments_confirmed,
            payments_failed,
            payments_parked,
            agents_registered,
            heartbeats,
            queue_depth,
            jobs_active,
            agents_healthy,
        })
    }

    /// Text exposition format for GET /metrics.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
