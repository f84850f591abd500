// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// The scheduler matches queued jobs to agents and runs the maintenance
// loop: heartbeat sweep, timeout sweep, dispatch sweep, payment retry
// sweep, in that order, on a fixed cadence.

use crate::clock::Clock;
use crate::config::MarketplaceConfig;
use crate::error::CoreError;
use crate::jobs::{JobId, JobPriority, JobState};
use crate::lifecycle::JobLifecycle;
use crate::monitoring::MarketplaceMetrics;
use crate::queue::JobQueue;
use crate::registry::{Agent, AgentId, AgentRegistry};
use crate::settlement::SettlementEngine;
use crate::store::MarketplaceStore;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const WEIGHT_AVAILABILITY: f64 = 0.5;
const WEIGHT_SUCCESS_RATE: f64 = 0.3;
const WEIGHT_SPEED: f64 = 0.2;

/// Pure scoring function over registry state. Higher is better.
pub fn agent_score(agent: &Agent) -> f64 {
    let availability = if agent.max_concurrent == 0 {
        0.0
    } else {
        agent.available_slots() as f64 / agent.max_concurrent as f64
    };
    let success_rate = agent.stats.success_rate();
    let speed = (60.0 / agent.stats.avg_duration_seconds.max(1.0)).clamp(0.0, 1.0);
    WEIGHT_AVAILABILITY * availability + WEIGHT_SUCCESS_RATE * success_rate + WEIGHT_SPEED * speed
}

/// Best candidate by score; ties go to the agent that has waited longest
/// since its last assignment, then to the lexicographically smaller id.
pub fn select_best(candidates: Vec<Agent>) -> Option<Agent> {
    candidates.into_iter().max_by(|a, b| {
        agent_score(a)
            .partial_cmp(&agent_score(b))
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_assigned_at_ms.cmp(&a.last_assigned_at_ms))
            .then_with(|| b.id.cmp(&a.id))
    })
}

pub struct Scheduler {
    lifecycle: Arc<JobLifecycle>,
    registry: Arc<AgentRegistry>,
    queue: Arc<JobQueue>,
    store: Arc<dyn MarketplaceStore>,
    settlement: SettlementEngine,
    clock: Arc<dyn Clock>,
    metrics: Arc<MarketplaceMetrics>,
    heartbeat_timeout_ms: u64,
    timeout_buffer: f64,
    rebalance_interval: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        registry: Arc<AgentRegistry>,
        queue: Arc<JobQueue>,
        store: Arc<dyn MarketplaceStore>,
        settlement: SettlementEngine,
        clock: Arc<dyn Clock>,
        metrics: Arc<MarketplaceMetrics>,
        config: &MarketplaceConfig,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            queue,
            store,
            settlement,
            clock,
            metrics,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms(),
            timeout_buffer: config.timeout_buffer,
            rebalance_interval: config.rebalance_interval,
        }
    }

    /// One full maintenance pass. Exposed so tests can tick the scheduler
    /// against a virtual clock without the cadence loop.
    pub async fn run_once(&self) {
        self.sweep_heartbeats().await;
        self.sweep_timeouts().await;
        self.sweep_dispatch().await;
        self.settlement.process_due().await;
        self.refresh_gauges().await;
    }

    /// Cadence loop. Stops on the shutdown signal, always between passes,
    /// never inside one.
    pub async fn run_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            interval_secs = self.rebalance_interval.as_secs(),
            "maintenance loop started"
        );
        loop {
            tokio::select! {
                _ = self.clock.sleep(self.rebalance_interval) => {
                    self.run_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("maintenance loop stopped");
                    break;
                }
            }
        }
    }

    /// Expire silent agents and recover every job they were holding.
    async fn sweep_heartbeats(&self) {
        for agent_id in self.registry.sweep_expired().await {
            let jobs = match self.store.jobs_for_agent(agent_id).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(agent_id = %agent_id, %err, "heartbeat sweep skipped agent");
                    continue;
                }
            };
            for job in jobs.into_iter().filter(|j| j.state.is_active()) {
                let job_id = job.id;
                if let Err(err) = self.lifecycle.reassign(job, "agent unhealthy").await {
                    warn!(job_id = %job_id, %err, "reassign after heartbeat loss failed");
                }
            }
        }
    }

    /// Recover jobs whose declared timeout (with buffer) has elapsed.
    async fn sweep_timeouts(&self) {
        let now_ms = self.clock.now_ms();
        for state in [JobState::Assigned, JobState::Running] {
            let jobs = match self.store.jobs_in_state(state).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(%err, "timeout sweep skipped");
                    return;
                }
            };
            for job in jobs {
                if job.timed_out(now_ms, self.timeout_buffer) {
                    let job_id = job.id;
                    if let Err(err) = self.lifecycle.reassign(job, "timeout").await {
                        warn!(job_id = %job_id, %err, "reassign after timeout failed");
                    }
                }
            }
        }
    }

    /// Assign queued jobs while any of them has a matching agent. Jobs with
    /// no current candidate stay queued; there is no fallback placement.
    async fn sweep_dispatch(&self) {
        loop {
            let now_ms = self.clock.now_ms();
            let agents = self.registry.snapshot().await;
            if agents.is_empty() {
                return;
            }

            let entry = self
                .queue
                .pop_best_match(|e| {
                    agents.iter().any(|a| {
                        a.can_run(
                            e.requires_gpu,
                            e.gpu_memory_required,
                            now_ms,
                            self.heartbeat_timeout_ms,
                        )
                    })
                })
                .await;
            let Some(entry) = entry else {
                return;
            };

            let candidates: Vec<Agent> = agents
                .into_iter()
                .filter(|a| {
                    a.can_run(
                        entry.requires_gpu,
                        entry.gpu_memory_required,
                        now_ms,
                        self.heartbeat_timeout_ms,
                    )
                })
                .collect();
            let Some(best) = select_best(candidates) else {
                self.queue.restore(entry).await;
                return;
            };

            match self.lifecycle.assign(entry.job_id, best.id).await {
                Ok(_) => {}
                Err(CoreError::Conflict(msg)) => {
                    debug!(job_id = %entry.job_id, msg, "assignment conflicted");
                    // Keep the job queued unless it genuinely moved on
                    // (e.g. a pull-style accept won the race).
                    match self.store.get_job(entry.job_id).await {
                        Ok(Some(job)) if job.state == JobState::Queued => {
                            self.queue.restore(entry).await;
                        }
                        Ok(_) => {}
                        Err(_) => self.queue.restore(entry).await,
                    }
                }
                Err(CoreError::NotFound(msg)) => {
                    debug!(job_id = %entry.job_id, msg, "dispatch skipped job");
                }
                Err(err) => {
                    warn!(job_id = %entry.job_id, %err, "dispatch halted");
                    self.queue.restore(entry).await;
                    return;
                }
            }
        }
    }

    async fn refresh_gauges(&self) {
        self.metrics.queue_depth.set(self.queue.len().await as i64);

        let now_ms = self.clock.now_ms();
        let healthy = self
            .registry
            .snapshot()
            .await
            .iter()
            .filter(|a| a.healthy && a.is_healthy_at(now_ms, self.heartbeat_timeout_ms))
            .count();
        self.metrics.agents_healthy.set(healthy as i64);

        let mut active = 0usize;
        for state in [JobState::Assigned, JobState::Running] {
            if let Ok(jobs) = self.store.jobs_in_state(state).await {
                active += jobs.len();
            }
        }
        self.metrics.jobs_active.set(active as i64);
    }

    /// Full picture of the balancer for the admin surface.
    pub async fn snapshot(&self) -> LoadBalancerSnapshot {
        let now_ms = self.clock.now_ms();
        let agents = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|agent| AgentSnapshot {
                agent_id: agent.id,
                wallet: agent.wallet.clone(),
                healthy: agent.healthy && agent.is_healthy_at(now_ms, self.heartbeat_timeout_ms),
                current_load: agent.current_load,
                max_concurrent: agent.max_concurrent,
                score: agent_score(&agent),
                completed: agent.stats.completed,
                failed: agent.stats.failed,
                retried: agent.stats.retried,
                avg_duration_seconds: agent.stats.avg_duration_seconds,
                reputation_score: agent.reputation_score,
                seconds_since_heartbeat: now_ms.saturating_sub(agent.last_heartbeat_at_ms) / 1000,
            })
            .collect();

        let queued = self
            .queue
            .peek_all()
            .await
            .into_iter()
            .map(|entry| QueuedJobSnapshot {
                job_id: entry.job_id,
                priority: entry.priority,
                requires_gpu: entry.requires_gpu,
                gpu_memory_required: entry.gpu_memory_required,
            })
            .collect();

        LoadBalancerSnapshot {
            agents,
            queued,
            config: BalancerConfig {
                heartbeat_timeout_secs: self.heartbeat_timeout_ms / 1000,
                timeout_buffer: self.timeout_buffer,
                rebalance_interval_secs: self.rebalance_interval.as_secs(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub wallet: String,
    pub healthy: bool,
    pub current_load: u32,
    pub max_concurrent: u32,
    pub score: f64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_duration_seconds: f64,
    pub reputation_score: f64,
    pub seconds_since_heartbeat: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJobSnapshot {
    pub job_id: JobId,
    pub priority: JobPriority,
    pub requires_gpu: bool,
    pub gpu_memory_required: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerConfig {
    pub heartbeat_timeout_secs: u64,
    pub timeout_buffer: f64,
    pub rebalance_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerSnapshot {
    pub agents: Vec<AgentSnapshot>,
    pub queued: Vec<QueuedJobSnapshot>,
    pub config: BalancerConfig,
}
