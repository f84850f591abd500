// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// The lifecycle controller owns every job state transition. Each transition
// commits through a guarded store operation, so a stale caller gets a
// conflict and nothing changes; retries of the same request are absorbed by
// the state guards.

use crate::clock::Clock;
use crate::config::MarketplaceConfig;
use crate::error::{CoreError, CoreResult};
use crate::jobs::{Job, JobId, JobPriority, JobSpec, JobState};
use crate::monitoring::MarketplaceMetrics;
use crate::queue::JobQueue;
use crate::registry::{AgentId, AgentRegistry, HeartbeatStatus};
use crate::settlement::{Payment, PaymentState, SettlementEngine};
use crate::store::MarketplaceStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct JobLifecycle {
    store: Arc<dyn MarketplaceStore>,
    registry: Arc<AgentRegistry>,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
    settlement: SettlementEngine,
    metrics: Arc<MarketplaceMetrics>,
    default_max_retries: u32,
    heartbeat_timeout_ms: u64,
    marketplace_wallet: String,
    seq: AtomicU64,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn MarketplaceStore>,
        registry: Arc<AgentRegistry>,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        settlement: SettlementEngine,
        metrics: Arc<MarketplaceMetrics>,
        config: &MarketplaceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            clock,
            settlement,
            metrics,
            default_max_retries: config.max_retries,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms(),
            marketplace_wallet: config.marketplace_wallet.clone(),
            seq: AtomicU64::new(0),
        }
    }

    /// Rebuild the queue cache from the store and restore the admission
    /// sequence. Runs once at startup, after registry recovery.
    pub async fn recover(&self) -> CoreResult<usize> {
        let queued = self.store.jobs_in_state(JobState::Queued).await?;
        let mut max_seq = 0;
        for state in [
            JobState::Queued,
            JobState::Assigned,
            JobState::Running,
            JobState::Completed,
            JobState::Abandoned,
        ] {
            for job in self.store.jobs_in_state(state).await? {
                max_seq = max_seq.max(job.seq);
            }
        }
        self.seq.store(max_seq + 1, Ordering::SeqCst);

        let count = queued.len();
        for job in queued {
            self.queue.push(&job).await;
        }
        if count > 0 {
            info!(jobs = count, "queue recovered from store");
        }
        Ok(count)
    }

    /// Admit a new job: validate, derive priority from the reward, persist
    /// as QUEUED and enqueue.
    pub async fn admit(&self, spec: JobSpec) -> CoreResult<Job> {
        validate_spec(&spec)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let job = Job::admit(spec, self.default_max_retries, seq, self.clock.now_ms());
        self.store.put_job(&job).await?;
        self.queue.push(&job).await;
        self.metrics.jobs_admitted.inc();
        info!(
            job_id = %job.id,
            priority = ?job.priority,
            reward = job.reward,
            "job admitted"
        );
        Ok(job)
    }

    /// Read-only preview of queued jobs this agent could take right now.
    /// Nothing transitions; concurrent callers may see the same jobs.
    pub async fn pull(
        &self,
        agent_id: AgentId,
        gpu_memory: Option<u64>,
        limit: usize,
    ) -> CoreResult<Vec<Job>> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", agent_id)))?;
        let memory = gpu_memory.unwrap_or(agent.capability.gpu_memory);

        let mut jobs = Vec::new();
        for entry in self.queue.peek_all().await {
            if jobs.len() >= limit {
                break;
            }
            if entry.gpu_memory_required > memory
                || (entry.requires_gpu && !agent.capability.has_gpu())
            {
                continue;
            }
            if let Some(job) = self.store.get_job(entry.job_id).await? {
                if job.state == JobState::Queued {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    /// Push-style assignment performed by the dispatch sweep. The commit is
    /// atomic with the agent's load increment; a failed commit leaves
    /// everything unchanged.
    pub async fn assign(&self, job_id: JobId, agent_id: AgentId) -> CoreResult<Job> {
        let job = self.get_job(job_id).await?;
        if job.state != JobState::Queued {
            return Err(CoreError::Conflict(format!(
                "job {} is {:?}, not QUEUED",
                job_id, job.state
            )));
        }
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", agent_id)))?;
        if agent.available_slots() == 0 {
            return Err(CoreError::Conflict(format!("agent {} is full", agent_id)));
        }
        self.commit_assignment(job, agent).await
    }

    /// Pull-style claim: like `assign`, but the agent must still match the
    /// job's requirements at claim time. Duplicate accepts from the holder
    /// are absorbed.
    pub async fn accept(&self, agent_id: AgentId, job_id: JobId) -> CoreResult<()> {
        let job = self.get_job(job_id).await?;
        if job.state.is_active() && job.assigned_agent_id == Some(agent_id) {
            return Ok(());
        }
        if job.state != JobState::Queued {
            return Err(CoreError::Conflict(format!(
                "job {} is {:?}, not QUEUED",
                job_id, job.state
            )));
        }
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", agent_id)))?;
        if !agent.can_run(
            job.requires_gpu,
            job.gpu_memory_required,
            self.clock.now_ms(),
            self.heartbeat_timeout_ms,
        ) {
            return Err(CoreError::Conflict(format!(
                "agent {} no longer matches job {}",
                agent_id, job_id
            )));
        }
        self.commit_assignment(job, agent).await?;
        Ok(())
    }

    /// ASSIGNED -> RUNNING, reported by the agent when execution begins.
    pub async fn started(&self, agent_id: AgentId, job_id: JobId) -> CoreResult<()> {
        let job = self.get_job(job_id).await?;
        if job.state == JobState::Running && job.assigned_agent_id == Some(agent_id) {
            return Ok(());
        }
        if job.state != JobState::Assigned || job.assigned_agent_id != Some(agent_id) {
            return Err(CoreError::Conflict(format!(
                "job {} is not ASSIGNED to agent {}",
                job_id, agent_id
            )));
        }
        let mut updated = job;
        updated.state = JobState::Running;
        updated.started_at_ms = Some(self.clock.now_ms());
        self.store
            .commit_job_transition(JobState::Assigned, &updated, None)
            .await?;
        info!(job_id = %job_id, agent_id = %agent_id, "job started");
        Ok(())
    }

    /// RUNNING -> COMPLETED plus the payment row, in one transaction. The
    /// agent's reply never waits on the settlement transport.
    pub async fn complete(
        &self,
        agent_id: AgentId,
        job_id: JobId,
        duration_seconds: f64,
    ) -> CoreResult<Payment> {
        let job = self.get_job(job_id).await?;
        if job.state == JobState::Completed && job.assigned_agent_id == Some(agent_id) {
            // Duplicate delivery of the same completion.
            return self
                .store
                .payment_for_job(job_id)
                .await?
                .ok_or_else(|| {
                    CoreError::Internal(format!("completed job {} has no payment", job_id))
                });
        }
        if job.state != JobState::Running || job.assigned_agent_id != Some(agent_id) {
            return Err(CoreError::Conflict(format!(
                "job {} is not RUNNING on agent {}",
                job_id, agent_id
            )));
        }
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", agent_id)))?;

        let now_ms = self.clock.now_ms();
        let payment = Payment::pending(
            job.id,
            &self.marketplace_wallet,
            &agent.wallet,
            job.reward,
            now_ms,
        );
        let mut updated = job;
        updated.state = JobState::Completed;
        updated.completed_at_ms = Some(now_ms);
        updated.payment_id = Some(payment.id);
        let mut agent_row = agent;
        agent_row.current_load = agent_row.current_load.saturating_sub(1);

        self.store
            .commit_completion(JobState::Running, &updated, &agent_row, &payment)
            .await?;
        self.registry.apply_release(agent_id).await;
        self.registry
            .observe_completion(agent_id, duration_seconds)
            .await;
        self.metrics.jobs_completed.inc();
        info!(
            job_id = %job_id,
            agent_id = %agent_id,
            payment_id = %payment.id,
            amount = payment.amount,
            "job completed"
        );

        self.settlement.spawn_submit(payment.clone());
        Ok(payment)
    }

    /// Agent-reported failure. Retries of the identical report after the
    /// job has already been requeued or abandoned are absorbed.
    pub async fn fail(&self, agent_id: AgentId, job_id: JobId, error: &str) -> CoreResult<()> {
        let job = self.get_job(job_id).await?;
        if job.state.is_active() && job.assigned_agent_id == Some(agent_id) {
            return self.reassign(job, error).await;
        }
        let already_processed = matches!(job.state, JobState::Queued | JobState::Abandoned)
            && job.last_error.as_deref() == Some(error);
        if already_processed {
            return Ok(());
        }
        Err(CoreError::Conflict(format!(
            "job {} is not assigned to agent {}",
            job_id, agent_id
        )))
    }

    /// Move an ASSIGNED/RUNNING job off its agent: back to QUEUED with a
    /// promoted priority while retry budget remains, ABANDONED otherwise.
    /// Called on failure, timeout and heartbeat loss alike; all three spend
    /// the same budget.
    pub async fn reassign(&self, job: Job, reason: &str) -> CoreResult<()> {
        if !job.state.is_active() {
            return Err(CoreError::Conflict(format!(
                "job {} is {:?}, not reassignable",
                job.id, job.state
            )));
        }
        let expected = job.state;
        let agent_id = job.assigned_agent_id;
        let agent_row = match agent_id {
            Some(id) => self.registry.get(id).await.map(|mut a| {
                a.current_load = a.current_load.saturating_sub(1);
                a
            }),
            None => None,
        };

        let mut updated = job;
        updated.assigned_agent_id = None;
        updated.assigned_at_ms = None;
        updated.started_at_ms = None;
        updated.last_error = Some(reason.to_string());

        if updated.retry_count < updated.max_retries {
            updated.retry_count += 1;
            updated.priority = updated.priority.promoted();
            updated.state = JobState::Queued;
            self.store
                .commit_job_transition(expected, &updated, agent_row.as_ref())
                .await?;
            if let Some(id) = agent_id {
                self.registry.apply_release(id).await;
                self.registry.observe_failure(id).await;
                self.registry.observe_retry(id).await;
            }
            self.queue.push(&updated).await;
            self.metrics.jobs_reassigned.inc();
            warn!(
                job_id = %updated.id,
                retry_count = updated.retry_count,
                priority = ?updated.priority,
                reason,
                "job requeued"
            );
        } else {
            updated.state = JobState::Abandoned;
            self.store
                .commit_job_transition(expected, &updated, agent_row.as_ref())
                .await?;
            if let Some(id) = agent_id {
                self.registry.apply_release(id).await;
                self.registry.observe_failure(id).await;
            }
            self.metrics.jobs_abandoned.inc();
            warn!(
                job_id = %updated.id,
                retries = updated.retry_count,
                reason,
                "job abandoned; retry budget exhausted"
            );
        }
        Ok(())
    }

    pub async fn heartbeat(&self, agent_id: AgentId, status: HeartbeatStatus) -> CoreResult<()> {
        self.registry.heartbeat(agent_id, status).await?;
        self.metrics.heartbeats.inc();
        Ok(())
    }

    pub async fn get_job(&self, job_id: JobId) -> CoreResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {}", job_id)))
    }

    /// Aggregate counters for the admin surface, computed from the store
    /// and the registry rather than from metrics counters.
    pub async fn stats(&self) -> CoreResult<AdminStats> {
        let jobs = JobCounts {
            queued: self.store.jobs_in_state(JobState::Queued).await?.len() as u64,
            assigned: self.store.jobs_in_state(JobState::Assigned).await?.len() as u64,
            running: self.store.jobs_in_state(JobState::Running).await?.len() as u64,
            completed: self.store.jobs_in_state(JobState::Completed).await?.len() as u64,
            abandoned: self.store.jobs_in_state(JobState::Abandoned).await?.len() as u64,
        };

        let depths = self.queue.depth_by_priority().await;
        let queue = QueueDepths {
            low: *depths.get(&JobPriority::Low).unwrap_or(&0) as u64,
            normal: *depths.get(&JobPriority::Normal).unwrap_or(&0) as u64,
            high: *depths.get(&JobPriority::High).unwrap_or(&0) as u64,
            urgent: *depths.get(&JobPriority::Urgent).unwrap_or(&0) as u64,
        };

        let now_ms = self.clock.now_ms();
        let mut agents = AgentCounts::default();
        for agent in self.registry.snapshot().await {
            agents.total += 1;
            if agent.healthy && agent.is_healthy_at(now_ms, self.heartbeat_timeout_ms) {
                agents.healthy += 1;
            } else {
                agents.unhealthy += 1;
            }
            agents.capacity += agent.max_concurrent as u64;
            agents.load += agent.current_load as u64;
        }

        let mut payments = PaymentCounts::default();
        for payment in self.store.list_payments().await? {
            match payment.state {
                PaymentState::Pending => payments.pending += 1,
                PaymentState::Submitted => payments.submitted += 1,
                PaymentState::Confirmed => {
                    payments.confirmed += 1;
                    payments.total_paid += payment.amount;
                }
                PaymentState::Failed => payments.failed += 1,
            }
            if payment.parked {
                payments.parked += 1;
            }
        }

        Ok(AdminStats {
            jobs,
            queue,
            agents,
            payments,
        })
    }

    /// Audit of the load invariant: for every agent, the in-memory load must
    /// equal the count of ASSIGNED/RUNNING jobs pointing at it. Returns the
    /// mismatches.
    pub async fn audit_agent_loads(&self) -> CoreResult<Vec<LoadMismatch>> {
        let mut mismatches = Vec::new();
        for agent in self.registry.snapshot().await {
            let observed = self.store.jobs_for_agent(agent.id).await?;
            let active = observed.iter().filter(|j| j.state.is_active()).count() as u32;
            if active != agent.current_load {
                mismatches.push(LoadMismatch {
                    agent_id: agent.id,
                    recorded: agent.current_load,
                    observed: active,
                });
            }
        }
        Ok(mismatches)
    }

    async fn commit_assignment(&self, job: Job, agent: crate::registry::Agent) -> CoreResult<Job> {
        let now_ms = self.clock.now_ms();
        let agent_id = agent.id;
        let mut updated = job;
        updated.state = JobState::Assigned;
        updated.assigned_agent_id = Some(agent_id);
        updated.assigned_at_ms = Some(now_ms);
        let mut agent_row = agent;
        agent_row.current_load = (agent_row.current_load + 1).min(agent_row.max_concurrent);
        agent_row.last_assigned_at_ms = now_ms;

        self.store
            .commit_job_transition(JobState::Queued, &updated, Some(&agent_row))
            .await?;
        self.registry.apply_assignment(agent_id, now_ms).await;
        self.queue.remove(updated.id).await;
        self.metrics.jobs_assigned.inc();
        info!(job_id = %updated.id, agent_id = %agent_id, "job assigned");
        Ok(updated)
    }
}

fn validate_spec(spec: &JobSpec) -> CoreResult<()> {
    if spec.job_type.trim().is_empty() {
        return Err(CoreError::BadRequest("job_type is required".to_string()));
    }
    if spec.docker_image.trim().is_empty() {
        return Err(CoreError::BadRequest("docker_image is required".to_string()));
    }
    if spec.timeout_seconds == 0 {
        return Err(CoreError::BadRequest(
            "timeout_seconds must be positive".to_string(),
        ));
    }
    if !spec.reward.is_finite() || spec.reward < 0.0 {
        return Err(CoreError::BadRequest(
            "reward must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct JobCounts {
    pub queued: u64,
    pub assigned: u64,
    pub running: u64,
    pub completed: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct QueueDepths {
    pub low: u64,
    pub normal: u64,
    pub high: u64,
    pub urgent: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AgentCounts {
    pub total: u64,
    pub healthy: u64,
    pub unhealthy: u64,
    pub capacity: u64,
    pub load: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PaymentCounts {
    pub pending: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub parked: u64,
    pub total_paid: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub jobs: JobCounts,
    pub queue: QueueDepths,
    pub agents: AgentCounts,
    pub payments: PaymentCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadMismatch {
    pub agent_id: AgentId,
    pub recorded: u32,
    pub observed: u32,
}
