// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::{MarketplaceStore, StoreError, StoreResult};
use crate::jobs::{Job, JobId, JobState};
use crate::registry::types::{Agent, AgentId};
use crate::settlement::types::{Payment, PaymentId, PaymentState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    agents: HashMap<AgentId, Agent>,
    jobs: HashMap<JobId, Job>,
    payments: HashMap<PaymentId, Payment>,
    payment_by_job: HashMap<JobId, PaymentId>,
}

/// In-memory store. One lock over all three tables makes every compound
/// commit linearizable with respect to every other operation.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Outage injection: while unavailable every operation returns
    /// `StoreError::Unavailable` and no state changes.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_by_priority(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
}

#[async_trait]
impl MarketplaceStore for MemoryStore {
    async fn put_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .await
            .agents
            .insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        self.check_available()?;
        Ok(self.tables.read().await.agents.get(&id).cloned())
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.check_available()?;
        Ok(self.tables.read().await.agents.values().cloned().collect())
    }

    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        self.check_available()?;
        self.tables.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.check_available()?;
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        self.check_available()?;
        let mut jobs: Vec<Job> = self
            .tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        sort_by_priority(&mut jobs);
        Ok(jobs)
    }

    async fn jobs_for_agent(&self, agent_id: AgentId) -> StoreResult<Vec<Job>> {
        self.check_available()?;
        let mut jobs: Vec<Job> = self
            .tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.assigned_agent_id == Some(agent_id))
            .cloned()
            .collect();
        sort_by_priority(&mut jobs);
        Ok(jobs)
    }

    async fn get_payment(&self, id: PaymentId) -> StoreResult<Option<Payment>> {
        self.check_available()?;
        Ok(self.tables.read().await.payments.get(&id).cloned())
    }

    async fn payment_for_job(&self, job_id: JobId) -> StoreResult<Option<Payment>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .payment_by_job
            .get(&job_id)
            .and_then(|pid| tables.payments.get(pid))
            .cloned())
    }

    async fn list_payments(&self) -> StoreResult<Vec<Payment>> {
        self.check_available()?;
        Ok(self.tables.read().await.payments.values().cloned().collect())
    }

    async fn commit_job_transition(
        &self,
        expected: JobState,
        job: &Job,
        agent: Option<&Agent>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .jobs
            .get(&job.id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
        if stored.state != expected {
            return Err(StoreError::StateConflict {
                job_id: job.id,
                expected,
                actual: stored.state,
            });
        }
        // Terminal states are immutable; only legal machine edges commit.
        if !stored.state.can_transition_to(job.state) {
            return Err(StoreError::StateConflict {
                job_id: job.id,
                expected,
                actual: stored.state,
            });
        }
        tables.jobs.insert(job.id, job.clone());
        if let Some(agent) = agent {
            tables.agents.insert(agent.id, agent.clone());
        }
        Ok(())
    }

    async fn commit_completion(
        &self,
        expected: JobState,
        job: &Job,
        agent: &Agent,
        payment: &Payment,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .jobs
            .get(&job.id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
        if stored.state != expected {
            return Err(StoreError::StateConflict {
                job_id: job.id,
                expected,
                actual: stored.state,
            });
        }
        if tables.payment_by_job.contains_key(&job.id) {
            return Err(StoreError::DuplicatePayment(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        tables.agents.insert(agent.id, agent.clone());
        tables.payments.insert(payment.id, payment.clone());
        tables.payment_by_job.insert(job.id, payment.id);
        Ok(())
    }

    async fn update_payment_guarded(
        &self,
        payment: &Payment,
        expected: &[PaymentState],
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .payments
            .get(&payment.id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment.id)))?;
        if !expected.contains(&stored.state) {
            return Ok(false);
        }
        tables.payments.insert(payment.id, payment.clone());
        Ok(true)
    }
}
