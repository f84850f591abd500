// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Durable store seam. The marketplace treats persistence as a transactional
// key/indexed store: single-row reads and writes are linearizable, and the
// compound groups the lifecycle needs (assign + load, complete + payment)
// commit atomically or not at all. In-memory registry and queue are caches
// rebuilt from this store at startup; the store is the source of truth.

pub mod memory;

pub use memory::MemoryStore;

use crate::jobs::{Job, JobId, JobState};
use crate::registry::types::{Agent, AgentId};
use crate::settlement::types::{Payment, PaymentId, PaymentState};
use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient outage; callers degrade to read-only behavior until the
    /// store recovers.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("job {job_id} is {actual:?}, expected {expected:?}")]
    StateConflict {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("payment already exists for job {0}")]
    DuplicatePayment(JobId),

    #[error("not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait MarketplaceStore: Send + Sync {
    async fn put_agent(&self, agent: &Agent) -> StoreResult<()>;
    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    async fn put_job(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;
    /// Jobs in a state, ordered by (priority desc, admission seq asc).
    async fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>>;
    async fn jobs_for_agent(&self, agent_id: AgentId) -> StoreResult<Vec<Job>>;

    async fn get_payment(&self, id: PaymentId) -> StoreResult<Option<Payment>>;
    async fn payment_for_job(&self, job_id: JobId) -> StoreResult<Option<Payment>>;
    async fn list_payments(&self) -> StoreResult<Vec<Payment>>;

    /// Write a job transition and, in the same atomic step, the agent row
    /// whose load it changes. Commits only if the stored job is still in
    /// `expected`; otherwise nothing changes and a `StateConflict` is
    /// returned.
    async fn commit_job_transition(
        &self,
        expected: JobState,
        job: &Job,
        agent: Option<&Agent>,
    ) -> StoreResult<()>;

    /// The RUNNING -> COMPLETED group: job row, agent row and a fresh
    /// payment row in one atomic step. Rejects a second payment for the same
    /// job.
    async fn commit_completion(
        &self,
        expected: JobState,
        job: &Job,
        agent: &Agent,
        payment: &Payment,
    ) -> StoreResult<()>;

    /// Compare-and-set on a payment row: the write applies only when the
    /// stored state is one of `expected`. Returns whether it applied. This
    /// is what keeps concurrent submitters from double-paying.
    async fn update_payment_guarded(
        &self,
        payment: &Payment,
        expected: &[PaymentState],
    ) -> StoreResult<bool>;
}
