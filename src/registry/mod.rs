// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Authoritative in-memory view of every registered agent. Persists to the
// store on change and is rebuilt from it at startup; assignment decisions
// read this view, never the store directly.

pub mod types;

pub use types::{Agent, AgentCapability, AgentId, AgentStats, HeartbeatStatus};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::jobs::JobState;
use crate::store::MarketplaceStore;
use chrono::Utc;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct AgentRegistry {
    clock: Arc<dyn Clock>,
    store: Arc<dyn MarketplaceStore>,
    heartbeat_timeout_ms: u64,
    default_max_concurrent: u32,
    agents: RwLock<HashMap<AgentId, Agent>>,
    credentials: RwLock<HashMap<String, AgentId>>,
}

impl AgentRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn MarketplaceStore>,
        heartbeat_timeout_ms: u64,
        default_max_concurrent: u32,
    ) -> Self {
        Self {
            clock,
            store,
            heartbeat_timeout_ms,
            default_max_concurrent,
            agents: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory view from the store. Per-agent load is
    /// recomputed from the jobs actually assigned or running, which also
    /// audits the load invariant after a restart.
    pub async fn recover(&self) -> CoreResult<usize> {
        let mut agents: HashMap<AgentId, Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        let mut active: HashMap<AgentId, u32> = HashMap::new();
        for state in [JobState::Assigned, JobState::Running] {
            for job in self.store.jobs_in_state(state).await? {
                if let Some(agent_id) = job.assigned_agent_id {
                    *active.entry(agent_id).or_insert(0) += 1;
                }
            }
        }
        for agent in agents.values_mut() {
            let observed = active.get(&agent.id).copied().unwrap_or(0);
            if agent.current_load != observed {
                warn!(
                    agent_id = %agent.id,
                    stored = agent.current_load,
                    observed,
                    "agent load corrected during recovery"
                );
                agent.current_load = observed;
            }
        }

        let count = agents.len();
        let mut credentials = HashMap::new();
        for agent in agents.values() {
            credentials.insert(agent.credential.clone(), agent.id);
        }
        *self.agents.write().await = agents;
        *self.credentials.write().await = credentials;
        info!(agents = count, "registry recovered from store");
        Ok(count)
    }

    /// Register an agent and issue its bearer credential. Re-registering
    /// with an identical wallet and capability snapshot is idempotent and
    /// returns the existing identity.
    pub async fn register(
        &self,
        capability: AgentCapability,
        wallet: String,
        max_concurrent: Option<u32>,
    ) -> CoreResult<(AgentId, String, u32)> {
        {
            let agents = self.agents.read().await;
            if let Some(existing) = agents
                .values()
                .find(|a| a.wallet == wallet && a.capability == capability)
            {
                debug!(agent_id = %existing.id, "idempotent re-registration");
                return Ok((
                    existing.id,
                    existing.credential.clone(),
                    existing.max_concurrent,
                ));
            }
        }

        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let credential = hex::encode(secret);

        let now_ms = self.clock.now_ms();
        let agent = Agent {
            id: Uuid::new_v4(),
            wallet,
            capability,
            max_concurrent: max_concurrent.unwrap_or(self.default_max_concurrent),
            current_load: 0,
            last_heartbeat_at_ms: now_ms,
            healthy: true,
            stats: AgentStats::default(),
            reputation_score: 0.0,
            last_assigned_at_ms: 0,
            registered_at: Utc::now(),
            credential: credential.clone(),
        };

        self.store.put_agent(&agent).await?;
        let id = agent.id;
        let max_concurrent = agent.max_concurrent;
        self.credentials
            .write()
            .await
            .insert(credential.clone(), id);
        self.agents.write().await.insert(id, agent);
        info!(agent_id = %id, "agent registered");
        Ok((id, credential, max_concurrent))
    }

    pub async fn authenticate(&self, credential: &str) -> CoreResult<AgentId> {
        self.credentials
            .read()
            .await
            .get(credential)
            .copied()
            .ok_or_else(|| CoreError::Unauthorized("unknown agent credential".to_string()))
    }

    /// Last-writer-wins heartbeat. Also clears the unhealthy flag: a
    /// returning agent is eligible for assignment again on the next sweep.
    pub async fn heartbeat(&self, agent_id: AgentId, status: HeartbeatStatus) -> CoreResult<()> {
        let updated = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&agent_id)
                .ok_or_else(|| CoreError::NotFound(format!("agent {}", agent_id)))?;
            agent.last_heartbeat_at_ms = self.clock.now_ms();
            agent.healthy = true;
            if let Some(reason) = status.status.as_deref() {
                debug!(agent_id = %agent_id, reason, "heartbeat status");
            }
            agent.clone()
        };
        self.persist(&updated).await;
        Ok(())
    }

    pub async fn observe_completion(&self, agent_id: AgentId, duration_seconds: f64) {
        if let Some(updated) = self
            .mutate(agent_id, |agent| {
                agent.stats.record_completion(duration_seconds);
                agent.reputation_score = agent.stats.success_rate();
            })
            .await
        {
            self.persist(&updated).await;
        }
    }

    pub async fn observe_failure(&self, agent_id: AgentId) {
        if let Some(updated) = self
            .mutate(agent_id, |agent| {
                agent.stats.record_failure();
                agent.reputation_score = agent.stats.success_rate();
            })
            .await
        {
            self.persist(&updated).await;
        }
    }

    pub async fn observe_retry(&self, agent_id: AgentId) {
        if let Some(updated) = self
            .mutate(agent_id, |agent| agent.stats.record_retry())
            .await
        {
            self.persist(&updated).await;
        }
    }

    /// Sync the in-memory view after a committed assignment.
    pub async fn apply_assignment(&self, agent_id: AgentId, now_ms: u64) {
        self.mutate(agent_id, |agent| {
            agent.current_load = (agent.current_load + 1).min(agent.max_concurrent);
            agent.last_assigned_at_ms = now_ms;
        })
        .await;
    }

    /// Sync the in-memory view after a committed release (completion,
    /// failure or reassignment).
    pub async fn apply_release(&self, agent_id: AgentId) {
        self.mutate(agent_id, |agent| {
            agent.current_load = agent.current_load.saturating_sub(1);
        })
        .await;
    }

    /// Mark agents whose heartbeat has expired. Returns the agents that just
    /// flipped to unhealthy so the caller can reassign their jobs.
    pub async fn sweep_expired(&self) -> Vec<AgentId> {
        let now_ms = self.clock.now_ms();
        let mut expired = Vec::new();
        let mut to_persist = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for agent in agents.values_mut() {
                if agent.healthy && !agent.is_healthy_at(now_ms, self.heartbeat_timeout_ms) {
                    agent.healthy = false;
                    expired.push(agent.id);
                    to_persist.push(agent.clone());
                    warn!(agent_id = %agent.id, "agent heartbeat expired");
                }
            }
        }
        for agent in &to_persist {
            self.persist(agent).await;
        }
        expired
    }

    pub async fn get(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.read().await.get(&agent_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout_ms
    }

    async fn mutate(&self, agent_id: AgentId, f: impl FnOnce(&mut Agent)) -> Option<Agent> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(&agent_id)?;
        f(agent);
        Some(agent.clone())
    }

    /// Registry persistence is best-effort: the in-memory view stays
    /// authoritative through a store outage and load is re-audited from job
    /// rows at recovery.
    async fn persist(&self, agent: &Agent) {
        if let Err(err) = self.store.put_agent(agent).await {
            warn!(agent_id = %agent.id, %err, "agent persist deferred");
        }
    }
}

#[cfg(test)]
pub fn test_agent(wallet: &str) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        wallet: wallet.to_string(),
        capability: AgentCapability {
            gpu_vendor: "nvidia".to_string(),
            gpu_model: "rtx-3080".to_string(),
            gpu_memory: 8_000_000_000,
            compute_capability: None,
            framework: Some("cuda".to_string()),
        },
        max_concurrent: 2,
        current_load: 0,
        last_heartbeat_at_ms: 0,
        healthy: true,
        stats: AgentStats::default(),
        reputation_score: 0.0,
        last_assigned_at_ms: 0,
        registered_at: Utc::now(),
        credential: "test-credential".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn capability() -> AgentCapability {
        AgentCapability {
            gpu_vendor: "nvidia".to_string(),
            gpu_model: "a100".to_string(),
            gpu_memory: 40_000_000_000,
            compute_capability: Some("8.0".to_string()),
            framework: Some("cuda".to_string()),
        }
    }

    fn registry() -> (Arc<VirtualClock>, Arc<MemoryStore>, AgentRegistry) {
        let clock = Arc::new(VirtualClock::new());
        let store = Arc::new(MemoryStore::new());
        let registry = AgentRegistry::new(clock.clone(), store.clone(), 60_000, 2);
        (clock, store, registry)
    }

    #[tokio::test]
    async fn test_register_issues_credential_and_persists() {
        let (_clock, store, registry) = registry();
        let (id, credential, max_concurrent) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();
        assert_eq!(max_concurrent, 2);
        assert_eq!(credential.len(), 64); // 32 bytes hex
        assert_eq!(registry.authenticate(&credential).await.unwrap(), id);
        assert!(store.get_agent(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_identical_snapshot() {
        let (_clock, _store, registry) = registry();
        let (id1, cred1, _) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();
        let (id2, cred2, _) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(cred1, cred2);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_fails_closed_on_store_outage() {
        let (_clock, store, registry) = registry();
        store.set_available(false);
        let err = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_credential_is_unauthorized() {
        let (_clock, _store, registry) = registry();
        let err = registry.authenticate("bogus").await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_expiry_and_return() {
        let (clock, _store, registry) = registry();
        let (id, _, _) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(61));
        let expired = registry.sweep_expired().await;
        assert_eq!(expired, vec![id]);
        assert!(!registry.get(id).await.unwrap().healthy);

        // Sweeping again reports nothing new.
        assert!(registry.sweep_expired().await.is_empty());

        registry
            .heartbeat(id, HeartbeatStatus::default())
            .await
            .unwrap();
        assert!(registry.get(id).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_load_accounting() {
        let (clock, _store, registry) = registry();
        let (id, _, _) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();

        registry.apply_assignment(id, clock.now_ms()).await;
        assert_eq!(registry.get(id).await.unwrap().current_load, 1);
        registry.apply_release(id).await;
        assert_eq!(registry.get(id).await.unwrap().current_load, 0);
        // Release never underflows.
        registry.apply_release(id).await;
        assert_eq!(registry.get(id).await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_observations_update_reputation() {
        let (_clock, _store, registry) = registry();
        let (id, _, _) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();

        registry.observe_completion(id, 30.0).await;
        registry.observe_completion(id, 60.0).await;
        registry.observe_failure(id).await;

        let agent = registry.get(id).await.unwrap();
        assert_eq!(agent.stats.completed, 2);
        assert_eq!(agent.stats.failed, 1);
        assert!((agent.reputation_score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recovery_rebuilds_view_and_corrects_load() {
        let (clock, store, registry) = registry();
        let (id, credential, _) = registry
            .register(capability(), "wallet-1".to_string(), None)
            .await
            .unwrap();

        // A job assigned to the agent exists in the store, but the persisted
        // agent row claims zero load.
        let mut job = crate::jobs::Job::admit(
            crate::jobs::JobSpec {
                job_type: "inference".to_string(),
                docker_image: "img".to_string(),
                command: vec![],
                env: Default::default(),
                requires_gpu: false,
                gpu_memory_required: 0,
                timeout_seconds: 60,
                reward: 0.001,
                max_retries: None,
            },
            3,
            0,
            clock.now_ms(),
        );
        job.state = JobState::Assigned;
        job.assigned_agent_id = Some(id);
        store.put_job(&job).await.unwrap();

        let fresh = AgentRegistry::new(clock.clone(), store.clone(), 60_000, 2);
        assert_eq!(fresh.recover().await.unwrap(), 1);
        assert_eq!(fresh.get(id).await.unwrap().current_load, 1);
        assert_eq!(fresh.authenticate(&credential).await.unwrap(), id);
    }
}
