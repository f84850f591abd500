// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Shared harness: a full coordination core over a virtual clock, an
// in-memory store and a scripted settlement transport.
#![allow(dead_code)]

use async_trait::async_trait;
use fabstir_gpu_marketplace::{
    api::AppState,
    clock::VirtualClock,
    config::MarketplaceConfig,
    jobs::{Job, JobSpec},
    lifecycle::JobLifecycle,
    monitoring::MarketplaceMetrics,
    queue::JobQueue,
    registry::{AgentId, AgentRegistry},
    scheduler::Scheduler,
    settlement::{Settlement, SettlementEngine, SettlementError},
    store::MemoryStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const ADMIN_KEY: &str = "admin-secret";
pub const MARKETPLACE_WALLET: &str = "marketplace-treasury";

/// Settlement transport with a programmable outcome script. With an empty
/// script every call succeeds with a fresh signature.
pub struct ScriptedSettlement {
    script: Mutex<VecDeque<Result<String, SettlementError>>>,
    pub calls: AtomicUsize,
    pub payouts: Mutex<Vec<(String, f64, Uuid)>>,
}

impl ScriptedSettlement {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            payouts: Mutex::new(Vec::new()),
        }
    }

    /// Queue up `n` transport failures before submissions succeed again.
    pub async fn fail_times(&self, n: usize) {
        let mut script = self.script.lock().await;
        for _ in 0..n {
            script.push_back(Err(SettlementError::Transport("rpc down".to_string())));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Settlement for ScriptedSettlement {
    async fn pay(
        &self,
        _from_wallet: &str,
        to_wallet: &str,
        amount: f64,
        memo: Uuid,
    ) -> Result<String, SettlementError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(format!("sig-{}", call)));
        if outcome.is_ok() {
            self.payouts
                .lock()
                .await
                .push((to_wallet.to_string(), amount, memo));
        }
        outcome
    }
}

pub struct Harness {
    pub clock: Arc<VirtualClock>,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<JobQueue>,
    pub lifecycle: Arc<JobLifecycle>,
    pub scheduler: Arc<Scheduler>,
    pub settlement: Arc<ScriptedSettlement>,
    pub metrics: Arc<MarketplaceMetrics>,
    pub config: MarketplaceConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(customize: impl FnOnce(&mut MarketplaceConfig)) -> Self {
        let mut config = MarketplaceConfig {
            marketplace_wallet: MARKETPLACE_WALLET.to_string(),
            admin_key: ADMIN_KEY.to_string(),
            ..MarketplaceConfig::default()
        };
        customize(&mut config);

        let clock = Arc::new(VirtualClock::new());
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MarketplaceMetrics::new().expect("metrics registry"));
        let registry = Arc::new(AgentRegistry::new(
            clock.clone(),
            store.clone(),
            config.heartbeat_timeout_ms(),
            config.default_max_concurrent,
        ));
        let queue = Arc::new(JobQueue::new());
        let settlement = Arc::new(ScriptedSettlement::new());
        let engine = SettlementEngine::new(
            settlement.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            config.settlement_workers,
            config.settlement_backoff.clone(),
            config.settlement_timeout,
        );
        let lifecycle = Arc::new(JobLifecycle::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            clock.clone(),
            engine.clone(),
            metrics.clone(),
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(
            lifecycle.clone(),
            registry.clone(),
            queue.clone(),
            store.clone(),
            engine,
            clock.clone(),
            metrics.clone(),
            &config,
        ));

        Self {
            clock,
            store,
            registry,
            queue,
            lifecycle,
            scheduler,
            settlement,
            metrics,
            config,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            lifecycle: self.lifecycle.clone(),
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            admin_key: self.config.admin_key.clone(),
            started: Instant::now(),
        }
    }

    pub async fn register_agent(
        &self,
        wallet: &str,
        gpu_memory: u64,
        max_concurrent: u32,
    ) -> (AgentId, String) {
        let capability = fabstir_gpu_marketplace::registry::AgentCapability {
            gpu_vendor: "nvidia".to_string(),
            gpu_model: "rtx-4090".to_string(),
            gpu_memory,
            compute_capability: Some("8.9".to_string()),
            framework: Some("cuda".to_string()),
        };
        let (id, credential, _) = self
            .registry
            .register(capability, wallet.to_string(), Some(max_concurrent))
            .await
            .expect("agent registration");
        (id, credential)
    }

    pub fn spec(reward: f64, timeout_seconds: u64, gpu_memory_required: u64) -> JobSpec {
        JobSpec {
            job_type: "training".to_string(),
            docker_image: "pytorch/pytorch:2.1".to_string(),
            command: vec!["python".to_string(), "train.py".to_string()],
            env: HashMap::new(),
            requires_gpu: gpu_memory_required > 0,
            gpu_memory_required,
            timeout_seconds,
            reward,
            max_retries: None,
        }
    }

    pub async fn admit(&self, reward: f64, timeout_seconds: u64, gpu_memory_required: u64) -> Job {
        self.lifecycle
            .admit(Self::spec(reward, timeout_seconds, gpu_memory_required))
            .await
            .expect("admission")
    }

    /// Let the tasks spawned by `complete` (settlement submission) run to
    /// completion on the test runtime.
    pub async fn drain_background(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
