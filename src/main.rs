// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::Result;
use fabstir_gpu_marketplace::{
    api::{serve, AppState},
    clock::SystemClock,
    config::MarketplaceConfig,
    lifecycle::JobLifecycle,
    monitoring::MarketplaceMetrics,
    queue::JobQueue,
    registry::AgentRegistry,
    scheduler::Scheduler,
    settlement::{DryRunSettlement, SettlementEngine},
    store::MemoryStore,
    version,
};
use std::env;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing subscriber for logging
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    println!("🚀 Starting {}...", version::get_version_string());

    let config = MarketplaceConfig::from_env();
    if config.admin_key.is_empty() {
        warn!("ADMIN_API_KEY is unset; admin endpoints are disabled");
    }
    if config.marketplace_wallet.is_empty() {
        warn!("MARKETPLACE_WALLET is unset; payments will carry an empty source wallet");
    }

    let clock = Arc::new(SystemClock::new());
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(MarketplaceMetrics::new()?);
    let registry = Arc::new(AgentRegistry::new(
        clock.clone(),
        store.clone(),
        config.heartbeat_timeout_ms(),
        config.default_max_concurrent,
    ));
    let queue = Arc::new(JobQueue::new());
    let settlement = SettlementEngine::new(
        Arc::new(DryRunSettlement),
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
        settlement.clone(),
        metrics.clone(),
        &config,
    ));
    let scheduler = Arc::new(Scheduler::new(
        lifecycle.clone(),
        registry.clone(),
        queue.clone(),
        store.clone(),
        settlement,
        clock.clone(),
        metrics.clone(),
        &config,
    ));

    // In-memory caches are rebuilt from the store before anything runs.
    registry.recover().await?;
    lifecycle.recover().await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let maintenance = tokio::spawn(scheduler.clone().run_loop(shutdown_rx));
    info!("scheduler maintenance loop spawned");

    let state = AppState {
        lifecycle,
        registry,
        scheduler,
        store,
        metrics,
        admin_key: config.admin_key.clone(),
        started: Instant::now(),
    };
    serve(state, &config.listen_addr).await?;

    // The listener has drained; stop the maintenance loop between passes.
    let _ = shutdown_tx.send(()).await;
    let _ = maintenance.await;
    info!("marketplace stopped");
    Ok(())
}
