// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Maintenance-loop behavior: dispatch ordering, capacity, timeout and
// heartbeat recovery, retry exhaustion. Everything runs against the virtual
// clock by ticking the scheduler by hand.

mod common;

use common::Harness;
use fabstir_gpu_marketplace::jobs::{JobPriority, JobState};
use fabstir_gpu_marketplace::store::MarketplaceStore;
use std::time::Duration;

#[tokio::test]
async fn test_reward_based_assignment_order() {
    let harness = Harness::new();

    // Admitted in reward-ascending order, before any agent exists.
    let j1 = harness.admit(0.0001, 60, 0).await; // LOW
    let j2 = harness.admit(0.002, 60, 0).await; // NORMAL
    let j3 = harness.admit(0.02, 60, 0).await; // HIGH

    let (agent, _) = harness.register_agent("wallet-a", 8_000_000_000, 1).await;

    let mut order = Vec::new();
    for _ in 0..3 {
        harness.scheduler.run_once().await;
        let assigned = harness
            .store
            .jobs_in_state(JobState::Assigned)
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1, "capacity 1 admits one job at a time");
        let job = &assigned[0];
        order.push(job.id);
        harness.lifecycle.started(agent, job.id).await.unwrap();
        harness.lifecycle.complete(agent, job.id, 5.0).await.unwrap();
    }

    assert_eq!(order, vec![j3.id, j2.id, j1.id]);
}

#[tokio::test]
async fn test_fifo_within_priority_class() {
    let harness = Harness::new();

    let first = harness.admit(0.002, 60, 0).await;
    let second = harness.admit(0.002, 60, 0).await;
    let (agent, _) = harness.register_agent("wallet-a", 8_000_000_000, 1).await;

    harness.scheduler.run_once().await;
    let assigned = harness
        .store
        .jobs_in_state(JobState::Assigned)
        .await
        .unwrap();
    assert_eq!(assigned[0].id, first.id);

    harness.lifecycle.started(agent, first.id).await.unwrap();
    harness
        .lifecycle
        .complete(agent, first.id, 5.0)
        .await
        .unwrap();
    harness.scheduler.run_once().await;

    let assigned = harness
        .store
        .jobs_in_state(JobState::Assigned)
        .await
        .unwrap();
    assert_eq!(assigned[0].id, second.id);
}

#[tokio::test]
async fn test_capacity_is_never_exceeded() {
    let harness = Harness::new();

    for _ in 0..3 {
        harness.admit(0.002, 60, 0).await;
    }
    let (agent, _) = harness.register_agent("wallet-a", 8_000_000_000, 2).await;

    harness.scheduler.run_once().await;

    let assigned = harness
        .store
        .jobs_in_state(JobState::Assigned)
        .await
        .unwrap();
    assert_eq!(assigned.len(), 2);
    assert_eq!(harness.queue.len().await, 1);
    assert_eq!(harness.registry.get(agent).await.unwrap().current_load, 2);

    // Load accounting matches the job table exactly.
    assert!(harness.lifecycle.audit_agent_loads().await.unwrap().is_empty());

    // Running the sweep again changes nothing.
    harness.scheduler.run_once().await;
    assert_eq!(harness.registry.get(agent).await.unwrap().current_load, 2);
}

#[tokio::test]
async fn test_gpu_memory_requirement_is_respected() {
    let harness = Harness::new();

    let job = harness.admit(0.002, 60, 16_000_000_000).await;
    harness.register_agent("small-gpu", 8_000_000_000, 2).await;

    harness.scheduler.run_once().await;
    // No matching agent: the job stays queued, no fallback placement.
    assert_eq!(
        harness.lifecycle.get_job(job.id).await.unwrap().state,
        JobState::Queued
    );

    harness.register_agent("big-gpu", 24_000_000_000, 2).await;
    harness.scheduler.run_once().await;

    let stored = harness.lifecycle.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Assigned);
    let agent = harness
        .registry
        .get(stored.assigned_agent_id.unwrap())
        .await
        .unwrap();
    assert!(agent.capability.gpu_memory >= stored.gpu_memory_required);
}

#[tokio::test]
async fn test_timeout_reassignment_then_completion_elsewhere() {
    let harness = Harness::new();

    let job = harness.admit(0.001, 10, 4_000_000_000).await;
    let (agent_a, _) = harness.register_agent("wallet-a", 8_000_000_000, 2).await;

    // Assign at t=1s so the tie-break clock below is unambiguous.
    harness.clock.advance(Duration::from_secs(1));
    harness.scheduler.run_once().await;
    let stored = harness.lifecycle.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Assigned);
    assert_eq!(stored.assigned_agent_id, Some(agent_a));

    // A second agent stands by; A never calls start, complete or fail.
    let (agent_b, _) = harness.register_agent("wallet-b", 8_000_000_000, 2).await;

    // Declared 10s x 1.2 buffer = 12s. Just before the deadline nothing
    // happens.
    harness.clock.advance(Duration::from_millis(11_900));
    harness.scheduler.run_once().await;
    assert_eq!(
        harness
            .lifecycle
            .get_job(job.id)
            .await
            .unwrap()
            .assigned_agent_id,
        Some(agent_a)
    );

    harness.clock.advance(Duration::from_millis(200));
    harness.scheduler.run_once().await;

    // The pass requeued the job off A (promoted, retry spent) and the
    // dispatch sweep placed it on B, the agent that waited longest.
    let stored = harness.lifecycle.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Assigned);
    assert_eq!(stored.assigned_agent_id, Some(agent_b));
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.priority, JobPriority::High); // promoted from NORMAL
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    assert_eq!(harness.registry.get(agent_a).await.unwrap().current_load, 0);

    harness.lifecycle.started(agent_b, job.id).await.unwrap();
    harness
        .lifecycle
        .complete(agent_b, job.id, 8.0)
        .await
        .unwrap();
    harness.drain_background().await;

    let payments = harness.store.list_payments().await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].to_wallet, "wallet-b");
}

#[tokio::test]
async fn test_heartbeat_loss_reassigns_and_late_complete_conflicts() {
    let harness = Harness::new();

    let job = harness.admit(0.001, 600, 4_000_000_000).await;
    let (agent_a, _) = harness.register_agent("wallet-a", 8_000_000_000, 2).await;

    harness.scheduler.run_once().await;
    harness.lifecycle.started(agent_a, job.id).await.unwrap();

    // Agent A goes silent for 61s.
    harness.clock.advance(Duration::from_secs(61));
    let (agent_b, _) = harness.register_agent("wallet-b", 8_000_000_000, 2).await;
    harness.scheduler.run_once().await;

    let stored = harness.lifecycle.get_job(job.id).await.unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("agent unhealthy"));
    assert_eq!(stored.state, JobState::Assigned);
    assert_eq!(stored.assigned_agent_id, Some(agent_b));
    assert_eq!(harness.registry.get(agent_a).await.unwrap().current_load, 0);
    assert!(!harness.registry.get(agent_a).await.unwrap().healthy);

    harness.lifecycle.started(agent_b, job.id).await.unwrap();
    harness
        .lifecycle
        .complete(agent_b, job.id, 30.0)
        .await
        .unwrap();
    harness.drain_background().await;

    // A comes back and reports the job it lost: state guard rejects it.
    let err = harness.lifecycle.complete(agent_a, job.id, 99.0).await;
    assert!(err.is_err());

    let payments = harness.store.list_payments().await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].to_wallet, "wallet-b");
}

#[tokio::test]
async fn test_retry_exhaustion_abandons_without_payment() {
    let harness = Harness::new();

    let job = harness.admit(0.002, 60, 0).await;
    assert_eq!(job.max_retries, 3);

    let mut holders = Vec::new();
    for attempt in 0..4u32 {
        let wallet = format!("wallet-{}", attempt);
        harness.register_agent(&wallet, 8_000_000_000, 2).await;
        harness.clock.advance(Duration::from_secs(1));
        harness.scheduler.run_once().await;

        let stored = harness.lifecycle.get_job(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Assigned);
        let holder = stored.assigned_agent_id.unwrap();
        holders.push(holder);
        harness
            .lifecycle
            .fail(holder, job.id, "cuda out of memory")
            .await
            .unwrap();
    }

    // Fresh agents wait longest, so four distinct agents took the job.
    holders.sort();
    holders.dedup();
    assert_eq!(holders.len(), 4);

    let stored = harness.lifecycle.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Abandoned);
    assert_eq!(stored.retry_count, 3);
    assert!(harness.store.list_payments().await.unwrap().is_empty());

    let stats = harness.lifecycle.stats().await.unwrap();
    assert_eq!(stats.jobs.abandoned, 1);

    // Abandoned is terminal: nothing ever dispatches it again.
    harness.scheduler.run_once().await;
    assert_eq!(
        harness.lifecycle.get_job(job.id).await.unwrap().state,
        JobState::Abandoned
    );
}

#[tokio::test]
async fn test_priority_promotion_is_monotone_across_retries() {
    let harness = Harness::new();

    let job = harness.admit(0.0001, 60, 0).await; // LOW
    let mut last_priority = JobPriority::Low;

    for _ in 0..3 {
        harness.register_agent("wallet-x", 8_000_000_000, 2).await;
        harness.scheduler.run_once().await;
        let stored = harness.lifecycle.get_job(job.id).await.unwrap();
        let holder = stored.assigned_agent_id.unwrap();
        harness
            .lifecycle
            .fail(holder, job.id, "worker crashed")
            .await
            .unwrap();

        let requeued = harness.lifecycle.get_job(job.id).await.unwrap();
        assert!(requeued.priority >= last_priority);
        last_priority = requeued.priority;
    }
    assert_eq!(last_priority, JobPriority::Urgent);
}

#[tokio::test]
async fn test_unhealthy_agent_excluded_from_dispatch() {
    let harness = Harness::new();

    harness.register_agent("wallet-a", 8_000_000_000, 2).await;
    harness.clock.advance(Duration::from_secs(61));
    harness.scheduler.run_once().await; // expires the agent

    let job = harness.admit(0.002, 60, 0).await;
    harness.scheduler.run_once().await;
    assert_eq!(
        harness.lifecycle.get_job(job.id).await.unwrap().state,
        JobState::Queued
    );

    let stats = harness.lifecycle.stats().await.unwrap();
    assert_eq!(stats.agents.unhealthy, 1);
}

#[tokio::test]
async fn test_best_scored_agent_wins_assignment() {
    let harness = Harness::new();

    // Busy agent: one of two slots taken.
    let (busy, _) = harness.register_agent("wallet-busy", 8_000_000_000, 2).await;
    let filler = harness.admit(0.002, 600, 0).await;
    harness.scheduler.run_once().await;
    assert_eq!(
        harness
            .lifecycle
            .get_job(filler.id)
            .await
            .unwrap()
            .assigned_agent_id,
        Some(busy)
    );

    // Idle agent joins; the next job should land on it.
    let (idle, _) = harness.register_agent("wallet-idle", 8_000_000_000, 2).await;
    let job = harness.admit(0.002, 600, 0).await;
    harness.scheduler.run_once().await;
    assert_eq!(
        harness
            .lifecycle
            .get_job(job.id)
            .await
            .unwrap()
            .assigned_agent_id,
        Some(idle)
    );
}

#[tokio::test]
async fn test_dispatch_halts_during_store_outage_and_recovers() {
    let harness = Harness::new();

    let job = harness.admit(0.002, 60, 0).await;
    harness.register_agent("wallet-a", 8_000_000_000, 2).await;

    harness.store.set_available(false);
    harness.scheduler.run_once().await;
    assert!(harness.queue.contains(job.id).await, "job stays queued");

    harness.store.set_available(true);
    harness.scheduler.run_once().await;
    assert_eq!(
        harness.lifecycle.get_job(job.id).await.unwrap().state,
        JobState::Assigned
    );
}
