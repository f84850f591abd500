// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Job domain types and the lifecycle state machine rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type JobId = Uuid;

/// Reward thresholds for the admission-time priority mapping, in SOL.
pub const HIGH_PRIORITY_REWARD: f64 = 0.01;
pub const NORMAL_PRIORITY_REWARD: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    /// Admission-time mapping from the posted reward.
    pub fn for_reward(reward: f64) -> Self {
        if reward >= HIGH_PRIORITY_REWARD {
            JobPriority::High
        } else if reward >= NORMAL_PRIORITY_REWARD {
            JobPriority::Normal
        } else {
            JobPriority::Low
        }
    }

    /// One step up the ladder. Retried jobs are promoted so repeated
    /// reassignment cannot starve them behind fresh admissions.
    pub fn promoted(self) -> Self {
        match self {
            JobPriority::Low => JobPriority::Normal,
            JobPriority::Normal => JobPriority::High,
            JobPriority::High => JobPriority::Urgent,
            JobPriority::Urgent => JobPriority::Urgent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl JobState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Abandoned)
    }

    /// States in which a job occupies a slot on an agent.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Assigned | JobState::Running)
    }

    /// Allowed edges of the lifecycle state machine. `Failed` is a transient
    /// marker: a failed job is immediately requeued or abandoned in the same
    /// transaction.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Failed)
                | (Assigned, Abandoned)
                | (Running, Completed)
                | (Running, Queued)
                | (Running, Failed)
                | (Running, Abandoned)
                | (Failed, Queued)
                | (Failed, Abandoned)
        )
    }
}

/// Requirements supplied by the job poster at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub docker_image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default)]
    pub gpu_memory_required: u64,
    pub timeout_seconds: u64,
    pub reward: f64,
    /// Per-job retry budget override; the marketplace default applies when
    /// absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub docker_image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub requires_gpu: bool,
    pub gpu_memory_required: u64,
    pub timeout_seconds: u64,
    pub reward: f64,

    pub state: JobState,
    pub priority: JobPriority,
    pub retry_count: u32,
    pub max_retries: u32,

    pub assigned_agent_id: Option<Uuid>,
    /// Monotonic clock timestamps (ms since scheduler start); used by every
    /// timeout decision.
    pub admitted_at_ms: u64,
    pub assigned_at_ms: Option<u64>,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    /// Admission order within the queue. Strictly increasing, survives
    /// requeues so FIFO fairness within a priority class holds.
    pub seq: u64,

    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub payment_id: Option<Uuid>,
}

impl Job {
    pub fn admit(spec: JobSpec, default_max_retries: u32, seq: u64, now_ms: u64) -> Self {
        let priority = JobPriority::for_reward(spec.reward);
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            docker_image: spec.docker_image,
            command: spec.command,
            env: spec.env,
            requires_gpu: spec.requires_gpu,
            gpu_memory_required: spec.gpu_memory_required,
            timeout_seconds: spec.timeout_seconds,
            reward: spec.reward,
            state: JobState::Queued,
            priority,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            assigned_agent_id: None,
            admitted_at_ms: now_ms,
            assigned_at_ms: None,
            started_at_ms: None,
            completed_at_ms: None,
            seq,
            created_at: Utc::now(),
            last_error: None,
            payment_id: None,
        }
    }

    /// Effective deadline base: execution start when known, otherwise the
    /// assignment instant.
    pub fn deadline_base_ms(&self) -> Option<u64> {
        self.started_at_ms.or(self.assigned_at_ms)
    }

    /// True once the declared timeout, stretched by the configured buffer,
    /// has elapsed.
    pub fn timed_out(&self, now_ms: u64, timeout_buffer: f64) -> bool {
        match self.deadline_base_ms() {
            Some(base) => {
                let budget_ms = (self.timeout_seconds as f64 * timeout_buffer * 1000.0) as u64;
                now_ms.saturating_sub(base) > budget_ms
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(reward: f64) -> JobSpec {
        JobSpec {
            job_type: "training".to_string(),
            docker_image: "pytorch/pytorch:latest".to_string(),
            command: vec!["python".to_string(), "train.py".to_string()],
            env: HashMap::new(),
            requires_gpu: true,
            gpu_memory_required: 4_000_000_000,
            timeout_seconds: 60,
            reward,
            max_retries: None,
        }
    }

    #[test]
    fn test_reward_priority_mapping() {
        assert_eq!(JobPriority::for_reward(0.02), JobPriority::High);
        assert_eq!(JobPriority::for_reward(0.01), JobPriority::High);
        assert_eq!(JobPriority::for_reward(0.002), JobPriority::Normal);
        assert_eq!(JobPriority::for_reward(0.001), JobPriority::Normal);
        assert_eq!(JobPriority::for_reward(0.0001), JobPriority::Low);
        assert_eq!(JobPriority::for_reward(0.0), JobPriority::Low);
    }

    #[test]
    fn test_promotion_is_monotone() {
        let ladder = [
            JobPriority::Low,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::Urgent,
        ];
        for p in ladder {
            assert!(p.promoted() >= p);
        }
        assert_eq!(JobPriority::Urgent.promoted(), JobPriority::Urgent);
    }

    #[test]
    fn test_state_machine_edges() {
        use JobState::*;
        assert!(Queued.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Queued));
        assert!(Assigned.can_transition_to(Abandoned));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Abandoned.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn test_admitted_job_defaults() {
        let job = Job::admit(spec(0.005), 3, 7, 1_000);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.seq, 7);
        assert!(job.assigned_agent_id.is_none());
        assert!(job.payment_id.is_none());
    }

    #[test]
    fn test_timeout_uses_buffer() {
        let mut job = Job::admit(spec(0.001), 3, 0, 0);
        job.assigned_at_ms = Some(0);
        // 60s declared, 1.2 buffer -> 72s budget.
        assert!(!job.timed_out(71_000, 1.2));
        assert!(job.timed_out(72_001, 1.2));
    }

    #[test]
    fn test_queued_job_never_times_out() {
        let job = Job::admit(spec(0.001), 3, 0, 0);
        assert!(!job.timed_out(u64::MAX / 2, 1.2));
    }
}
