// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = Uuid;

/// Hardware snapshot reported by the agent at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub gpu_vendor: String,
    pub gpu_model: String,
    /// Total GPU memory in bytes; zero for CPU-only agents.
    pub gpu_memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
}

impl AgentCapability {
    pub fn has_gpu(&self) -> bool {
        self.gpu_memory > 0 && !self.gpu_model.is_empty()
    }
}

/// EWMA smoothing factor for the rolling average job duration.
pub const DURATION_EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_duration_seconds: f64,
}

impl AgentStats {
    pub fn success_rate(&self) -> f64 {
        self.completed as f64 / (self.completed + self.failed).max(1) as f64
    }

    pub fn record_completion(&mut self, duration_seconds: f64) {
        self.completed += 1;
        if self.completed == 1 && self.avg_duration_seconds == 0.0 {
            self.avg_duration_seconds = duration_seconds;
        } else {
            self.avg_duration_seconds = DURATION_EWMA_ALPHA * duration_seconds
                + (1.0 - DURATION_EWMA_ALPHA) * self.avg_duration_seconds;
        }
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn record_retry(&mut self) {
        self.retried += 1;
    }
}

/// Optional fields an agent may attach to a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_load: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub wallet: String,
    pub capability: AgentCapability,
    pub max_concurrent: u32,
    pub current_load: u32,
    /// Monotonic clock ms of the most recent heartbeat.
    pub last_heartbeat_at_ms: u64,
    pub healthy: bool,
    pub stats: AgentStats,
    /// Rolling success rate in [0,1]; informational, not a scoring input
    /// beyond the success term itself.
    pub reputation_score: f64,
    /// Tie-break input for assignment: agents that waited longest win.
    pub last_assigned_at_ms: u64,
    pub registered_at: DateTime<Utc>,
    /// Bearer credential; issued exactly once at registration and never
    /// serialized back out.
    #[serde(skip_serializing)]
    pub credential: String,
}

impl Agent {
    pub fn available_slots(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.current_load)
    }

    pub fn is_healthy_at(&self, now_ms: u64, heartbeat_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_at_ms) <= heartbeat_timeout_ms
    }

    /// Matching predicate: can this agent take a job with these
    /// requirements right now? There is no fallback to non-matching agents.
    pub fn can_run(
        &self,
        requires_gpu: bool,
        gpu_memory_required: u64,
        now_ms: u64,
        heartbeat_timeout_ms: u64,
    ) -> bool {
        self.healthy
            && self.is_healthy_at(now_ms, heartbeat_timeout_ms)
            && self.available_slots() >= 1
            && self.capability.gpu_memory >= gpu_memory_required
            && (!requires_gpu || self.capability.has_gpu())
    }
}
