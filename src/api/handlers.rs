// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Boundary request/response types. Validation happens here, before anything
// touches the core; unknown fields are ignored and never persisted.

use crate::api::errors::ApiError;
use crate::jobs::{JobPriority, JobSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub wallet: String,
    pub gpu_vendor: String,
    pub gpu_model: String,
    pub gpu_memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.wallet.trim().is_empty() {
            return Err(ApiError::BadRequest("wallet is required".to_string()));
        }
        if let Some(0) = self.max_concurrent {
            return Err(ApiError::BadRequest(
                "max_concurrent must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: Uuid,
    pub credential: String,
    pub max_concurrent: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_load: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableJobsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<u64>,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPreview {
    pub job_id: Uuid,
    pub job_type: String,
    pub docker_image: String,
    pub priority: JobPriority,
    pub requires_gpu: bool,
    pub gpu_memory_required: u64,
    pub timeout_seconds: u64,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableJobsResponse {
    pub jobs: Vec<JobPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
}

impl CompleteRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(ApiError::BadRequest(
                "duration_seconds must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub payment_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub error: String,
}

impl FailRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.error.trim().is_empty() {
            return Err(ApiError::BadRequest("error is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitJobRequest {
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
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl AdmitJobRequest {
    pub fn into_spec(self) -> JobSpec {
        JobSpec {
            job_type: self.job_type,
            docker_image: self.docker_image,
            command: self.command,
            env: self.env,
            requires_gpu: self.requires_gpu,
            gpu_memory_required: self.gpu_memory_required,
            timeout_seconds: self.timeout_seconds,
            reward: self.reward,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<String>>,
}
