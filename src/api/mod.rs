// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{
    AdmitJobRequest, AdmitJobResponse, AvailableJobsRequest, AvailableJobsResponse,
    CompleteRequest, CompleteResponse, FailRequest, HealthResponse, HeartbeatRequest, JobPreview,
    RegisterRequest, RegisterResponse,
};
pub use server::{create_app, serve, AppState};
