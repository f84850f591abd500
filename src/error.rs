// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Error taxonomy shared by the lifecycle controller, registry and scheduler.
// The API layer maps these one-to-one onto response codes.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoreError::Unavailable(msg),
            conflict @ StoreError::StateConflict { .. } => {
                CoreError::Conflict(conflict.to_string())
            }
            StoreError::DuplicatePayment(job_id) => {
                CoreError::Conflict(format!("payment already exists for job {}", job_id))
            }
            StoreError::NotFound(what) => CoreError::NotFound(what),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
