use crate::jobs::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PaymentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentState {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// One payment row per completed job. Created in the same transaction as the
/// RUNNING -> COMPLETED transition; the row is the exactly-once gate for the
/// external pay call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub job_id: JobId,
    pub from_wallet: String,
    pub to_wallet: String,
    /// Amount in SOL.
    pub amount: f64,
    pub signature: Option<String>,
    pub state: PaymentState,
    /// Submission attempts so far, successful or not.
    pub attempts: u32,
    /// Monotonic-clock instant after which the next submission may run.
    pub next_attempt_at_ms: u64,
    /// Exhausted the retry schedule; held for manual review.
    pub parked: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn pending(
        job_id: JobId,
        from_wallet: &str,
        to_wallet: &str,
        amount: f64,
        now_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            from_wallet: from_wallet.to_string(),
            to_wallet: to_wallet.to_string(),
            amount,
            signature: None,
            state: PaymentState::Pending,
            attempts: 0,
            next_attempt_at_ms: now_ms,
            parked: false,
            last_error: None,
            created_at: Utc::now(),
            confirmed_at: None,
        }
    }

    /// Due for submission by the payment retry sweep.
    pub fn is_due(&self, now_ms: u64) -> bool {
        !self.parked
            && matches!(self.state, PaymentState::Pending | PaymentState::Failed)
            && self.next_attempt_at_ms <= now_ms
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("payment rejected: {0}")]
    Rejected(String),

    #[error("settlement call timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}
