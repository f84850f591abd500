// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Settlement: the payment side of job completion. The external transport is
// behind the `Settlement` trait; the engine owns the exactly-once gate, the
// bounded submission pool and the retry schedule.

pub mod types;

pub use types::{Payment, PaymentId, PaymentState, SettlementError};

use crate::clock::Clock;
use crate::jobs::JobId;
use crate::monitoring::MarketplaceMetrics;
use crate::store::MarketplaceStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// External payment transport. May block; always invoked from the bounded
/// worker pool, never inline on a request. Idempotency across process
/// restarts is the caller's job: the engine calls `pay` at most once per
/// in-flight payment row.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn pay(
        &self,
        from_wallet: &str,
        to_wallet: &str,
        amount: f64,
        memo: JobId,
    ) -> Result<String, SettlementError>;
}

/// Stand-in transport for deployments without a chain connection. Records a
/// synthetic signature so the rest of the pipeline can be exercised.
pub struct DryRunSettlement;

#[async_trait]
impl Settlement for DryRunSettlement {
    async fn pay(
        &self,
        _from_wallet: &str,
        to_wallet: &str,
        amount: f64,
        memo: JobId,
    ) -> Result<String, SettlementError> {
        warn!(
            %memo,
            to_wallet,
            amount,
            "settlement transport not configured; recording dry-run signature"
        );
        Ok(format!("dryrun-{}", memo.simple()))
    }
}

#[derive(Clone)]
pub struct SettlementEngine {
    settlement: Arc<dyn Settlement>,
    store: Arc<dyn MarketplaceStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MarketplaceMetrics>,
    workers: Arc<Semaphore>,
    backoff: Arc<Vec<Duration>>,
    call_timeout: Duration,
}

impl SettlementEngine {
    pub fn new(
        settlement: Arc<dyn Settlement>,
        store: Arc<dyn MarketplaceStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MarketplaceMetrics>,
        workers: usize,
        backoff: Vec<Duration>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            settlement,
            store,
            clock,
            metrics,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            backoff: Arc::new(backoff),
            call_timeout,
        }
    }

    /// Fire-and-forget submission, used right after a completion commit so
    /// the agent's request never waits on the transport.
    pub fn spawn_submit(&self, payment: Payment) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.submit(payment).await;
        });
    }

    /// Payment retry sweep: submit every payment whose retry time has come.
    /// Returns how many submissions ran.
    pub async fn process_due(&self) -> usize {
        let payments = match self.store.list_payments().await {
            Ok(payments) => payments,
            Err(err) => {
                warn!(%err, "payment sweep skipped");
                return 0;
            }
        };
        let now_ms = self.clock.now_ms();
        let due: Vec<Payment> = payments.into_iter().filter(|p| p.is_due(now_ms)).collect();
        let count = due.len();

        let mut tasks = JoinSet::new();
        for payment in due {
            let engine = self.clone();
            tasks.spawn(async move { engine.submit(payment).await });
        }
        while tasks.join_next().await.is_some() {}
        count
    }

    /// Submit one payment. The compare-and-set to SUBMITTED is the
    /// exactly-once gate: concurrent submitters race on it and exactly one
    /// proceeds to the transport.
    pub async fn submit(&self, payment: Payment) {
        let mut claim = payment.clone();
        claim.state = PaymentState::Submitted;
        claim.attempts = payment.attempts + 1;
        match self
            .store
            .update_payment_guarded(&claim, &[PaymentState::Pending, PaymentState::Failed])
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(payment_id = %payment.id, %err, "payment claim failed");
                return;
            }
        }
        let mut payment = claim;

        let permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let result = tokio::time::timeout(
            self.call_timeout,
            self.settlement.pay(
                &payment.from_wallet,
                &payment.to_wallet,
                payment.amount,
                payment.job_id,
            ),
        )
        .await;
        drop(permit);

        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => Err(SettlementError::Timeout),
        };

        match outcome {
            Ok(signature) => {
                payment.state = PaymentState::Confirmed;
                payment.signature = Some(signature);
                payment.confirmed_at = Some(Utc::now());
                payment.last_error = None;
                info!(
                    payment_id = %payment.id,
                    job_id = %payment.job_id,
                    amount = payment.amount,
                    "payment confirmed"
                );
                self.metrics.payments_confirmed.inc();
            }
            Err(err) => {
                payment.state = PaymentState::Failed;
                payment.last_error = Some(err.to_string());
                self.metrics.payments_failed.inc();
                if payment.attempts as usize > self.backoff.len() {
                    payment.parked = true;
                    self.metrics.payments_parked.inc();
                    error!(
                        payment_id = %payment.id,
                        job_id = %payment.job_id,
                        attempts = payment.attempts,
                        "payment retry schedule exhausted; parked for manual review"
                    );
                } else {
                    let delay = self.backoff[payment.attempts as usize - 1];
                    payment.next_attempt_at_ms =
                        self.clock.now_ms() + delay.as_millis() as u64;
                    warn!(
                        payment_id = %payment.id,
                        job_id = %payment.job_id,
                        attempts = payment.attempts,
                        retry_in_secs = delay.as_secs(),
                        "payment submission failed"
                    );
                }
            }
        }

        if let Err(err) = self
            .store
            .update_payment_guarded(&payment, &[PaymentState::Submitted])
            .await
        {
            warn!(payment_id = %payment.id, %err, "payment result write failed");
        }
    }
}
