// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Monotonic clock seam. Every heartbeat, timeout and rebalance decision reads
// time through this trait so the maintenance loop can be driven with a
// virtual clock in tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time elapsed since the clock's epoch. Millisecond resolution
    /// is guaranteed; wall-clock time never feeds scheduling decisions.
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);

    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// Production clock backed by the OS monotonic clock.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock. Time only moves when `advance` is called; sleepers wake as
/// soon as the clock passes their deadline.
pub struct VirtualClock {
    now_ms: AtomicU64,
    waker: Notify,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            waker: Notify::new(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        self.waker.notify_waiters();
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now_ms.load(Ordering::SeqCst) + duration.as_millis() as u64;
        loop {
            let notified = self.waker.notified();
            if self.now_ms.load(Ordering::SeqCst) >= deadline {
                return;
            }
            notified.await;
        }
    }
}
