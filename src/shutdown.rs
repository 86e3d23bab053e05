// SPDX-License-Identifier: MIT
//! Graceful shutdown coordination (SPEC_FULL.md "Graceful shutdown
//! sequencing"). spec.md §5 requires every worker to stop within 5s of a
//! global cancel; this gives `main`-equivalent code something to await
//! instead of firing the cancellation and hoping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    remaining: Arc<AtomicUsize>,
    all_done: Arc<Notify>,
}

/// RAII guard held by one worker task; dropping it (including on panic)
/// decrements the outstanding-worker count and notifies once it hits zero.
pub struct WorkerGuard {
    remaining: Arc<AtomicUsize>,
    all_done: Arc<Notify>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.all_done.notify_waiters();
        }
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            remaining: Arc::new(AtomicUsize::new(0)),
            all_done: Arc::new(Notify::new()),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a worker before spawning it, getting back a guard whose drop
    /// marks that worker as finished.
    pub fn register_worker(&self) -> WorkerGuard {
        self.remaining.fetch_add(1, Ordering::AcqRel);
        WorkerGuard { remaining: self.remaining.clone(), all_done: self.all_done.clone() }
    }

    /// Signal cancellation to every holder of the token.
    pub fn begin_shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for all registered workers to drop their guard, up to `timeout`.
    /// Returns `false` if the timeout elapsed with workers still outstanding.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        if self.remaining.load(Ordering::Acquire) == 0 {
            return true;
        }
        let notified = self.all_done.notified();
        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    outstanding = self.remaining.load(Ordering::Acquire),
                    "shutdown timed out with workers still running"
                );
                false
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_completes_once_all_guards_drop() {
        let shutdown = Shutdown::new();
        let guard1 = shutdown.register_worker();
        let guard2 = shutdown.register_worker();

        shutdown.begin_shutdown();
        assert!(shutdown.is_cancelled());

        let shutdown_clone = shutdown.clone();
        let wait_handle = tokio::spawn(async move { shutdown_clone.wait_for_drain(Duration::from_secs(5)).await });

        drop(guard1);
        drop(guard2);

        assert!(wait_handle.await.unwrap());
    }

    #[tokio::test]
    async fn drain_times_out_if_worker_never_finishes() {
        let shutdown = Shutdown::new();
        let _guard = shutdown.register_worker();
        let completed = shutdown.wait_for_drain(Duration::from_millis(50)).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn drain_is_immediate_with_no_workers() {
        let shutdown = Shutdown::new();
        assert!(shutdown.wait_for_drain(Duration::from_millis(10)).await);
    }
}
