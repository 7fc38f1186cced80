//! Refresh Scheduler
//!
//! Book-keeping for auto-refresh tasks. Each key has at most one pending
//! refresh; registering a new one, deleting the key or clearing the cache
//! cancels the old one. The coordinator spawns the actual task and consults
//! the scheduler before writing the refreshed value back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::REFRESH_FRACTION;

struct Pending {
    id: u64,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl Pending {
    /// Cancel, then wait out a write already in flight
    async fn settle(self) {
        self.token.cancel();
        let _settled = self.gate.lock().await;
    }
}

/// Handle held by a spawned refresh task
#[derive(Debug, Clone)]
pub struct RefreshTicket {
    key: String,
    id: u64,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl RefreshTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the ticket is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Exclusive right to write a refreshed value, released by
/// [`RefreshScheduler::finish`]
#[derive(Debug)]
pub struct RefreshClaim {
    _gate: OwnedMutexGuard<()>,
}

/// Pending refresh registry
///
/// Cancelling a registration waits until any write it already claimed has
/// landed, so a caller that cancels and then deletes always has the last word.
#[derive(Default)]
pub struct RefreshScheduler {
    pending: DashMap<String, Pending>,
    next_id: AtomicU64,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a refresh for `key`, cancelling any earlier one
    pub async fn register(&self, key: &str) -> RefreshTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let previous = self.pending.insert(
            key.to_string(),
            Pending {
                id,
                token: token.clone(),
                gate: gate.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.settle().await;
        }
        RefreshTicket {
            key: key.to_string(),
            id,
            token,
            gate,
        }
    }

    /// Cancel the pending refresh for `key`, if any
    pub async fn cancel(&self, key: &str) -> bool {
        // bind first so the map shard is unlocked before awaiting
        let removed = self.pending.remove(key);
        match removed {
            Some((_, pending)) => {
                pending.settle().await;
                true
            }
            None => false,
        }
    }

    /// Cancel every pending refresh
    pub async fn cancel_all(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for key in keys {
            if self.cancel(&key).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel every pending refresh without waiting for in-flight writes
    pub fn abort_all(&self) {
        for entry in self.pending.iter() {
            entry.token.cancel();
        }
    }

    /// Claim the right to write the refreshed value.
    ///
    /// Succeeds only if the ticket is still the registered one for its key
    /// and was not cancelled. The registration stays in place until
    /// [`finish`](Self::finish), so a delete arriving mid-write waits for it.
    pub async fn claim(&self, ticket: &RefreshTicket) -> Option<RefreshClaim> {
        let gate = ticket.gate.clone().lock_owned().await;
        let current = self
            .pending
            .get(&ticket.key)
            .is_some_and(|pending| pending.id == ticket.id);
        if current && !ticket.is_cancelled() {
            Some(RefreshClaim { _gate: gate })
        } else {
            self.release(ticket);
            None
        }
    }

    /// Drop the registration and release the claim
    pub fn finish(&self, ticket: &RefreshTicket, claim: RefreshClaim) {
        self.release(ticket);
        drop(claim);
    }

    fn release(&self, ticket: &RefreshTicket) {
        self.pending
            .remove_if(&ticket.key, |_, pending| pending.id == ticket.id);
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// When a refresh for an entry with `ttl` should fire
pub fn refresh_delay(ttl: Duration) -> Duration {
    ttl.mul_f64(REFRESH_FRACTION)
}
