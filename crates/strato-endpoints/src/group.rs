//! Endpoint group — the live address set for a single model
//!
//! Waiters suspend (not spin) while the set is empty and are woken by a
//! broadcast when addresses arrive or the model is removed. Selection is
//! least-loaded with lexicographic tie-break; the per-replica counter is
//! owned here and released through the returned [`EndpointRef`] guard, so
//! callers never touch the counter directly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::Notify;

/// Errors returned while waiting for an endpoint
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The model was deleted while requests were waiting for a replica
    #[error("model removed while waiting for endpoints")]
    ModelRemoved,
}

/// A claimed endpoint address
///
/// Holds the per-replica in-flight count that was incremented at selection
/// time; dropping the ref decrements it again. This is the defer-like
/// guarantee: the count is released on success, error, cancel, and timeout
/// paths alike.
pub struct EndpointRef {
    addr: String,
    counter: Arc<AtomicI64>,
}

impl EndpointRef {
    /// The claimed `host:port` address
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for EndpointRef {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct GroupState {
    endpoints: BTreeMap<String, Arc<AtomicI64>>,
    removed: bool,
}

/// Live address set for one model
#[derive(Default)]
pub struct EndpointGroup {
    state: RwLock<GroupState>,
    ready: Notify,
}

impl EndpointGroup {
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the address set
    ///
    /// Counters for surviving addresses are preserved so least-loaded
    /// selection stays meaningful across rollouts; counters for removed
    /// addresses are dropped. Waiters are broadcast when the set transitions
    /// from empty to non-empty.
    pub fn set_addrs(&self, addrs: &BTreeSet<String>) {
        let became_ready = {
            let mut state = self.state.write().expect("endpoint group lock poisoned");
            let was_empty = state.endpoints.is_empty();
            let mut next = BTreeMap::new();
            for addr in addrs {
                let counter = state
                    .endpoints
                    .remove(addr)
                    .unwrap_or_else(|| Arc::new(AtomicI64::new(0)));
                next.insert(addr.clone(), counter);
            }
            state.endpoints = next;
            was_empty && !state.endpoints.is_empty()
        };

        if became_ready {
            self.ready.notify_waiters();
        }
    }

    /// Snapshot of the current address set
    pub fn get_all_addrs(&self) -> Vec<String> {
        self.state
            .read()
            .expect("endpoint group lock poisoned")
            .endpoints
            .keys()
            .cloned()
            .collect()
    }

    /// Current per-replica in-flight count for an address
    pub fn in_flight(&self, addr: &str) -> i64 {
        self.state
            .read()
            .expect("endpoint group lock poisoned")
            .endpoints
            .get(addr)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Mark the model as removed and wake all waiters with an error
    pub fn remove(&self) {
        {
            let mut state = self.state.write().expect("endpoint group lock poisoned");
            state.removed = true;
            state.endpoints.clear();
        }
        self.ready.notify_waiters();
    }

    /// Claim the least-loaded address, suspending while the set is empty
    ///
    /// Ties break on lexicographic address order. Cancellation is the
    /// caller's concern: wrap in `tokio::time::timeout` or drop the future.
    pub async fn get_best_addr(&self) -> Result<EndpointRef, ResolveError> {
        loop {
            // Register interest before checking so a broadcast between the
            // check and the await is not lost.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.read().expect("endpoint group lock poisoned");
                if state.removed {
                    return Err(ResolveError::ModelRemoved);
                }
                if let Some((addr, counter)) = least_loaded(&state.endpoints) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    return Ok(EndpointRef {
                        addr,
                        counter: Arc::clone(counter),
                    });
                }
            }

            notified.await;
        }
    }
}

/// Smallest in-flight count wins; ties go to the lexicographically first
/// address (BTreeMap iteration order).
fn least_loaded(
    endpoints: &BTreeMap<String, Arc<AtomicI64>>,
) -> Option<(String, &Arc<AtomicI64>)> {
    let mut best: Option<(&String, &Arc<AtomicI64>, i64)> = None;
    for (addr, counter) in endpoints {
        let count = counter.load(Ordering::SeqCst);
        match best {
            Some((_, _, best_count)) if count >= best_count => {}
            _ => best = Some((addr, counter, count)),
        }
    }
    best.map(|(addr, counter, _)| (addr.clone(), counter))
}
