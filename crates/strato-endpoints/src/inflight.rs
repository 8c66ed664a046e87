//! Per-model in-flight request counters
//!
//! Process-local counters read by the autoscaler each tick and exported on
//! `/metrics` for peer aggregation. Counters live for the lifetime of the
//! process; the admission path balances every `enter` with exactly one
//! `leave` on all exit paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Per-model in-flight request index
#[derive(Default)]
pub struct InFlightIndex {
    counts: DashMap<String, Arc<AtomicI64>>,
}

impl InFlightIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, model: &str) -> Arc<AtomicI64> {
        self.counts
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    /// Record a request entering the admission path for `model`
    pub fn enter(&self, model: &str) {
        self.counter(model).fetch_add(1, Ordering::SeqCst);
    }

    /// Record a request leaving the admission path for `model`
    pub fn leave(&self, model: &str) {
        self.counter(model).fetch_sub(1, Ordering::SeqCst);
    }

    /// Current in-flight count for `model`
    pub fn total(&self, model: &str) -> i64 {
        self.counts
            .get(model)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Consistent snapshot of all per-model counts
    pub fn all(&self) -> BTreeMap<String, i64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::SeqCst)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_leave_balance_to_zero() {
        let index = InFlightIndex::new();
        index.enter("llama");
        index.enter("llama");
        assert_eq!(index.total("llama"), 2);
        index.leave("llama");
        index.leave("llama");
        assert_eq!(index.total("llama"), 0);
    }

    #[test]
    fn unknown_model_reads_zero() {
        let index = InFlightIndex::new();
        assert_eq!(index.total("nope"), 0);
    }

    #[test]
    fn snapshot_covers_all_models() {
        let index = InFlightIndex::new();
        index.enter("a");
        index.enter("b");
        index.enter("b");
        let all = index.all();
        assert_eq!(all["a"], 1);
        assert_eq!(all["b"], 2);
    }

    #[tokio::test]
    async fn concurrent_enters_are_linearisable() {
        let index = Arc::new(InFlightIndex::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    index.enter("m");
                    index.leave("m");
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(index.total("m"), 0);
    }
}
