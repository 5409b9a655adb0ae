//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::pipeline::DegradeReason;

#[derive(Debug, Default)]
pub struct PipelineStats {
    queries: AtomicU64,
    empty_results: AtomicU64,
    degraded_provider_unavailable: AtomicU64,
    degraded_overloaded: AtomicU64,
    degraded_budget_exhausted: AtomicU64,
    degraded_timeout: AtomicU64,
    degraded_invalid_query: AtomicU64,
    degraded_internal: AtomicU64,
    chunks_indexed: AtomicU64,
    chunks_skipped: AtomicU64,
    chunks_deferred: AtomicU64,
    chunks_dropped: AtomicU64,
    store_failures: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub queries: u64,
    pub empty_results: u64,
    pub degraded_provider_unavailable: u64,
    pub degraded_overloaded: u64,
    pub degraded_budget_exhausted: u64,
    pub degraded_timeout: u64,
    pub degraded_invalid_query: u64,
    pub degraded_internal: u64,
    pub chunks_indexed: u64,
    pub chunks_skipped: u64,
    pub chunks_deferred: u64,
    pub chunks_dropped: u64,
    /// Chunks embedded but not written to the index
    pub store_failures: u64,
}

impl PipelineStatsSnapshot {
    pub fn degraded_total(&self) -> u64 {
        self.degraded_provider_unavailable
            + self.degraded_overloaded
            + self.degraded_budget_exhausted
            + self.degraded_timeout
            + self.degraded_invalid_query
            + self.degraded_internal
    }
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl PipelineStats {
    pub(crate) fn record_query(&self) {
        add(&self.queries, 1);
    }

    pub(crate) fn record_empty(&self) {
        add(&self.empty_results, 1);
    }

    pub(crate) fn record_degraded(&self, reason: DegradeReason) {
        let counter = match reason {
            DegradeReason::ProviderUnavailable => &self.degraded_provider_unavailable,
            DegradeReason::Overloaded => &self.degraded_overloaded,
            DegradeReason::BudgetExhausted => &self.degraded_budget_exhausted,
            DegradeReason::Timeout => &self.degraded_timeout,
            DegradeReason::InvalidQuery => &self.degraded_invalid_query,
            DegradeReason::Internal => &self.degraded_internal,
        };
        add(counter, 1);
    }

    pub(crate) fn record_indexing(&self, indexed: usize, skipped: usize, deferred: usize, dropped: usize) {
        add(&self.chunks_indexed, indexed);
        add(&self.chunks_skipped, skipped);
        add(&self.chunks_deferred, deferred);
        add(&self.chunks_dropped, dropped);
    }

    pub(crate) fn record_store_failures(&self, n: usize) {
        add(&self.store_failures, n);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            queries: load(&self.queries),
            empty_results: load(&self.empty_results),
            degraded_provider_unavailable: load(&self.degraded_provider_unavailable),
            degraded_overloaded: load(&self.degraded_overloaded),
            degraded_budget_exhausted: load(&self.degraded_budget_exhausted),
            degraded_timeout: load(&self.degraded_timeout),
            degraded_invalid_query: load(&self.degraded_invalid_query),
            degraded_internal: load(&self.degraded_internal),
            chunks_indexed: load(&self.chunks_indexed),
            chunks_skipped: load(&self.chunks_skipped),
            chunks_deferred: load(&self.chunks_deferred),
            chunks_dropped: load(&self.chunks_dropped),
            store_failures: load(&self.store_failures),
        }
    }
}
