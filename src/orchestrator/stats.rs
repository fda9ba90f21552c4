use crate::worker::PoolStats;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    total_elapsed_us: AtomicU64,
    output_bytes: AtomicU64,
}

/// What one finished operation contributes to the counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationRecord {
    pub elapsed: Duration,
    pub success: bool,
    pub cache_hit: bool,
    pub output_bytes: Option<u64>,
}

#[derive(Debug, Default)]
pub struct OperationStats {
    by_operation: DashMap<&'static str, Counters>,
}

impl OperationStats {
    pub fn record(&self, operation: &'static str, record: OperationRecord) {
        let counters = self.by_operation.entry(operation).or_default();
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if !record.success {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        if record.cache_hit {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        counters.total_elapsed_us.fetch_add(
            u64::try_from(record.elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if let Some(bytes) = record.output_bytes {
            counters.output_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, OperationSnapshot> {
        self.by_operation
            .iter()
            .map(|entry| {
                let c = entry.value();
                let requests = c.requests.load(Ordering::Relaxed);
                let total_us = c.total_elapsed_us.load(Ordering::Relaxed);
                (
                    entry.key().to_string(),
                    OperationSnapshot {
                        requests,
                        failures: c.failures.load(Ordering::Relaxed),
                        cache_hits: c.cache_hits.load(Ordering::Relaxed),
                        total_elapsed_ms: total_us / 1000,
                        average_elapsed_ms: if requests == 0 {
                            0.0
                        } else {
                            total_us as f64 / requests as f64 / 1000.0
                        },
                        output_bytes: c.output_bytes.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub total_elapsed_ms: u64,
    pub average_elapsed_ms: f64,
    pub output_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub operations: BTreeMap<String, OperationSnapshot>,
    pub pool_generation: u64,
    pub pool_size: usize,
    pub pool_requests: u64,
    pub pool_respawns: u64,
    pub restarts: u64,
    pub active_sessions: usize,
    pub cache_backend: &'static str,
}

impl ServiceStats {
    pub(crate) fn new(
        operations: BTreeMap<String, OperationSnapshot>,
        pool: PoolStats,
        restarts: u64,
        active_sessions: usize,
        cache_backend: &'static str,
    ) -> Self {
        Self {
            operations,
            pool_generation: pool.generation,
            pool_size: pool.size,
            pool_requests: pool.requests,
            pool_respawns: pool.respawns,
            restarts,
            active_sessions,
            cache_backend,
        }
    }
}
