//! Task Orchestrator: bounded-concurrency worker pool for query-tool
//! dispatch, with result caching and health metrics.
//!
//! Mutating `execute_macro` calls never go through here — they are
//! serialized through the dispatcher directly (see CONCURRENCY & RESOURCE
//! MODEL). Only independent query calls (`IsQueryTool`) are worth
//! parallelizing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{Error, Result};

struct CachedResult {
    value: Value,
    inserted_at: Instant,
}

#[derive(Default)]
struct TaskMetrics {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
    total_duration_ms: AtomicU64,
}

/// A point-in-time snapshot of orchestrator health metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub active_workers: usize,
    pub avg_duration_ms: u64,
    pub success_rate: f64,
}

/// Result of [`TaskOrchestrator::health_check`].
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(Vec<String>),
}

/// Bounded-concurrency pool for dispatching independent query-tool calls,
/// with a TTL cache keyed by caller-supplied cache key (typically
/// `tool_name:args_hash`).
pub struct TaskOrchestrator {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedResult>>,
    metrics: Arc<TaskMetrics>,
}

impl TaskOrchestrator {
    pub fn new(max_concurrency: usize, cache_ttl_secs: u64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            cache: Mutex::new(HashMap::new()),
            metrics: Arc::new(TaskMetrics::default()),
        }
    }

    fn cached(&self, cache_key: &str) -> Option<Value> {
        let cache = self.cache.lock().unwrap();
        cache.get(cache_key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    /// Run a query task under the concurrency cap, serving a cached result
    /// if one is fresh. Panics inside `task` are caught via the spawned
    /// task's `JoinError` and surfaced as a failed task — the pool itself
    /// keeps running (no worker is ever lost to a panicking task).
    pub async fn run_query<F>(&self, cache_key: &str, task: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        if let Some(value) = self.cached(cache_key) {
            return Ok(value);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::other("task orchestrator semaphore closed"))?;

        self.metrics.active.fetch_add(1, Ordering::SeqCst);
        self.metrics.total.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        let outcome = tokio::spawn(task).await;

        drop(permit);
        self.metrics.active.fetch_sub(1, Ordering::SeqCst);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.metrics.total_duration_ms.fetch_add(elapsed_ms, Ordering::SeqCst);

        match outcome {
            Ok(Ok(value)) => {
                self.metrics.success.fetch_add(1, Ordering::SeqCst);
                self.cache.lock().unwrap().insert(
                    cache_key.to_string(),
                    CachedResult { value: value.clone(), inserted_at: Instant::now() },
                );
                Ok(value)
            }
            Ok(Err(e)) => {
                self.metrics.failed.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
            Err(join_err) => {
                self.metrics.failed.fetch_add(1, Ordering::SeqCst);
                warn!(error = %join_err, "query task panicked, pool continues");
                Err(Error::other(format!("query task panicked: {join_err}")))
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let total = self.metrics.total.load(Ordering::SeqCst);
        let success = self.metrics.success.load(Ordering::SeqCst);
        let failed = self.metrics.failed.load(Ordering::SeqCst);
        let total_duration_ms = self.metrics.total_duration_ms.load(Ordering::SeqCst);

        MetricsSnapshot {
            total,
            success,
            failed,
            active_workers: self.metrics.active.load(Ordering::SeqCst),
            avg_duration_ms: if total == 0 { 0 } else { total_duration_ms / total },
            success_rate: if total == 0 { 1.0 } else { success as f64 / total as f64 },
        }
    }

    /// Unhealthy if: (1) the success rate has dropped below 50% over at
    /// least 10 completed tasks, (2) every worker slot is saturated, or (3)
    /// average task duration exceeds 30s.
    pub fn health_check(&self) -> HealthStatus {
        let m = self.metrics();
        let mut reasons = Vec::new();

        if m.total >= 10 && m.success_rate < 0.5 {
            reasons.push(format!("success rate {:.0}% below threshold", m.success_rate * 100.0));
        }
        if m.active_workers >= self.max_concurrency {
            reasons.push("worker pool saturated".to_string());
        }
        if m.avg_duration_ms > 30_000 {
            reasons.push(format!("average task duration {}ms exceeds 30s", m.avg_duration_ms));
        }

        if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy(reasons)
        }
    }
}
