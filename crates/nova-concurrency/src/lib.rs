//! In-process gate for dispatching runs: a global worker pool plus exclusive
//! (or capacity-bounded) access per target resource.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;

use nova_core::RunId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyPolicy {
    pub global_pool_size: usize,
    pub per_resource_concurrency: usize,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self { global_pool_size: 3, per_resource_concurrency: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceAcquire {
    Acquired,
    Busy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// Expected contention: reschedule the run later.
    #[error("resource {resource} is busy (run {run_id} not started)")]
    ResourceBusy { resource: String, run_id: RunId },
    #[error("global worker pool is closed")]
    Closed,
}

/// Observability snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStatus {
    pub global_limit: usize,
    pub global_available: usize,
    pub per_resource_limit: usize,
    pub active_per_resource: BTreeMap<String, usize>,
}

pub struct ConcurrencyManager {
    policy: ConcurrencyPolicy,
    global: Semaphore,
    // resource -> runs currently holding it; only try_acquire_resource/release touch this
    active: Mutex<HashMap<String, HashSet<RunId>>>,
}

impl ConcurrencyManager {
    pub fn new(policy: ConcurrencyPolicy) -> Self {
        Self {
            global: Semaphore::new(policy.global_pool_size),
            policy,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Non-blocking. A run that already holds the resource is reported busy.
    pub fn try_acquire_resource(&self, resource: &str, run_id: &RunId) -> ResourceAcquire {
        let mut active = self.active.lock().unwrap();
        let runs = active.entry(resource.to_string()).or_default();
        if runs.len() >= self.policy.per_resource_concurrency || runs.contains(run_id) {
            return ResourceAcquire::Busy;
        }
        runs.insert(run_id.clone());
        ResourceAcquire::Acquired
    }

    /// Idempotent: releasing a run that does not hold the resource does nothing.
    pub fn release(&self, resource: &str, run_id: &RunId) {
        let mut active = self.active.lock().unwrap();
        if let Some(runs) = active.get_mut(resource) {
            runs.remove(run_id);
        }
    }

    pub fn is_busy(&self, resource: &str) -> bool {
        let active = self.active.lock().unwrap();
        active
            .get(resource)
            .map(|runs| runs.len() >= self.policy.per_resource_concurrency)
            .unwrap_or(false)
    }

    /// Runs `work` once a global slot is free and the resource is not busy.
    ///
    /// Waiting for the global slot is the only suspension point. A busy resource
    /// gives the slot back immediately and `work` is dropped unstarted. Both gates
    /// are released when `work` finishes, panics, or this future is dropped.
    pub async fn run_under_limits<F, T>(&self, resource: &str, run_id: &RunId, work: F) -> Result<T, ConcurrencyError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.global.acquire().await.map_err(|_| ConcurrencyError::Closed)?;

        if self.try_acquire_resource(resource, run_id) == ResourceAcquire::Busy {
            tracing::debug!(resource, run_id = %run_id, "resource busy; not starting run");
            return Err(ConcurrencyError::ResourceBusy { resource: resource.to_string(), run_id: run_id.clone() });
        }
        // declared after the permit so it drops first: resource, then global slot
        let _guard = ResourceGuard { manager: self, resource, run_id };

        Ok(work.await)
    }

    pub fn status(&self) -> ConcurrencyStatus {
        let active = self.active.lock().unwrap();
        ConcurrencyStatus {
            global_limit: self.policy.global_pool_size,
            global_available: self.global.available_permits(),
            per_resource_limit: self.policy.per_resource_concurrency,
            active_per_resource: active.iter().map(|(r, runs)| (r.clone(), runs.len())).collect(),
        }
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(ConcurrencyPolicy::default())
    }
}

struct ResourceGuard<'a> {
    manager: &'a ConcurrencyManager,
    resource: &'a str,
    run_id: &'a RunId,
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.resource, self.run_id);
    }
}
