//! Bounded concurrency for worker invocations.
//!
//! A global semaphore caps invocations in flight; each breaker-guarded
//! external resource gets its own, smaller semaphore. Per-resource permits
//! are always taken in sorted order so two invocations needing the same pair
//! of resources cannot deadlock, and the global permit is taken last so an
//! invocation waiting on a saturated resource never occupies a global slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Concurrency ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Invocations allowed in flight across the engine.
    /// Default: 3
    pub max_concurrency: usize,
    /// Invocations allowed in flight against one external resource.
    /// Default: 2
    pub per_resource_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            per_resource_limit: 2,
        }
    }
}

impl LimitsConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_per_resource_limit(mut self, limit: usize) -> Self {
        self.per_resource_limit = limit;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("concurrency limiter has been closed")]
    Closed,
}

/// Lease held by one in-flight invocation. Dropping it releases every permit.
#[derive(Debug)]
pub struct ConcurrencySlot {
    resources: Vec<String>,
    _resource_permits: Vec<OwnedSemaphorePermit>,
    _global: OwnedSemaphorePermit,
}

impl ConcurrencySlot {
    /// External resources this slot holds a permit for, sorted.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }
}

/// Global plus per-resource concurrency ceilings.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    config: LimitsConfig,
    global: Arc<Semaphore>,
    per_resource: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            global,
            per_resource: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    /// Wait for a slot on every listed external resource, then a global slot.
    pub async fn acquire(&self, external_resources: &[String]) -> Result<ConcurrencySlot, LimiterError> {
        let ordered: BTreeSet<&String> = external_resources.iter().collect();
        let mut resources = Vec::with_capacity(ordered.len());
        let mut resource_permits = Vec::with_capacity(ordered.len());
        for resource in ordered {
            let permit = self
                .semaphore_for(resource)
                .acquire_owned()
                .await
                .map_err(|_| LimiterError::Closed)?;
            resources.push(resource.clone());
            resource_permits.push(permit);
        }
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;

        debug!(
            resources = ?resources,
            available = self.global.available_permits(),
            "Acquired concurrency slot"
        );
        Ok(ConcurrencySlot {
            resources,
            _resource_permits: resource_permits,
            _global: global,
        })
    }

    /// Free global slots right now.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Free slots on one external resource right now.
    pub fn available_for(&self, resource: &str) -> usize {
        self.semaphore_for(resource).available_permits()
    }

    /// Refuse all queued and future acquisitions.
    pub fn close(&self) {
        self.global.close();
        let per_resource = self
            .per_resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for semaphore in per_resource.values() {
            semaphore.close();
        }
    }

    fn semaphore_for(&self, resource: &str) -> Arc<Semaphore> {
        let mut per_resource = self
            .per_resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        per_resource
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_resource_limit.max(1))))
            .clone()
    }
}
