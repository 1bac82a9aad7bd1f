use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{QueueError, Result};
use crate::job::{Job, Payload};

/// Factory turning a persisted payload back into an executable job.
pub type JobFactory = Arc<dyn Fn(Payload) -> Result<Arc<dyn Job>> + Send + Sync>;

/// Mapping from stable job type identifiers to deserialization factories.
///
/// Construct one registry and inject it into every driver that persists jobs
/// (file, Redis). The in-memory and synchronous drivers never discard the job
/// object, so they do not need one.
pub struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory for a job type. Registering the same type twice is
    /// an error rather than a silent overwrite.
    pub fn register<F>(&self, job_type: &str, factory: F) -> Result<()>
    where
        F: Fn(Payload) -> Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(job_type) {
            return Err(QueueError::DuplicateJobType(job_type.to_string()));
        }
        factories.insert(job_type.to_string(), Arc::new(factory));
        tracing::debug!(job_type = job_type, "Registered job factory");
        Ok(())
    }

    /// Re-hydrate a job from its type identifier and payload.
    pub fn create(&self, job_type: &str, payload: Payload) -> Result<Arc<dyn Job>> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories
                .get(job_type)
                .cloned()
                .ok_or_else(|| QueueError::UnregisteredJobType(job_type.to_string()))?
        };
        factory(payload)
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.keys().cloned().collect()
    }
}
