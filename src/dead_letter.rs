use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{QueueError, Result};
use crate::job::{FailedJob, Job, Payload};
use crate::registry::JobRegistry;

/// Durable, append-only record of permanently failed jobs. Mutated only by
/// `remove`/`clear` and the handler's prune.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(&self, record: FailedJob) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<FailedJob>>;

    /// Newest-first page of records.
    async fn get_all(&self, limit: usize, offset: usize) -> Result<Vec<FailedJob>>;

    async fn get_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<FailedJob>>;

    async fn get_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FailedJob>>;

    /// Returns whether a record with that id existed.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    async fn stats(&self) -> Result<Value>;
}

/// In-process dead letter store. Suits the memory and file drivers; the Redis
/// driver additionally mirrors failures into its `queue:Q:failed` list.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    records: RwLock<Vec<FailedJob>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn store(&self, record: FailedJob) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FailedJob>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn get_all(&self, limit: usize, offset: usize) -> Result<Vec<FailedJob>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<FailedJob>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.job_type == job_type)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FailedJob>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.failed_at >= start && r.failed_at <= end)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() < before)
    }

    async fn clear(&self) -> Result<()> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn stats(&self) -> Result<Value> {
        let records = self.records.read().await;
        let mut by_type: HashMap<&str, u64> = HashMap::new();
        for record in records.iter() {
            *by_type.entry(record.job_type.as_str()).or_default() += 1;
        }
        Ok(json!({
            "count": records.len(),
            "byType": by_type,
            "oldest": records.iter().map(|r| r.failed_at).min(),
            "newest": records.iter().map(|r| r.failed_at).max(),
        }))
    }
}

/// Higher-level wrapper around a [`DeadLetterStore`] that records failures
/// and re-hydrates stored jobs for replay.
///
/// `retry` only returns the rebuilt job; dispatching it again is the caller's
/// business, which keeps the handler decoupled from any particular driver.
#[derive(Clone)]
pub struct FailedJobHandler {
    store: Arc<dyn DeadLetterStore>,
    registry: Arc<JobRegistry>,
}

impl FailedJobHandler {
    pub fn new(store: Arc<dyn DeadLetterStore>, registry: Arc<JobRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Build and persist a [`FailedJob`] from the raw failure data.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_failure(
        &self,
        id: &str,
        job_type: &str,
        payload: Payload,
        error: &str,
        stack_trace: Option<String>,
        attempts: u32,
        metadata: Payload,
    ) -> Result<()> {
        warn!(
            job_id = id,
            job_type = job_type,
            attempts = attempts,
            error = error,
            "Job moved to dead letter store"
        );
        self.store
            .store(FailedJob {
                id: id.to_string(),
                job_type: job_type.to_string(),
                payload,
                error: error.to_string(),
                stack_trace,
                failed_at: Utc::now(),
                attempts,
                metadata,
            })
            .await
    }

    /// Re-hydrate a dead-lettered job and remove its record. The caller is
    /// expected to push the returned job back onto a driver.
    pub async fn retry(&self, id: &str) -> Result<Arc<dyn Job>> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        let job = self.registry.create(&record.job_type, record.payload)?;
        self.store.remove(id).await?;
        info!(job_id = id, job_type = %record.job_type, "Dead-lettered job re-hydrated for retry");
        Ok(job)
    }

    /// Re-hydrate every stored failure of one type, removing the records that
    /// could be rebuilt. Records whose type is no longer registered are kept.
    pub async fn retry_by_type(&self, job_type: &str) -> Result<Vec<Arc<dyn Job>>> {
        let records = self.store.get_by_type(job_type, usize::MAX).await?;
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            match self.registry.create(&record.job_type, record.payload.clone()) {
                Ok(job) => {
                    self.store.remove(&record.id).await?;
                    jobs.push(job);
                }
                Err(e) => {
                    warn!(job_id = %record.id, error = %e, "Skipping non-rehydratable record");
                }
            }
        }
        Ok(jobs)
    }

    /// Bulk delete by age. `older_than = None` deletes everything. Returns
    /// the number of removed records.
    pub async fn prune(&self, older_than: Option<Duration>) -> Result<usize> {
        let before = self.store.count().await?;
        match older_than {
            None => self.store.clear().await?,
            Some(age) => {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
                let stale = self
                    .store
                    .get_by_date_range(DateTime::<Utc>::MIN_UTC, cutoff)
                    .await?;
                for record in stale {
                    self.store.remove(&record.id).await?;
                }
            }
        }
        let after = self.store.count().await?;
        Ok(before.saturating_sub(after))
    }

    pub async fn report(&self) -> Result<Value> {
        let stats = self.store.stats().await?;
        Ok(json!({
            "deadLetters": stats,
            "generatedAt": Utc::now(),
        }))
    }

    /// Serialize the newest `limit` records (all of them by default).
    pub async fn export_to_json(&self, limit: Option<usize>) -> Result<String> {
        let records = self
            .store
            .get_all(limit.unwrap_or(usize::MAX), 0)
            .await?;
        Ok(serde_json::to_string_pretty(&records)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, job_type: &str, age_secs: i64) -> FailedJob {
        FailedJob {
            id: id.to_string(),
            job_type: job_type.to_string(),
            payload: Payload::new(),
            error: "boom".into(),
            stack_trace: Some("trace".into()),
            failed_at: Utc::now() - chrono::Duration::seconds(age_secs),
            attempts: 3,
            metadata: Payload::new(),
        }
    }

    #[tokio::test]
    async fn store_get_remove_cycle() {
        let store = MemoryDeadLetterStore::new();
        store.store(record("a", "email", 0)).await.unwrap();
        store.store(record("b", "email", 0)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pagination_is_newest_first() {
        let store = MemoryDeadLetterStore::new();
        for i in 0..5 {
            store.store(record(&format!("r{}", i), "email", 0)).await.unwrap();
        }
        let page = store.get_all(2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "r3");
        assert_eq!(page[1].id, "r2");
    }

    #[tokio::test]
    async fn filter_by_type_and_date() {
        let store = MemoryDeadLetterStore::new();
        store.store(record("a", "email", 3600)).await.unwrap();
        store.store(record("b", "report", 0)).await.unwrap();

        let emails = store.get_by_type("email", 10).await.unwrap();
        assert_eq!(emails.len(), 1);

        let recent = store
            .get_by_date_range(Utc::now() - chrono::Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "b");
    }

    #[tokio::test]
    async fn prune_by_age_and_fully() {
        let registry = Arc::new(JobRegistry::new());
        let store: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::new());
        let handler = FailedJobHandler::new(Arc::clone(&store), registry);

        store.store(record("old", "email", 7200)).await.unwrap();
        store.store(record("new", "email", 0)).await.unwrap();

        let removed = handler
            .prune(Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("new").await.unwrap().is_some());

        let removed = handler.prune(None).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_fails_without_registration() {
        let registry = Arc::new(JobRegistry::new());
        let store: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::new());
        let handler = FailedJobHandler::new(Arc::clone(&store), registry);

        store.store(record("a", "email", 0)).await.unwrap();
        assert!(matches!(
            handler.retry("a").await,
            Err(QueueError::UnregisteredJobType(_))
        ));
        // record stays put when re-hydration fails
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(matches!(
            handler.retry("missing").await,
            Err(QueueError::JobNotFound(_))
        ));
    }
}
