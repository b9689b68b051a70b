//! In-memory reference implementation of the persistence contract.
//!
//! Single-process only, but it enforces the exact revision discipline a
//! production backend must: every update/delete is checked against the
//! stored revision, and one [`FlushBatch`] applies all-or-nothing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entity::{EventKind, EventSubscription, Execution, Job, PayloadHandle};
use crate::error::StoreError;
use crate::store::{EntityKind, EntityRecord, FlushBatch, ProcessStore};

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, Execution>,
    jobs: HashMap<Uuid, Job>,
    subscriptions: HashMap<Uuid, EventSubscription>,
    payloads: HashMap<PayloadHandle, Vec<u8>>,
}

impl Inner {
    fn stored_revision(&self, kind: EntityKind, id: Uuid) -> Option<i32> {
        match kind {
            EntityKind::Execution => self.executions.get(&id).map(|e| e.revision),
            EntityKind::Job => self.jobs.get(&id).map(|j| j.revision),
            EntityKind::EventSubscription => self.subscriptions.get(&id).map(|s| s.revision),
        }
    }

    fn put(&mut self, record: EntityRecord) {
        match record {
            EntityRecord::Execution(e) => {
                self.executions.insert(e.id, e);
            }
            EntityRecord::Job(j) => {
                self.jobs.insert(j.id, j);
            }
            EntityRecord::Subscription(s) => {
                self.subscriptions.insert(s.id, s);
            }
        }
    }

    fn remove(&mut self, kind: EntityKind, id: Uuid) {
        match kind {
            EntityKind::Execution => {
                self.executions.remove(&id);
            }
            EntityKind::Job => {
                self.jobs.remove(&id);
            }
            EntityKind::EventSubscription => {
                self.subscriptions.remove(&id);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entity count, handy for "nothing left behind" assertions.
    pub async fn entity_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.executions.len() + inner.jobs.len() + inner.subscriptions.len()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.inner.read().await.executions.get(&id).cloned())
    }

    async fn executions_by_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Execution>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn jobs_by_instance(&self, process_instance_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect();
        found.sort_by_key(|j| j.id);
        Ok(found)
    }

    async fn jobs_by_definition(&self, definition_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.definition_id == definition_id)
            .cloned()
            .collect();
        found.sort_by_key(|j| j.id);
        Ok(found)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut due: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.due_date, j.id));
        due.truncate(max);
        Ok(due)
    }

    async fn instances_with_locked_exclusive_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.exclusive && j.is_locked(now))
            .filter_map(|j| j.process_instance_id)
            .collect())
    }

    async fn find_subscription(&self, id: Uuid) -> Result<Option<EventSubscription>, StoreError> {
        Ok(self.inner.read().await.subscriptions.get(&id).cloned())
    }

    async fn subscriptions_by_event(
        &self,
        kind: EventKind,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<EventSubscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.kind == kind && s.event_name == event_name)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn subscriptions_by_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<EventSubscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn subscriptions_by_definition(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<EventSubscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.definition_id == definition_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn put_payload(&self, bytes: Vec<u8>) -> Result<PayloadHandle, StoreError> {
        let handle = PayloadHandle::for_bytes(&bytes);
        self.inner
            .write()
            .await
            .payloads
            .entry(handle.clone())
            .or_insert(bytes);
        Ok(handle)
    }

    async fn get_payload(&self, handle: &PayloadHandle) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().await.payloads.get(handle).cloned())
    }

    async fn apply(&self, batch: FlushBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        // Validate everything before touching anything.
        for record in &batch.inserts {
            if inner.stored_revision(record.kind(), record.id()).is_some() {
                return Err(StoreError::DuplicateId {
                    kind: record.kind(),
                    id: record.id(),
                });
            }
        }
        for update in &batch.updates {
            let kind = update.entity.kind();
            let id = update.entity.id();
            match inner.stored_revision(kind, id) {
                None => return Err(StoreError::NotFound { kind, id }),
                Some(actual) if actual != update.expected_revision => {
                    return Err(StoreError::Conflict {
                        kind,
                        id,
                        expected: update.expected_revision,
                        actual,
                    });
                }
                Some(_) => {}
            }
        }
        for delete in &batch.deletes {
            match inner.stored_revision(delete.kind, delete.id) {
                None => {
                    return Err(StoreError::NotFound {
                        kind: delete.kind,
                        id: delete.id,
                    });
                }
                Some(actual) if actual != delete.expected_revision => {
                    return Err(StoreError::Conflict {
                        kind: delete.kind,
                        id: delete.id,
                        expected: delete.expected_revision,
                        actual,
                    });
                }
                Some(_) => {}
            }
        }

        for record in batch.inserts {
            inner.put(record);
        }
        for update in batch.updates {
            inner.put(update.entity);
        }
        for delete in batch.deletes {
            inner.remove(delete.kind, delete.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeleteRecord, UpdateRecord};

    fn execution() -> Execution {
        Execution::new_root(Uuid::now_v7(), None)
    }

    fn batch_insert(exec: &Execution) -> FlushBatch {
        FlushBatch {
            inserts: vec![EntityRecord::Execution(exec.clone())],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_increments_revision_by_one() {
        let store = MemoryStore::new();
        let exec = execution();
        store.apply(batch_insert(&exec)).await.unwrap();

        let mut updated = exec.clone();
        updated.is_active = false;
        updated.revision = 2;
        store
            .apply(FlushBatch {
                updates: vec![UpdateRecord {
                    entity: EntityRecord::Execution(updated),
                    expected_revision: 1,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        let stored = store.find_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn stale_update_is_rejected_and_nothing_applies() {
        let store = MemoryStore::new();
        let exec = execution();
        store.apply(batch_insert(&exec)).await.unwrap();

        let other = execution();
        let mut stale = exec.clone();
        stale.revision = 2;
        let err = store
            .apply(FlushBatch {
                inserts: vec![EntityRecord::Execution(other.clone())],
                updates: vec![UpdateRecord {
                    entity: EntityRecord::Execution(stale),
                    expected_revision: 7,
                }],
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict { expected: 7, actual: 1, .. }));
        // The batch was all-or-nothing: the insert did not land either.
        assert!(store.find_execution(other.id).await.unwrap().is_none());
        let stored = store.find_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn delete_with_stale_revision_is_rejected() {
        let store = MemoryStore::new();
        let exec = execution();
        store.apply(batch_insert(&exec)).await.unwrap();

        let err = store
            .apply(FlushBatch {
                deletes: vec![DeleteRecord {
                    kind: EntityKind::Execution,
                    id: exec.id,
                    expected_revision: 3,
                }],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        store
            .apply(FlushBatch {
                deletes: vec![DeleteRecord {
                    kind: EntityKind::Execution,
                    id: exec.id,
                    expected_revision: 1,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.find_execution(exec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn payloads_are_content_addressed_and_idempotent() {
        let store = MemoryStore::new();
        let a = store.put_payload(b"big value".to_vec()).await.unwrap();
        let b = store.put_payload(b"big value".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            store.get_payload(&a).await.unwrap().as_deref(),
            Some(b"big value".as_ref())
        );
    }
}
