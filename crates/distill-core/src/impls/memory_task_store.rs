//! In-memory task store.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{StoreError, TaskId, TaskPatch, TaskRecord, TaskStatus};
use crate::ports::TaskStore;

/// Task store backed by a `HashMap` behind one async mutex.
///
/// The lock is held only inside each call; nothing awaits while holding it.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    records: Arc<Mutex<HashMap<TaskId, TaskRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is (bypassing creation defaults). Used to simulate
    /// state left behind by a previous process.
    pub async fn insert_raw(&self, record: TaskRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

fn by_schedule_order(tasks: &mut [TaskRecord]) {
    tasks.sort_by_key(|t| (Reverse(t.priority.value()), t.created_at, t.id));
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, record: TaskRecord) -> Result<TaskId, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.to_string()));
        }
        let id = record.id;
        records.insert(id, record);
        Ok(id)
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<TaskRecord, StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(next) = patch.status
            && next != record.status
            && !record.status.can_transition_to(next)
        {
            warn!(task_id = %id, from = %record.status, to = %next, "unexpected status transition");
        }
        patch.apply(record);
        Ok(record.clone())
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut all: Vec<TaskRecord> = self.records.lock().await.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        Ok(all)
    }

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let mut matching: Vec<TaskRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.created_at, t.id));
        Ok(matching)
    }

    async fn get_pending(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError> {
        let mut pending: Vec<TaskRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.execute_at <= now)
            .cloned()
            .collect();
        by_schedule_order(&mut pending);
        Ok(pending)
    }

    async fn get_retryable(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError> {
        let mut retryable: Vec<TaskRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|t| {
                t.status == TaskStatus::Failed
                    && t.has_attempts_left()
                    && t.next_retry_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        by_schedule_order(&mut retryable);
        Ok(retryable)
    }

    async fn get_by_session(&self, session_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let mut matching: Vec<TaskRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|t| t.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.created_at, t.id));
        Ok(matching)
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackoffConfig, NewTask, Priority, TaskType};
    use chrono::Duration;
    use serde_json::json;

    fn new_record(priority: Priority, created_at: DateTime<Utc>) -> TaskRecord {
        NewTask::new(TaskType::Extract, json!({}))
            .with_priority(priority)
            .into_record(TaskId::new(), created_at, 3, &BackoffConfig::default())
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryTaskStore::new();
        let r = new_record(Priority::Normal, Utc::now());
        let id = store.create(r.clone()).await.unwrap();
        assert_eq!(store.get_by_id(id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryTaskStore::new();
        let r = new_record(Priority::Normal, Utc::now());
        store.create(r.clone()).await.unwrap();
        assert!(matches!(
            store.create(r).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn pending_sorted_by_priority_then_age() {
        let store = InMemoryTaskStore::new();
        let t0 = Utc::now();
        let old_low = new_record(Priority::Low, t0);
        let old_normal = new_record(Priority::Normal, t0);
        let new_normal = new_record(Priority::Normal, t0 + Duration::seconds(1));
        let critical = new_record(Priority::Critical, t0 + Duration::seconds(2));
        for r in [&old_low, &new_normal, &critical, &old_normal] {
            store.create(r.clone()).await.unwrap();
        }

        let order: Vec<TaskId> = store
            .get_pending(t0 + Duration::seconds(10))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![critical.id, old_normal.id, new_normal.id, old_low.id]);
    }

    #[tokio::test]
    async fn pending_excludes_deferred_tasks() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let deferred = NewTask::new(TaskType::Extract, json!({}))
            .deferred_until(now + Duration::minutes(5))
            .into_record(TaskId::new(), now, 3, &BackoffConfig::default());
        store.create(deferred).await.unwrap();
        assert!(store.get_pending(now).await.unwrap().is_empty());
        assert_eq!(store.get_pending(now + Duration::minutes(5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retryable_requires_attempts_left_and_elapsed_delay() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();

        let mut exhausted = new_record(Priority::Normal, now);
        exhausted.status = TaskStatus::Failed;
        exhausted.attempts = 3;

        let mut waiting = new_record(Priority::Normal, now);
        waiting.status = TaskStatus::Failed;
        waiting.attempts = 1;
        waiting.next_retry_at = Some(now + Duration::seconds(30));

        let mut ready = new_record(Priority::Normal, now);
        ready.status = TaskStatus::Failed;
        ready.attempts = 1;

        for r in [&exhausted, &waiting, &ready] {
            store.insert_raw(r.clone()).await;
        }

        let ids: Vec<TaskId> = store
            .get_retryable(now)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![ready.id]);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store.update(TaskId::new(), TaskPatch::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn by_session_and_delete() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let r = NewTask::new(TaskType::Preprocess, json!({}))
            .in_session("s1")
            .into_record(TaskId::new(), now, 3, &BackoffConfig::default());
        let id = store.create(r).await.unwrap();
        store.create(new_record(Priority::Normal, now)).await.unwrap();

        assert_eq!(store.get_by_session("s1").await.unwrap().len(), 1);
        store.delete(id).await.unwrap();
        assert!(store.get_by_session("s1").await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }
}
