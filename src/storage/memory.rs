//! In-process operation store.
//!
//! Records live in a `DashMap`; the due queue and leases sit behind a single mutex so
//! claiming is atomic across workers.

use super::{lease_deadline, Operations, StorageError, StorageResult};
use crate::models::Operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    due_at: DateTime<Utc>,
    lease: Option<Lease>,
}

impl QueueEntry {
    fn is_claimable(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.due_at <= before
            && self
                .lease
                .as_ref()
                .map_or(true, |lease| lease.expires_at <= now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOperations {
    records: DashMap<String, Operation>,
    queue: Mutex<HashMap<String, QueueEntry>>,
}

impl InMemoryOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every stored record
    pub fn all(&self) -> Vec<Operation> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Due time of `id`, `None` if not queued
    pub fn due_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.queue.lock().get(id).map(|entry| entry.due_at)
    }
}

#[async_trait]
impl Operations for InMemoryOperations {
    async fn get(&self, id: &str) -> StorageResult<Operation> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    async fn insert(&self, operation: &Operation) -> StorageResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(operation.id().to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists {
                id: operation.id().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(operation.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, operation: &Operation) -> StorageResult<Operation> {
        let mut stored = self
            .records
            .get_mut(operation.id())
            .ok_or_else(|| StorageError::NotFound {
                id: operation.id().to_string(),
            })?;

        if stored.version != operation.version {
            return Err(StorageError::Conflict {
                id: operation.id().to_string(),
                expected: operation.version,
                actual: stored.version,
            });
        }
        if !stored.same_identity(operation) {
            return Err(StorageError::IdentityChanged {
                id: operation.id().to_string(),
            });
        }

        let mut next = operation.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_due(&self, before: DateTime<Utc>) -> StorageResult<Vec<Operation>> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .queue
            .lock()
            .iter()
            .filter(|(_, entry)| entry.due_at <= before)
            .map(|(id, entry)| (entry.due_at, id.clone()))
            .collect();
        due.sort();

        Ok(due
            .into_iter()
            .filter_map(|(_, id)| self.records.get(&id).map(|r| r.value().clone()))
            .filter(|op| !op.state.is_terminal())
            .collect())
    }

    async fn schedule(&self, id: &str, due_at: DateTime<Utc>) -> StorageResult<()> {
        if !self.records.contains_key(id) {
            return Err(StorageError::NotFound { id: id.to_string() });
        }

        let mut queue = self.queue.lock();
        queue
            .entry(id.to_string())
            .and_modify(|entry| entry.due_at = due_at)
            .or_insert(QueueEntry { due_at, lease: None });
        Ok(())
    }

    async fn claim_due(
        &self,
        before: DateTime<Utc>,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Operation>> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;

        let claimed_ids = {
            let mut queue = self.queue.lock();
            let mut candidates: Vec<(DateTime<Utc>, String)> = queue
                .iter()
                .filter(|(_, entry)| entry.is_claimable(before, now))
                .map(|(id, entry)| (entry.due_at, id.clone()))
                .collect();
            candidates.sort();
            candidates.truncate(limit);

            for (_, id) in &candidates {
                if let Some(entry) = queue.get_mut(id) {
                    entry.lease = Some(Lease {
                        owner: owner.to_string(),
                        expires_at,
                    });
                }
            }
            candidates
        };

        let claimed: Vec<Operation> = claimed_ids
            .into_iter()
            .filter_map(|(_, id)| self.records.get(&id).map(|r| r.value().clone()))
            .collect();

        if !claimed.is_empty() {
            debug!(owner = owner, claimed_count = claimed.len(), "Claimed due operations");
        }
        Ok(claimed)
    }

    async fn release(
        &self,
        id: &str,
        owner: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        let mut queue = self.queue.lock();
        let held = queue
            .get(id)
            .and_then(|entry| entry.lease.as_ref())
            .is_some_and(|lease| lease.owner == owner);
        if !held {
            return Ok(false);
        }

        match next_due {
            Some(due_at) => {
                queue.insert(id.to_string(), QueueEntry { due_at, lease: None });
            }
            None => {
                queue.remove(id);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationType, ProvisioningParameters};
    use crate::state_machine::OperationState;

    fn operation() -> Operation {
        Operation::new(
            "instance",
            OperationType::Provision,
            ProvisioningParameters::new("plan", "ga"),
        )
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = InMemoryOperations::new();
        let op = operation();
        store.insert(&op).await.unwrap();
        assert!(matches!(
            store.insert(&op).await,
            Err(StorageError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = InMemoryOperations::new();
        let op = operation();
        store.insert(&op).await.unwrap();

        let mut first = op.clone();
        first.description = "first".to_string();
        let stored = store.update(&first).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut stale = op.clone();
        stale.description = "stale".to_string();
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(op.id()).await.unwrap().description, "first");
    }

    #[tokio::test]
    async fn test_update_rejects_identity_change() {
        let store = InMemoryOperations::new();
        let op = operation();
        store.insert(&op).await.unwrap();

        let impostor = Operation::with_id(
            op.id(),
            "other-instance",
            OperationType::Provision,
            ProvisioningParameters::new("plan", "ga"),
        );
        assert!(matches!(
            store.update(&impostor).await,
            Err(StorageError::IdentityChanged { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = InMemoryOperations::new();
        let op = operation();
        store.insert(&op).await.unwrap();
        store.schedule(op.id(), Utc::now()).await.unwrap();

        let lease = Duration::from_secs(60);
        let a = store.claim_due(Utc::now(), "a", lease, 10).await.unwrap();
        let b = store.claim_due(Utc::now(), "b", lease, 10).await.unwrap();
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());

        assert!(!store.release(op.id(), "b", None).await.unwrap());
        assert!(store.release(op.id(), "a", Some(Utc::now())).await.unwrap());

        let b = store.claim_due(Utc::now(), "b", lease, 10).await.unwrap();
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed() {
        let store = InMemoryOperations::new();
        let op = operation();
        store.insert(&op).await.unwrap();
        store.schedule(op.id(), Utc::now()).await.unwrap();

        let claimed = store
            .claim_due(Utc::now(), "a", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let reclaimed = store
            .claim_due(Utc::now(), "b", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn test_list_due_skips_future_and_terminal() {
        let store = InMemoryOperations::new();
        let now = Utc::now();

        let due = operation();
        let later = operation();
        let mut done = operation();
        done.state = OperationState::Succeeded;

        for op in [&due, &later, &done] {
            store.insert(op).await.unwrap();
        }
        store.schedule(due.id(), now).await.unwrap();
        store
            .schedule(later.id(), now + chrono::Duration::hours(1))
            .await
            .unwrap();
        store.schedule(done.id(), now).await.unwrap();

        let listed = store.list_due(now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), due.id());
    }

    #[tokio::test]
    async fn test_release_without_next_due_dequeues() {
        let store = InMemoryOperations::new();
        let op = operation();
        store.insert(&op).await.unwrap();
        store.schedule(op.id(), Utc::now()).await.unwrap();
        store
            .claim_due(Utc::now(), "a", Duration::from_secs(60), 1)
            .await
            .unwrap();

        assert!(store.release(op.id(), "a", None).await.unwrap());
        assert!(store.due_at(op.id()).is_none());
    }
}
