//! In-memory implementation of [`StepStore`], for tests and single-process use.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{now_ms, Reservation, StepRecord, StepStatus, StepStore, StoreError};

/// In-memory step store.
///
/// Provides the same reservation semantics as [`SqliteStepStore`], minus
/// cross-process durability. Primarily for unit tests and for replaying
/// a workflow within a single process without a database.
///
/// [`SqliteStepStore`]: super::SqliteStepStore
///
/// # Example
///
/// ```
/// use durable_steps::store::InMemoryStepStore;
///
/// let store = InMemoryStepStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryStepStore {
    rows: RwLock<HashMap<(String, String), StepRecord>>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored (for test assertions).
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, StoreError> {
        let key = (workflow_id.to_string(), step_key.to_string());
        let mut rows = self.rows.write();
        let now = now_ms();

        match rows.get(&key) {
            None => {
                let record = StepRecord {
                    workflow_id: workflow_id.to_string(),
                    step_key: step_key.to_string(),
                    step_id: step_id.to_string(),
                    status: StepStatus::Running,
                    output_json: None,
                    output_type: None,
                    error_message: None,
                    attempt: 1,
                    owner: Some(owner.to_string()),
                    started_at_ms: now,
                    updated_at_ms: now,
                };
                rows.insert(key, record.clone());
                tracing::debug!(workflow_id, step_key, owner, "acquired fresh step");
                Ok(Reservation::Acquired(record))
            }
            Some(existing) => match existing.status {
                StepStatus::Completed => Ok(Reservation::Cached(existing.clone())),
                StepStatus::Running | StepStatus::Failed => {
                    let stale = existing.status == StepStatus::Running
                        && now.saturating_sub(existing.updated_at_ms) > lease_ms as i64;
                    let same_owner =
                        existing.status == StepStatus::Running && existing.owner.as_deref() == Some(owner);

                    if existing.status == StepStatus::Failed || stale || same_owner {
                        let mut record = existing.clone();
                        record.owner = Some(owner.to_string());
                        record.status = StepStatus::Running;
                        record.output_json = None;
                        record.output_type = None;
                        record.error_message = None;
                        record.attempt += 1;
                        record.updated_at_ms = now;
                        rows.insert(key, record.clone());
                        tracing::debug!(
                            workflow_id,
                            step_key,
                            owner,
                            attempt = record.attempt,
                            "reclaimed step"
                        );
                        Ok(Reservation::Acquired(record))
                    } else {
                        Ok(Reservation::RunningElsewhere(existing.clone()))
                    }
                }
            },
        }
    }

    async fn complete(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        output_json: Option<String>,
        output_type: &str,
    ) -> Result<(), StoreError> {
        let key = (workflow_id.to_string(), step_key.to_string());
        let mut rows = self.rows.write();
        let record = rows.get_mut(&key).ok_or_else(|| StoreError::OwnershipLost {
            workflow_id: workflow_id.to_string(),
            step_key: step_key.to_string(),
        })?;

        if record.owner.as_deref() != Some(owner) {
            return Err(StoreError::OwnershipLost {
                workflow_id: workflow_id.to_string(),
                step_key: step_key.to_string(),
            });
        }

        record.status = StepStatus::Completed;
        record.output_json = output_json;
        record.output_type = Some(output_type.to_string());
        record.error_message = None;
        record.updated_at_ms = now_ms();
        Ok(())
    }

    async fn fail(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let key = (workflow_id.to_string(), step_key.to_string());
        let mut rows = self.rows.write();
        let record = rows.get_mut(&key).ok_or_else(|| StoreError::OwnershipLost {
            workflow_id: workflow_id.to_string(),
            step_key: step_key.to_string(),
        })?;

        if record.owner.as_deref() != Some(owner) {
            return Err(StoreError::OwnershipLost {
                workflow_id: workflow_id.to_string(),
                step_key: step_key.to_string(),
            });
        }

        record.status = StepStatus::Failed;
        record.error_message = Some(error_message.to_string());
        record.updated_at_ms = now_ms();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_key_is_acquired_with_attempt_one() {
        let store = InMemoryStepStore::new();
        let res = store
            .reserve("wf", "k1", "step-a", "worker-1", 3_000)
            .await
            .unwrap();
        match res {
            Reservation::Acquired(r) => assert_eq!(r.attempt, 1),
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_step_is_served_cached() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        store
            .complete("wf", "k1", "w1", Some("1".to_string()), "i64")
            .await
            .unwrap();

        let res = store.reserve("wf", "k1", "step-a", "w2", 3_000).await.unwrap();
        match res {
            Reservation::Cached(r) => {
                assert_eq!(r.output_json.as_deref(), Some("1"));
                assert_eq!(r.output_type.as_deref(), Some("i64"));
            }
            other => panic!("expected Cached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn live_owner_blocks_other_workers() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        let res = store.reserve("wf", "k1", "step-a", "w2", 3_000).await.unwrap();
        assert!(matches!(res, Reservation::RunningElsewhere(_)));
    }

    #[tokio::test]
    async fn same_owner_retaking_increments_attempt() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        let res = store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        match res {
            Reservation::Acquired(r) => assert_eq!(r.attempt, 2),
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();

        // Simulate an expired lease by reserving with lease_ms=0.
        let res = store.reserve("wf", "k1", "step-a", "w2", 0).await.unwrap();
        match res {
            Reservation::Acquired(r) => {
                assert_eq!(r.attempt, 2);
                assert_eq!(r.owner.as_deref(), Some("w2"));
            }
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_fails_ownership_when_reclaimed() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 0).await.unwrap();
        store.reserve("wf", "k1", "step-a", "w2", 0).await.unwrap(); // reclaims from w1

        let err = store
            .complete("wf", "k1", "w1", Some("1".to_string()), "i64")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OwnershipLost { .. }));
    }

    #[tokio::test]
    async fn failed_step_can_be_reclaimed_with_incremented_attempt() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        store.fail("wf", "k1", "w1", "boom").await.unwrap();

        let res = store.reserve("wf", "k1", "step-a", "w2", 3_000).await.unwrap();
        match res {
            Reservation::Acquired(r) => {
                assert_eq!(r.attempt, 2);
                assert!(r.error_message.is_none());
            }
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_record_is_never_mutated_by_later_reserve() {
        let store = InMemoryStepStore::new();
        store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        store
            .complete("wf", "k1", "w1", Some("\"x\"".to_string()), "String")
            .await
            .unwrap();

        // A same-owner retake must not be able to reopen a COMPLETED row.
        let res = store.reserve("wf", "k1", "step-a", "w1", 3_000).await.unwrap();
        assert!(matches!(res, Reservation::Cached(_)));
    }
}
