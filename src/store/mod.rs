//! Step store: interface plus relational and in-memory adapters
//!
//! The store is the engine's durability boundary. It persists and
//! atomically transitions per-step records, enforcing ownership so
//! that at most one worker ever observes `ACQUIRED` for a fresh key.

mod memory;
mod sqlite;

pub use memory::InMemoryStepStore;
pub use sqlite::SqliteStepStore;

use async_trait::async_trait;

/// Status of a [`StepRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(StepStatus::Running),
            "COMPLETED" => Some(StepStatus::Completed),
            "FAILED" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// One row of the `steps` table: see SPEC_FULL.md §3/§6.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub workflow_id: String,
    pub step_key: String,
    pub step_id: String,
    pub status: StepStatus,
    pub output_json: Option<String>,
    pub output_type: Option<String>,
    pub error_message: Option<String>,
    pub attempt: u32,
    pub owner: Option<String>,
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Outcome of [`StepStore::reserve`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// This caller now owns the record and must execute the step.
    Acquired(StepRecord),
    /// The step already completed; its output can be decoded directly.
    Cached(StepRecord),
    /// Another live owner holds the lease; the caller should wait and retry.
    RunningElsewhere(StepRecord),
}

impl Reservation {
    pub fn record(&self) -> &StepRecord {
        match self {
            Reservation::Acquired(r) | Reservation::Cached(r) | Reservation::RunningElsewhere(r) => r,
        }
    }
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller no longer owns the record it tried to mutate — a
    /// lease-reclaim by another worker overtook it.
    #[error("ownership lost for step `{step_key}` in workflow `{workflow_id}`")]
    OwnershipLost { workflow_id: String, step_key: String },

    /// The underlying database returned an error not covered above.
    #[error("store database error: {0}")]
    Database(String),

    /// A value failed to serialize/deserialize on its way in or out of the store.
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// Contention (busy/locked) persisted past the adapter's retry budget.
    #[error("store contention exhausted retry budget after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Store for per-step reservation records.
///
/// Implementations must be safe under concurrent callers against the
/// same or different processes: the `reserve` read-then-write must be
/// one serializable unit per `(workflow_id, step_key)`.
#[async_trait]
pub trait StepStore: Send + Sync + 'static {
    /// Idempotently create schema (tables/indexes). Safe to call repeatedly.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Atomically claim, observe-as-cached, or refuse a step key.
    async fn reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, StoreError>;

    /// Transition a RUNNING record this `owner` holds to COMPLETED.
    ///
    /// Fails with [`StoreError::OwnershipLost`] if `owner` no longer
    /// matches the record (lease was reclaimed) or the record does not exist.
    async fn complete(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        output_json: Option<String>,
        output_type: &str,
    ) -> Result<(), StoreError>;

    /// Transition a RUNNING record this `owner` holds to FAILED.
    ///
    /// Same ownership predicate as [`StepStore::complete`].
    async fn fail(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        error_message: &str,
    ) -> Result<(), StoreError>;
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
