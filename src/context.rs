//! Durable context: the `step` primitive
//!
//! Implements reserve → execute → commit, cached replay, and the
//! bounded wait for a step another worker currently owns.

use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::codec::{self, CodecError};
use crate::crash::{CrashPolicy, Phase};
use crate::keygen::StepKeyGenerator;
use crate::store::{Reservation, StepStore, StoreError};

const RUNNING_ELSEWHERE_POLL: Duration = Duration::from_millis(100);
const RUNNING_ELSEWHERE_MIN_WAIT: Duration = Duration::from_millis(300);

tokio::task_local! {
    static CURRENT_STEP_KEY: String;
}

/// Errors surfaced by [`DurableContext::step`] and friends.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step is held by a live owner and did not free up within the wait window.
    #[error("step is still running elsewhere and exceeded its wait window")]
    StepInProgress,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The user-supplied step function returned an error.
    ///
    /// If the store also failed while recording the failure, that
    /// error is retained in `store_error` as a suppressed cause rather
    /// than replacing the original error.
    #[error("step `{step_key}` failed: {source}")]
    UserFailure {
        step_key: String,
        source: anyhow::Error,
        store_error: Option<StoreError>,
    },
}

impl StepError {
    /// The store error (if any) encountered while recording a user failure.
    pub fn suppressed_store_error(&self) -> Option<&StoreError> {
        match self {
            StepError::UserFailure { store_error, .. } => store_error.as_ref(),
            _ => None,
        }
    }
}

/// Per-run handle through which workflow code checkpoints side effects.
///
/// Cheap to clone; `step_async` spawns the clone onto a new task.
#[derive(Clone)]
pub struct DurableContext {
    workflow_id: Arc<str>,
    store: Arc<dyn StepStore>,
    keygen: Arc<StepKeyGenerator>,
    lease_ms: u64,
    worker_id: Arc<str>,
    crash_policy: Arc<CrashPolicy>,
}

impl DurableContext {
    pub(crate) fn new(
        workflow_id: impl Into<Arc<str>>,
        store: Arc<dyn StepStore>,
        lease_ms: u64,
        worker_id: impl Into<Arc<str>>,
        crash_policy: Arc<CrashPolicy>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            store,
            keygen: Arc::new(StepKeyGenerator::new()),
            lease_ms,
            worker_id: worker_id.into(),
            crash_policy,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The step key currently executing on this worker, if any.
    ///
    /// Set around the user function and restored (LIFO) across nested
    /// `step` calls via a task-local scope.
    pub fn current_step_key(&self) -> Option<String> {
        CURRENT_STEP_KEY.try_with(|k| k.clone()).ok()
    }

    /// Run `f` under `step_id`, replaying a cached result if one exists.
    #[track_caller]
    pub async fn step<T, F, Fut>(&self, step_id: &str, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        self.step_impl(Some(step_id), f, Location::caller()).await
    }

    /// Run `f` under an auto-generated step id derived from the call site.
    #[track_caller]
    pub async fn step_auto<T, F, Fut>(&self, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        self.step_impl(None, f, Location::caller()).await
    }

    /// Run `f` on `executor`, returning a handle that resolves the same
    /// way an inline `step` call would.
    #[track_caller]
    pub fn step_async<T, F, Fut>(
        &self,
        step_id: &str,
        f: F,
    ) -> tokio::task::JoinHandle<Result<T, StepError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        let ctx = self.clone();
        let step_id = step_id.to_string();
        let location = Location::caller();
        tokio::spawn(async move { ctx.step_impl(Some(step_id.as_str()), f, location).await })
    }

    async fn step_impl<T, F, Fut>(
        &self,
        step_id: Option<&str>,
        f: F,
        location: &Location<'_>,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let generated = self.keygen.next_key(step_id, location);
        let step_key = generated.store_key;
        let logical_step_id = generated.step_id;

        let mut reservation = self
            .store
            .reserve(
                &self.workflow_id,
                &step_key,
                &logical_step_id,
                &self.worker_id,
                self.lease_ms,
            )
            .await?;

        let wait_window = Duration::from_millis(self.lease_ms).max(RUNNING_ELSEWHERE_MIN_WAIT);
        let deadline = Instant::now() + wait_window;

        loop {
            match reservation {
                Reservation::Cached(record) => {
                    tracing::debug!(workflow_id = %self.workflow_id, step_key, "replaying cached step");
                    let value = codec::decode(
                        record.output_json.as_deref(),
                        record.output_type.as_deref().unwrap_or(codec::VOID_TAG),
                    )?;
                    return Ok(value);
                }
                Reservation::Acquired(_) => {
                    return self.execute_and_commit(&step_key, &logical_step_id, f).await
                }
                Reservation::RunningElsewhere(_) => {
                    if Instant::now() >= deadline {
                        return Err(StepError::StepInProgress);
                    }
                    tokio::time::sleep(RUNNING_ELSEWHERE_POLL).await;
                    reservation = self
                        .store
                        .reserve(
                            &self.workflow_id,
                            &step_key,
                            &logical_step_id,
                            &self.worker_id,
                            self.lease_ms,
                        )
                        .await?;
                }
            }
        }
    }

    async fn execute_and_commit<T, F, Fut>(
        &self,
        step_key: &str,
        logical_step_id: &str,
        f: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        self.crash_policy
            .maybe_crash(logical_step_id, Phase::BeforeExecute);

        let result = CURRENT_STEP_KEY
            .scope(step_key.to_string(), f())
            .await;

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                let store_error = self
                    .store
                    .fail(&self.workflow_id, step_key, &self.worker_id, &err.to_string())
                    .await
                    .err();
                return Err(StepError::UserFailure {
                    step_key: step_key.to_string(),
                    source: err,
                    store_error,
                });
            }
        };

        self.crash_policy
            .maybe_crash(logical_step_id, Phase::AfterExecuteBeforeCommit);

        let encoded = codec::encode(&value)?;
        self.store
            .complete(
                &self.workflow_id,
                step_key,
                &self.worker_id,
                encoded.payload,
                &encoded.type_tag,
            )
            .await?;

        self.crash_policy
            .maybe_crash(logical_step_id, Phase::AfterCommit);

        Ok(value)
    }
}
