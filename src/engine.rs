//! Engine facade
//!
//! Binds a workflow id, store, and configuration into a
//! [`DurableContext`] and hands it to a user-supplied workflow
//! procedure.

use std::future::Future;
use std::sync::Arc;

use rand::Rng;

use crate::context::DurableContext;
use crate::crash::CrashPolicy;
use crate::store::{StepStore, StoreError};

const DEFAULT_LEASE_MS: u64 = 3_000;

/// Construction options for an [`Engine`].
///
/// Builder-style: start from [`EngineOptions::default`] and chain
/// `with_*` calls. All fields have the defaults enumerated in the
/// external-interfaces section of the design notes.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    lease_ms: u64,
    worker_id: Option<String>,
    crash_policy: CrashPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lease_ms: DEFAULT_LEASE_MS,
            worker_id: None,
            crash_policy: CrashPolicy::none(),
        }
    }
}

impl EngineOptions {
    pub fn with_lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_crash_policy(mut self, crash_policy: CrashPolicy) -> Self {
        self.crash_policy = crash_policy;
        self
    }
}

fn random_worker_id() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("worker-{suffix:016x}")
}

/// Binds a [`StepStore`] to a set of run options and drives workflow
/// procedures against it.
pub struct Engine {
    store: Arc<dyn StepStore>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(store: impl StepStore, options: EngineOptions) -> Self {
        Self {
            store: Arc::new(store),
            options,
        }
    }

    /// Build an engine from an already-`Arc`'d store (for sharing one
    /// store across multiple engine instances/processes in tests).
    pub fn from_shared_store(store: Arc<dyn StepStore>, options: EngineOptions) -> Self {
        Self { store, options }
    }

    /// Ensure the store's schema exists. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        self.store.initialize().await
    }

    /// Run `workflow_fn` against `workflow_id`.
    ///
    /// Re-invoking `run` with the same `workflow_id` against the same
    /// store resumes from whichever steps already completed.
    pub async fn run<T, F, Fut>(&self, workflow_id: impl Into<String>, workflow_fn: F) -> T
    where
        F: FnOnce(DurableContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let worker_id = self
            .options
            .worker_id
            .clone()
            .unwrap_or_else(random_worker_id);
        let workflow_id: String = workflow_id.into();

        let ctx = DurableContext::new(
            workflow_id,
            self.store.clone(),
            self.options.lease_ms,
            worker_id,
            Arc::new(self.options.crash_policy.clone()),
        );

        workflow_fn(ctx).await
    }
}
