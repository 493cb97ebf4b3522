//! Durable step execution engine.
//!
//! Wrap a side effect in `ctx.step(id, || ...)` and it is checkpointed
//! to a relational store exactly once per workflow instance. Re-running
//! the same workflow id against the same store replays completed steps
//! from their cached results instead of re-executing them.
//!
//! ```no_run
//! use durable_steps::prelude::*;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = InMemoryStepStore::new();
//! let engine = Engine::new(store, EngineOptions::default());
//! engine.initialize().await?;
//!
//! let total = engine
//!     .run("order-42", |ctx| async move {
//!         let a = ctx.step("charge-card", || async { Ok::<_, anyhow::Error>(1_00i64) }).await?;
//!         let b = ctx.step("send-receipt", || async { Ok::<_, anyhow::Error>(()) }).await?;
//!         let _ = b;
//!         Ok::<_, anyhow::Error>(a)
//!     })
//!     .await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod context;
pub mod crash;
pub mod engine;
pub mod keygen;
pub mod store;

/// Common imports for workflow code.
pub mod prelude {
    pub use crate::context::{DurableContext, StepError};
    pub use crate::crash::{CrashPolicy, Phase};
    pub use crate::engine::{Engine, EngineOptions};
    pub use crate::store::{InMemoryStepStore, SqliteStepStore, StepStore, StoreError};
}

pub use codec::{decode, encode, CodecError, EncodedOutput, VOID_TAG};
pub use context::{DurableContext, StepError};
pub use crash::{CrashPolicy, Phase};
pub use engine::{Engine, EngineOptions};
pub use store::{InMemoryStepStore, Reservation, SqliteStepStore, StepRecord, StepStatus, StepStore, StoreError};
