//! Step-key generation
//!
//! Maps each `step(id, …)` invocation to a key that is stable across
//! replays of the same workflow code path and distinct across repeated
//! visits to the same call site (loops, branch retries).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A generated step key plus the logical-clock tick it was minted at.
///
/// The clock value is informational only (logs/telemetry); the store
/// key is `store_key`, built from `step_id`, `callsite`, and `sequence`
/// alone, so that replay reproduces the same key independent of how
/// many other steps ran before it (§4.3, §9).
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub store_key: String,
    pub logical_clock: u64,
    /// The resolved logical step id: the trimmed user-supplied `step_id`,
    /// or `"auto-" + hex(hash(callsite))` when none was given. This is
    /// what `StepRecord.step_id` stores and what crash-policy matching
    /// compares against — never the composite `store_key`.
    pub step_id: String,
}

/// Generates step keys for one workflow run.
///
/// Safe for concurrent use: the callsite→sequence map uses lock-free
/// concurrent insertion (`dashmap`) and the logical clock is a single
/// atomic counter, matching the concurrency model of §5.
pub struct StepKeyGenerator {
    sequences: DashMap<(String, String), u64>,
    clock: AtomicU64,
}

impl Default for StepKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl StepKeyGenerator {
    pub fn new() -> Self {
        Self {
            sequences: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Generate the next key for `step_id` at `callsite`.
    ///
    /// `step_id` is the user-supplied logical name, or `None` to derive
    /// one deterministically from the callsite hash.
    pub fn next_key(&self, step_id: Option<&str>, callsite: &Location<'_>) -> GeneratedKey {
        let callsite_hash = hash_callsite(callsite);

        let step_id = match step_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("auto-{callsite_hash}"),
        };

        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

        let seq_key = (step_id.clone(), callsite_hash.clone());
        let sequence = {
            let mut entry = self.sequences.entry(seq_key).or_insert(0);
            *entry += 1;
            *entry
        };

        GeneratedKey {
            store_key: format!("{step_id}::{callsite_hash}::{sequence}"),
            logical_clock: tick,
            step_id,
        }
    }
}

/// Hash a `(file, line, column)` callsite triple to a fixed-width hex string.
fn hash_callsite(location: &Location<'_>) -> String {
    let mut hasher = DefaultHasher::new();
    location.file().hash(&mut hasher);
    location.line().hash(&mut hasher);
    location.column().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
