//! Crash-injection policy
//!
//! A declarative `{step_id?, phase}` rule consulted at each phase
//! boundary of [`crate::context::DurableContext::step`]. When it
//! matches, the process is hard-halted with no cleanup, so tests can
//! assert on exactly the store state a real power loss would leave
//! behind.

/// The three phase boundaries a step passes through between
/// reservation and return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    None,
    BeforeExecute,
    AfterExecuteBeforeCommit,
    AfterCommit,
}

/// `{step_id?, phase}` crash rule.
///
/// A blank or absent `step_id` matches every step. `phase = None`
/// never triggers, regardless of `step_id`.
#[derive(Debug, Clone, Default)]
pub struct CrashPolicy {
    step_id: Option<String>,
    phase: Phase,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::None
    }
}

impl CrashPolicy {
    /// No crash injection (the default).
    pub fn none() -> Self {
        Self::default()
    }

    /// Crash at `phase`, for any step.
    pub fn at_phase(phase: Phase) -> Self {
        Self {
            step_id: None,
            phase,
        }
    }

    /// Crash at `phase`, only for the step named `step_id`.
    pub fn at_step(step_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            step_id: Some(step_id.into()),
            phase,
        }
    }

    /// Whether this policy fires for `current_step` at `current_phase`.
    pub fn should_crash(&self, current_step: &str, current_phase: Phase) -> bool {
        if self.phase == Phase::None || self.phase != current_phase {
            return false;
        }
        match self.step_id.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(id) => id == current_step,
        }
    }

    /// Consult the policy and, if it matches, hard-halt the process.
    ///
    /// Logs at `error` level before exiting so a test harness reading
    /// the log can confirm the intended phase was actually reached.
    /// This calls `std::process::exit`, which skips destructors and
    /// `Drop` impls — the point is to emulate power loss, not a clean
    /// shutdown.
    pub fn maybe_crash(&self, current_step: &str, current_phase: Phase) {
        if self.should_crash(current_step, current_phase) {
            tracing::error!(
                step = current_step,
                phase = ?current_phase,
                "crash policy fired; hard-halting process"
            );
            std::process::exit(70);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_policy_never_fires() {
        let p = CrashPolicy::none();
        assert!(!p.should_crash("a", Phase::BeforeExecute));
        assert!(!p.should_crash("a", Phase::AfterCommit));
    }

    #[test]
    fn wildcard_step_fires_for_any_step_at_matching_phase() {
        let p = CrashPolicy::at_phase(Phase::AfterExecuteBeforeCommit);
        assert!(p.should_crash("a", Phase::AfterExecuteBeforeCommit));
        assert!(p.should_crash("b", Phase::AfterExecuteBeforeCommit));
        assert!(!p.should_crash("a", Phase::BeforeExecute));
    }

    #[test]
    fn scoped_step_only_fires_for_that_step() {
        let p = CrashPolicy::at_step("b", Phase::AfterCommit);
        assert!(!p.should_crash("a", Phase::AfterCommit));
        assert!(p.should_crash("b", Phase::AfterCommit));
    }

    #[test]
    fn blank_step_id_behaves_as_wildcard() {
        let p = CrashPolicy::at_step("   ", Phase::BeforeExecute);
        assert!(p.should_crash("anything", Phase::BeforeExecute));
    }
}
