//! Rollback policy — decides what happens after a batch resolves.

use jobupdate_state::UpdateSpec;

/// Outcome of evaluating failure counts against the update's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Thresholds exceeded and rollback disabled; the update fails.
    PauseForOperator,
    Rollback,
}

/// Compare failure counts to the thresholds. A threshold is exceeded only
/// when the count is strictly greater than it.
pub fn evaluate(batch_failures: u32, total_failures: u32, spec: &UpdateSpec) -> Verdict {
    let exceeded =
        total_failures > spec.max_total_failures || batch_failures > spec.max_batch_failures;
    match (exceeded, spec.rollback_on_failure) {
        (false, _) => Verdict::Continue,
        (true, true) => Verdict::Rollback,
        (true, false) => Verdict::PauseForOperator,
    }
}
