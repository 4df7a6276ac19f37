//! Structured observability hooks for case lifecycle events.
//!
//! - `CaseSpan`: RAII guard entering a case-scoped span
//! - `emit_*`: one function per lifecycle event, logged at `info!`
//!   (`warn!` for archive errors) with an `event` field

use tracing::{info, warn};

/// RAII guard that enters a case-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = CaseSpan::enter("demo_NVDA_20260101_120000");
/// // every event below carries case_id
/// ```
pub struct CaseSpan {
    _span: tracing::span::EnteredSpan,
}

impl CaseSpan {
    pub fn enter(case_id: &str) -> Self {
        let span = tracing::info_span!("evoloop.case", case_id = %case_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Span for one orchestrator step, for use with `Instrument`.
pub fn case_span(case_id: &str) -> tracing::Span {
    tracing::info_span!("evoloop.case", case_id = %case_id)
}

pub fn emit_case_started(case_id: &str, symbols: &[String], mock_mode: bool) {
    info!(
        event = "case.started",
        case_id = %case_id,
        symbols = %symbols.join(","),
        mock_mode = mock_mode,
    );
}

pub fn emit_attempt_failed(subject: &str, attempt: u32, max_attempts: u32, error: &str) {
    info!(
        event = "attempt.failed",
        subject = %subject,
        attempt = attempt,
        max_attempts = max_attempts,
        error = %evoloop_state::tail_chars(error, 200),
    );
}

pub fn emit_turn_completed(turn: u32, succeeded: bool, approved: bool, quality_score: f64) {
    info!(
        event = "turn.completed",
        turn = turn,
        succeeded = succeeded,
        approved = approved,
        quality_score = quality_score,
    );
}

pub fn emit_evolution_applied(
    subject: &str,
    source: &str,
    from_version: u32,
    to_version: u32,
    activated: &[String],
) {
    info!(
        event = "evolution.applied",
        subject = %subject,
        source = %source,
        from_version = from_version,
        to_version = to_version,
        activated = %activated.join(","),
    );
}

pub fn emit_user_feedback_received(case_id: &str, satisfied: bool, chars: usize) {
    info!(
        event = "user_feedback.received",
        case_id = %case_id,
        satisfied = satisfied,
        chars = chars,
    );
}

pub fn emit_case_finalized(case_id: &str, iterations: usize, approved: bool, duration_ms: u64) {
    info!(
        event = "case.finalized",
        case_id = %case_id,
        iterations = iterations,
        approved = approved,
        duration_ms = duration_ms,
    );
}

/// Persistence failures never abort a case; they are only reported.
pub fn emit_archive_error(case_id: &str, operation: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "archive.error",
        case_id = %case_id,
        operation = %operation,
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_span_enters_and_drops() {
        let _span = CaseSpan::enter("test-case");
        emit_turn_completed(1, true, false, 0.5);
    }
}
