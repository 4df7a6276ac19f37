//! Bounded produce→execute retry loop for a single turn.
//!
//! States: `Attempting(n)` → `Succeeded` | `Attempting(n+1)` | `ExhaustedFailing`.
//! Each retry hands the previous failure's stderr tail to the producer.
//! A producer error or empty source is a failed attempt like any other.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use evoloop_state::ExecutionOutcome;

use crate::executor::Executor;
use crate::metrics::METRICS;
use crate::obs;
use crate::producer::{CodeProducer, ProductionSpec};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegenerationState {
    Attempting(u32),
    Succeeded,
    ExhaustedFailing,
}

impl RegenerationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RegenerationState::Attempting(_))
    }
}

/// One attempt as seen by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub succeeded: bool,
    /// The producer failed before anything was executed.
    pub producer_failed: bool,
    pub stderr_tail: Option<String>,
    pub duration_ms: u64,
}

/// Terminal result of [`RegenerationController::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegenerationOutcome {
    /// `Succeeded` or `ExhaustedFailing`.
    pub state: RegenerationState,
    /// Winning source, or the last one produced.
    pub source: String,
    pub outcome: ExecutionOutcome,
    pub attempts: Vec<AttemptRecord>,
}

impl RegenerationOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RegenerationState::Succeeded
    }
}

/// Drives a producer/executor pair for up to `max_attempts` attempts.
pub struct RegenerationController<'a> {
    producer: &'a dyn CodeProducer,
    executor: &'a dyn Executor,
    max_attempts: u32,
    timeout: Duration,
}

impl<'a> RegenerationController<'a> {
    /// `max_attempts` below 1 is treated as 1.
    pub fn new(
        producer: &'a dyn CodeProducer,
        executor: &'a dyn Executor,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            producer,
            executor,
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    pub async fn run(&self, spec: &ProductionSpec<'_>, working_dir: &Path) -> RegenerationOutcome {
        let mut attempts = Vec::new();
        let mut source = String::new();
        let mut hint: Option<String> = spec.repair_hint.map(str::to_string);
        let mut n = 1;

        loop {
            let started = Instant::now();
            let attempt_spec = ProductionSpec {
                repair_hint: hint.as_deref(),
                ..*spec
            };

            let (mut outcome, producer_failed) = match self.producer.produce(&attempt_spec).await {
                Ok(code) if !code.trim().is_empty() => {
                    source = code;
                    (
                        self.executor.run(&source, working_dir, self.timeout).await,
                        false,
                    )
                }
                Ok(_) => (
                    ExecutionOutcome::failed(format!(
                        "{} producer returned empty source",
                        self.producer.name()
                    )),
                    true,
                ),
                Err(e) => (
                    ExecutionOutcome::failed(format!("{} producer failed: {}", self.producer.name(), e)),
                    true,
                ),
            };
            outcome.attempts_used = n;
            METRICS.record_attempt(outcome.succeeded);
            attempts.push(AttemptRecord {
                attempt: n,
                succeeded: outcome.succeeded,
                producer_failed,
                stderr_tail: outcome.stderr_tail.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            let state = if outcome.succeeded {
                RegenerationState::Succeeded
            } else {
                obs::emit_attempt_failed(
                    spec.subject.as_str(),
                    n,
                    self.max_attempts,
                    outcome.stderr_tail.as_deref().unwrap_or(""),
                );
                if n < self.max_attempts {
                    hint = outcome.stderr_tail.clone();
                    n += 1;
                    RegenerationState::Attempting(n)
                } else {
                    RegenerationState::ExhaustedFailing
                }
            };

            if state.is_terminal() {
                debug!(subject = %spec.subject, attempts = attempts.len(), state = ?state, "regeneration finished");
                return RegenerationOutcome {
                    state,
                    source,
                    outcome,
                    attempts,
                };
            }
        }
    }
}
