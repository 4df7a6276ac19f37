//! Case data model shared by the engine and the archive.
//!
//! - `VersionedState`: version + additive capability list for one subject
//! - `ExecutionOutcome`: result of running one produced script
//! - `CriticVerdict`: structured critique of one turn
//! - `IterationRecord` / `IterationLog`: append-only audit trail of a case

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Subjects & capabilities
// ---------------------------------------------------------------------------

/// One of the two independently versioned artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Visual,
    Data,
}

impl Subject {
    pub const ALL: [Subject; 2] = [Subject::Visual, Subject::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Visual => "visual",
            Subject::Data => "data",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an additive capability flag (e.g. `moving_avg`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

impl CapabilityId {
    pub fn new(id: impl Into<String>) -> Self {
        CapabilityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        CapabilityId::new(s)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// VersionedState
// ---------------------------------------------------------------------------

/// Version and enabled capabilities of one subject.
///
/// The fields are private so the only ways to move forward are
/// [`VersionedState::advance`], which bumps the version by exactly one and
/// keeps every previously active capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState {
    version: u32,
    active_capabilities: Vec<CapabilityId>,
}

impl Default for VersionedState {
    fn default() -> Self {
        Self::initial()
    }
}

impl VersionedState {
    /// Version 1 with no capabilities.
    pub fn initial() -> Self {
        Self {
            version: 1,
            active_capabilities: Vec::new(),
        }
    }

    /// Version 1 seeded with capabilities (duplicates dropped, order kept).
    pub fn seeded<I, C>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CapabilityId>,
    {
        let mut state = Self::initial();
        for cap in capabilities {
            let cap = cap.into();
            if !state.active_capabilities.contains(&cap) {
                state.active_capabilities.push(cap);
            }
        }
        state
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Active capabilities in activation order.
    pub fn active_capabilities(&self) -> &[CapabilityId] {
        &self.active_capabilities
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.active_capabilities
            .iter()
            .any(|c| c.as_str() == capability)
    }

    /// Capability ids as plain strings, in activation order.
    pub fn capability_names(&self) -> Vec<String> {
        self.active_capabilities
            .iter()
            .map(|c| c.as_str().to_string())
            .collect()
    }

    /// Next state: version + 1, with `activated` appended (skipping ids
    /// already present).
    pub fn advance(&self, activated: &[CapabilityId]) -> VersionedState {
        let mut next = self.clone();
        next.version += 1;
        for cap in activated {
            if !next.active_capabilities.contains(cap) {
                next.active_capabilities.push(cap.clone());
            }
        }
        next
    }

    /// `true` when every capability of `earlier` is still active here and the
    /// version did not go backwards.
    pub fn descends_from(&self, earlier: &VersionedState) -> bool {
        self.version >= earlier.version
            && earlier
                .active_capabilities
                .iter()
                .all(|c| self.active_capabilities.contains(c))
    }
}

// ---------------------------------------------------------------------------
// ExecutionOutcome
// ---------------------------------------------------------------------------

/// Default cap on captured stderr/stdout suffixes (characters).
pub const DEFAULT_TAIL_CHARS: usize = 2000;

/// Result of executing one produced script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    /// Attempts consumed by the regeneration controller (1..=max_attempts).
    pub attempts_used: u32,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Bounded suffix of standard error (present on failure).
    pub stderr_tail: Option<String>,
    /// Bounded suffix of standard output.
    pub stdout_tail: Option<String>,
    /// Files newly present in the working directory after the run.
    pub produced_files: BTreeSet<String>,
    /// Working directory the run used (for archiving produced files).
    pub work_dir: Option<PathBuf>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    /// A failed outcome that never reached a process (producer failure,
    /// spawn error, working directory error).
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            attempts_used: 1,
            exit_code: None,
            timed_out: false,
            stderr_tail: Some(message.into()),
            stdout_tail: None,
            produced_files: BTreeSet::new(),
            work_dir: None,
            duration_ms: 0,
        }
    }

    /// A successful outcome with no captured output.
    pub fn success() -> Self {
        Self {
            succeeded: true,
            attempts_used: 1,
            exit_code: Some(0),
            timed_out: false,
            stderr_tail: None,
            stdout_tail: None,
            produced_files: BTreeSet::new(),
            work_dir: None,
            duration_ms: 0,
        }
    }

    /// Error text for the next regeneration attempt, if any.
    pub fn failure_hint(&self) -> Option<&str> {
        if self.succeeded {
            None
        } else {
            self.stderr_tail.as_deref()
        }
    }
}

/// Keep at most the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Keep at most the first `max_chars` characters of `text`.
pub fn head_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// ---------------------------------------------------------------------------
// CriticVerdict
// ---------------------------------------------------------------------------

/// Structured critique of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub approved: bool,
    pub quality_score: f64,
    pub feedback_text: String,
}

impl CriticVerdict {
    pub fn new(approved: bool, quality_score: f64, feedback_text: impl Into<String>) -> Self {
        Self {
            approved,
            quality_score,
            feedback_text: feedback_text.into(),
        }
    }

    /// Verdict used when an evaluator response cannot be interpreted.
    pub fn fail_safe(feedback_text: impl Into<String>) -> Self {
        Self::new(false, 0.0, feedback_text)
    }
}

// ---------------------------------------------------------------------------
// Iteration records
// ---------------------------------------------------------------------------

/// Who drove an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Critic,
    User,
    CriticPostUser,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Critic => "critic",
            Actor::User => "user",
            Actor::CriticPostUser => "critic_post_user",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit entry for one loop step. Created only by [`IterationLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based, gapless position within the case.
    pub index: u32,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// Visual version in effect when this iteration's code was produced.
    pub visual_version: u32,
    /// Data version in effect when this iteration's code was produced.
    pub data_version: u32,
    pub visual_code: String,
    pub data_code: String,
    pub outcome: ExecutionOutcome,
    pub feedback_text: String,
    pub verdict: Option<CriticVerdict>,
    pub data_sample: Option<serde_json::Value>,
}

impl IterationRecord {
    /// Stable artifact prefix, e.g. `v003_critic`.
    pub fn artifact_id(&self) -> String {
        format!("v{:03}_{}", self.index, self.actor)
    }
}

/// Everything about an iteration except its position and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationDraft {
    pub actor: Actor,
    pub visual_version: u32,
    pub data_version: u32,
    pub visual_code: String,
    pub data_code: String,
    pub outcome: ExecutionOutcome,
    pub feedback_text: String,
    pub verdict: Option<CriticVerdict>,
    pub data_sample: Option<serde_json::Value>,
}

/// Append-only, strictly ordered sequence of iteration records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationLog {
    records: Vec<IterationRecord>,
}

impl IterationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal `draft` into the next record and return it.
    pub fn append(&mut self, draft: IterationDraft) -> &IterationRecord {
        let index = self.records.len() as u32 + 1;
        self.records.push(IterationRecord {
            index,
            actor: draft.actor,
            timestamp: Utc::now(),
            visual_version: draft.visual_version,
            data_version: draft.data_version,
            visual_code: draft.visual_code,
            data_code: draft.data_code,
            outcome: draft.outcome,
            feedback_text: draft.feedback_text,
            verdict: draft.verdict,
            data_sample: draft.data_sample,
        });
        &self.records[self.records.len() - 1]
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    pub fn count_by_actor(&self, actor: Actor) -> usize {
        self.records.iter().filter(|r| r.actor == actor).count()
    }

    pub fn into_records(self) -> Vec<IterationRecord> {
        self.records
    }
}

/// `true` when `indices` is exactly `1..=n` in order.
pub fn is_gapless<I>(indices: I) -> bool
where
    I: IntoIterator<Item = u32>,
{
    indices
        .into_iter()
        .enumerate()
        .all(|(pos, index)| index == pos as u32 + 1)
}

// ---------------------------------------------------------------------------
// Feedback trends
// ---------------------------------------------------------------------------

/// Direction of critic/user scores over a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTrend {
    Improving,
    Declining,
    Stable,
}

impl fmt::Display for ScoreTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScoreTrend::Improving => "improving",
            ScoreTrend::Declining => "declining",
            ScoreTrend::Stable => "stable",
        };
        f.write_str(s)
    }
}

/// Aggregate view of analysed feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackTrends {
    pub average_score: f64,
    pub score_trend: ScoreTrend,
    pub most_common_category: String,
    pub total_feedback: usize,
}
