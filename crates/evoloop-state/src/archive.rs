//! Persistence trait for case artifacts.
//!
//! The engine hands every completed iteration to a [`CaseArchive`] and, once
//! the case is finalized, a [`CaseSummary`] from which the archive
//! synthesises the evolution report. Read-back preserves iteration order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{Actor, CriticVerdict, FeedbackTrends, IterationRecord, VersionedState};
use crate::Result;

/// Identity of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    pub case_id: String,
    pub name: String,
    pub symbols: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One archived iteration: the sealed record plus the state snapshots that
/// were current when it was archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEntry {
    pub record: IterationRecord,
    pub visual: VersionedState,
    pub data: VersionedState,
}

/// Compact, report-oriented view of an archived iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMetadata {
    pub index: u32,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// Versions the code was produced with.
    pub code_visual_version: u32,
    pub code_data_version: u32,
    /// Snapshot versions at archive time.
    pub visual_version: u32,
    pub data_version: u32,
    pub visual_capabilities: Vec<String>,
    pub data_capabilities: Vec<String>,
    pub succeeded: bool,
    pub attempts_used: u32,
    pub verdict: Option<CriticVerdict>,
    /// Artifact kind -> archive-relative path.
    pub artifacts: BTreeMap<String, String>,
}

impl IterationMetadata {
    pub fn from_entry(entry: &IterationEntry, artifacts: BTreeMap<String, String>) -> Self {
        let record = &entry.record;
        Self {
            index: record.index,
            actor: record.actor,
            timestamp: record.timestamp,
            code_visual_version: record.visual_version,
            code_data_version: record.data_version,
            visual_version: entry.visual.version(),
            data_version: entry.data.version(),
            visual_capabilities: entry.visual.capability_names(),
            data_capabilities: entry.data.capability_names(),
            succeeded: record.outcome.succeeded,
            attempts_used: record.outcome.attempts_used,
            verdict: record.verdict.clone(),
            artifacts,
        }
    }
}

/// End-of-case summary supplied by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub total_iterations: usize,
    pub critic_turns_used: u32,
    pub approved: bool,
    pub final_visual_version: u32,
    pub final_data_version: u32,
    pub visual_capabilities: Vec<String>,
    pub data_capabilities: Vec<String>,
    pub total_improvements: usize,
    pub trends: Option<FeedbackTrends>,
    pub improvement_plan: BTreeMap<String, Vec<String>>,
}

/// Full archived view of a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub case: CaseDescriptor,
    pub iterations: Vec<IterationMetadata>,
    pub summary: Option<CaseSummary>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl CaseMetadata {
    pub fn new(case: CaseDescriptor) -> Self {
        Self {
            case,
            iterations: Vec::new(),
            summary: None,
            finalized_at: None,
        }
    }

    /// Index the next archived iteration must carry.
    pub fn next_index(&self) -> u32 {
        self.iterations.len() as u32 + 1
    }
}

/// Listing row for `list_cases`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseListing {
    pub case_id: String,
    pub symbols: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub iterations: usize,
    pub finalized: bool,
}

impl From<&CaseMetadata> for CaseListing {
    fn from(meta: &CaseMetadata) -> Self {
        Self {
            case_id: meta.case.case_id.clone(),
            symbols: meta.case.symbols.clone(),
            created_at: meta.case.created_at,
            iterations: meta.iterations.len(),
            finalized: meta.finalized_at.is_some(),
        }
    }
}

/// Case artifact archive.
///
/// Guarantees:
/// - `record_iteration` accepts records only in gapless index order.
/// - `load_case` returns iterations in the order they were recorded.
/// - `finalize_case` returns the rendered evolution report.
#[async_trait]
pub trait CaseArchive: Send + Sync {
    /// Register a new case. Fails with `CaseExists` on a duplicate id.
    async fn create_case(&self, case: &CaseDescriptor) -> Result<()>;

    /// Archive one completed iteration.
    async fn record_iteration(&self, case_id: &str, entry: &IterationEntry) -> Result<()>;

    /// Attach the summary, synthesise the report and return it.
    async fn finalize_case(&self, case_id: &str, summary: &CaseSummary) -> Result<String>;

    /// Read back a case.
    async fn load_case(&self, case_id: &str) -> Result<CaseMetadata>;

    /// All known cases, newest first.
    async fn list_cases(&self) -> Result<Vec<CaseListing>>;
}

/// SHA-256 hex digest of `data`.
pub fn digest_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
