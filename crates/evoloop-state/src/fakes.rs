//! In-memory fake for the case archive (testing only)
//!
//! `MemoryCaseArchive` satisfies the `CaseArchive` contract without touching
//! the filesystem and keeps full `IterationEntry` values for inspection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::archive::{
    CaseArchive, CaseDescriptor, CaseListing, CaseMetadata, CaseSummary, IterationEntry,
    IterationMetadata,
};
use crate::error::StateError;
use crate::report::render_evolution_report;
use crate::Result;

#[derive(Debug)]
struct CaseState {
    meta: CaseMetadata,
    entries: Vec<IterationEntry>,
}

/// In-memory archive backed by a `HashMap<case_id, CaseState>`.
#[derive(Debug, Default)]
pub struct MemoryCaseArchive {
    cases: Mutex<HashMap<String, CaseState>>,
}

impl MemoryCaseArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full entries recorded for `case_id`, in order.
    pub fn entries(&self, case_id: &str) -> Vec<IterationEntry> {
        let cases = self.cases.lock().unwrap();
        cases
            .get(case_id)
            .map(|c| c.entries.clone())
            .unwrap_or_default()
    }

    /// Whether `case_id` has been finalized.
    pub fn is_finalized(&self, case_id: &str) -> bool {
        let cases = self.cases.lock().unwrap();
        cases
            .get(case_id)
            .map(|c| c.meta.finalized_at.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl CaseArchive for MemoryCaseArchive {
    async fn create_case(&self, case: &CaseDescriptor) -> Result<()> {
        let mut cases = self.cases.lock().unwrap();
        if cases.contains_key(&case.case_id) {
            return Err(StateError::CaseExists(case.case_id.clone()));
        }
        cases.insert(
            case.case_id.clone(),
            CaseState {
                meta: CaseMetadata::new(case.clone()),
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    async fn record_iteration(&self, case_id: &str, entry: &IterationEntry) -> Result<()> {
        let mut cases = self.cases.lock().unwrap();
        let state = cases
            .get_mut(case_id)
            .ok_or_else(|| StateError::CaseNotFound(case_id.to_string()))?;
        if state.meta.finalized_at.is_some() {
            return Err(StateError::AlreadyFinalized(case_id.to_string()));
        }
        let expected = state.meta.next_index();
        if entry.record.index != expected {
            return Err(StateError::OutOfOrder {
                case_id: case_id.to_string(),
                expected,
                actual: entry.record.index,
            });
        }
        state
            .meta
            .iterations
            .push(IterationMetadata::from_entry(entry, BTreeMap::new()));
        state.entries.push(entry.clone());
        Ok(())
    }

    async fn finalize_case(&self, case_id: &str, summary: &CaseSummary) -> Result<String> {
        let mut cases = self.cases.lock().unwrap();
        let state = cases
            .get_mut(case_id)
            .ok_or_else(|| StateError::CaseNotFound(case_id.to_string()))?;
        state.meta.summary = Some(summary.clone());
        state.meta.finalized_at = Some(Utc::now());
        Ok(render_evolution_report(&state.meta))
    }

    async fn load_case(&self, case_id: &str) -> Result<CaseMetadata> {
        let cases = self.cases.lock().unwrap();
        cases
            .get(case_id)
            .map(|c| c.meta.clone())
            .ok_or_else(|| StateError::CaseNotFound(case_id.to_string()))
    }

    async fn list_cases(&self) -> Result<Vec<CaseListing>> {
        let cases = self.cases.lock().unwrap();
        let mut listings: Vec<CaseListing> =
            cases.values().map(|c| CaseListing::from(&c.meta)).collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listings)
    }
}
