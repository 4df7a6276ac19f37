//! Filesystem-backed case archive.
//!
//! Layout under `<root>/<case_id>/`:
//!
//! ```text
//! metadata.json              case + iteration metadata
//! metadata.digest            sha256 of metadata.json
//! code/vNNN_<actor>_visual.py
//! code/vNNN_<actor>_data.py
//! feedback/vNNN_<actor>.txt
//! states/vNNN_<actor>_visual.json
//! states/vNNN_<actor>_data.json
//! outputs/vNNN_<actor>/<produced files>
//! data/vNNN_<actor>.json
//! evolution_report.md
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::archive::{
    digest_hex, CaseArchive, CaseDescriptor, CaseListing, CaseMetadata, CaseSummary,
    IterationEntry, IterationMetadata,
};
use crate::error::StateError;
use crate::report::render_evolution_report;
use crate::Result;

const SUBDIRS: [&str; 5] = ["code", "feedback", "states", "outputs", "data"];
const METADATA_FILE: &str = "metadata.json";
const DIGEST_FILE: &str = "metadata.digest";
const REPORT_FILE: &str = "evolution_report.md";

/// Archive rooted at a directory; one sub-directory per case.
pub struct FsCaseArchive {
    root: PathBuf,
}

impl FsCaseArchive {
    /// Create an archive rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of `case_id`.
    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.root.join(case_id)
    }

    /// Path of the rendered report for `case_id`.
    pub fn report_path(&self, case_id: &str) -> PathBuf {
        self.case_dir(case_id).join(REPORT_FILE)
    }

    fn read_metadata(&self, case_id: &str) -> Result<CaseMetadata> {
        let dir = self.case_dir(case_id);
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Err(StateError::CaseNotFound(case_id.to_string()));
        }
        let json = fs::read(&path)?;
        let digest_path = dir.join(DIGEST_FILE);
        if digest_path.exists() {
            let expected = fs::read_to_string(&digest_path)?;
            let actual = digest_hex(&json);
            if expected.trim() != actual {
                return Err(StateError::DigestMismatch {
                    expected: expected.trim().to_string(),
                    actual,
                });
            }
        }
        Ok(serde_json::from_slice(&json)?)
    }

    fn write_metadata(&self, meta: &CaseMetadata) -> Result<()> {
        let dir = self.case_dir(&meta.case.case_id);
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&dir.join(METADATA_FILE), &json)?;
        fs::write(dir.join(DIGEST_FILE), digest_hex(&json).as_bytes())?;
        Ok(())
    }

    fn write_iteration_files(
        &self,
        case_dir: &Path,
        entry: &IterationEntry,
    ) -> Result<BTreeMap<String, String>> {
        let record = &entry.record;
        let id = record.artifact_id();
        let mut artifacts = BTreeMap::new();

        let visual_code = format!("code/{}_visual.py", id);
        fs::write(case_dir.join(&visual_code), &record.visual_code)?;
        artifacts.insert("visual_code".to_string(), visual_code);

        let data_code = format!("code/{}_data.py", id);
        fs::write(case_dir.join(&data_code), &record.data_code)?;
        artifacts.insert("data_code".to_string(), data_code);

        if !record.feedback_text.is_empty() {
            let feedback = format!("feedback/{}.txt", id);
            fs::write(case_dir.join(&feedback), &record.feedback_text)?;
            artifacts.insert("feedback".to_string(), feedback);
        }

        let visual_state = format!("states/{}_visual.json", id);
        fs::write(
            case_dir.join(&visual_state),
            serde_json::to_vec_pretty(&entry.visual)?,
        )?;
        artifacts.insert("visual_state".to_string(), visual_state);

        let data_state = format!("states/{}_data.json", id);
        fs::write(
            case_dir.join(&data_state),
            serde_json::to_vec_pretty(&entry.data)?,
        )?;
        artifacts.insert("data_state".to_string(), data_state);

        if let Some(sample) = &record.data_sample {
            let data = format!("data/{}.json", id);
            fs::write(case_dir.join(&data), serde_json::to_vec_pretty(sample)?)?;
            artifacts.insert("data_sample".to_string(), data);
        }

        if let Some(work_dir) = &record.outcome.work_dir {
            let out_rel = format!("outputs/{}", id);
            let out_dir = case_dir.join(&out_rel);
            for file in &record.outcome.produced_files {
                let src = work_dir.join(file);
                if !src.is_file() {
                    debug!(file = %file, "produced file vanished before archiving");
                    continue;
                }
                let dest = out_dir.join(file);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                match fs::copy(&src, &dest) {
                    Ok(_) => {
                        artifacts.insert(format!("output:{}", file), format!("{}/{}", out_rel, file));
                    }
                    Err(e) => warn!(file = %file, error = %e, "failed to archive produced file"),
                }
            }
        }

        Ok(artifacts)
    }
}

/// Write via a temp file in the same directory, then rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl CaseArchive for FsCaseArchive {
    async fn create_case(&self, case: &CaseDescriptor) -> Result<()> {
        let dir = self.case_dir(&case.case_id);
        if dir.join(METADATA_FILE).exists() {
            return Err(StateError::CaseExists(case.case_id.clone()));
        }
        for sub in SUBDIRS {
            fs::create_dir_all(dir.join(sub))?;
        }
        self.write_metadata(&CaseMetadata::new(case.clone()))
    }

    async fn record_iteration(&self, case_id: &str, entry: &IterationEntry) -> Result<()> {
        let mut meta = self.read_metadata(case_id)?;
        if meta.finalized_at.is_some() {
            return Err(StateError::AlreadyFinalized(case_id.to_string()));
        }
        let expected = meta.next_index();
        if entry.record.index != expected {
            return Err(StateError::OutOfOrder {
                case_id: case_id.to_string(),
                expected,
                actual: entry.record.index,
            });
        }

        let artifacts = self.write_iteration_files(&self.case_dir(case_id), entry)?;
        meta.iterations
            .push(IterationMetadata::from_entry(entry, artifacts));
        self.write_metadata(&meta)
    }

    async fn finalize_case(&self, case_id: &str, summary: &CaseSummary) -> Result<String> {
        let mut meta = self.read_metadata(case_id)?;
        meta.summary = Some(summary.clone());
        meta.finalized_at = Some(Utc::now());
        self.write_metadata(&meta)?;

        let report = render_evolution_report(&meta);
        fs::write(self.report_path(case_id), &report)?;
        Ok(report)
    }

    async fn load_case(&self, case_id: &str) -> Result<CaseMetadata> {
        self.read_metadata(case_id)
    }

    async fn list_cases(&self) -> Result<Vec<CaseListing>> {
        let mut cases = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let case_id = entry.file_name().to_string_lossy().into_owned();
            match self.read_metadata(&case_id) {
                Ok(meta) => cases.push(CaseListing::from(&meta)),
                Err(StateError::CaseNotFound(_)) => {}
                Err(e) => warn!(case_id = %case_id, error = %e, "skipping unreadable case"),
            }
        }
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(cases)
    }
}
