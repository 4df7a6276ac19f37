//! Top-level case state machine.
//!
//! ```text
//! CriticTurn(1) ─► … ─► CriticTurn(t) ──approved or t == max──► AwaitingUserFeedback
//!                                                                   │
//!                               satisfied ◄─────────────────────────┤
//!                                   │                               │ feedback
//!                                   ▼                               ▼
//!                               Finalized ◄── PostUserCritic ◄── (critic reviews?)
//! ```
//!
//! The orchestrator owns the visual/data state pair, the turn counter and
//! the iteration log. Each step finishes before the next one starts.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use evoloop_state::{
    Actor, CaseArchive, CaseDescriptor, CaseSummary, CriticVerdict, ExecutionOutcome,
    IterationDraft, IterationEntry, IterationLog, IterationRecord, Subject, VersionedState,
};

use crate::config::EngineConfig;
use crate::critic::{CriticEvaluator, EvaluationContext};
use crate::data::{DataSource, Dataset, DateWindow};
use crate::error::{EvoError, Result};
use crate::evolver::{evolve, EvolutionEvent, EvolutionSource};
use crate::executor::Executor;
use crate::feedback::{FeedbackAnalysis, FeedbackAnalyzer};
use crate::metrics::METRICS;
use crate::obs;
use crate::producer::{CodeProducer, ProductionSpec};
use crate::regeneration::{RegenerationController, RegenerationOutcome};

/// Where a case is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    CriticTurn(u32),
    AwaitingUserFeedback,
    PostUserCritic,
    Finalized,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::CriticTurn(t) => write!(f, "critic_turn({})", t),
            OrchestratorState::AwaitingUserFeedback => f.write_str("awaiting_user_feedback"),
            OrchestratorState::PostUserCritic => f.write_str("post_user_critic"),
            OrchestratorState::Finalized => f.write_str("finalized"),
        }
    }
}

/// Producer, executor, critic and data source for one case, chosen once at
/// configuration time.
#[derive(Clone)]
pub struct Collaborators {
    pub producer: Arc<dyn CodeProducer>,
    pub executor: Arc<dyn Executor>,
    pub critic: Arc<dyn CriticEvaluator>,
    pub data_source: Arc<dyn DataSource>,
}

/// Decides whether user feedback means "no further changes".
pub trait SatisfactionPolicy: Send + Sync {
    fn is_satisfied(&self, feedback: &str) -> bool;
}

impl<F> SatisfactionPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_satisfied(&self, feedback: &str) -> bool {
        self(feedback)
    }
}

const AFFIRMATIVE_REPLIES: &[&str] = &[
    "ok",
    "okay",
    "yes",
    "y",
    "done",
    "lgtm",
    "fine",
    "good",
    "great",
    "perfect",
    "looks good",
    "looks great",
    "all good",
    "ship it",
    "approve",
    "approved",
    "satisfied",
    "no changes",
    "no further changes",
    "nothing",
    "none",
];

/// Empty input, or a reply that is exactly one of a fixed set of
/// affirmative phrases (case and trailing punctuation ignored).
#[derive(Debug, Clone, Copy, Default)]
pub struct AffirmativeSatisfaction;

impl SatisfactionPolicy for AffirmativeSatisfaction {
    fn is_satisfied(&self, feedback: &str) -> bool {
        let normalized = feedback
            .trim()
            .trim_end_matches(['.', '!'])
            .trim()
            .to_lowercase();
        normalized.is_empty() || AFFIRMATIVE_REPLIES.contains(&normalized.as_str())
    }
}

/// Approval only stands when the run succeeded and the score clears the
/// threshold.
pub fn enforce_approval(
    mut verdict: CriticVerdict,
    outcome: &ExecutionOutcome,
    threshold: f64,
) -> CriticVerdict {
    if !verdict.quality_score.is_finite() {
        verdict.quality_score = 0.0;
    }
    if verdict.approved && !(outcome.succeeded && verdict.quality_score >= threshold) {
        warn!(
            succeeded = outcome.succeeded,
            quality_score = verdict.quality_score,
            threshold = threshold,
            "critic approval overridden"
        );
        verdict.approved = false;
    }
    verdict
}

/// JSON form of the data sample attached to every record; `None` (with a
/// warning) when it cannot be serialized.
fn sample_value<T: Serialize>(sample: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(sample) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "failed to serialize data sample");
            None
        }
    }
}

#[derive(Debug, Clone)]
struct TurnArtifacts {
    visual_code: String,
    data_code: String,
    outcome: ExecutionOutcome,
}

/// Drives one case from the first critic turn to `Finalized`.
pub struct EvolutionOrchestrator {
    config: EngineConfig,
    case: CaseDescriptor,
    collaborators: Collaborators,
    archive: Arc<dyn CaseArchive>,
    satisfaction: Arc<dyn SatisfactionPolicy>,
    analyzer: FeedbackAnalyzer,
    window: Option<DateWindow>,
    working_dir: PathBuf,

    state: OrchestratorState,
    started: bool,
    visual: VersionedState,
    data: VersionedState,
    log: IterationLog,
    evolutions: Vec<EvolutionEvent>,
    analyses: Vec<FeedbackAnalysis>,
    critic_feedback: Vec<String>,
    user_feedback: Option<String>,
    dataset: Dataset,
    data_sample: Option<serde_json::Value>,
    last_turn: Option<TurnArtifacts>,
    critic_turns_used: u32,
    approved: bool,
    report: Option<String>,
    started_at: Instant,
}

impl EvolutionOrchestrator {
    /// Validates `config`; an invalid configuration never creates a case.
    pub fn new(
        config: EngineConfig,
        case: CaseDescriptor,
        collaborators: Collaborators,
        archive: Arc<dyn CaseArchive>,
    ) -> Result<Self> {
        config.validate()?;
        if case.symbols.is_empty() {
            return Err(EvoError::InvalidConfig(
                "a case needs at least one symbol".to_string(),
            ));
        }
        let run_id = Uuid::new_v4().simple().to_string();
        let working_dir = config
            .executor
            .scratch_root
            .join(format!("{}_{}", case.case_id, &run_id[..8]));
        let visual = VersionedState::seeded(config.seed_visual.iter().map(String::as_str));
        let data = VersionedState::seeded(config.seed_data.iter().map(String::as_str));
        Ok(Self {
            config,
            case,
            collaborators,
            archive,
            satisfaction: Arc::new(AffirmativeSatisfaction),
            analyzer: FeedbackAnalyzer::new(),
            window: None,
            working_dir,
            state: OrchestratorState::CriticTurn(1),
            started: false,
            visual,
            data,
            log: IterationLog::new(),
            evolutions: Vec::new(),
            analyses: Vec::new(),
            critic_feedback: Vec::new(),
            user_feedback: None,
            dataset: Dataset::default(),
            data_sample: None,
            last_turn: None,
            critic_turns_used: 0,
            approved: false,
            report: None,
            started_at: Instant::now(),
        })
    }

    pub fn with_satisfaction(mut self, policy: Arc<dyn SatisfactionPolicy>) -> Self {
        self.satisfaction = policy;
        self
    }

    /// Data window; year-to-date when unset.
    pub fn with_window(mut self, window: DateWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Fetch the dataset and register the case with the archive.
    pub async fn start(&mut self) -> Result<()> {
        let span = obs::case_span(&self.case.case_id);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<()> {
        if self.started {
            return Err(EvoError::InvalidTransition(format!(
                "case {} already started",
                self.case.case_id
            )));
        }
        let window = self
            .window
            .unwrap_or_else(|| DateWindow::year_to_date(Utc::now().date_naive()));
        self.dataset = self
            .collaborators
            .data_source
            .fetch(&self.case.symbols, &window)
            .await?;
        debug!(
            source = self.collaborators.data_source.name(),
            rows = self.dataset.total_rows(),
            "dataset fetched"
        );
        self.data_sample = sample_value(&self.dataset.sample());

        self.archive.create_case(&self.case).await?;
        self.started = true;
        self.started_at = Instant::now();
        obs::emit_case_started(&self.case.case_id, &self.case.symbols, self.config.mock_mode);
        Ok(())
    }

    /// Advance by one state. User feedback is supplied through
    /// [`submit_user_feedback`](Self::submit_user_feedback) instead.
    pub async fn step(&mut self) -> Result<OrchestratorState> {
        let span = obs::case_span(&self.case.case_id);
        self.step_inner().instrument(span).await
    }

    async fn step_inner(&mut self) -> Result<OrchestratorState> {
        if !self.started {
            return Err(EvoError::InvalidTransition(format!(
                "case {} has not been started",
                self.case.case_id
            )));
        }
        match self.state {
            OrchestratorState::CriticTurn(turn) => self.run_critic_turn(turn).await,
            OrchestratorState::PostUserCritic => self.run_post_user_critic().await,
            state @ (OrchestratorState::AwaitingUserFeedback | OrchestratorState::Finalized) => {
                Err(EvoError::InvalidTransition(format!(
                    "no automatic step from {}",
                    state
                )))
            }
        }
    }

    /// Run critic turns until the loop hands over to the user.
    pub async fn run_critic_loop(&mut self) -> Result<OrchestratorState> {
        while matches!(self.state, OrchestratorState::CriticTurn(_)) {
            self.step().await?;
        }
        Ok(self.state)
    }

    /// Returns `PostUserCritic` when the critic reviews user feedback,
    /// otherwise `Finalized`.
    pub async fn submit_user_feedback(&mut self, feedback: &str) -> Result<OrchestratorState> {
        let span = obs::case_span(&self.case.case_id);
        self.submit_inner(feedback).instrument(span).await
    }

    async fn submit_inner(&mut self, feedback: &str) -> Result<OrchestratorState> {
        if self.state != OrchestratorState::AwaitingUserFeedback {
            return Err(EvoError::InvalidTransition(format!(
                "cannot accept user feedback in state {}",
                self.state
            )));
        }
        let satisfied = self.satisfaction.is_satisfied(feedback);
        obs::emit_user_feedback_received(
            &self.case.case_id,
            satisfied,
            feedback.chars().count(),
        );
        if satisfied {
            self.finalize().await;
            return Ok(self.state);
        }

        let last = self.last_turn.clone().ok_or_else(|| {
            EvoError::InvalidTransition("no critic turn to attach feedback to".to_string())
        })?;
        let text = feedback.trim().to_string();
        let (visual_version, data_version) = (self.visual.version(), self.data.version());
        for subject in Subject::ALL {
            self.apply_evolution(subject, &text, EvolutionSource::User);
        }
        self.user_feedback = Some(text.clone());
        self.analyses.push(self.analyzer.analyze(&text));

        let record = self
            .log
            .append(IterationDraft {
                actor: Actor::User,
                visual_version,
                data_version,
                visual_code: last.visual_code,
                data_code: last.data_code,
                outcome: last.outcome,
                feedback_text: text,
                verdict: None,
                data_sample: self.data_sample.clone(),
            })
            .clone();
        self.archive_record(record).await;

        if self.collaborators.critic.reviews_user_feedback() {
            self.state = OrchestratorState::PostUserCritic;
        } else {
            self.finalize().await;
        }
        Ok(self.state)
    }

    async fn run_critic_turn(&mut self, turn: u32) -> Result<OrchestratorState> {
        let (regen, data_code) = self.produce_turn().await;
        let verdict = self.judge(turn, Actor::Critic, &regen).await;
        METRICS.inc_critic_turns();
        self.critic_turns_used = turn;
        self.approved = verdict.approved;
        obs::emit_turn_completed(
            turn,
            regen.outcome.succeeded,
            verdict.approved,
            verdict.quality_score,
        );
        self.analyses.push(self.analyzer.analyze(&verdict.feedback_text));
        self.critic_feedback.push(verdict.feedback_text.clone());

        let record = self.append_turn(Actor::Critic, &regen, &data_code, &verdict);
        let failure = regen.outcome.failure_hint().map(str::to_string);
        self.last_turn = Some(TurnArtifacts {
            visual_code: regen.source,
            data_code,
            outcome: regen.outcome,
        });

        let next = if verdict.approved || turn >= self.config.max_critic_turns {
            OrchestratorState::AwaitingUserFeedback
        } else {
            if let Some(error) = failure {
                for subject in Subject::ALL {
                    self.apply_evolution(subject, &error, EvolutionSource::Error);
                }
            }
            for subject in Subject::ALL {
                self.apply_evolution(subject, &verdict.feedback_text, EvolutionSource::Critic);
            }
            OrchestratorState::CriticTurn(turn + 1)
        };
        // Snapshot pair reflects the state the next turn starts from.
        self.archive_record(record).await;
        self.state = next;
        Ok(next)
    }

    async fn run_post_user_critic(&mut self) -> Result<OrchestratorState> {
        let (regen, data_code) = self.produce_turn().await;
        let turn = self.critic_turns_used + 1;
        let verdict = self.judge(turn, Actor::CriticPostUser, &regen).await;
        METRICS.inc_critic_turns();
        self.approved = verdict.approved;
        obs::emit_turn_completed(
            turn,
            regen.outcome.succeeded,
            verdict.approved,
            verdict.quality_score,
        );
        self.analyses.push(self.analyzer.analyze(&verdict.feedback_text));

        let record = self.append_turn(Actor::CriticPostUser, &regen, &data_code, &verdict);
        self.last_turn = Some(TurnArtifacts {
            visual_code: regen.source,
            data_code,
            outcome: regen.outcome,
        });
        self.archive_record(record).await;
        self.finalize().await;
        Ok(self.state)
    }

    /// Visual script through the regeneration controller; data script
    /// produced alongside for the archive.
    async fn produce_turn(&self) -> (RegenerationOutcome, String) {
        let depth = self.config.critic_context_depth;
        let recent = &self.critic_feedback[self.critic_feedback.len().saturating_sub(depth)..];
        let spec = ProductionSpec {
            subject: Subject::Visual,
            state: &self.visual,
            companion: &self.data,
            symbols: &self.case.symbols,
            dataset: &self.dataset,
            repair_hint: None,
            critic_feedback: recent,
            user_feedback: self.user_feedback.as_deref(),
        };
        let controller = RegenerationController::new(
            self.collaborators.producer.as_ref(),
            self.collaborators.executor.as_ref(),
            self.config.max_regen_attempts,
            self.config.execution_timeout(),
        );
        let regen = controller.run(&spec, &self.working_dir).await;

        let data_code = match self
            .collaborators
            .producer
            .produce(&spec.for_subject(Subject::Data))
            .await
        {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "data script generation failed");
                String::new()
            }
        };
        (regen, data_code)
    }

    async fn judge(&self, turn: u32, actor: Actor, regen: &RegenerationOutcome) -> CriticVerdict {
        let context = EvaluationContext {
            turn,
            max_turns: self.config.max_critic_turns,
            actor,
            visual: &self.visual,
            data: &self.data,
            symbols: &self.case.symbols,
            max_attempts: self.config.max_regen_attempts,
            user_feedback: self.user_feedback.as_deref(),
        };
        let verdict = self
            .collaborators
            .critic
            .evaluate(&regen.source, &regen.outcome, &context)
            .await;
        enforce_approval(verdict, &regen.outcome, self.config.quality_threshold)
    }

    fn append_turn(
        &mut self,
        actor: Actor,
        regen: &RegenerationOutcome,
        data_code: &str,
        verdict: &CriticVerdict,
    ) -> IterationRecord {
        self.log
            .append(IterationDraft {
                actor,
                visual_version: self.visual.version(),
                data_version: self.data.version(),
                visual_code: regen.source.clone(),
                data_code: data_code.to_string(),
                outcome: regen.outcome.clone(),
                feedback_text: verdict.feedback_text.clone(),
                verdict: Some(verdict.clone()),
                data_sample: self.data_sample.clone(),
            })
            .clone()
    }

    fn apply_evolution(&mut self, subject: Subject, text: &str, source: EvolutionSource) {
        let before = match subject {
            Subject::Visual => &self.visual,
            Subject::Data => &self.data,
        };
        let evolution = evolve(subject, before, text, source);
        if !evolution.bumped {
            return;
        }
        let event = EvolutionEvent::new(subject, source, before, &evolution, text);
        obs::emit_evolution_applied(
            subject.as_str(),
            source.as_str(),
            event.from_version,
            event.to_version,
            &event.activated,
        );
        METRICS.inc_evolutions();
        self.evolutions.push(event);
        match subject {
            Subject::Visual => self.visual = evolution.state,
            Subject::Data => self.data = evolution.state,
        }
    }

    async fn archive_record(&self, record: IterationRecord) {
        let entry = IterationEntry {
            record,
            visual: self.visual.clone(),
            data: self.data.clone(),
        };
        if let Err(e) = self
            .archive
            .record_iteration(&self.case.case_id, &entry)
            .await
        {
            obs::emit_archive_error(&self.case.case_id, "record_iteration", &e);
        }
    }

    async fn finalize(&mut self) {
        let summary = self.summary();
        match self.archive.finalize_case(&self.case.case_id, &summary).await {
            Ok(report) => self.report = Some(report),
            Err(e) => obs::emit_archive_error(&self.case.case_id, "finalize_case", &e),
        }
        self.state = OrchestratorState::Finalized;
        match tokio::fs::remove_dir_all(&self.working_dir).await {
            Ok(()) => debug!(dir = %self.working_dir.display(), "scratch directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.working_dir.display(), error = %e, "failed to remove scratch directory"),
        }
        obs::emit_case_finalized(
            &self.case.case_id,
            self.log.len(),
            self.approved,
            self.started_at.elapsed().as_millis() as u64,
        );
        METRICS.flush();
    }

    /// Summary handed to the archive at finalization.
    pub fn summary(&self) -> CaseSummary {
        CaseSummary {
            total_iterations: self.log.len(),
            critic_turns_used: self.critic_turns_used,
            approved: self.approved,
            final_visual_version: self.visual.version(),
            final_data_version: self.data.version(),
            visual_capabilities: self.visual.capability_names(),
            data_capabilities: self.data.capability_names(),
            total_improvements: self.evolutions.len(),
            trends: self.analyzer.trends(&self.analyses),
            improvement_plan: self.analyzer.improvement_plan(&self.analyses),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn case_id(&self) -> &str {
        &self.case.case_id
    }

    pub fn case(&self) -> &CaseDescriptor {
        &self.case
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn records(&self) -> &[IterationRecord] {
        self.log.records()
    }

    pub fn log(&self) -> &IterationLog {
        &self.log
    }

    pub fn visual(&self) -> &VersionedState {
        &self.visual
    }

    pub fn data(&self) -> &VersionedState {
        &self.data
    }

    pub fn evolutions(&self) -> &[EvolutionEvent] {
        &self.evolutions
    }

    pub fn analyses(&self) -> &[FeedbackAnalysis] {
        &self.analyses
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.working_dir
    }

    /// Whether the most recent critic pass approved.
    pub fn approved(&self) -> bool {
        self.approved
    }

    pub fn critic_turns_used(&self) -> u32 {
        self.critic_turns_used
    }

    /// Evolution report synthesised by the archive, once finalized.
    pub fn report(&self) -> Option<&str> {
        self.report.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmative_replies_are_satisfied() {
        let policy = AffirmativeSatisfaction;
        for text in ["", "   ", "OK", "Looks good!", "lgtm.", "No changes"] {
            assert!(policy.is_satisfied(text), "{:?}", text);
        }
        for text in ["add moving averages", "looks good but add RSI", "no"] {
            assert!(!policy.is_satisfied(text), "{:?}", text);
        }
    }

    #[test]
    fn closures_are_policies() {
        let policy: Arc<dyn SatisfactionPolicy> = Arc::new(|t: &str| t == "ship");
        assert!(policy.is_satisfied("ship"));
        assert!(!policy.is_satisfied(""));
    }

    #[test]
    fn approval_requires_success_and_threshold() {
        let approved = CriticVerdict::new(true, 0.9, "APPROVED");
        let failed = ExecutionOutcome::failed("boom");
        assert!(!enforce_approval(approved.clone(), &failed, 0.7).approved);
        assert!(enforce_approval(approved.clone(), &ExecutionOutcome::success(), 0.7).approved);

        let weak = CriticVerdict::new(true, 0.5, "APPROVED");
        assert!(!enforce_approval(weak, &ExecutionOutcome::success(), 0.7).approved);

        let nan = CriticVerdict::new(true, f64::NAN, "APPROVED");
        let v = enforce_approval(nan, &ExecutionOutcome::success(), 0.0);
        assert_eq!(v.quality_score, 0.0);
        assert!(v.approved);
    }

    #[test]
    fn unserializable_sample_is_dropped() {
        let mut bad = std::collections::BTreeMap::new();
        bad.insert((1u8, 2u8), "tuple keys are not JSON object keys");
        assert!(sample_value(&bad).is_none());
        let good = sample_value(&Dataset::default().sample()).unwrap();
        assert_eq!(good["rows"], 0);
    }

    #[test]
    fn state_display_is_snake_case() {
        assert_eq!(OrchestratorState::CriticTurn(2).to_string(), "critic_turn(2)");
        assert_eq!(
            OrchestratorState::AwaitingUserFeedback.to_string(),
            "awaiting_user_feedback"
        );
    }
}
