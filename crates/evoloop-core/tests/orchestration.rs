//! Orchestrator state machine tests with deterministic collaborators.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use evoloop_core::{
    CaseManager, CodeProducer, Collaborators, CriticEvaluator, DateWindow, EngineConfig,
    EvaluationContext, EvoError, EvolutionOrchestrator, EvolutionSource, Executor,
    OrchestratorState, ProductionSpec, Result, SyntheticDataSource, TemplateCritic,
};
use evoloop_state::{
    is_gapless, Actor, CaseArchive, CaseDescriptor, CriticVerdict, ExecutionOutcome,
    MemoryCaseArchive,
};

// -------------------------------------------------------------------------
// Stubs
// -------------------------------------------------------------------------

/// Emits a script naming the visual version and capabilities.
struct EchoProducer;

#[async_trait]
impl CodeProducer for EchoProducer {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn produce(&self, spec: &ProductionSpec<'_>) -> Result<String> {
        Ok(format!(
            "{} v{} {}",
            spec.subject,
            spec.state.version(),
            spec.state.capability_names().join(",")
        ))
    }
}

struct BrokenProducer;

#[async_trait]
impl CodeProducer for BrokenProducer {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn produce(&self, _spec: &ProductionSpec<'_>) -> Result<String> {
        Err(EvoError::Generation("backend unavailable".to_string()))
    }
}

struct StubExecutor {
    error: Option<&'static str>,
    runs: AtomicU32,
}

impl StubExecutor {
    fn ok() -> Self {
        Self {
            error: None,
            runs: AtomicU32::new(0),
        }
    }

    fn failing(error: &'static str) -> Self {
        Self {
            error: Some(error),
            runs: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn run(&self, _source: &str, _dir: &Path, _timeout: Duration) -> ExecutionOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.error {
            None => ExecutionOutcome::success(),
            Some(e) => ExecutionOutcome::failed(e),
        }
    }
}

/// Always claims approval with a fixed score.
struct YesCritic {
    score: f64,
    reviews: bool,
}

#[async_trait]
impl CriticEvaluator for YesCritic {
    fn name(&self) -> &'static str {
        "yes"
    }

    async fn evaluate(
        &self,
        _code: &str,
        _outcome: &ExecutionOutcome,
        _context: &EvaluationContext<'_>,
    ) -> CriticVerdict {
        CriticVerdict::new(true, self.score, "APPROVED, add volume")
    }

    fn reviews_user_feedback(&self) -> bool {
        self.reviews
    }
}

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn window() -> DateWindow {
    DateWindow::new(
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(),
    )
    .unwrap()
}

fn config(turns: u32, attempts: u32, scratch: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        max_critic_turns: turns,
        max_regen_attempts: attempts,
        execution_timeout_secs: 5,
        ..EngineConfig::default()
    };
    config.executor.scratch_root = scratch.to_path_buf();
    config
}

fn collaborators(
    producer: Arc<dyn CodeProducer>,
    executor: Arc<dyn Executor>,
    critic: Arc<dyn CriticEvaluator>,
) -> Collaborators {
    Collaborators {
        producer,
        executor,
        critic,
        data_source: Arc::new(SyntheticDataSource::new()),
    }
}

fn descriptor(id: &str) -> CaseDescriptor {
    CaseDescriptor {
        case_id: id.to_string(),
        name: "test".to_string(),
        symbols: vec!["NVDA".to_string(), "TSLA".to_string()],
        created_at: Utc::now(),
    }
}

async fn started(
    id: &str,
    config: EngineConfig,
    collaborators: Collaborators,
    archive: Arc<MemoryCaseArchive>,
) -> EvolutionOrchestrator {
    let mut orch = EvolutionOrchestrator::new(config, descriptor(id), collaborators, archive)
        .unwrap()
        .with_window(window());
    orch.start().await.unwrap();
    orch
}

// -------------------------------------------------------------------------
// Scenarios
// -------------------------------------------------------------------------

#[tokio::test]
async fn critic_approving_on_turn_two_hands_over_after_two_records() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let mut orch = started(
        "scenario_a",
        config(3, 2, scratch.path()),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(TemplateCritic::new(2)),
        ),
        archive.clone(),
    )
    .await;

    let state = orch.run_critic_loop().await.unwrap();
    assert_eq!(state, OrchestratorState::AwaitingUserFeedback);

    let records = orch.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.actor == Actor::Critic));
    assert!(!records[0].verdict.as_ref().unwrap().approved);
    assert!(records[1].verdict.as_ref().unwrap().approved);

    // First critic feedback asked for moving averages.
    assert_eq!(records[1].visual_version, 2);
    assert!(records[1].visual_code.contains("moving_avg"));
    assert!(orch.visual().contains("moving_avg"));
    assert!(orch.data().contains("moving_avg"));
    assert_eq!(archive.entries("scenario_a").len(), 2);
}

#[tokio::test]
async fn user_request_activates_capability_and_bumps_once() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let mut orch = started(
        "scenario_b",
        config(3, 1, scratch.path()),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(TemplateCritic::new(1)),
        ),
        archive.clone(),
    )
    .await;
    orch.run_critic_loop().await.unwrap();
    assert_eq!(orch.visual().version(), 1);
    assert!(orch.visual().active_capabilities().is_empty());

    let state = orch.submit_user_feedback("add moving averages").await.unwrap();
    assert_eq!(state, OrchestratorState::Finalized);

    assert_eq!(orch.visual().version(), 2);
    assert_eq!(orch.visual().capability_names(), vec!["moving_avg"]);

    let user = &orch.records()[1];
    assert_eq!(user.actor, Actor::User);
    assert_eq!(user.visual_version, 1);
    assert!(user.verdict.is_none());
    assert_eq!(user.feedback_text, "add moving averages");

    let event = orch.evolutions().last().unwrap();
    assert_eq!(event.source, EvolutionSource::User);
    assert_eq!(event.to_version, event.from_version + 1);

    assert!(archive.is_finalized("scenario_b"));
    let entries = archive.entries("scenario_b");
    assert_eq!(entries[1].visual.version(), 2);
}

#[tokio::test]
async fn always_failing_collaborators_still_finalize_within_bounds() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let executor = Arc::new(StubExecutor::ok());
    let mut orch = started(
        "bounded",
        config(3, 2, scratch.path()),
        collaborators(
            Arc::new(BrokenProducer),
            executor.clone(),
            Arc::new(YesCritic {
                score: 1.0,
                reviews: true,
            }),
        ),
        archive.clone(),
    )
    .await;

    let state = orch.run_critic_loop().await.unwrap();
    assert_eq!(state, OrchestratorState::AwaitingUserFeedback);
    assert_eq!(orch.records().len(), 3);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
    for record in orch.records() {
        assert!(!record.outcome.succeeded);
        assert_eq!(record.outcome.attempts_used, 2);
        assert!(!record.verdict.as_ref().unwrap().approved);
    }

    let state = orch.submit_user_feedback("add rsi please").await.unwrap();
    assert_eq!(state, OrchestratorState::PostUserCritic);
    let state = orch.step().await.unwrap();
    assert_eq!(state, OrchestratorState::Finalized);

    let records = orch.records();
    assert_eq!(records.len(), 3 + 2);
    assert_eq!(records[3].actor, Actor::User);
    assert_eq!(records[4].actor, Actor::CriticPostUser);
    assert!(is_gapless(records.iter().map(|r| r.index)));
    assert!(!orch.approved());

    let stored: Vec<u32> = archive
        .entries("bounded")
        .iter()
        .map(|e| e.record.index)
        .collect();
    assert_eq!(stored, vec![1, 2, 3, 4, 5]);
    assert!(matches!(
        orch.step().await,
        Err(EvoError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn approval_on_failed_execution_is_overridden() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let mut orch = started(
        "override",
        config(2, 1, scratch.path()),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::failing("KeyError: 'Close'")),
            Arc::new(YesCritic {
                score: 1.0,
                reviews: false,
            }),
        ),
        archive,
    )
    .await;

    orch.run_critic_loop().await.unwrap();
    // Both turns ran: the claimed approval never counted.
    assert_eq!(orch.records().len(), 2);
    assert!(orch
        .records()
        .iter()
        .all(|r| !r.verdict.as_ref().unwrap().approved));
    assert!(!orch.approved());

    // The failure text drove the defensive capability.
    assert!(orch.visual().contains("safe_column_access"));
    assert!(orch
        .evolutions()
        .iter()
        .any(|e| e.source == EvolutionSource::Error));
}

#[tokio::test]
async fn approval_below_threshold_does_not_count() {
    let scratch = tempfile::tempdir().unwrap();
    let mut cfg = config(2, 1, scratch.path());
    cfg.quality_threshold = 0.8;
    let mut orch = started(
        "threshold",
        cfg,
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(YesCritic {
                score: 0.6,
                reviews: false,
            }),
        ),
        Arc::new(MemoryCaseArchive::new()),
    )
    .await;
    orch.run_critic_loop().await.unwrap();
    assert_eq!(orch.records().len(), 2);
    assert_eq!(orch.critic_turns_used(), 2);
}

#[tokio::test]
async fn versions_never_decrease_across_a_case() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let mut orch = started(
        "monotonic",
        config(3, 1, scratch.path()),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(TemplateCritic::new(3)),
        ),
        archive.clone(),
    )
    .await;
    orch.run_critic_loop().await.unwrap();
    orch.submit_user_feedback("annotate the peaks and show volatility")
        .await
        .unwrap();

    let entries = archive.entries("monotonic");
    assert_eq!(entries.len(), 4);
    for pair in entries.windows(2) {
        assert!(pair[1].visual.descends_from(&pair[0].visual));
        assert!(pair[1].data.descends_from(&pair[0].data));
    }
    for pair in orch.evolutions().windows(2) {
        if pair[0].subject == pair[1].subject {
            assert_eq!(pair[1].from_version, pair[0].to_version);
        }
    }
    assert!(orch.visual().contains("annotate"));
    assert!(orch.visual().contains("peaks"));
    assert!(orch.data().contains("volatility"));
    assert!(orch.data().contains("volume"));
}

#[tokio::test]
async fn satisfied_feedback_finalizes_without_a_user_record() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let mut orch = started(
        "satisfied",
        config(1, 1, scratch.path()),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(TemplateCritic::new(1)),
        ),
        archive.clone(),
    )
    .await;
    orch.run_critic_loop().await.unwrap();
    let state = orch.submit_user_feedback("  Looks good! ").await.unwrap();
    assert_eq!(state, OrchestratorState::Finalized);
    assert_eq!(orch.records().len(), 1);

    let summary = orch.summary();
    assert!(summary.approved);
    assert_eq!(summary.total_iterations, 1);
    assert!(archive.is_finalized("satisfied"));
    assert!(orch
        .report()
        .unwrap()
        .starts_with("# Code Evolution Report"));
}

#[tokio::test]
async fn out_of_order_calls_are_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let mut orch = EvolutionOrchestrator::new(
        config(2, 1, scratch.path()),
        descriptor("order"),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(TemplateCritic::new(1)),
        ),
        Arc::new(MemoryCaseArchive::new()),
    )
    .unwrap()
    .with_window(window());

    assert!(matches!(
        orch.step().await,
        Err(EvoError::InvalidTransition(_))
    ));
    orch.start().await.unwrap();
    assert!(matches!(
        orch.submit_user_feedback("add rsi").await,
        Err(EvoError::InvalidTransition(_))
    ));
    assert!(matches!(
        orch.start().await,
        Err(EvoError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn invalid_config_never_creates_a_case() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let result = EvolutionOrchestrator::new(
        config(3, 0, scratch.path()),
        descriptor("invalid"),
        collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(TemplateCritic::default()),
        ),
        archive.clone(),
    );
    assert!(matches!(result, Err(EvoError::InvalidConfig(_))));
    assert!(archive.list_cases().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_case_id_is_fatal_at_start() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let make = || {
        EvolutionOrchestrator::new(
            config(1, 1, scratch.path()),
            descriptor("dup"),
            collaborators(
                Arc::new(EchoProducer),
                Arc::new(StubExecutor::ok()),
                Arc::new(TemplateCritic::new(1)),
            ),
            archive.clone(),
        )
        .unwrap()
        .with_window(window())
    };
    make().start().await.unwrap();
    assert!(matches!(
        make().start().await,
        Err(EvoError::CaseExists(_))
    ));
}

// -------------------------------------------------------------------------
// CaseManager
// -------------------------------------------------------------------------

#[tokio::test]
async fn manager_runs_case_to_finalized_and_reset_keeps_archive() {
    let scratch = tempfile::tempdir().unwrap();
    let archive = Arc::new(MemoryCaseArchive::new());
    let mut manager = CaseManager::new(config(3, 2, scratch.path()), archive.clone())
        .with_window(window())
        .with_collaborators(collaborators(
            Arc::new(EchoProducer),
            Arc::new(StubExecutor::ok()),
            Arc::new(YesCritic {
                score: 0.9,
                reviews: true,
            }),
        ));

    let symbols = vec!["NVDA".to_string()];
    let id = manager.start_case("ytd", &symbols).await.unwrap();
    assert!(id.starts_with("ytd_NVDA_"));
    assert_eq!(
        manager.state(&id),
        Some(OrchestratorState::AwaitingUserFeedback)
    );

    let state = manager
        .submit_user_feedback(&id, "add rsi")
        .await
        .unwrap();
    assert_eq!(state, OrchestratorState::Finalized);
    let orch = manager.orchestrator(&id).unwrap();
    let actors: Vec<Actor> = orch.records().iter().map(|r| r.actor).collect();
    assert_eq!(actors, vec![Actor::Critic, Actor::User, Actor::CriticPostUser]);
    assert!(orch.data().contains("rsi"));

    manager.reset_case(&id).unwrap();
    assert!(manager.state(&id).is_none());
    assert!(matches!(
        manager.submit_user_feedback(&id, "more").await,
        Err(EvoError::CaseNotFound(_))
    ));
    let stored = archive.load_case(&id).await.unwrap();
    assert_eq!(stored.iterations.len(), 3);
    assert!(stored.summary.is_some());
}
