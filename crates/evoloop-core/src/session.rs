//! In-process control surface: start, feed back, reset cases by id.
//!
//! Each case is an independent [`EvolutionOrchestrator`]. Resetting a case
//! drops it from memory; archived records stay where they are.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::info;

use evoloop_state::{CaseArchive, CaseDescriptor};

use crate::config::{EngineConfig, GenerationConfig};
use crate::critic::{GenerativeCritic, TemplateCritic};
use crate::data::{DataSource, DateWindow, SyntheticDataSource};
use crate::error::{EvoError, Result};
use crate::executor::ProcessExecutor;
use crate::llm::TextGenerator;
use crate::orchestrator::{
    AffirmativeSatisfaction, Collaborators, EvolutionOrchestrator, OrchestratorState,
    SatisfactionPolicy,
};
use crate::producer::{GenerativeProducer, TemplateProducer};

fn embedded_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{8}").expect("valid regex"))
}

/// `<name>_<SYMBOLS>_<YYYYMMDD>_<HHMMSS>`; only the time is appended when
/// the name already carries an 8-digit date.
pub fn case_id(name: &str, symbols: &[String], now: DateTime<Utc>) -> String {
    let mut clean: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean.is_empty() {
        clean = "case".to_string();
    }
    let symbols = symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .collect::<Vec<_>>()
        .join("-");
    if embedded_date().is_match(&clean) {
        format!("{}_{}_{}", clean, symbols, now.format("%H%M%S"))
    } else {
        format!("{}_{}_{}", clean, symbols, now.format("%Y%m%d_%H%M%S"))
    }
}

/// Split a comma/space separated symbol list, uppercase, drop duplicates.
pub fn parse_symbols(input: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for sym in input
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
    {
        if !out.contains(&sym) {
            out.push(sym);
        }
    }
    out
}

/// Cases keyed by id, each with its own orchestrator.
pub struct CaseManager {
    config: EngineConfig,
    archive: Arc<dyn CaseArchive>,
    data_source: Arc<dyn DataSource>,
    generation: Option<(Arc<dyn TextGenerator>, GenerationConfig)>,
    collaborators: Option<Collaborators>,
    satisfaction: Arc<dyn SatisfactionPolicy>,
    window: Option<DateWindow>,
    cases: HashMap<String, EvolutionOrchestrator>,
}

impl CaseManager {
    pub fn new(config: EngineConfig, archive: Arc<dyn CaseArchive>) -> Self {
        Self {
            config,
            archive,
            data_source: Arc::new(SyntheticDataSource::new()),
            generation: None,
            collaborators: None,
            satisfaction: Arc::new(AffirmativeSatisfaction),
            window: None,
            cases: HashMap::new(),
        }
    }

    /// Backend for generative mode (`mock_mode = false`).
    pub fn with_generator(
        mut self,
        generator: Arc<dyn TextGenerator>,
        config: GenerationConfig,
    ) -> Self {
        self.generation = Some((generator, config));
        self
    }

    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_source = source;
        self
    }

    /// Use these collaborators for every case instead of deriving them from
    /// `mock_mode`.
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn with_satisfaction(mut self, policy: Arc<dyn SatisfactionPolicy>) -> Self {
        self.satisfaction = policy;
        self
    }

    pub fn with_window(mut self, window: DateWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn archive(&self) -> &Arc<dyn CaseArchive> {
        &self.archive
    }

    /// Template variants in mock mode, generative variants otherwise.
    pub fn collaborators_for(&self, config: &EngineConfig) -> Result<Collaborators> {
        if let Some(fixed) = &self.collaborators {
            return Ok(fixed.clone());
        }
        let executor = Arc::new(ProcessExecutor::new(
            &config.executor,
            config.stderr_tail_chars,
        ));
        if config.mock_mode {
            return Ok(Collaborators {
                producer: Arc::new(TemplateProducer::new()),
                executor,
                critic: Arc::new(TemplateCritic::default()),
                data_source: self.data_source.clone(),
            });
        }

        let (generator, generation) = self.generation.as_ref().ok_or_else(|| {
            EvoError::InvalidConfig(
                "generative mode requires a text-generation backend".to_string(),
            )
        })?;
        generation.validate()?;
        let writer = generation.writer_model().unwrap_or_default().to_string();
        let judge = generation.critic_model().unwrap_or_default().to_string();
        Ok(Collaborators {
            producer: Arc::new(GenerativeProducer::new(generator.clone(), writer)),
            executor,
            critic: Arc::new(GenerativeCritic::new(generator.clone(), judge)),
            data_source: self.data_source.clone(),
        })
    }

    /// Start a case with the manager's configuration and run its critic loop.
    pub async fn start_case(&mut self, name: &str, symbols: &[String]) -> Result<String> {
        let config = self.config.clone();
        self.start_case_with(name, symbols, config).await
    }

    /// Start a case with its own configuration and run its critic loop.
    /// Returns the case id once the case awaits user feedback.
    pub async fn start_case_with(
        &mut self,
        name: &str,
        symbols: &[String],
        config: EngineConfig,
    ) -> Result<String> {
        config.validate()?;
        let now = Utc::now();
        let id = case_id(name, symbols, now);
        if self.cases.contains_key(&id) {
            return Err(EvoError::CaseExists(id));
        }
        let collaborators = self.collaborators_for(&config)?;
        let descriptor = CaseDescriptor {
            case_id: id.clone(),
            name: name.to_string(),
            symbols: symbols.to_vec(),
            created_at: now,
        };
        let mut orchestrator =
            EvolutionOrchestrator::new(config, descriptor, collaborators, self.archive.clone())?
                .with_satisfaction(self.satisfaction.clone());
        if let Some(window) = self.window {
            orchestrator = orchestrator.with_window(window);
        }

        orchestrator.start().await?;
        orchestrator.run_critic_loop().await?;
        self.cases.insert(id.clone(), orchestrator);
        Ok(id)
    }

    /// Apply user feedback and drive the case to its next resting state,
    /// which is always `Finalized`.
    pub async fn submit_user_feedback(
        &mut self,
        case_id: &str,
        feedback: &str,
    ) -> Result<OrchestratorState> {
        let orchestrator = self
            .cases
            .get_mut(case_id)
            .ok_or_else(|| EvoError::CaseNotFound(case_id.to_string()))?;
        let mut state = orchestrator.submit_user_feedback(feedback).await?;
        while state == OrchestratorState::PostUserCritic {
            state = orchestrator.step().await?;
        }
        Ok(state)
    }

    /// Forget the in-memory case. Persisted records are untouched.
    pub fn reset_case(&mut self, case_id: &str) -> Result<()> {
        match self.cases.remove(case_id) {
            Some(orchestrator) => {
                info!(case_id = %case_id, state = %orchestrator.state(), "case reset");
                Ok(())
            }
            None => Err(EvoError::CaseNotFound(case_id.to_string())),
        }
    }

    pub fn state(&self, case_id: &str) -> Option<OrchestratorState> {
        self.cases.get(case_id).map(|o| o.state())
    }

    pub fn orchestrator(&self, case_id: &str) -> Option<&EvolutionOrchestrator> {
        self.cases.get(case_id)
    }

    /// Ids of in-memory cases, sorted.
    pub fn case_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cases.keys().cloned().collect();
        ids.sort();
        ids
    }
}
