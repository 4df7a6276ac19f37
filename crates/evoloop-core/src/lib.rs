//! Evoloop Core Library
//!
//! The evolution orchestration engine: produce a script, execute it, have a
//! critic judge it, evolve the versioned capability specs from the feedback,
//! and repeat until approval or the turn budget runs out; then one round of
//! user feedback and an optional final critic pass.

pub mod catalog;
pub mod config;
pub mod critic;
pub mod data;
pub mod error;
pub mod evolver;
pub mod executor;
pub mod feedback;
pub mod llm;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod producer;
pub mod regeneration;
pub mod session;
pub mod telemetry;

pub use catalog::{
    known_capabilities, matching_capabilities, subject_catalog, CatalogEntry, Trigger,
    DATA_CATALOG, ERROR_CATALOG, VISUAL_CATALOG,
};
pub use config::{EngineConfig, ExecutorConfig, GenerationConfig};
pub use critic::{
    parse_verdict, CriticEvaluator, EvaluationContext, GenerativeCritic, TemplateCritic,
};
pub use data::{DataSample, DataSource, Dataset, DateWindow, SymbolSeries, SyntheticDataSource};
pub use error::{EvoError, Result};
pub use evolver::{evolve, Evolution, EvolutionEvent, EvolutionSource};
pub use executor::{Executor, ProcessExecutor};
pub use feedback::{FeedbackAnalysis, FeedbackAnalyzer, FeedbackCategory, Improvement, Priority};
pub use llm::{ChatClient, ChatMessage, GenerationRequest, TextGenerator};
pub use metrics::METRICS;
pub use orchestrator::{
    enforce_approval, AffirmativeSatisfaction, Collaborators, EvolutionOrchestrator,
    OrchestratorState, SatisfactionPolicy,
};
pub use producer::{extract_code, CodeProducer, GenerativeProducer, ProductionSpec, TemplateProducer};
pub use regeneration::{
    AttemptRecord, RegenerationController, RegenerationOutcome, RegenerationState,
};
pub use session::{case_id, parse_symbols, CaseManager};
pub use telemetry::init_tracing;
