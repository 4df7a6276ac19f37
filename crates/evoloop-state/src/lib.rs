//! Evoloop-State: case model and artifact archive
//!
//! This crate provides the persistence layer for the evolution engine.
//! It owns the data model that crosses the engine/archive boundary and the
//! `CaseArchive` trait the engine archives iterations through.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only iteration records, ordered read-back, report synthesis.
//!
//! ## Key Components
//!
//! - `VersionedState`: monotonically versioned capability set per subject
//! - `IterationLog`: gapless, append-only iteration records
//! - `FsCaseArchive`: on-disk archive (metadata, code, states, outputs)
//! - `render_evolution_report`: markdown timeline of a case

pub mod archive;
mod error;
pub mod fakes;
pub mod fs_archive;
pub mod model;
pub mod report;

pub use archive::{
    digest_hex, CaseArchive, CaseDescriptor, CaseListing, CaseMetadata, CaseSummary,
    IterationEntry, IterationMetadata,
};
pub use error::StateError;
pub use fakes::MemoryCaseArchive;
pub use fs_archive::FsCaseArchive;
pub use model::{
    head_chars, is_gapless, tail_chars, Actor, CapabilityId, CriticVerdict, ExecutionOutcome,
    FeedbackTrends, IterationDraft, IterationLog, IterationRecord, ScoreTrend, Subject,
    VersionedState, DEFAULT_TAIL_CHARS,
};
pub use report::render_evolution_report;

/// Result type for evoloop-state operations
pub type Result<T> = std::result::Result<T, StateError>;
