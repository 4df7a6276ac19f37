//! Feedback-driven capability evolution.
//!
//! [`evolve`] is a pure function: the same state, text and source always
//! yield the same result. Capabilities are only ever added.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evoloop_state::{head_chars, CapabilityId, Subject, VersionedState};

use crate::catalog::{matching_capabilities, subject_catalog, ERROR_CATALOG};

/// Longest feedback excerpt kept in an [`EvolutionEvent`].
pub const EXCERPT_CHARS: usize = 400;

/// Where the feedback driving an evolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionSource {
    Critic,
    User,
    Error,
}

impl EvolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionSource::Critic => "critic",
            EvolutionSource::User => "user",
            EvolutionSource::Error => "error",
        }
    }

    /// User rounds always open a new version.
    pub fn forces_bump(&self) -> bool {
        matches!(self, EvolutionSource::User)
    }
}

/// Result of one [`evolve`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Evolution {
    pub state: VersionedState,
    /// Capabilities newly activated by this call.
    pub activated: Vec<CapabilityId>,
    /// Whether the version moved.
    pub bumped: bool,
}

/// Map `feedback_text` onto `state`.
///
/// Critic and user text is matched against the subject's table; error text
/// only against the defensive table. The version moves by exactly one when
/// something new was activated or the source forces a bump.
pub fn evolve(
    subject: Subject,
    state: &VersionedState,
    feedback_text: &str,
    source: EvolutionSource,
) -> Evolution {
    let catalog = match source {
        EvolutionSource::Error => ERROR_CATALOG,
        EvolutionSource::Critic | EvolutionSource::User => subject_catalog(subject),
    };
    let activated: Vec<CapabilityId> = matching_capabilities(catalog, feedback_text)
        .into_iter()
        .filter(|cap| !state.contains(cap.as_str()))
        .collect();

    if activated.is_empty() && !source.forces_bump() {
        return Evolution {
            state: state.clone(),
            activated,
            bumped: false,
        };
    }

    Evolution {
        state: state.advance(&activated),
        activated,
        bumped: true,
    }
}

/// Audit entry for an applied evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub subject: Subject,
    pub source: EvolutionSource,
    pub from_version: u32,
    pub to_version: u32,
    pub activated: Vec<String>,
    pub feedback_excerpt: String,
    pub timestamp: DateTime<Utc>,
}

impl EvolutionEvent {
    pub fn new(
        subject: Subject,
        source: EvolutionSource,
        before: &VersionedState,
        evolution: &Evolution,
        feedback_text: &str,
    ) -> Self {
        Self {
            subject,
            source,
            from_version: before.version(),
            to_version: evolution.state.version(),
            activated: evolution.activated.iter().map(|c| c.to_string()).collect(),
            feedback_excerpt: head_chars(feedback_text, EXCERPT_CHARS),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critic_text_without_triggers_keeps_state() {
        let s = VersionedState::initial();
        let e = evolve(Subject::Visual, &s, "Looks fine overall.", EvolutionSource::Critic);
        assert!(!e.bumped);
        assert_eq!(e.state, s);
    }

    #[test]
    fn user_text_always_bumps() {
        let s = VersionedState::initial();
        let e = evolve(Subject::Data, &s, "make it nicer", EvolutionSource::User);
        assert!(e.bumped);
        assert!(e.activated.is_empty());
        assert_eq!(e.state.version(), 2);
    }

    #[test]
    fn already_active_capability_does_not_bump() {
        let s = VersionedState::seeded(["volume"]);
        let e = evolve(Subject::Visual, &s, "more volume please", EvolutionSource::Critic);
        assert!(!e.bumped);
        assert_eq!(e.state.version(), 1);
    }

    #[test]
    fn error_source_only_uses_defensive_table() {
        let s = VersionedState::initial();
        let e = evolve(
            Subject::Visual,
            &s,
            "KeyError: 'volume' column missing",
            EvolutionSource::Error,
        );
        assert_eq!(e.state.capability_names(), vec!["safe_column_access"]);
        assert_eq!(e.state.version(), 2);
    }

    #[test]
    fn repeated_error_is_idempotent() {
        let s = VersionedState::seeded(["safe_column_access"]);
        let e = evolve(Subject::Data, &s, "KeyError: 'Close'", EvolutionSource::Error);
        assert!(!e.bumped);
    }

    #[test]
    fn event_excerpt_is_bounded() {
        let s = VersionedState::initial();
        let text = "add volume ".repeat(100);
        let e = evolve(Subject::Visual, &s, &text, EvolutionSource::Critic);
        let event = EvolutionEvent::new(Subject::Visual, EvolutionSource::Critic, &s, &e, &text);
        assert_eq!(event.feedback_excerpt.chars().count(), EXCERPT_CHARS);
        assert_eq!(event.from_version, 1);
        assert_eq!(event.to_version, 2);
        assert_eq!(event.activated, vec!["volume"]);
    }
}
