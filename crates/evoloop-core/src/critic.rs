//! Critic evaluators.
//!
//! A critic sees the final source text and its execution outcome, never the
//! rendered output. Evaluators return a verdict and never fail: an
//! unreachable backend or unusable reply yields [`CriticVerdict::fail_safe`].
//! The orchestrator applies the approval threshold and the failed-execution
//! override on top of whatever is returned here.

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use evoloop_state::{head_chars, tail_chars, Actor, CriticVerdict, ExecutionOutcome, VersionedState};

use crate::feedback::FeedbackAnalyzer;
use crate::llm::{ChatMessage, GenerationRequest, TextGenerator};

const CODE_EXCERPT_CHARS: usize = 900;
const OUTPUT_EXCERPT_CHARS: usize = 600;
/// Token a post-user critic uses to confirm the user's request was met.
pub const USER_FEEDBACK_OK: &str = "USER_FEEDBACK_OK";

/// What a critic knows about the turn besides code and outcome.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub turn: u32,
    pub max_turns: u32,
    pub actor: Actor,
    pub visual: &'a VersionedState,
    pub data: &'a VersionedState,
    pub symbols: &'a [String],
    pub max_attempts: u32,
    /// Latest user feedback, for post-user reviews.
    pub user_feedback: Option<&'a str>,
}

#[async_trait]
pub trait CriticEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        code: &str,
        outcome: &ExecutionOutcome,
        context: &EvaluationContext<'_>,
    ) -> CriticVerdict;

    /// Whether this critic runs the extra pass after user feedback.
    fn reviews_user_feedback(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Template critic
// ---------------------------------------------------------------------------

const DEFAULT_TEMPLATES: [&str; 3] = [
    "The plot needs moving averages for better trend visibility. Add 20-day and 50-day MA.",
    "Good progress! Now add volume analysis in a subplot below the main chart.",
    "Excellent! The plot is clear and informative. APPROVED",
];

const TEMPLATE_APPROVED_SCORE: f64 = 0.9;
const TEMPLATE_PENDING_SCORE: f64 = 0.55;
const TEMPLATE_FAILED_SCORE: f64 = 0.3;

/// Deterministic critic for mock mode: walks a fixed list of feedback and
/// approves from `approve_on_turn` onwards, provided the run succeeded.
#[derive(Debug, Clone)]
pub struct TemplateCritic {
    approve_on_turn: u32,
    pending: Vec<String>,
    approval: String,
}

impl Default for TemplateCritic {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TemplateCritic {
    pub fn new(approve_on_turn: u32) -> Self {
        Self {
            approve_on_turn: approve_on_turn.max(1),
            pending: DEFAULT_TEMPLATES[..2].iter().map(|s| s.to_string()).collect(),
            approval: DEFAULT_TEMPLATES[2].to_string(),
        }
    }

    pub fn approve_on_turn(&self) -> u32 {
        self.approve_on_turn
    }

    fn pending_feedback(&self, turn: u32) -> &str {
        let idx = (turn.saturating_sub(1) as usize).min(self.pending.len() - 1);
        &self.pending[idx]
    }
}

#[async_trait]
impl CriticEvaluator for TemplateCritic {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn evaluate(
        &self,
        _code: &str,
        outcome: &ExecutionOutcome,
        context: &EvaluationContext<'_>,
    ) -> CriticVerdict {
        if !outcome.succeeded {
            let error = outcome.failure_hint().unwrap_or("unknown error");
            return CriticVerdict::new(
                false,
                TEMPLATE_FAILED_SCORE,
                format!(
                    "The script failed after {} attempt(s): {}. Fix the error before adding features.",
                    outcome.attempts_used,
                    tail_chars(error.trim(), 200)
                ),
            );
        }
        if context.turn >= self.approve_on_turn {
            CriticVerdict::new(true, TEMPLATE_APPROVED_SCORE, self.approval.clone())
        } else {
            CriticVerdict::new(
                false,
                TEMPLATE_PENDING_SCORE,
                self.pending_feedback(context.turn),
            )
        }
    }

    fn reviews_user_feedback(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Generative critic
// ---------------------------------------------------------------------------

/// Critic backed by a text-generation model.
pub struct GenerativeCritic {
    generator: Arc<dyn TextGenerator>,
    model: String,
    analyzer: FeedbackAnalyzer,
}

impl GenerativeCritic {
    pub fn new(generator: Arc<dyn TextGenerator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
            analyzer: FeedbackAnalyzer::new(),
        }
    }

    pub fn build_request(
        &self,
        code: &str,
        outcome: &ExecutionOutcome,
        context: &EvaluationContext<'_>,
    ) -> GenerationRequest {
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "Review this YTD stock analysis script for {} (turn {}/{}).",
            context.symbols.join(", "),
            context.turn,
            context.max_turns
        );
        let _ = writeln!(
            prompt,
            "Visual spec v{} features: {}",
            context.visual.version(),
            feature_list(context.visual)
        );
        let _ = writeln!(
            prompt,
            "Data spec v{} features: {}",
            context.data.version(),
            feature_list(context.data)
        );
        let _ = writeln!(
            prompt,
            "Execution: {} after {}/{} attempt(s)",
            if outcome.succeeded { "succeeded" } else { "FAILED" },
            outcome.attempts_used,
            context.max_attempts
        );
        if let Some(error) = outcome.failure_hint() {
            let _ = writeln!(prompt, "Error:\n{}", tail_chars(error, OUTPUT_EXCERPT_CHARS));
        }
        if let Some(stdout) = outcome.stdout_tail.as_deref() {
            let _ = writeln!(prompt, "Output:\n{}", tail_chars(stdout, OUTPUT_EXCERPT_CHARS));
        }
        if !outcome.produced_files.is_empty() {
            let files: Vec<&str> = outcome.produced_files.iter().map(String::as_str).collect();
            let _ = writeln!(prompt, "Produced files: {}", files.join(", "));
        }
        let _ = writeln!(prompt, "Code:\n{}", head_chars(code, CODE_EXCERPT_CHARS));

        match (context.actor, context.user_feedback) {
            (Actor::CriticPostUser, Some(user)) => {
                let _ = writeln!(prompt, "The user asked for:\n{}", user.trim());
                let _ = writeln!(
                    prompt,
                    "Verify the request was implemented. Reply with {} if it was, otherwise list what is missing.",
                    USER_FEEDBACK_OK
                );
            }
            _ => {
                prompt.push_str(
                    "Give concise, numbered improvement suggestions (indicators, volume, annotations, layout). \
                     Include 'APPROVED' only if the script is satisfactory as is.\n",
                );
            }
        }
        prompt.push_str(
            "Optionally answer as JSON: {\"approved\": bool, \"quality_score\": 0-1, \"feedback\": string}.",
        );

        GenerationRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(
                    "You are a strict reviewer of financial visualization code. You only see code and execution results.",
                ),
                ChatMessage::user(prompt),
            ],
            temperature: Some(0.0),
        }
    }
}

#[async_trait]
impl CriticEvaluator for GenerativeCritic {
    fn name(&self) -> &'static str {
        "generative"
    }

    async fn evaluate(
        &self,
        code: &str,
        outcome: &ExecutionOutcome,
        context: &EvaluationContext<'_>,
    ) -> CriticVerdict {
        let request = self.build_request(code, outcome, context);
        match self.generator.generate(&request).await {
            Ok(reply) => parse_verdict(&reply, &self.analyzer),
            Err(e) => {
                warn!(error = %e, turn = context.turn, "critic request failed");
                CriticVerdict::fail_safe(format!("critic unavailable: {}", e))
            }
        }
    }

    fn reviews_user_feedback(&self) -> bool {
        true
    }
}

fn feature_list(state: &VersionedState) -> String {
    let names = state.capability_names();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn approval_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(not\s+)?(approved|user_feedback_ok)\b").expect("valid regex")
    })
}

/// Turn free text from a judging model into a verdict.
///
/// A JSON object carrying `approved` or a score is used directly; otherwise
/// the text heuristics apply and approval requires an explicit `APPROVED`
/// (or `USER_FEEDBACK_OK`) token that is not negated. Empty replies fail safe.
pub fn parse_verdict(reply: &str, analyzer: &FeedbackAnalyzer) -> CriticVerdict {
    let text = reply.trim();
    if text.is_empty() {
        warn!("critic reply was empty");
        return CriticVerdict::fail_safe("critic returned no feedback");
    }
    if let Some(verdict) = parse_json_verdict(text) {
        return verdict;
    }

    let mut approved = false;
    for caps in approval_token().captures_iter(text) {
        if caps.get(1).is_some() {
            approved = false;
            break;
        }
        approved = true;
    }
    CriticVerdict::new(approved, analyzer.quality_score(text), text)
}

fn parse_json_verdict(text: &str) -> Option<CriticVerdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let obj = value.as_object()?;

    let approved = obj.get("approved").and_then(Value::as_bool);
    let score = ["quality_score", "overall", "score"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_f64));
    if approved.is_none() && score.is_none() {
        return None;
    }
    let score = score.map(normalize_score).unwrap_or(0.0);
    let feedback = ["feedback", "recommendation", "feedback_text"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| text.to_string());
    Some(CriticVerdict::new(approved.unwrap_or(false), score, feedback))
}

/// Scores on a 0-10 scale are brought back to 0-1.
fn normalize_score(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    let score = if score > 1.0 && score <= 10.0 {
        score / 10.0
    } else {
        score
    };
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EvoError, Result};
    use std::sync::Mutex;

    fn context<'a>(
        turn: u32,
        actor: Actor,
        state: &'a VersionedState,
        symbols: &'a [String],
    ) -> EvaluationContext<'a> {
        EvaluationContext {
            turn,
            max_turns: 3,
            actor,
            visual: state,
            data: state,
            symbols,
            max_attempts: 2,
            user_feedback: Some("add RSI"),
        }
    }

    struct Canned {
        reply: Result<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.messages[1].content.clone());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(EvoError::Generation("down".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn template_walks_feedback_then_approves() {
        let critic = TemplateCritic::new(2);
        let state = VersionedState::initial();
        let symbols = vec!["NVDA".to_string()];
        let ok = ExecutionOutcome::success();

        let first = critic
            .evaluate("", &ok, &context(1, Actor::Critic, &state, &symbols))
            .await;
        assert!(!first.approved);
        assert!(first.feedback_text.contains("moving averages"));

        let second = critic
            .evaluate("", &ok, &context(2, Actor::Critic, &state, &symbols))
            .await;
        assert!(second.approved);
        assert_eq!(second.quality_score, 0.9);
    }

    #[tokio::test]
    async fn template_never_approves_a_failed_run() {
        let critic = TemplateCritic::new(1);
        let state = VersionedState::initial();
        let symbols = vec!["NVDA".to_string()];
        let mut failed = ExecutionOutcome::failed("KeyError: 'Close'");
        failed.attempts_used = 2;
        let verdict = critic
            .evaluate("", &failed, &context(1, Actor::Critic, &state, &symbols))
            .await;
        assert!(!verdict.approved);
        assert!(verdict.feedback_text.contains("KeyError"));
        assert!(!critic.reviews_user_feedback());
    }

    #[test]
    fn json_reply_is_used_directly() {
        let analyzer = FeedbackAnalyzer::new();
        let v = parse_verdict(
            "Here you go: {\"approved\": true, \"overall\": 8, \"recommendation\": \"ship it\"}",
            &analyzer,
        );
        assert!(v.approved);
        assert!((v.quality_score - 0.8).abs() < 1e-9);
        assert_eq!(v.feedback_text, "ship it");
    }

    #[test]
    fn text_reply_needs_an_unnegated_token() {
        let analyzer = FeedbackAnalyzer::new();
        assert!(parse_verdict("Clean chart. APPROVED", &analyzer).approved);
        assert!(!parse_verdict("NOT APPROVED: add volume", &analyzer).approved);
        assert!(!parse_verdict("Looks good, but add a legend", &analyzer).approved);
        assert!(parse_verdict("USER_FEEDBACK_OK", &analyzer).approved);
    }

    #[test]
    fn empty_reply_fails_safe() {
        let v = parse_verdict("   ", &FeedbackAnalyzer::new());
        assert!(!v.approved);
        assert_eq!(v.quality_score, 0.0);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        assert_eq!(normalize_score(42.0), 1.0);
        assert_eq!(normalize_score(-3.0), 0.0);
        assert_eq!(normalize_score(f64::NAN), 0.0);
        assert!((normalize_score(7.0) - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn backend_failure_fails_safe() {
        let generator = Arc::new(Canned {
            reply: Err(EvoError::Generation("down".to_string())),
            prompts: Mutex::new(Vec::new()),
        });
        let critic = GenerativeCritic::new(generator, "judge");
        let state = VersionedState::initial();
        let symbols = vec!["NVDA".to_string()];
        let verdict = critic
            .evaluate(
                "print(1)",
                &ExecutionOutcome::success(),
                &context(1, Actor::Critic, &state, &symbols),
            )
            .await;
        assert!(!verdict.approved);
        assert_eq!(verdict.quality_score, 0.0);
        assert!(critic.reviews_user_feedback());
    }

    #[tokio::test]
    async fn post_user_prompt_carries_the_request() {
        let generator = Arc::new(Canned {
            reply: Ok("USER_FEEDBACK_OK".to_string()),
            prompts: Mutex::new(Vec::new()),
        });
        let critic = GenerativeCritic::new(generator.clone(), "judge");
        let state = VersionedState::seeded(["rsi"]);
        let symbols = vec!["NVDA".to_string()];
        let verdict = critic
            .evaluate(
                "print(1)",
                &ExecutionOutcome::success(),
                &context(1, Actor::CriticPostUser, &state, &symbols),
            )
            .await;
        assert!(verdict.approved);
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("The user asked for:\nadd RSI"));
        assert!(prompts[0].contains("features: rsi"));
    }
}
