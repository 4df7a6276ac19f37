//! Heuristic analysis of critic and user feedback text.
//!
//! Produces a quality score, a category, and a list of concrete improvement
//! requests; aggregates a case's analyses into an improvement plan and score
//! trends for the final summary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use evoloop_state::{FeedbackTrends, ScoreTrend};

const APPROVAL_TERMS: &[&str] = &[
    "approved",
    "excellent",
    "perfect",
    "great job",
    "well done",
    "looks good",
];

const POSITIVE_WEIGHTS: &[(&str, i32)] = &[
    ("excellent", 3),
    ("perfect", 3),
    ("great", 2),
    ("professional", 2),
    ("good", 1),
    ("clear", 1),
    ("accurate", 1),
    ("well", 1),
];

const NEGATIVE_WEIGHTS: &[(&str, i32)] = &[
    ("error", 3),
    ("wrong", 3),
    ("missing", 2),
    ("bad", 2),
    ("poor", 2),
    ("unclear", 2),
    ("confusing", 2),
    ("fix", 1),
    ("improve", 1),
    ("needs", 1),
    ("add", 1),
    ("should", 1),
];

const ACTION_TERMS: &[&str] = &["improve", "needs", "should", "add", "consider", "enhance", "fix"];

/// Keyword table for improvement extraction, checked in order.
const IMPROVEMENT_KEYWORDS: &[(&str, &[&str])] = &[
    ("style", &["style", "font", "theme", "professional"]),
    ("colors", &["color", "colour", "palette"]),
    ("annotations", &["annotate", "annotation", "label"]),
    ("indicators", &["moving average", "rsi", "macd", "bollinger", "indicator"]),
    ("volume", &["volume"]),
    ("trends", &["trend"]),
    ("peaks", &["peak", "maximum", "minimum"]),
    ("comparison", &["compare", "comparison", "relative", "benchmark"]),
    ("risk", &["risk", "volatility", "drawdown"]),
    ("layout", &["layout", "subplot", "legend", "axis", "grid"]),
];

const MAX_SENTIMENT: f64 = 10.0;
const ACTION_PENALTY_STEP: f64 = 0.05;
const ACTION_PENALTY_CAP: f64 = 0.25;
const APPROVED_FLOOR: f64 = 0.7;
const REJECTED_CEILING: f64 = 0.4;
/// Score movement between first and last feedback treated as a trend.
const TREND_DELTA: f64 = 0.05;

fn list_item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s+(.+?)\s*$").expect("list item regex is valid")
    })
}

/// Broad kind of a piece of feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Approval,
    Error,
    Enhancement,
    Modification,
    General,
}

impl FeedbackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackCategory::Approval => "approval",
            FeedbackCategory::Error => "error",
            FeedbackCategory::Enhancement => "enhancement",
            FeedbackCategory::Modification => "modification",
            FeedbackCategory::General => "general",
        }
    }
}

impl fmt::Display for FeedbackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Key used in improvement plans.
    pub fn plan_key(&self) -> &'static str {
        match self {
            Priority::High => "high_priority",
            Priority::Medium => "medium_priority",
            Priority::Low => "low_priority",
        }
    }
}

/// One requested change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Improvement {
    pub category: String,
    pub priority: Priority,
    pub text: String,
}

/// Result of analysing one piece of feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAnalysis {
    pub score: f64,
    pub category: FeedbackCategory,
    pub approved: bool,
    pub improvements: Vec<Improvement>,
}

/// Stateless text heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackAnalyzer;

impl FeedbackAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, text: &str) -> FeedbackAnalysis {
        FeedbackAnalysis {
            score: self.quality_score(text),
            category: self.categorize(text),
            approved: self.is_approval(text),
            improvements: self.extract_improvements(text),
        }
    }

    /// Contains an approval phrase and no explicit rejection.
    pub fn is_approval(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if is_rejection(&lower) {
            return false;
        }
        APPROVAL_TERMS.iter().any(|t| lower.contains(t))
    }

    /// Score in `[0, 1]`: weighted sentiment, minus a capped penalty per
    /// action word, then pinned by explicit approval or rejection.
    pub fn quality_score(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let weigh = |table: &[(&str, i32)]| -> i32 {
            table
                .iter()
                .filter(|(term, _)| lower.contains(term))
                .map(|(_, w)| *w)
                .sum()
        };
        let raw = (weigh(POSITIVE_WEIGHTS) - weigh(NEGATIVE_WEIGHTS)) as f64;
        let mut score = ((raw + MAX_SENTIMENT) / (2.0 * MAX_SENTIMENT)).clamp(0.0, 1.0);

        let actions = ACTION_TERMS.iter().filter(|t| lower.contains(*t)).count();
        score -= (actions as f64 * ACTION_PENALTY_STEP).min(ACTION_PENALTY_CAP);

        if is_rejection(&lower) {
            score = score.min(REJECTED_CEILING);
        } else if lower.contains("approved") && !lower.contains("not") {
            score = score.max(APPROVED_FLOOR);
        }
        score.clamp(0.0, 1.0)
    }

    pub fn categorize(&self, text: &str) -> FeedbackCategory {
        let lower = text.to_lowercase();
        if self.is_approval(text) {
            FeedbackCategory::Approval
        } else if contains_any(&lower, &["error", "bug", "crash", "fail"]) {
            FeedbackCategory::Error
        } else if contains_any(&lower, &["improve", "enhance", "add", "include"]) {
            FeedbackCategory::Enhancement
        } else if contains_any(&lower, &["change", "modify", "adjust", "update"]) {
            FeedbackCategory::Modification
        } else {
            FeedbackCategory::General
        }
    }

    /// Numbered or bulleted items when present, otherwise one entry per
    /// keyword category mentioned, carrying the sentence that mentions it.
    pub fn extract_improvements(&self, text: &str) -> Vec<Improvement> {
        let items: Vec<&str> = text
            .lines()
            .filter_map(|line| list_item_regex().captures(line))
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if !items.is_empty() {
            return items
                .into_iter()
                .map(|item| Improvement {
                    category: keyword_category(item).unwrap_or("general").to_string(),
                    priority: priority_of(item),
                    text: item.to_string(),
                })
                .collect();
        }

        let sentences: Vec<&str> = text
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let mut out = Vec::new();
        for (category, keywords) in IMPROVEMENT_KEYWORDS {
            let hit = sentences.iter().find(|s| {
                let lower = s.to_lowercase();
                keywords.iter().any(|k| lower.contains(k))
            });
            if let Some(sentence) = hit {
                out.push(Improvement {
                    category: category.to_string(),
                    priority: priority_of(sentence),
                    text: sentence.to_string(),
                });
            }
        }
        out
    }

    /// Improvements from non-approval feedback, bucketed by priority and
    /// deduplicated in first-seen order.
    pub fn improvement_plan(&self, analyses: &[FeedbackAnalysis]) -> BTreeMap<String, Vec<String>> {
        let mut plan: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for improvement in analyses
            .iter()
            .filter(|a| !a.approved)
            .flat_map(|a| a.improvements.iter())
        {
            let line = format!("[{}] {}", improvement.category, improvement.text);
            let bucket = plan
                .entry(improvement.priority.plan_key().to_string())
                .or_default();
            if !bucket.contains(&line) {
                bucket.push(line);
            }
        }
        plan
    }

    /// `None` when nothing was analysed.
    pub fn trends(&self, analyses: &[FeedbackAnalysis]) -> Option<FeedbackTrends> {
        let first = analyses.first()?;
        let last = analyses.last()?;
        let average_score =
            analyses.iter().map(|a| a.score).sum::<f64>() / analyses.len() as f64;
        let delta = last.score - first.score;
        let score_trend = if delta > TREND_DELTA {
            ScoreTrend::Improving
        } else if delta < -TREND_DELTA {
            ScoreTrend::Declining
        } else {
            ScoreTrend::Stable
        };

        let mut counts: HashMap<FeedbackCategory, usize> = HashMap::new();
        for a in analyses {
            *counts.entry(a.category).or_default() += 1;
        }
        // Ties go to the category seen first.
        let mut most_common = first.category;
        for a in analyses {
            if counts[&a.category] > counts[&most_common] {
                most_common = a.category;
            }
        }

        Some(FeedbackTrends {
            average_score,
            score_trend,
            most_common_category: most_common.as_str().to_string(),
            total_feedback: analyses.len(),
        })
    }
}

fn contains_any(lower: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| lower.contains(t))
}

fn is_rejection(lower: &str) -> bool {
    contains_any(lower, &["not approved", "rejected", "needs work"])
}

fn keyword_category(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    IMPROVEMENT_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(category, _)| *category)
}

fn priority_of(text: &str) -> Priority {
    let lower = text.to_lowercase();
    if contains_any(&lower, &["must", "required", "critical"]) {
        Priority::High
    } else if contains_any(&lower, &["should", "important", "need"]) {
        Priority::Medium
    } else {
        Priority::Low
    }
}
