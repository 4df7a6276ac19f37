//! Markdown evolution report synthesised from archived case metadata.

use std::fmt::Write as _;
use std::path::Path;

use crate::archive::CaseMetadata;

/// Render the human-readable timeline report for a case.
pub fn render_evolution_report(meta: &CaseMetadata) -> String {
    let mut out = String::new();
    let case = &meta.case;

    out.push_str("# Code Evolution Report\n");
    let _ = writeln!(out, "## Case: {}", case.name);
    let _ = writeln!(out, "## Symbols: {}", case.symbols.join(", "));
    let _ = writeln!(out, "## Created: {}", case.created_at.to_rfc3339());
    out.push_str("\n## Evolution Timeline\n");

    for it in &meta.iterations {
        let _ = writeln!(out, "\n### Iteration {} ({})", it.index, it.actor);
        let _ = writeln!(out, "- **Timestamp**: {}", it.timestamp.to_rfc3339());
        let _ = writeln!(
            out,
            "- **Visual Version**: v{} (code produced at v{})",
            it.visual_version, it.code_visual_version
        );
        let _ = writeln!(
            out,
            "- **Data Version**: v{} (code produced at v{})",
            it.data_version, it.code_data_version
        );
        let _ = writeln!(
            out,
            "- **Execution**: {} after {} attempt(s)",
            if it.succeeded { "succeeded" } else { "failed" },
            it.attempts_used
        );
        if let Some(verdict) = &it.verdict {
            let _ = writeln!(
                out,
                "- **Verdict**: {} (score {:.2})",
                if verdict.approved {
                    "approved"
                } else {
                    "not approved"
                },
                verdict.quality_score
            );
        }
        if !it.visual_capabilities.is_empty() {
            let _ = writeln!(
                out,
                "- **Visual Capabilities**: {}",
                it.visual_capabilities.join(", ")
            );
        }
        if !it.data_capabilities.is_empty() {
            let _ = writeln!(
                out,
                "- **Data Capabilities**: {}",
                it.data_capabilities.join(", ")
            );
        }
        if !it.artifacts.is_empty() {
            out.push_str("- **Artifacts**:\n");
            for (kind, path) in &it.artifacts {
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                let _ = writeln!(out, "  - {}: `{}`", kind, name);
            }
        }
    }

    out.push_str("\n## Summary\n");
    let _ = writeln!(out, "- Total Iterations: {}", meta.iterations.len());
    match &meta.summary {
        Some(summary) => {
            let _ = writeln!(
                out,
                "- Final Visual Version: v{}",
                summary.final_visual_version
            );
            let _ = writeln!(out, "- Final Data Version: v{}", summary.final_data_version);
            let _ = writeln!(out, "- Critic Turns Used: {}", summary.critic_turns_used);
            let _ = writeln!(
                out,
                "- Critic Approved: {}",
                if summary.approved { "yes" } else { "no" }
            );
            let _ = writeln!(out, "- Total Improvements: {}", summary.total_improvements);
            if let Some(trends) = &summary.trends {
                out.push_str("\n## Feedback Trends\n");
                let _ = writeln!(out, "- Average Score: {:.2}", trends.average_score);
                let _ = writeln!(out, "- Score Trend: {}", trends.score_trend);
                let _ = writeln!(
                    out,
                    "- Most Common Category: {}",
                    trends.most_common_category
                );
            }
            let planned: Vec<_> = summary
                .improvement_plan
                .iter()
                .filter(|(_, items)| !items.is_empty())
                .collect();
            if !planned.is_empty() {
                out.push_str("\n## Improvement Plan\n");
                for (priority, items) in planned {
                    let _ = writeln!(out, "\n**{}**", title_case(priority));
                    for item in items {
                        let _ = writeln!(out, "- {}", item);
                    }
                }
            }
        }
        None => {
            let last = meta.iterations.last();
            let _ = writeln!(
                out,
                "- Final Visual Version: v{}",
                last.map(|i| i.visual_version).unwrap_or(1)
            );
            let _ = writeln!(
                out,
                "- Final Data Version: v{}",
                last.map(|i| i.data_version).unwrap_or(1)
            );
        }
    }

    out
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CaseDescriptor, CaseSummary, IterationMetadata};
    use crate::model::{Actor, CriticVerdict};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("parse RFC3339")
            .with_timezone(&Utc)
    }

    fn iteration(index: u32, actor: Actor) -> IterationMetadata {
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "visual_code".to_string(),
            format!("code/v{:03}_{}_visual.py", index, actor),
        );
        IterationMetadata {
            index,
            actor,
            timestamp: ts(),
            code_visual_version: index,
            code_data_version: index,
            visual_version: index,
            data_version: index,
            visual_capabilities: vec!["moving_avg".to_string()],
            data_capabilities: vec![],
            succeeded: true,
            attempts_used: 1,
            verdict: Some(CriticVerdict::new(index == 2, 0.8, "ok")),
            artifacts,
        }
    }

    fn meta() -> CaseMetadata {
        let mut meta = CaseMetadata::new(CaseDescriptor {
            case_id: "demo_NVDA_20260101_000000".to_string(),
            name: "demo".to_string(),
            symbols: vec!["NVDA".to_string(), "TSLA".to_string()],
            created_at: ts(),
        });
        meta.iterations.push(iteration(1, Actor::Critic));
        meta.iterations.push(iteration(2, Actor::Critic));
        meta
    }

    #[test]
    fn report_lists_iterations_in_order() {
        let md = render_evolution_report(&meta());
        let first = md.find("### Iteration 1 (critic)").expect("iteration 1");
        let second = md.find("### Iteration 2 (critic)").expect("iteration 2");
        assert!(first < second);
        assert!(md.contains("## Symbols: NVDA, TSLA"));
        assert!(md.contains("`v001_critic_visual.py`"));
        assert!(md.contains("- Total Iterations: 2"));
    }

    #[test]
    fn report_includes_summary_and_plan() {
        let mut m = meta();
        let mut plan = BTreeMap::new();
        plan.insert(
            "high_priority".to_string(),
            vec!["Add volume subplot".to_string()],
        );
        plan.insert("low_priority".to_string(), vec![]);
        m.summary = Some(CaseSummary {
            total_iterations: 2,
            critic_turns_used: 2,
            approved: true,
            final_visual_version: 2,
            final_data_version: 2,
            visual_capabilities: vec!["moving_avg".to_string()],
            data_capabilities: vec![],
            total_improvements: 1,
            trends: None,
            improvement_plan: plan,
        });
        let md = render_evolution_report(&m);
        assert!(md.contains("- Critic Approved: yes"));
        assert!(md.contains("**High Priority**"));
        assert!(!md.contains("**Low Priority**"));
    }

    #[test]
    fn title_case_splits_underscores() {
        assert_eq!(title_case("medium_priority"), "Medium Priority");
    }
}
