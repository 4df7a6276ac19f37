//! Trigger tables mapping feedback phrases to capability ids.
//!
//! Each subject has its own table; execution errors use a shared defensive
//! table. Tables are plain data so they can be listed, tested and extended.

use evoloop_state::{CapabilityId, Subject};

/// How a trigger matches feedback text (always case-insensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Matches anywhere in the text.
    Substring(&'static str),
    /// Matches a whole alphanumeric token, so `ma` does not match `make`.
    Word(&'static str),
    /// Matches when every substring is present.
    AllOf(&'static [&'static str]),
}

impl Trigger {
    fn matches(&self, lower: &str, tokens: &[&str]) -> bool {
        match self {
            Trigger::Substring(s) => lower.contains(s),
            Trigger::Word(w) => tokens.iter().any(|t| t == w),
            Trigger::AllOf(parts) => parts.iter().all(|p| lower.contains(p)),
        }
    }
}

/// One row of a trigger table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub capability: &'static str,
    pub triggers: &'static [Trigger],
}

use Trigger::{AllOf, Substring, Word};

const MOVING_AVG: CatalogEntry = CatalogEntry {
    capability: "moving_avg",
    triggers: &[
        Substring("moving average"),
        Substring("moving-average"),
        Word("ma"),
        Word("sma"),
    ],
};

const VOLUME: CatalogEntry = CatalogEntry {
    capability: "volume",
    triggers: &[Substring("volume")],
};

pub const VISUAL_CATALOG: &[CatalogEntry] = &[
    MOVING_AVG,
    CatalogEntry {
        capability: "peaks",
        triggers: &[
            Substring("peak"),
            Word("high"),
            Word("highs"),
            Word("low"),
            Word("lows"),
        ],
    },
    CatalogEntry {
        capability: "annotate",
        triggers: &[Substring("annot"), Word("label"), Word("labels")],
    },
    VOLUME,
    CatalogEntry {
        capability: "style_classic",
        triggers: &[AllOf(&["style", "classic"])],
    },
    CatalogEntry {
        capability: "style_default",
        triggers: &[AllOf(&["style", "default"])],
    },
];

pub const DATA_CATALOG: &[CatalogEntry] = &[
    MOVING_AVG,
    CatalogEntry {
        capability: "rsi",
        triggers: &[Word("rsi"), Substring("relative strength")],
    },
    CatalogEntry {
        capability: "volatility",
        triggers: &[Substring("volatil"), Word("vol"), Word("risk")],
    },
    CatalogEntry {
        capability: "correlation",
        triggers: &[Substring("correlat"), Word("corr")],
    },
    VOLUME,
];

/// Defensive capabilities activated by execution errors (both subjects).
pub const ERROR_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        capability: "safe_column_access",
        triggers: &[
            Substring("keyerror"),
            Substring("not in index"),
            Substring("column"),
            Substring("multiindex"),
        ],
    },
    CatalogEntry {
        capability: "empty_data_guard",
        triggers: &[
            Substring("indexerror"),
            Substring("out of range"),
            Substring("out of bounds"),
            Substring("empty"),
            Substring("zerodivisionerror"),
        ],
    },
];

/// Table consulted for `subject` feedback.
pub fn subject_catalog(subject: Subject) -> &'static [CatalogEntry] {
    match subject {
        Subject::Visual => VISUAL_CATALOG,
        Subject::Data => DATA_CATALOG,
    }
}

/// Capabilities of `catalog` triggered by `text`, in table order.
pub fn matching_capabilities(catalog: &[CatalogEntry], text: &str) -> Vec<CapabilityId> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    catalog
        .iter()
        .filter(|entry| entry.triggers.iter().any(|t| t.matches(&lower, &tokens)))
        .map(|entry| CapabilityId::from(entry.capability))
        .collect()
}

/// Every capability id known to `subject` (including defensive ones).
pub fn known_capabilities(subject: Subject) -> Vec<&'static str> {
    subject_catalog(subject)
        .iter()
        .chain(ERROR_CATALOG)
        .map(|e| e.capability)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(caps: Vec<CapabilityId>) -> Vec<String> {
        caps.into_iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn moving_average_phrases_match() {
        assert_eq!(
            ids(matching_capabilities(VISUAL_CATALOG, "add moving averages")),
            vec!["moving_avg"]
        );
        assert_eq!(
            ids(matching_capabilities(DATA_CATALOG, "Add 20-day and 50-day MA.")),
            vec!["moving_avg"]
        );
    }

    #[test]
    fn word_triggers_ignore_embedded_tokens() {
        assert!(matching_capabilities(VISUAL_CATALOG, "make the chart cleaner").is_empty());
        assert!(matching_capabilities(VISUAL_CATALOG, "highlight the legend").is_empty());
        assert!(matching_capabilities(DATA_CATALOG, "add a corridor").is_empty());
    }

    #[test]
    fn volume_does_not_imply_volatility() {
        assert_eq!(
            ids(matching_capabilities(
                DATA_CATALOG,
                "Now add volume analysis in a subplot below the main chart."
            )),
            vec!["volume"]
        );
    }

    #[test]
    fn several_capabilities_in_table_order() {
        let caps = ids(matching_capabilities(
            DATA_CATALOG,
            "Show correlation, RSI and the risk profile",
        ));
        assert_eq!(caps, vec!["rsi", "volatility", "correlation"]);
    }

    #[test]
    fn errors_map_to_defensive_capabilities() {
        let caps = ids(matching_capabilities(
            ERROR_CATALOG,
            "Traceback ...\nKeyError: 'Close'",
        ));
        assert_eq!(caps, vec!["safe_column_access"]);
        let caps = ids(matching_capabilities(
            ERROR_CATALOG,
            "IndexError: list index out of range",
        ));
        assert_eq!(caps, vec!["empty_data_guard"]);
    }

    #[test]
    fn style_needs_both_the_word_and_a_variant() {
        assert_eq!(
            ids(matching_capabilities(VISUAL_CATALOG, "Use the classic style please")),
            vec!["style_classic"]
        );
        assert!(matching_capabilities(VISUAL_CATALOG, "improve the style").is_empty());
        assert!(matching_capabilities(VISUAL_CATALOG, "a classic chart").is_empty());
        assert!(matching_capabilities(DATA_CATALOG, "classic style").is_empty());
    }

    #[test]
    fn known_capabilities_include_defensive_ones() {
        let visual = known_capabilities(Subject::Visual);
        assert!(visual.contains(&"peaks"));
        assert!(visual.contains(&"safe_column_access"));
        assert!(!visual.contains(&"rsi"));
    }
}
