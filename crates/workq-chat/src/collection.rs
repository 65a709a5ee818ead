//! Rule-based detection of "list the X" queries.
//!
//! Matches normalized query text against a fixed set of reference-data
//! collections. No network calls. A high-confidence match lets the
//! orchestrator skip language-model intent analysis.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use workq_core::types::EntityKind;

/// How sure the detector is about a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Result of [`CollectionDetector::detect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMatch {
    /// `None` when the query is not a collection listing.
    #[serde(rename = "type")]
    pub kind: Option<EntityKind>,
    pub confidence: Confidence,
    pub keywords: Vec<String>,
}

impl CollectionMatch {
    pub fn none() -> Self {
        Self {
            kind: None,
            confidence: Confidence::Low,
            keywords: vec![],
        }
    }

    pub fn is_high(&self) -> bool {
        self.kind.is_some() && self.confidence == Confidence::High
    }
}

struct Rule {
    kind: EntityKind,
    noun: Regex,
    high: Vec<Regex>,
}

static LIST_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(list|show|get|display|give|what|which|all|available|enumerate)\b")
        .expect("Invalid list verb regex")
});

// Checked in order; the first rule that matches wins.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let nouns: [(EntityKind, &str); 6] = [
        (EntityKind::Projects, r"projects"),
        (EntityKind::Teams, r"teams"),
        (
            EntityKind::Users,
            r"(?:users|people|members|team\s+members|assignees)",
        ),
        (
            EntityKind::States,
            r"(?:states|statuses|workflow\s+states|work\s*item\s+states)",
        ),
        (EntityKind::Types, r"(?:work\s*item\s+types|item\s+types|types)"),
        (EntityKind::Tags, r"(?:tags|labels)"),
    ];

    nouns
        .into_iter()
        .map(|(kind, noun)| {
            let high = [
                format!(
                    r"^(?:please\s+)?(?:list|show|get|display|give\s+me|enumerate)\s+(?:me\s+)?(?:all\s+)?(?:of\s+)?(?:the\s+)?(?:our\s+)?(?:available\s+)?{noun}$"
                ),
                format!(r"^(?:what|which)\s+{noun}\s+(?:are\s+there|exist|do\s+we\s+have)$"),
                format!(r"^(?:all\s+)?(?:the\s+)?{noun}$"),
                format!(r"^how\s+many\s+{noun}(?:\s+are\s+there|\s+do\s+we\s+have)?$"),
            ]
            .iter()
            .map(|p| Regex::new(p).expect("Invalid collection regex"))
            .collect();

            Rule {
                kind,
                noun: Regex::new(&format!(r"\b{noun}\b")).expect("Invalid collection noun regex"),
                high,
            }
        })
        .collect()
});

/// Stateless collection-intent matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionDetector;

impl CollectionDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, query: &str) -> CollectionMatch {
        let text = normalize(query);
        if text.is_empty() {
            return CollectionMatch::none();
        }

        for rule in RULES.iter() {
            let Some(noun) = rule.noun.find(&text) else {
                continue;
            };
            let mut keywords: Vec<String> = LIST_VERB_RE
                .find_iter(&text)
                .map(|m| m.as_str().to_string())
                .collect();
            keywords.push(noun.as_str().to_string());

            if rule.high.iter().any(|re| re.is_match(&text)) {
                return CollectionMatch {
                    kind: Some(rule.kind),
                    confidence: Confidence::High,
                    keywords,
                };
            }
            if LIST_VERB_RE.is_match(&text) {
                return CollectionMatch {
                    kind: Some(rule.kind),
                    confidence: Confidence::Medium,
                    keywords,
                };
            }
        }

        CollectionMatch::none()
    }
}

/// Lower-case, trim, collapse whitespace and drop trailing punctuation.
fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['?', '.', '!'])
        .trim()
        .to_string()
}
