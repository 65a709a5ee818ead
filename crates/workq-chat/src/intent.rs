//! Intent analysis: free text to structured search criteria.
//!
//! The language model is asked for a JSON [`QueryAnalysis`]. Its output is
//! validated strictly, recovered by the extractor when wrapped in prose, and
//! replaced by a keyword heuristic when the provider fails or the output
//! cannot be used.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use workq_core::types::{
    Message, MetadataSnapshot, QueryAnalysis, Role, SearchCriteria, StageOutcome,
};
use workq_provider::{ChatTurn, CompletionRequest, Deadline, LlmProvider};

use crate::collection::CollectionDetector;
use crate::extract::{parse_structured, Parsed};

pub const INTENT_SEARCH: &str = "search_work_items";
pub const INTENT_GENERAL: &str = "general_question";

const SYSTEM_PROMPT: &str = "You translate questions about a team's work tracker into a search plan. \
Reply with a single JSON object and nothing else, shaped as:\n\
{\"needsBackendData\": bool, \"intent\": string, \"requiresSummary\": bool, \
\"searchCriteria\": {\"entityKind\": null | \"projects\" | \"teams\" | \"users\" | \"states\" | \"types\" | \"tags\" | \"sprints\" | \"queries\", \
\"status\": string | null, \"type\": string | null, \"tags\": [string], \"assignee\": string | null, \
\"freeText\": string | null, \"priority\": 1-4 | null, \"timeframe\": string | null}}\n\
Use intent \"search_work_items\" when work items must be fetched and \"general_question\" otherwise. \
Use \"@me\" as the assignee when the user refers to themselves. \
Use timeframe values such as \"current sprint\", \"last sprint\" or an iteration name.";

/// Result of one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentOutcome {
    pub analysis: QueryAnalysis,
    pub outcome: StageOutcome,
    pub tokens: u64,
    /// Provider that produced the analysis, `None` for the heuristic.
    pub provider: Option<String>,
    pub detail: Option<String>,
}

pub struct IntentAnalyzer {
    llm: Arc<dyn LlmProvider>,
    detector: CollectionDetector,
}

impl IntentAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            detector: CollectionDetector::new(),
        }
    }

    pub async fn analyze(&self, query: &str, history: &[Message], deadline: &Deadline) -> IntentOutcome {
        let mut turns = history_turns(history);
        turns.push(ChatTurn::user(query));
        let request = CompletionRequest::new(SYSTEM_PROMPT, turns).json();

        let completion = match self.llm.complete(&request, deadline).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(error = %e, "Intent analysis failed, using keyword heuristic");
                return self.fallback(query, format!("provider error: {e}"), 0);
            }
        };

        match parse_structured::<QueryAnalysis, _>(&completion.text, validate) {
            Ok(parsed) => {
                let detail = (!parsed.is_strict())
                    .then(|| "recovered JSON from surrounding text".to_string());
                debug!(provider = %completion.provider, strict = parsed.is_strict(), "Intent analysis parsed");
                IntentOutcome {
                    analysis: finalize(parsed),
                    outcome: StageOutcome::Succeeded,
                    tokens: completion.tokens,
                    provider: Some(completion.provider),
                    detail,
                }
            }
            Err(reason) => {
                warn!(provider = %completion.provider, reason = %reason, "Unusable intent output, using keyword heuristic");
                self.fallback(query, format!("unusable model output: {reason}"), completion.tokens)
            }
        }
    }

    fn fallback(&self, query: &str, detail: String, tokens: u64) -> IntentOutcome {
        IntentOutcome {
            analysis: self.heuristic_analysis(query),
            outcome: StageOutcome::FellBack,
            tokens,
            provider: None,
            detail: Some(detail),
        }
    }

    /// Keyword-based analysis used when the model is unavailable.
    pub fn heuristic_analysis(&self, query: &str) -> QueryAnalysis {
        let text = query.trim().to_lowercase();
        let p = &*HEURISTIC_PATTERNS;

        if text.is_empty() || p.smalltalk.is_match(&text) {
            return QueryAnalysis {
                needs_backend_data: false,
                search_criteria: None,
                intent: INTENT_GENERAL.to_string(),
                requires_summary: false,
            };
        }

        let mut criteria = SearchCriteria::default();
        criteria.item_type = first_label(&p.types, &text);
        criteria.status = first_label(&p.states, &text);
        criteria.timeframe = first_label(&p.timeframes, &text);

        if p.self_assigned.is_match(&text) {
            criteria.assignee = Some("@me".to_string());
        } else if let Some(caps) = p.assigned_to.captures(&text) {
            criteria.assignee = caps.get(1).map(|m| m.as_str().to_string());
        }
        if let Some(caps) = p.priority.captures(&text) {
            criteria.priority = caps.get(1).and_then(|m| m.as_str().parse().ok());
        }
        criteria.tags = p
            .tag
            .captures_iter(&text)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string())
            .collect();
        if let Some(caps) = p.about.captures(&text) {
            criteria.free_text = caps.get(1).map(|m| m.as_str().trim().to_string());
        }

        // A collection noun next to work-item filters ("open bugs across all
        // projects") is a work-item search, unless the match is unambiguous.
        let detected = self.detector.detect(&text);
        if detected.is_high() || !criteria.has_item_filters() {
            criteria.entity_kind = detected.kind;
        }

        let needs_backend_data = !criteria.is_empty() || p.work_nouns.is_match(&text);
        QueryAnalysis {
            needs_backend_data,
            search_criteria: needs_backend_data.then_some(criteria),
            intent: if needs_backend_data {
                INTENT_SEARCH
            } else {
                INTENT_GENERAL
            }
            .to_string(),
            requires_summary: needs_backend_data,
        }
    }
}

/// Align state and type names with the tracker's own spelling.
pub fn normalize_criteria(criteria: &mut SearchCriteria, snapshot: &MetadataSnapshot) {
    if let Some(status) = criteria.status.as_mut() {
        if let Some(state) = snapshot.states.iter().find(|s| s.name.eq_ignore_ascii_case(status.trim())) {
            *status = state.name.clone();
        }
    }
    if let Some(kind) = criteria.item_type.as_mut() {
        let wanted = kind.trim().trim_end_matches('s');
        if let Some(t) = snapshot.types.iter().find(|t| {
            t.name.eq_ignore_ascii_case(kind.trim()) || t.name.eq_ignore_ascii_case(wanted)
        }) {
            *kind = t.name.clone();
        }
    }
}

fn validate(analysis: &QueryAnalysis) -> Result<(), String> {
    if analysis.intent.trim().is_empty() {
        return Err("intent is empty".to_string());
    }
    if let Some(priority) = analysis.search_criteria.as_ref().and_then(|c| c.priority) {
        if !(1..=4).contains(&priority) {
            return Err(format!("priority {priority} is outside 1-4"));
        }
    }
    Ok(())
}

fn finalize(parsed: Parsed<QueryAnalysis>) -> QueryAnalysis {
    let mut analysis = parsed.into_inner();
    if analysis.needs_backend_data && analysis.search_criteria.is_none() {
        analysis.search_criteria = Some(SearchCriteria::default());
    }
    analysis
}

/// Prior user and assistant turns; system messages are not replayed.
pub(crate) fn history_turns(history: &[Message]) -> Vec<ChatTurn> {
    history
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(ChatTurn::user(m.content.clone())),
            Role::Assistant => Some(ChatTurn::assistant(m.content.clone())),
            Role::System => None,
        })
        .collect()
}

fn first_label(patterns: &[(Regex, &'static str)], text: &str) -> Option<String> {
    patterns
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, label)| label.to_string())
}

// =============================================================================
// Heuristic patterns
// =============================================================================

struct HeuristicPatterns {
    smalltalk: Regex,
    work_nouns: Regex,
    types: Vec<(Regex, &'static str)>,
    states: Vec<(Regex, &'static str)>,
    timeframes: Vec<(Regex, &'static str)>,
    self_assigned: Regex,
    assigned_to: Regex,
    priority: Regex,
    tag: Regex,
    about: Regex,
}

static HEURISTIC_PATTERNS: LazyLock<HeuristicPatterns> = LazyLock::new(|| {
    let re = |p: &str| Regex::new(p).expect("Invalid heuristic regex");
    let labelled = |pairs: &[(&str, &'static str)]| -> Vec<(Regex, &'static str)> {
        pairs.iter().map(|(p, label)| (re(p), *label)).collect()
    };

    HeuristicPatterns {
        smalltalk: re(r"^(?:hi|hello|hey|thanks|thank you|help|what can you do)\b[\s!.?]*$"),
        work_nouns: re(
            r"\b(?:items?|work|bugs?|tasks?|tickets?|stor(?:y|ies)|features?|epics?|sprints?|backlog|assigned|blocking|blocked)\b",
        ),
        types: labelled(&[
            (r"\bbugs?\b", "Bug"),
            (r"\buser\s+stor(?:y|ies)\b|\bstor(?:y|ies)\b", "User Story"),
            (r"\btasks?\b", "Task"),
            (r"\bfeatures?\b", "Feature"),
            (r"\bepics?\b", "Epic"),
        ]),
        states: labelled(&[
            (r"\b(?:active|in\s+progress|open)\b", "Active"),
            (r"\bresolved\b", "Resolved"),
            (r"\b(?:closed|done|completed|finished)\b", "Closed"),
            (r"\bnew\b", "New"),
        ]),
        timeframes: labelled(&[
            (r"\b(?:current|this)\s+(?:sprint|iteration)\b", "current sprint"),
            (r"\b(?:last|previous)\s+(?:sprint|iteration)\b", "last sprint"),
            (r"\bnext\s+(?:sprint|iteration)\b", "next sprint"),
        ]),
        self_assigned: re(r"\b(?:my|mine|assigned\s+to\s+me|on\s+my\s+plate)\b"),
        assigned_to: re(r"\bassigned\s+to\s+([a-z0-9._@-]+)"),
        priority: re(r"\b(?:p|priority\s*)([1-4])\b"),
        tag: re(r#"\btagged\s+(?:with\s+)?['"]?([a-z0-9_-]+)|#([a-z0-9_-]+)"#),
        about: re(r#"\b(?:about|mentioning|related\s+to)\s+['"]?([^'"?]+)"#),
    }
});
