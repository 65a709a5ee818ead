//! Synthesis: retrieved data to a conversational answer.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use workq_core::types::{
    EntityKind, Message, MetadataSnapshot, QueryAnalysis, StageOutcome, WorkItem,
    DEFAULT_SUGGESTIONS,
};
use workq_provider::{ChatTurn, CompletionRequest, Deadline, LlmProvider};

use crate::extract::parse_structured;
use crate::intent::history_turns;

/// Names listed in a collection summary before "and N more".
const MAX_LISTED_NAMES: usize = 10;

const SYSTEM_PROMPT: &str = "You answer questions about a team's work items using only the data provided. \
Reply with a single JSON object and nothing else, shaped as:\n\
{\"summary\": string, \"insights\": [string], \"suggestions\": [string]}\n\
The summary is a short conversational answer. Insights are notable patterns in the data. \
Suggestions are follow-up questions the user could ask next.";

#[derive(Debug, Deserialize)]
struct SynthesisReply {
    summary: String,
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Answer text plus how it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutcome {
    pub summary: String,
    pub insights: Vec<String>,
    pub suggestions: Vec<String>,
    pub outcome: StageOutcome,
    pub tokens: u64,
    pub provider: Option<String>,
    pub detail: Option<String>,
}

pub struct Synthesizer {
    llm: Arc<dyn LlmProvider>,
    max_suggestions: usize,
    max_items: usize,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>, max_suggestions: usize, max_items: usize) -> Self {
        Self {
            llm,
            max_suggestions,
            max_items,
        }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        analysis: &QueryAnalysis,
        items: &[WorkItem],
        history: &[Message],
        deadline: &Deadline,
    ) -> SynthesisOutcome {
        let mut turns = history_turns(history);
        turns.push(ChatTurn::user(self.user_prompt(query, analysis, items)));
        let request = CompletionRequest::new(SYSTEM_PROMPT, turns).json();

        let completion = match self.llm.complete(&request, deadline).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(error = %e, "Synthesis failed, returning raw data with a generic summary");
                return self.fallback(analysis, items, format!("provider error: {e}"), 0);
            }
        };

        match parse_structured::<SynthesisReply, _>(&completion.text, validate) {
            Ok(parsed) => {
                let strict = parsed.is_strict();
                let reply = parsed.into_inner();
                debug!(provider = %completion.provider, strict, "Synthesis parsed");
                let mut suggestions = clean_list(reply.suggestions, self.max_suggestions);
                if suggestions.is_empty() {
                    suggestions = self.suggestions_for_items(analysis, items);
                }
                SynthesisOutcome {
                    summary: reply.summary.trim().to_string(),
                    insights: clean_list(reply.insights, usize::MAX),
                    suggestions,
                    outcome: StageOutcome::Succeeded,
                    tokens: completion.tokens,
                    provider: Some(completion.provider),
                    detail: (!strict).then(|| "recovered JSON from surrounding text".to_string()),
                }
            }
            Err(reason) => {
                warn!(provider = %completion.provider, reason = %reason, "Unusable synthesis output");
                self.fallback(
                    analysis,
                    items,
                    format!("unusable model output: {reason}"),
                    completion.tokens,
                )
            }
        }
    }

    /// Deterministic answer for a reference-data listing.
    pub fn summarize_collection(&self, kind: EntityKind, snapshot: &MetadataSnapshot) -> SynthesisOutcome {
        let names = snapshot.names(kind);
        let summary = match names.len() {
            0 => format!("No {} were found.", kind.as_str()),
            1 => format!("There is 1 {}: {}.", kind.singular(), names[0]),
            n => {
                let listed = names
                    .iter()
                    .take(MAX_LISTED_NAMES)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                if n > MAX_LISTED_NAMES {
                    format!("There are {n} {}: {listed} and {} more.", kind.as_str(), n - MAX_LISTED_NAMES)
                } else {
                    format!("There are {n} {}: {listed}.", kind.as_str())
                }
            }
        };

        let mut suggestions: Vec<String> = names
            .iter()
            .map(|name| match kind {
                EntityKind::Projects => format!("Show active bugs in {name}"),
                EntityKind::Teams => format!("Show the current sprint for {name}"),
                EntityKind::Users => format!("What is {name} working on?"),
                EntityKind::States => format!("Show items in state {name}"),
                EntityKind::Types => format!("List open {name} items"),
                EntityKind::Tags => format!("Show items tagged {name}"),
                EntityKind::Sprints => format!("What was completed in {name}?"),
                EntityKind::Queries => format!("Run the saved query {name}"),
            })
            .take(self.max_suggestions)
            .collect();
        if suggestions.is_empty() {
            suggestions = default_suggestions(self.max_suggestions);
        }

        SynthesisOutcome {
            summary,
            insights: vec![],
            suggestions,
            outcome: StageOutcome::Succeeded,
            tokens: 0,
            provider: None,
            detail: Some("answered from reference data".to_string()),
        }
    }

    fn user_prompt(&self, query: &str, analysis: &QueryAnalysis, items: &[WorkItem]) -> String {
        if !analysis.needs_backend_data {
            return query.to_string();
        }
        let shown: Vec<_> = items
            .iter()
            .take(self.max_items)
            .map(|i| {
                json!({
                    "id": i.id,
                    "title": i.title,
                    "state": i.state,
                    "type": i.item_type,
                    "assignedTo": i.assigned_to,
                    "tags": i.tags,
                    "priority": i.priority,
                    "iteration": i.iteration_path,
                    "changed": i.changed_date,
                })
            })
            .collect();
        let data = serde_json::to_string(&shown).unwrap_or_else(|_| "[]".to_string());
        format!(
            "Question: {query}\n\nMatching work items ({} total, {} shown):\n{data}",
            items.len(),
            shown.len()
        )
    }

    fn fallback(&self, analysis: &QueryAnalysis, items: &[WorkItem], detail: String, tokens: u64) -> SynthesisOutcome {
        SynthesisOutcome {
            summary: generic_summary(analysis, items),
            insights: vec![],
            suggestions: self.suggestions_for_items(analysis, items),
            outcome: StageOutcome::FellBack,
            tokens,
            provider: None,
            detail: Some(detail),
        }
    }

    /// Deterministic follow-ups derived from what was retrieved.
    pub fn suggestions_for_items(&self, analysis: &QueryAnalysis, items: &[WorkItem]) -> Vec<String> {
        let mut out = Vec::new();
        if analysis.needs_backend_data && !items.is_empty() {
            if items.iter().any(|i| i.item_type.eq_ignore_ascii_case("bug")) {
                out.push("Show only the bugs".to_string());
            }
            if items.iter().any(|i| i.assigned_to.is_none()) {
                out.push("Which of these are unassigned?".to_string());
            }
            out.push("Group these by assignee".to_string());
            out.push("Which of these changed this week?".to_string());
        }
        out.extend(DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()));
        clean_list(out, self.max_suggestions)
    }
}

fn generic_summary(analysis: &QueryAnalysis, items: &[WorkItem]) -> String {
    if !analysis.needs_backend_data {
        return "I couldn't generate an answer right now. Try asking about specific work items."
            .to_string();
    }
    match items.len() {
        0 => "No matching work items were found.".to_string(),
        1 => "Found 1 matching work item.".to_string(),
        n => format!("Found {n} matching work items."),
    }
}

fn default_suggestions(max: usize) -> Vec<String> {
    DEFAULT_SUGGESTIONS
        .iter()
        .take(max)
        .map(|s| s.to_string())
        .collect()
}

fn validate(reply: &SynthesisReply) -> Result<(), String> {
    if reply.summary.trim().is_empty() {
        return Err("summary is empty".to_string());
    }
    Ok(())
}

/// Trim, drop empties and duplicates, keep at most `max`.
fn clean_list(values: Vec<String>, max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim().to_string();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
        if out.len() >= max {
            break;
        }
    }
    out
}
