//! Query orchestrator: central coordinator for one question.
//!
//! Runs collection detection, intent analysis, retrieval and synthesis in
//! order, records the exchange in the conversation store and aggregates
//! per-stage metrics. Upstream failures degrade the answer; they never
//! escape as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use workq_core::config::OrchestratorConfig;
use workq_core::types::{
    ContextStats, Conversation, EntityKind, GlobalFilters, Message, MetadataSnapshot,
    OrchestratorResult, QueryAnalysis, QueryOptions, ResultMetadata, Role, SearchCriteria, Stage,
    StageOutcome, StageReport, Visualization, DEFAULT_SUGGESTIONS,
};
use workq_provider::{Deadline, LlmProvider, ProviderError};
use workq_storage::ConversationStore;

use crate::collection::CollectionDetector;
use crate::error::ChatError;
use crate::intent::{normalize_criteria, IntentAnalyzer};
use crate::metadata::MetadataCache;
use crate::selector::{Availability, BackendSelector};
use crate::synthesis::{SynthesisOutcome, Synthesizer};
use crate::visualize::build_visualizations;

/// Data source tag for answers served from reference data.
const METADATA_SOURCE: &str = "metadata";

const TIMEOUT_SUMMARY: &str =
    "The request took too long to complete. Try a narrower question or try again shortly.";

/// One question from one user.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query: String,
    pub conversation_id: Option<Uuid>,
    pub user_id: String,
    pub filters: GlobalFilters,
    pub options: QueryOptions,
}

/// Everything a pipeline run produced before persistence.
#[derive(Debug, Default)]
struct PipelineRun {
    success: bool,
    summary: String,
    analysis: Option<QueryAnalysis>,
    insights: Vec<String>,
    raw_data: Vec<Value>,
    suggestions: Vec<String>,
    visualizations: Vec<Visualization>,
    queries_executed: u32,
    data_sources: Vec<String>,
    cache_hit: bool,
    stages: Vec<StageReport>,
    tokens: u64,
}

impl PipelineRun {
    fn stage(&mut self, stage: Stage, outcome: StageOutcome, detail: Option<String>) {
        debug!(?stage, ?outcome, detail = detail.as_deref().unwrap_or(""), "Stage finished");
        self.stages.push(StageReport {
            stage,
            outcome,
            detail,
        });
    }

    fn source(&mut self, source: &str) {
        if !self.data_sources.iter().any(|s| s == source) {
            self.data_sources.push(source.to_string());
        }
    }

    fn apply_synthesis(&mut self, synthesis: SynthesisOutcome) {
        self.stage(Stage::Synthesis, synthesis.outcome, synthesis.detail);
        if let Some(provider) = synthesis.provider.as_deref() {
            self.source(provider);
        }
        self.tokens += synthesis.tokens;
        self.summary = synthesis.summary;
        self.insights = synthesis.insights;
        self.suggestions = synthesis.suggestions;
    }

    fn fail(&mut self, summary: String) {
        self.success = false;
        self.summary = summary;
        self.suggestions = DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()).collect();
    }

    /// First answering stage that has not reported yet.
    fn pending_stage(&self) -> Stage {
        [Stage::IntentAnalysis, Stage::Retrieval, Stage::Synthesis]
            .into_iter()
            .find(|stage| !self.stages.iter().any(|s| s.stage == *stage))
            .unwrap_or(Stage::Synthesis)
    }
}

pub struct QueryOrchestrator {
    store: Arc<ConversationStore>,
    selector: Arc<BackendSelector>,
    metadata: Arc<MetadataCache>,
    detector: CollectionDetector,
    intent: IntentAnalyzer,
    synthesizer: Synthesizer,
    config: OrchestratorConfig,
    prefer_enhanced: bool,
    model: String,
}

impl QueryOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        llm: Arc<dyn LlmProvider>,
        selector: Arc<BackendSelector>,
        metadata: Arc<MetadataCache>,
        config: OrchestratorConfig,
        prefer_enhanced: bool,
    ) -> Self {
        let model = if llm.model().is_empty() {
            config.default_model.clone()
        } else {
            llm.model().to_string()
        };
        Self {
            store,
            selector,
            metadata,
            detector: CollectionDetector::new(),
            intent: IntentAnalyzer::new(Arc::clone(&llm)),
            synthesizer: Synthesizer::new(
                llm,
                config.max_suggestions,
                config.max_items_for_synthesis,
            ),
            config,
            prefer_enhanced,
            model,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    /// Answer one question.
    ///
    /// Returns an error only for invalid input, ownership violations and
    /// storage failures before the pipeline starts. Everything else,
    /// including running out of time, yields a well-formed result.
    pub async fn process(&self, request: QueryRequest) -> Result<OrchestratorResult, ChatError> {
        let started = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyQuery);
        }
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(ChatError::MissingUser);
        }

        let conversation = self.resolve_conversation(request.conversation_id, user_id)?;
        let history = self
            .store
            .get_messages(conversation.id, self.store.context_window())?;

        let budget = Duration::from_secs(self.config.request_timeout_secs);
        let deadline = Deadline::after(budget);
        let mut run = PipelineRun {
            success: true,
            ..Default::default()
        };
        let pipeline = self.run_pipeline(
            &mut run,
            query,
            user_id,
            &request.filters,
            request.options,
            &history,
            &deadline,
        );
        if tokio::time::timeout(budget, pipeline).await.is_err() {
            // Stages that finished before the deadline are kept.
            let pending = run.pending_stage();
            warn!(
                conversation_id = %conversation.id,
                budget_secs = budget.as_secs(),
                ?pending,
                "Query exceeded its time budget"
            );
            run.fail(TIMEOUT_SUMMARY.to_string());
            run.stage(
                pending,
                StageOutcome::Failed,
                Some("request deadline exceeded".to_string()),
            );
        }

        let confidence_before = confidence(&run.stages);
        match self.persist(conversation.id, query, &run, confidence_before) {
            Ok(()) => run.stage(Stage::Persistence, StageOutcome::Succeeded, None),
            Err(e) => {
                error!(conversation_id = %conversation.id, error = %e, "Failed to record exchange");
                run.stage(Stage::Persistence, StageOutcome::Failed, Some(e.to_string()));
            }
        }

        let metadata = ResultMetadata {
            queries_executed: run.queries_executed,
            data_sources: run.data_sources,
            confidence: confidence(&run.stages),
            processing_time: started.elapsed().as_millis() as u64,
            cache_hit: run.cache_hit,
            stages: request.options.verbose.then_some(run.stages),
        };
        info!(
            conversation_id = %conversation.id,
            success = run.success,
            confidence = metadata.confidence,
            processing_ms = metadata.processing_time,
            "Query processed"
        );

        Ok(OrchestratorResult {
            success: run.success,
            summary: run.summary,
            analysis: run.analysis,
            insights: run.insights,
            raw_data: run.raw_data,
            suggestions: run.suggestions,
            visualizations: run.visualizations,
            metadata,
            conversation_id: Some(conversation.id),
        })
    }

    /// Statistics for a conversation owned by `user_id`; `None` when it
    /// does not exist.
    pub fn get_context_stats(
        &self,
        conversation_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextStats>, ChatError> {
        match self.store.get_conversation(conversation_id)? {
            None => Ok(None),
            Some(c) if !c.is_owned_by(user_id) => Err(ChatError::Forbidden(conversation_id)),
            Some(c) => Ok(Some(ContextStats::from(&c))),
        }
    }

    /// Delete a conversation owned by `user_id`. Returns whether it existed.
    pub fn clear_context(&self, conversation_id: Uuid, user_id: &str) -> Result<bool, ChatError> {
        match self.store.get_conversation(conversation_id)? {
            None => Ok(false),
            Some(c) if !c.is_owned_by(user_id) => Err(ChatError::Forbidden(conversation_id)),
            Some(_) => Ok(self.store.delete_conversation(conversation_id)?),
        }
    }

    fn resolve_conversation(
        &self,
        conversation_id: Option<Uuid>,
        user_id: &str,
    ) -> Result<Conversation, ChatError> {
        match conversation_id {
            Some(id) => {
                let conversation = self
                    .store
                    .get_conversation(id)?
                    .ok_or(ChatError::ConversationNotFound(id))?;
                if !conversation.is_owned_by(user_id) {
                    warn!(conversation_id = %id, "Rejected access to another user's conversation");
                    return Err(ChatError::Forbidden(id));
                }
                Ok(conversation)
            }
            None => Ok(self
                .store
                .create_conversation(user_id, None, Some(&self.model), None)?),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        run: &mut PipelineRun,
        query: &str,
        user_id: &str,
        filters: &GlobalFilters,
        options: QueryOptions,
        history: &[Message],
        deadline: &Deadline,
    ) {
        let detected = self.detector.detect(query);
        if let Some(kind) = detected.kind.filter(|_| detected.is_high()) {
            run.stage(
                Stage::CollectionDetection,
                StageOutcome::Succeeded,
                Some(format!("{} ({})", kind, detected.keywords.join(" "))),
            );
            run.stage(Stage::IntentAnalysis, StageOutcome::Skipped, None);
            run.analysis = Some(QueryAnalysis {
                needs_backend_data: true,
                search_criteria: Some(SearchCriteria {
                    entity_kind: Some(kind),
                    ..Default::default()
                }),
                intent: "list_collection".to_string(),
                requires_summary: false,
            });

            match self.snapshot(options.skip_cache, deadline).await {
                Ok((snapshot, cached)) => {
                    self.answer_from_snapshot(run, kind, &snapshot, cached)
                }
                Err(e) => {
                    run.stage(Stage::Retrieval, StageOutcome::Failed, Some(e.to_string()));
                    run.stage(Stage::Synthesis, StageOutcome::Skipped, None);
                    run.fail(e.user_message());
                }
            }
            return;
        }

        // Reference data is only needed after analysis, so fetch both at once.
        let (intent, prefetched) = tokio::join!(
            self.intent.analyze(query, history, deadline),
            self.snapshot(options.skip_cache, deadline),
        );
        run.stage(Stage::IntentAnalysis, intent.outcome, intent.detail);
        run.tokens += intent.tokens;
        if let Some(provider) = intent.provider.as_deref() {
            run.source(provider);
        }
        let snapshot = match prefetched {
            Ok((snapshot, _)) => Some(snapshot),
            Err(e) => {
                debug!(error = %e, "Metadata prefetch failed");
                None
            }
        };

        let mut analysis = intent.analysis;
        let criteria = if analysis.needs_backend_data {
            let mut criteria = analysis.search_criteria.take().unwrap_or_default();
            criteria.apply_filters(filters);
            // The tracker resolves "@me" against its service token, not the asker.
            criteria.resolve_self_reference(user_id);
            if criteria.has_item_filters() {
                criteria.entity_kind = None;
            }
            if let Some(snapshot) = &snapshot {
                normalize_criteria(&mut criteria, snapshot);
            }
            analysis.search_criteria = Some(criteria.clone());
            Some(criteria)
        } else {
            None
        };
        run.analysis = Some(analysis.clone());

        let Some(criteria) = criteria else {
            run.stage(Stage::Retrieval, StageOutcome::Skipped, None);
            let synthesis = self
                .synthesizer
                .synthesize(query, &analysis, &[], history, deadline)
                .await;
            run.apply_synthesis(synthesis);
            return;
        };

        if let Some(kind) = criteria.entity_kind {
            match snapshot {
                Some(snapshot) => self.answer_from_snapshot(run, kind, &snapshot, false),
                None => {
                    run.stage(
                        Stage::Retrieval,
                        StageOutcome::Failed,
                        Some("reference data unavailable".to_string()),
                    );
                    run.stage(Stage::Synthesis, StageOutcome::Skipped, None);
                    run.fail(format!(
                        "I couldn't load the list of {} right now. Please try again shortly.",
                        kind.as_str()
                    ));
                }
            }
            return;
        }

        let mut availability = Availability::default();
        let fetched = self
            .selector
            .fetch(
                &criteria,
                self.prefer_enhanced,
                options.skip_cache,
                &mut availability,
                deadline,
            )
            .await;
        let fetch = match fetched {
            Ok(fetch) => fetch,
            Err(e) => {
                run.stage(Stage::Retrieval, StageOutcome::Failed, Some(e.to_string()));
                run.stage(Stage::Synthesis, StageOutcome::Skipped, None);
                run.fail(retrieval_failure_message(&e));
                return;
            }
        };

        let outcome = if fetch.fell_back {
            StageOutcome::FellBack
        } else {
            StageOutcome::Succeeded
        };
        run.stage(
            Stage::Retrieval,
            outcome,
            Some(format!("{} items from {}", fetch.items.len(), fetch.source)),
        );
        run.source(fetch.source.as_str());
        run.queries_executed += fetch.queries_executed;
        run.cache_hit |= fetch.cache_hit;

        let synthesis = self
            .synthesizer
            .synthesize(query, &analysis, &fetch.items, history, deadline)
            .await;
        run.apply_synthesis(synthesis);

        run.visualizations = build_visualizations(&fetch.items);
        run.raw_data = fetch
            .items
            .iter()
            .filter_map(|item| serde_json::to_value(item).ok())
            .collect();
    }

    fn answer_from_snapshot(
        &self,
        run: &mut PipelineRun,
        kind: EntityKind,
        snapshot: &MetadataSnapshot,
        cached: bool,
    ) {
        run.stage(
            Stage::Retrieval,
            StageOutcome::Succeeded,
            Some(format!("{} {} from reference data", snapshot.count(kind), kind)),
        );
        run.source(METADATA_SOURCE);
        run.cache_hit |= cached;
        run.raw_data = match snapshot.collection_json(kind) {
            Value::Array(entries) => entries,
            _ => vec![],
        };
        let synthesis = self.synthesizer.summarize_collection(kind, snapshot);
        run.apply_synthesis(synthesis);
    }

    async fn snapshot(
        &self,
        force_refresh: bool,
        deadline: &Deadline,
    ) -> Result<(Arc<MetadataSnapshot>, bool), ProviderError> {
        if force_refresh {
            self.metadata.refresh(deadline).await.map(|s| (s, false))
        } else {
            self.metadata.preload(deadline).await
        }
    }

    fn persist(
        &self,
        conversation_id: Uuid,
        query: &str,
        run: &PipelineRun,
        confidence: f32,
    ) -> Result<(), ChatError> {
        self.store
            .add_message(conversation_id, Role::User, query, None)?;
        self.store.add_message(
            conversation_id,
            Role::Assistant,
            &run.summary,
            Some(json!({
                "tokens": run.tokens,
                "dataSources": run.data_sources,
                "confidence": confidence,
                "success": run.success,
            })),
        )?;
        Ok(())
    }
}

/// Mean weight of the stages that ran; zero when none did.
fn confidence(stages: &[StageReport]) -> f32 {
    let weights: Vec<f32> = stages.iter().filter_map(|s| s.outcome.weight()).collect();
    if weights.is_empty() {
        return 0.0;
    }
    weights.iter().sum::<f32>() / weights.len() as f32
}

fn retrieval_failure_message(err: &ProviderError) -> String {
    match err {
        ProviderError::Upstream { .. } if err.is_rate_limited() => err.user_message(),
        ProviderError::Configuration(_) => err.user_message(),
        _ => "I couldn't reach the work tracker right now. Please try again shortly.".to_string(),
    }
}
