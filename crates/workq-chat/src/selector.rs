//! Choice between the enhanced and REST work-item access modes.
//!
//! Enhanced mode is tried first when it is configured, preferred and
//! available. Any failure there is retried once through REST and the
//! result is tagged with the mode that actually served it.

use std::sync::Arc;

use tracing::{debug, warn};

use workq_core::types::{BackendSource, SearchCriteria, WorkItem};
use workq_provider::{Deadline, ProviderError, WorkItemBackend};

use crate::result_cache::ResultCache;

/// Per-request availability flags, probed lazily on first use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Availability {
    pub enhanced: Option<bool>,
    pub rest: Option<bool>,
}

/// Items plus where they came from.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub items: Arc<Vec<WorkItem>>,
    pub source: BackendSource,
    pub cache_hit: bool,
    /// Backend searches issued, including a failed enhanced attempt.
    pub queries_executed: u32,
    /// Enhanced mode was attempted and REST served the result instead.
    pub fell_back: bool,
}

pub struct BackendSelector {
    enhanced: Option<Arc<dyn WorkItemBackend>>,
    rest: Arc<dyn WorkItemBackend>,
    cache: Arc<ResultCache>,
}

impl BackendSelector {
    pub fn new(
        enhanced: Option<Arc<dyn WorkItemBackend>>,
        rest: Arc<dyn WorkItemBackend>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            enhanced,
            rest,
            cache,
        }
    }

    pub fn enhanced_configured(&self) -> bool {
        self.enhanced.is_some()
    }

    pub async fn fetch(
        &self,
        criteria: &SearchCriteria,
        prefer_enhanced: bool,
        skip_cache: bool,
        availability: &mut Availability,
        deadline: &Deadline,
    ) -> Result<FetchOutcome, ProviderError> {
        if !skip_cache {
            if let Some(hit) = self.cache.get(criteria) {
                debug!(source = %hit.source, items = hit.items.len(), "Result cache hit");
                return Ok(FetchOutcome {
                    items: hit.items,
                    source: hit.source,
                    cache_hit: true,
                    queries_executed: 0,
                    fell_back: false,
                });
            }
        }

        let mut queries_executed = 0;
        let mut fell_back = false;

        if let Some(enhanced) = self.enhanced.as_ref().filter(|_| prefer_enhanced) {
            let available = match availability.enhanced {
                Some(known) => known,
                None => {
                    let probed = enhanced.probe(deadline).await;
                    availability.enhanced = Some(probed);
                    probed
                }
            };

            if available {
                queries_executed += 1;
                match enhanced.search(criteria, deadline).await {
                    Ok(items) => {
                        return Ok(self.finish(
                            criteria,
                            items,
                            BackendSource::Enhanced,
                            queries_executed,
                            false,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Enhanced search failed, falling back to REST");
                        availability.enhanced = Some(false);
                        fell_back = true;
                    }
                }
            } else {
                debug!("Enhanced mode unavailable, using REST");
            }
        }

        let rest_available = match availability.rest {
            Some(known) => known,
            None => {
                let probed = self.rest.probe(deadline).await;
                availability.rest = Some(probed);
                probed
            }
        };
        if !rest_available {
            return Err(ProviderError::Configuration(
                "The work tracker is not configured. Set tracker.organization, tracker.project \
                 and WORKQ_TRACKER_TOKEN."
                    .to_string(),
            ));
        }

        queries_executed += 1;
        let items = self.rest.search(criteria, deadline).await?;
        Ok(self.finish(criteria, items, BackendSource::Rest, queries_executed, fell_back))
    }

    fn finish(
        &self,
        criteria: &SearchCriteria,
        items: Vec<WorkItem>,
        source: BackendSource,
        queries_executed: u32,
        fell_back: bool,
    ) -> FetchOutcome {
        let items = Arc::new(items);
        self.cache.insert(criteria, Arc::clone(&items), source);
        FetchOutcome {
            items,
            source,
            cache_hit: false,
            queries_executed,
            fell_back,
        }
    }
}
