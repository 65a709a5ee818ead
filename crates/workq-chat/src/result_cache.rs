//! Short-lived cache of backend fetches keyed by normalized criteria.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use workq_core::types::{BackendSource, SearchCriteria, WorkItem};

#[derive(Debug, Clone)]
struct Entry {
    items: Arc<Vec<WorkItem>>,
    source: BackendSource,
    stored_at: Instant,
}

/// A cached fetch.
#[derive(Debug, Clone)]
pub struct CachedFetch {
    pub items: Arc<Vec<WorkItem>>,
    pub source: BackendSource,
}

/// Upper bound on live entries unless overridden.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Concurrent TTL cache shared by every request.
///
/// Expired entries are purged on every insert, and the oldest entry is
/// evicted once `max_entries` is reached.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<SearchCriteria, Entry>,
    ttl: Duration,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Fresh entry for `criteria`, if any. Expired entries are evicted.
    pub fn get(&self, criteria: &SearchCriteria) -> Option<CachedFetch> {
        if self.ttl.is_zero() {
            return None;
        }
        let key = normalize(criteria);
        let hit = self.entries.get(&key).and_then(|entry| {
            (entry.stored_at.elapsed() < self.ttl).then(|| CachedFetch {
                items: Arc::clone(&entry.items),
                source: entry.source,
            })
        });
        if hit.is_none() {
            self.entries.remove(&key);
        }
        hit
    }

    pub fn insert(&self, criteria: &SearchCriteria, items: Arc<Vec<WorkItem>>, source: BackendSource) {
        if self.ttl.is_zero() {
            return;
        }
        let key = normalize(criteria);
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Entry {
                items,
                source,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().stored_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trim and lower-case every text field and sort tags so that equivalent
/// criteria share one entry.
fn normalize(criteria: &SearchCriteria) -> SearchCriteria {
    let clean = |s: &Option<String>| {
        s.as_deref()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
    };
    let mut tags: Vec<String> = criteria
        .tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();

    SearchCriteria {
        entity_kind: criteria.entity_kind,
        status: clean(&criteria.status),
        item_type: clean(&criteria.item_type),
        tags,
        assignee: clean(&criteria.assignee),
        free_text: clean(&criteria.free_text),
        priority: criteria.priority,
        timeframe: clean(&criteria.timeframe),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Arc<Vec<WorkItem>> {
        Arc::new(vec![WorkItem {
            id: 1,
            title: "Login fails".into(),
            state: "Active".into(),
            item_type: "Bug".into(),
            assigned_to: None,
            tags: vec![],
            priority: None,
            iteration_path: None,
            parent_id: None,
            changed_date: None,
            url: None,
            relevance: None,
        }])
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_and_expiry() {
        let cache = ResultCache::new(Duration::from_secs(120));
        let criteria = SearchCriteria {
            status: Some("Active".into()),
            ..Default::default()
        };
        cache.insert(&criteria, items(), BackendSource::Rest);

        let hit = cache.get(&criteria).unwrap();
        assert_eq!(hit.items.len(), 1);
        assert_eq!(hit.source, BackendSource::Rest);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(cache.get(&criteria).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_equivalent_criteria_share_an_entry() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let a = SearchCriteria {
            status: Some(" Active ".into()),
            tags: vec!["Release".into(), "api".into()],
            ..Default::default()
        };
        let b = SearchCriteria {
            status: Some("active".into()),
            tags: vec!["API".into(), "release".into()],
            ..Default::default()
        };
        cache.insert(&a, items(), BackendSource::Enhanced);
        assert!(cache.get(&b).is_some());
        assert_eq!(cache.len(), 1);
    }

    fn free_text(n: usize) -> SearchCriteria {
        SearchCriteria {
            free_text: Some(format!("checkout flow {n}")),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_purges_expired_entries() {
        let cache = ResultCache::new(Duration::from_secs(120));
        for n in 0..50 {
            cache.insert(&free_text(n), items(), BackendSource::Rest);
        }
        assert_eq!(cache.len(), 50);

        tokio::time::advance(Duration::from_secs(121)).await;
        cache.insert(&free_text(50), items(), BackendSource::Rest);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&free_text(50)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = ResultCache::new(Duration::from_secs(600)).with_max_entries(8);
        for n in 0..100 {
            cache.insert(&free_text(n), items(), BackendSource::Rest);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 8);
        assert!(cache.get(&free_text(99)).is_some());
        assert!(cache.get(&free_text(0)).is_none());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = ResultCache::new(Duration::ZERO);
        let criteria = SearchCriteria::default();
        cache.insert(&criteria, items(), BackendSource::Rest);
        assert!(cache.get(&criteria).is_none());
        assert!(cache.is_empty());
    }
}
