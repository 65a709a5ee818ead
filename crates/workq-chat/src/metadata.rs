//! Cache-aside store of organization-wide reference data.
//!
//! The current snapshot lives behind an [`ArcSwapOption`]: readers load an
//! `Arc` without locking and a refresh swaps in a complete new snapshot, so
//! no reader ever sees a half-updated one.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use tracing::{debug, info};

use workq_core::types::{MetadataSnapshot, MetadataStats};
use workq_provider::{Deadline, MetadataSource, ProviderError};

pub struct MetadataCache {
    source: Arc<dyn MetadataSource>,
    snapshot: ArcSwapOption<MetadataSnapshot>,
    ttl: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>, ttl: Duration) -> Self {
        Self {
            source,
            snapshot: ArcSwapOption::empty(),
            ttl,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The cached snapshot regardless of age.
    pub fn current(&self) -> Option<Arc<MetadataSnapshot>> {
        self.snapshot.load_full()
    }

    /// Cached snapshot when fresh, otherwise a full refresh.
    pub async fn preload_all(
        &self,
        deadline: &Deadline,
    ) -> Result<Arc<MetadataSnapshot>, ProviderError> {
        self.preload(deadline).await.map(|(snapshot, _)| snapshot)
    }

    /// Like [`preload_all`](Self::preload_all), also reporting whether the
    /// snapshot came from the cache.
    pub async fn preload(
        &self,
        deadline: &Deadline,
    ) -> Result<(Arc<MetadataSnapshot>, bool), ProviderError> {
        if let Some(snapshot) = self.fresh() {
            debug!(last_updated = %snapshot.last_updated, "Metadata cache hit");
            return Ok((snapshot, true));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(snapshot) = self.fresh() {
            return Ok((snapshot, true));
        }
        self.fetch_and_swap(deadline).await.map(|s| (s, false))
    }

    /// Unconditional fetch of every category and atomic replacement.
    pub async fn refresh(&self, deadline: &Deadline) -> Result<Arc<MetadataSnapshot>, ProviderError> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_swap(deadline).await
    }

    pub fn stats(&self) -> MetadataStats {
        match self.current() {
            Some(snapshot) => MetadataStats {
                cached: true,
                last_updated: Some(snapshot.last_updated),
                counts: snapshot.counts(),
            },
            None => MetadataStats {
                cached: false,
                last_updated: None,
                counts: Default::default(),
            },
        }
    }

    fn fresh(&self) -> Option<Arc<MetadataSnapshot>> {
        let snapshot = self.current()?;
        let age = Utc::now()
            .signed_duration_since(snapshot.last_updated)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (age < self.ttl).then_some(snapshot)
    }

    async fn fetch_and_swap(
        &self,
        deadline: &Deadline,
    ) -> Result<Arc<MetadataSnapshot>, ProviderError> {
        let source = &self.source;
        let (sprints, users, states, types, tags, queries, projects, teams) = tokio::try_join!(
            source.sprints(deadline),
            source.users(deadline),
            source.states(deadline),
            source.types(deadline),
            source.tags(deadline),
            source.queries(deadline),
            source.projects(deadline),
            source.teams(deadline),
        )?;

        let mut last_updated = Utc::now();
        if let Some(previous) = self.current() {
            if last_updated <= previous.last_updated {
                last_updated = previous.last_updated + chrono::Duration::milliseconds(1);
            }
        }

        let snapshot = Arc::new(MetadataSnapshot {
            sprints,
            users,
            states,
            types,
            tags,
            queries,
            projects,
            teams,
            last_updated,
        });
        self.snapshot.store(Some(Arc::clone(&snapshot)));
        info!(
            last_updated = %snapshot.last_updated,
            projects = snapshot.projects.len(),
            users = snapshot.users.len(),
            "Metadata snapshot refreshed"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use workq_core::types::{
        Project, SavedQuery, Sprint, Tag, Team, TimeFrame, TrackerUser, WorkItemState,
        WorkItemType,
    };

    /// In-memory reference data with a call counter.
    pub(crate) struct FakeMetadata {
        pub fetches: AtomicUsize,
        pub fail: bool,
    }

    impl FakeMetadata {
        pub(crate) fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl MetadataSource for FakeMetadata {
        async fn sprints(&self, _: &Deadline) -> Result<Vec<Sprint>, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Sprint {
                id: "s42".into(),
                name: "Sprint 42".into(),
                path: "Platform\\Sprint 42".into(),
                start_date: None,
                finish_date: None,
                time_frame: Some(TimeFrame::Current),
            }])
        }
        async fn users(&self, _: &Deadline) -> Result<Vec<TrackerUser>, ProviderError> {
            Ok(vec![TrackerUser {
                id: "u1".into(),
                display_name: "Ada Lovelace".into(),
                email: Some("ada@example.com".into()),
            }])
        }
        async fn states(&self, _: &Deadline) -> Result<Vec<WorkItemState>, ProviderError> {
            Ok(["New", "Active", "Resolved", "Closed"]
                .into_iter()
                .map(|name| WorkItemState {
                    name: name.into(),
                    category: None,
                })
                .collect())
        }
        async fn types(&self, _: &Deadline) -> Result<Vec<WorkItemType>, ProviderError> {
            Ok(["Bug", "Task", "User Story"]
                .into_iter()
                .map(|name| WorkItemType {
                    name: name.into(),
                    description: None,
                })
                .collect())
        }
        async fn tags(&self, _: &Deadline) -> Result<Vec<Tag>, ProviderError> {
            Ok(vec![Tag {
                id: "t1".into(),
                name: "release".into(),
            }])
        }
        async fn queries(&self, _: &Deadline) -> Result<Vec<SavedQuery>, ProviderError> {
            Ok(vec![])
        }
        async fn projects(&self, _: &Deadline) -> Result<Vec<Project>, ProviderError> {
            if self.fail {
                return Err(ProviderError::Configuration("tracker not configured".into()));
            }
            Ok(vec![
                Project {
                    id: "p1".into(),
                    name: "Platform".into(),
                    description: None,
                },
                Project {
                    id: "p2".into(),
                    name: "Mobile".into(),
                    description: Some("iOS and Android".into()),
                },
            ])
        }
        async fn teams(&self, _: &Deadline) -> Result<Vec<Team>, ProviderError> {
            Ok(vec![Team {
                id: "team1".into(),
                name: "Platform Team".into(),
                description: None,
            }])
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_preload_within_ttl_returns_same_snapshot() {
        let source = Arc::new(FakeMetadata::new());
        let cache = MetadataCache::new(source.clone(), Duration::from_secs(3600));

        let (first, first_cached) = cache.preload(&deadline()).await.unwrap();
        let (second, second_cached) = cache.preload(&deadline()).await.unwrap();
        assert!(!first_cached);
        assert!(second_cached);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refetches() {
        let source = Arc::new(FakeMetadata::new());
        let cache = MetadataCache::new(source.clone(), Duration::ZERO);
        cache.preload_all(&deadline()).await.unwrap();
        cache.preload_all(&deadline()).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_strictly_increases_last_updated() {
        let cache = MetadataCache::new(Arc::new(FakeMetadata::new()), Duration::from_secs(3600));
        let mut previous = cache.refresh(&deadline()).await.unwrap();
        for _ in 0..5 {
            let next = cache.refresh(&deadline()).await.unwrap();
            assert!(next.last_updated > previous.last_updated);
            assert!(!Arc::ptr_eq(&next, &previous));
            previous = next;
        }
    }

    #[tokio::test]
    async fn test_stats_before_and_after_preload() {
        let cache = MetadataCache::new(Arc::new(FakeMetadata::new()), Duration::from_secs(60));
        let empty = cache.stats();
        assert!(!empty.cached);
        assert!(empty.last_updated.is_none());

        cache.preload_all(&deadline()).await.unwrap();
        let stats = cache.stats();
        assert!(stats.cached);
        assert_eq!(stats.counts["projects"], 2);
        assert_eq!(stats.counts["states"], 4);
        assert_eq!(stats.counts.len(), 8);
    }

    #[tokio::test]
    async fn test_failed_refresh_stores_nothing() {
        let cache = MetadataCache::new(Arc::new(FakeMetadata::failing()), Duration::from_secs(60));
        assert!(cache.refresh(&deadline()).await.is_err());
        assert!(cache.current().is_none());
    }
}
