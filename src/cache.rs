//! Per-credential cache tiers.
//!
//! ## Tiers
//!
//! 1. **ActivityStore**: normalized activities per credential, loaded once from
//!    the provider.
//! 2. **ResultStore**: finished query responses per credential and filter set.
//!
//! The third tier, shared across credentials, lives in [`crate::boundary`].
//! Both tiers here are volatile, have no TTL, and are dropped on logout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::activity::{ActivityRecord, QueryParams, RawActivity};
use crate::config::ProviderConfig;
use crate::provider::ActivityProvider;
use crate::service::MapResponse;
use crate::timeline::TimelineResponse;

type ActivitySlot = Arc<OnceCell<Arc<Vec<ActivityRecord>>>>;

// ============================================================================
// Tier 1: Activities
// ============================================================================

/// Normalized activities per credential.
///
/// Concurrent first requests for a credential share a single upstream load.
#[derive(Debug, Default)]
pub struct ActivityStore {
    entries: Mutex<HashMap<String, ActivitySlot>>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activities for `credential`, sorted by start time ascending. The first
    /// call fetches every page from `provider`; later calls are served from memory.
    pub async fn get_or_load<P: ActivityProvider>(
        &self,
        credential: &str,
        provider: &P,
        config: &ProviderConfig,
    ) -> Arc<Vec<ActivityRecord>> {
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(credential.to_string()).or_default())
        };

        let records = slot
            .get_or_init(|| async {
                Arc::new(load_activities(provider, credential, config).await)
            })
            .await;
        Arc::clone(records)
    }

    /// Cached activities, without loading.
    pub fn get(&self, credential: &str) -> Option<Arc<Vec<ActivityRecord>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(credential).and_then(|slot| slot.get().cloned())
    }

    pub fn invalidate(&self, credential: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(credential);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetch pages until an empty page, an error, or the page cap.
async fn load_activities<P: ActivityProvider>(
    provider: &P,
    credential: &str,
    config: &ProviderConfig,
) -> Vec<ActivityRecord> {
    let start = Instant::now();
    let mut raw: Vec<RawActivity> = Vec::new();
    let mut pages = 0;

    for page in 1..=config.max_pages {
        match provider.fetch_page(credential, page, config.per_page).await {
            Ok(items) if items.is_empty() => break,
            Ok(items) => {
                pages += 1;
                raw.extend(items);
            }
            Err(e) => {
                warn!("[ActivityStore] Stopping at page {}: {}", page, e);
                break;
            }
        }
    }

    let mut records: Vec<ActivityRecord> = raw
        .iter()
        .filter_map(|activity| match activity.normalize() {
            Ok(record) => record,
            Err(e) => {
                debug!("[ActivityStore] Skipping activity: {}", e);
                None
            }
        })
        .collect();
    records.sort_by(|a, b| a.start_local.cmp(&b.start_local));

    info!(
        "[ActivityStore] Loaded {} pages, kept {}/{} activities ({} ms)",
        pages,
        records.len(),
        raw.len(),
        start.elapsed().as_millis()
    );
    records
}

// ============================================================================
// Tier 2: Computed results
// ============================================================================

/// Which response a cached entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Timeline,
    Map,
}

/// Result cache key within one credential's partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub kind: QueryKind,
    pub params: QueryParams,
}

impl ResultKey {
    pub fn new(kind: QueryKind, params: &QueryParams) -> Self {
        Self {
            kind,
            params: params.clone(),
        }
    }
}

/// A finished response, shared with every cache hit.
#[derive(Debug, Clone)]
pub enum CachedResponse {
    Timeline(Arc<TimelineResponse>),
    Map(Arc<MapResponse>),
}

impl CachedResponse {
    pub fn into_timeline(self) -> Option<Arc<TimelineResponse>> {
        match self {
            CachedResponse::Timeline(response) => Some(response),
            CachedResponse::Map(_) => None,
        }
    }

    pub fn into_map(self) -> Option<Arc<MapResponse>> {
        match self {
            CachedResponse::Map(response) => Some(response),
            CachedResponse::Timeline(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct ResultPartitions {
    responses: HashMap<String, HashMap<ResultKey, CachedResponse>>,
    /// Bumped on every invalidation of a credential
    epochs: HashMap<String, u64>,
}

/// Computed responses partitioned by credential.
///
/// Writers pass the [`epoch`](Self::epoch) they observed before computing; a
/// response computed across an invalidation is returned to its caller but
/// not stored.
#[derive(Debug, Default)]
pub struct ResultStore {
    entries: Mutex<ResultPartitions>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, credential: &str, key: &ResultKey) -> Option<CachedResponse> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .responses
            .get(credential)
            .and_then(|m| m.get(key))
            .cloned()
    }

    /// Current invalidation epoch for `credential`.
    pub fn epoch(&self, credential: &str) -> u64 {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.epochs.get(credential).copied().unwrap_or(0)
    }

    /// Store `response` unless an entry already exists, and return the stored
    /// entry. The first computation wins, so every hit serves the same value.
    /// A stale `epoch` leaves the store untouched and hands `response` back.
    pub fn put(
        &self,
        credential: &str,
        epoch: u64,
        key: ResultKey,
        response: CachedResponse,
    ) -> CachedResponse {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.epochs.get(credential).copied().unwrap_or(0) != epoch {
            debug!("[ResultStore] Dropping result computed before logout");
            return response;
        }
        entries
            .responses
            .entry(credential.to_string())
            .or_default()
            .entry(key)
            .or_insert(response)
            .clone()
    }

    pub fn invalidate(&self, credential: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.responses.remove(credential);
        *entries.epochs.entry(credential.to_string()).or_default() += 1;
    }

    /// Number of cached responses for `credential`.
    pub fn len_for(&self, credential: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .responses
            .get(credential)
            .map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConquestError, Result};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves `pages` pages of one activity each, counting calls.
    struct PagedProvider {
        pages: u32,
        fail_at: Option<u32>,
        calls: AtomicU32,
    }

    impl PagedProvider {
        fn new(pages: u32) -> Self {
            Self {
                pages,
                fail_at: None,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl ActivityProvider for PagedProvider {
        async fn fetch_page(
            &self,
            _credential: &str,
            page: u32,
            _per_page: u32,
        ) -> Result<Vec<RawActivity>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(page) {
                return Err(ConquestError::upstream("HTTP 500", Some(500)));
            }
            if page > self.pages {
                return Ok(Vec::new());
            }
            // Later pages hold older activities, as the provider returns newest first
            let day = 28 - page;
            Ok(vec![
                RawActivity::new("Run", &format!("2024-01-{:02}T08:00:00Z", day), "_p~iF~ps|U", 1000.0),
                RawActivity::new("Swim", &format!("2024-01-{:02}T09:00:00Z", day), "", 1000.0),
            ])
        }
    }

    #[tokio::test]
    async fn test_loads_once_and_sorts() {
        let store = ActivityStore::new();
        let provider = PagedProvider::new(3);
        let config = ProviderConfig::default();

        let first = store.get_or_load("token", &provider, &config).await;
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].start_local <= w[1].start_local));
        // 3 pages + the empty page that ends pagination
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

        let second = store.get_or_load("token", &provider, &config).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_page_cap() {
        let store = ActivityStore::new();
        let provider = PagedProvider::new(50);
        let config = ProviderConfig::default();

        let records = store.get_or_load("token", &provider, &config).await;
        assert_eq!(records.len(), 10);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_upstream_error_keeps_earlier_pages() {
        let store = ActivityStore::new();
        let provider = PagedProvider {
            fail_at: Some(3),
            ..PagedProvider::new(5)
        };

        let records = store
            .get_or_load("token", &provider, &ProviderConfig::default())
            .await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = ActivityStore::new();
        let provider = PagedProvider::new(1);
        let config = ProviderConfig::default();

        store.get_or_load("token", &provider, &config).await;
        assert!(store.get("token").is_some());
        store.invalidate("token");
        assert!(store.get("token").is_none());

        store.get_or_load("token", &provider, &config).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_result_store_partitions_by_credential() {
        let store = ResultStore::new();
        let key = ResultKey::new(QueryKind::Timeline, &QueryParams::default());
        let response = CachedResponse::Timeline(Arc::new(TimelineResponse {
            labels: vec![],
            conquest: vec![],
            exploration: vec![],
            routine: vec![],
            total_blocks: 0,
            available_years: vec![],
            available_sports: vec![],
        }));

        let stored = store.put("alice", 0, key.clone(), response.clone());
        assert!(stored.into_timeline().is_some());
        assert!(store.get("alice", &key).is_some());

        // A second write for the same key keeps the first value
        let first = store.get("alice", &key).unwrap().into_timeline().unwrap();
        let again = store.put("alice", 0, key.clone(), response).into_timeline().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(store.get("bob", &key).is_none());

        let map_key = ResultKey::new(QueryKind::Map, &QueryParams::default());
        assert!(store.get("alice", &map_key).is_none());

        store.invalidate("alice");
        assert_eq!(store.len_for("alice"), 0);
    }

    #[test]
    fn test_result_computed_across_logout_is_not_stored() {
        let store = ResultStore::new();
        let key = ResultKey::new(QueryKind::Timeline, &QueryParams::default());
        let response = CachedResponse::Timeline(Arc::new(TimelineResponse {
            labels: vec!["2024-01".to_string()],
            conquest: vec![1],
            exploration: vec![1],
            routine: vec![0],
            total_blocks: 1,
            available_years: vec!["2024".to_string()],
            available_sports: vec!["Run".to_string()],
        }));

        let epoch = store.epoch("alice");
        store.invalidate("alice");
        assert_eq!(store.epoch("alice"), epoch + 1);

        let returned = store.put("alice", epoch, key.clone(), response.clone());
        assert_eq!(returned.into_timeline().unwrap().total_blocks, 1);
        assert!(store.get("alice", &key).is_none());

        // A fresh epoch stores again
        store.put("alice", store.epoch("alice"), key.clone(), response);
        assert!(store.get("alice", &key).is_some());
    }

    /// One page of one activity, each request taking a while.
    struct SlowProvider {
        calls: AtomicU32,
    }

    impl ActivityProvider for SlowProvider {
        async fn fetch_page(
            &self,
            _credential: &str,
            page: u32,
            _per_page: u32,
        ) -> Result<Vec<RawActivity>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if page > 1 {
                return Ok(Vec::new());
            }
            Ok(vec![RawActivity::new("Run", "2024-01-05T08:00:00Z", "_p~iF~ps|U", 1000.0)])
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_load() {
        let store = ActivityStore::new();
        let provider = SlowProvider {
            calls: AtomicU32::new(0),
        };
        let config = ProviderConfig::default();

        let (a, b, c) = tokio::join!(
            store.get_or_load("token", &provider, &config),
            store.get_or_load("token", &provider, &config),
            store.get_or_load("token", &provider, &config),
        );

        // One page with data plus the empty page that ends pagination
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(a.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_for_different_credentials() {
        let store = ActivityStore::new();
        let provider = SlowProvider {
            calls: AtomicU32::new(0),
        };
        let config = ProviderConfig::default();

        let (alice, bob) = tokio::join!(
            store.get_or_load("alice", &provider, &config),
            store.get_or_load("bob", &provider, &config),
        );

        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert!(!Arc::ptr_eq(&alice, &bob));
        assert_eq!(store.len(), 2);
    }
}
