//! Query entry points.
//!
//! [`ConquestService`] owns the three cache tiers and the two upstream
//! clients, and answers the two query kinds:
//!
//! - **Timeline**: monthly new/routine counts with cumulative conquest
//! - **Map**: decoded tracks, per-cell statistics and top municipalities
//!
//! Each answer is computed once per credential and filter set, then served
//! from the result cache until the credential logs out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityRecord, QueryParams, SportKind};
use crate::boundary::BoundaryStore;
use crate::cache::{ActivityStore, CachedResponse, QueryKind, ResultKey, ResultStore};
use crate::config::ConquestConfig;
use crate::containment::{ContainmentEngine, MunicipalitySummary};
use crate::decode_polyline;
use crate::error::{ConquestError, Result};
use crate::grid::{cells_for, GridTally};
use crate::provider::{ActivityProvider, BoundaryGeocoder};
use crate::resolver::MunicipalityResolver;
use crate::timeline::{ConquestAggregator, TimelineResponse};

/// `[lat_key, lon_key, count, first_month, last_month]`
pub type GridCellRow = (f64, f64, u32, String, String);

/// Sport code → display label, ordered by label.
///
/// Serialized as a JSON object whose keys follow that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SportLabels(Vec<(String, String)>);

impl SportLabels {
    pub fn from_sports(sports: impl IntoIterator<Item = SportKind>) -> Self {
        Self::from_entries(
            sports
                .into_iter()
                .map(|s| (s.code().to_string(), s.label().to_string()))
                .collect(),
        )
    }

    fn from_entries(mut entries: Vec<(String, String)>) -> Self {
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries.dedup_by(|a, b| a.0 == b.0);
        Self(entries)
    }

    pub fn get(&self, code: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, label)| label.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(c, l)| (c.as_str(), l.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SportLabels {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (code, label) in &self.0 {
            map.serialize_entry(code, label)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SportLabels {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(Self::from_entries(raw.into_iter().collect()))
    }
}

/// Totals over the in-scope activities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapStats {
    pub total_distance_km: f64,
    pub activity_count: u32,
    pub cells_conquered: u32,
}

/// Map/detail query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapResponse {
    /// Decoded tracks as `[lat, lon]` points
    pub coords: Vec<Vec<[f64; 2]>>,
    /// Per-cell statistics in first-seen order
    pub grid_cells: Vec<GridCellRow>,
    /// Grid resolution in degrees
    pub grid_size_used: f64,
    pub available_years: Vec<String>,
    pub available_sports: SportLabels,
    pub stats: MapStats,
    pub top_municipalities: Vec<MunicipalitySummary>,
}

// ============================================================================
// Service
// ============================================================================

/// Owns the cache tiers and upstream clients; answers queries per credential.
pub struct ConquestService<P, G> {
    config: ConquestConfig,
    provider: P,
    geocoder: G,
    activities: ActivityStore,
    results: ResultStore,
    boundaries: BoundaryStore,
}

#[cfg(feature = "http")]
impl ConquestService<crate::http::StravaClient, crate::http::GeoApiClient> {
    /// Service backed by the reqwest clients.
    pub fn from_config(config: ConquestConfig) -> Result<Self> {
        let provider = crate::http::StravaClient::new(config.provider.clone())?;
        let geocoder = crate::http::GeoApiClient::new(&config.resolver)?;
        Ok(Self::new(config, provider, geocoder))
    }
}

impl<P: ActivityProvider, G: BoundaryGeocoder> ConquestService<P, G> {
    /// Create the service, loading the boundary snapshot if one is configured.
    pub fn new(config: ConquestConfig, provider: P, geocoder: G) -> Self {
        let boundaries = match &config.boundary_cache_path {
            Some(path) => BoundaryStore::load(path.clone()),
            None => BoundaryStore::in_memory(),
        };
        Self::with_boundary_store(config, provider, geocoder, boundaries)
    }

    pub fn with_boundary_store(
        config: ConquestConfig,
        provider: P,
        geocoder: G,
        boundaries: BoundaryStore,
    ) -> Self {
        Self {
            config,
            provider,
            geocoder,
            activities: ActivityStore::new(),
            results: ResultStore::new(),
            boundaries,
        }
    }

    pub fn config(&self) -> &ConquestConfig {
        &self.config
    }

    pub fn activity_store(&self) -> &ActivityStore {
        &self.activities
    }

    pub fn result_store(&self) -> &ResultStore {
        &self.results
    }

    pub fn boundary_store(&self) -> &BoundaryStore {
        &self.boundaries
    }

    /// Monthly new/routine time series.
    pub async fn timeline(
        &self,
        credential: Option<&str>,
        params: &QueryParams,
    ) -> Result<Arc<TimelineResponse>> {
        let credential = require_credential(credential)?;
        params.validate()?;

        let key = ResultKey::new(QueryKind::Timeline, params);
        if let Some(hit) = self.results.get(credential, &key).and_then(CachedResponse::into_timeline) {
            debug!("[ConquestService] Cache hit: timeline {:?}", params);
            return Ok(hit);
        }

        let epoch = self.results.epoch(credential);
        let activities = self
            .activities
            .get_or_load(credential, &self.provider, &self.config.provider)
            .await;
        let fresh = Arc::new(ConquestAggregator::aggregate(&activities, params));

        let stored = self
            .results
            .put(credential, epoch, key, CachedResponse::Timeline(Arc::clone(&fresh)));
        Ok(stored.into_timeline().unwrap_or(fresh))
    }

    /// Tracks, cell statistics and top municipalities.
    pub async fn map_view(
        &self,
        credential: Option<&str>,
        params: &QueryParams,
    ) -> Result<Arc<MapResponse>> {
        let credential = require_credential(credential)?;
        params.validate()?;

        let key = ResultKey::new(QueryKind::Map, params);
        if let Some(hit) = self.results.get(credential, &key).and_then(CachedResponse::into_map) {
            debug!("[ConquestService] Cache hit: map {:?}", params);
            return Ok(hit);
        }

        let start = Instant::now();
        let epoch = self.results.epoch(credential);
        let activities = self
            .activities
            .get_or_load(credential, &self.provider, &self.config.provider)
            .await;

        let (mut response, tally) = build_map(&activities, params);

        if !tally.is_empty() {
            let containment = ContainmentEngine::new(
                tally.cells(),
                params.grid_meters as f64,
                self.config.resolver.proximity_degrees,
            );
            let resolver =
                MunicipalityResolver::new(&self.geocoder, &self.boundaries, &self.config.resolver);
            response.top_municipalities = resolver.resolve(&tally, &containment).await;
        }

        info!(
            "[ConquestService] Map computed: {} activities, {} cells, {} municipalities ({} ms)",
            response.stats.activity_count,
            response.stats.cells_conquered,
            response.top_municipalities.len(),
            start.elapsed().as_millis()
        );

        let fresh = Arc::new(response);
        let stored = self
            .results
            .put(credential, epoch, key, CachedResponse::Map(Arc::clone(&fresh)));
        Ok(stored.into_map().unwrap_or(fresh))
    }

    /// Drop the credential's activities and computed results. Boundaries stay.
    pub fn logout(&self, credential: &str) {
        self.activities.invalidate(credential);
        self.results.invalidate(credential);
        debug!("[ConquestService] Cleared caches for a session");
    }

    /// Persist the boundary snapshot now. Returns whether a file was written.
    pub fn persist_boundaries(&self) -> Result<bool> {
        self.boundaries.persist()
    }
}

fn require_credential(credential: Option<&str>) -> Result<&str> {
    match credential {
        Some(c) if !c.trim().is_empty() => Ok(c),
        _ => Err(ConquestError::Unauthenticated),
    }
}

/// Everything in the map response except municipalities, plus the cell tally
/// they are resolved from.
fn build_map(activities: &[ActivityRecord], params: &QueryParams) -> (MapResponse, GridTally) {
    let resolution = params.resolution_degrees();
    let mut tally = GridTally::new();
    let mut coords: Vec<Vec<[f64; 2]>> = Vec::new();
    let mut years = BTreeSet::new();
    let mut sports = BTreeSet::new();
    let mut total_distance_km = 0.0;
    let mut activity_count = 0;

    for activity in activities {
        years.insert(activity.year());
        sports.insert(activity.sport);

        if !params.includes(activity) {
            continue;
        }

        match decode_polyline(&activity.polyline) {
            Ok(points) => {
                let month = activity.month_key();
                for cell in cells_for(&points, resolution) {
                    tally.record(cell, &month);
                }
                coords.push(points.iter().map(|p| [p.latitude, p.longitude]).collect());
            }
            Err(e) => warn!(
                "[ConquestService] Treating activity at {} as empty: {}",
                activity.start_local, e
            ),
        }

        total_distance_km += activity.distance_m / 1000.0;
        activity_count += 1;
    }

    let grid_cells: Vec<GridCellRow> = tally
        .iter()
        .map(|(cell, stat)| {
            (
                cell.lat(),
                cell.lon(),
                stat.count,
                stat.first_month.clone(),
                stat.last_month.clone(),
            )
        })
        .collect();

    let response = MapResponse {
        coords,
        grid_cells,
        grid_size_used: resolution,
        available_years: years.iter().rev().map(|y| y.to_string()).collect(),
        available_sports: SportLabels::from_sports(sports),
        stats: MapStats {
            total_distance_km,
            activity_count,
            cells_conquered: tally.len() as u32,
        },
        top_municipalities: Vec::new(),
    };
    (response, tally)
}
