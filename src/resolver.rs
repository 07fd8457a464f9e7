//! Resolution of grid cells to municipality boundaries.
//!
//! The most-visited cells are looked up with bounded concurrency:
//! - Boundary store first, keyed by the cell's rounded coordinate
//! - Remote geocoder otherwise, each call under its own timeout
//! - Every fetched boundary is written back to the store
//!
//! Results are consumed in completion order. Each boundary whose name has no
//! summary yet is measured against the query's cells as it arrives; once the municipality cap
//! is reached, lookups that have not started yet skip the remote call and
//! results still in flight are discarded after being cached.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::boundary::{BoundaryKey, BoundaryStore, MunicipalityBoundary};
use crate::config::ResolverConfig;
use crate::containment::{rank_summaries, ContainmentEngine, MunicipalitySummary};
use crate::error::{ConquestError, Result};
use crate::grid::{GridCell, GridTally};
use crate::provider::BoundaryGeocoder;

/// How a single cell lookup ended.
#[derive(Debug)]
enum LookupOutcome {
    Cached(Arc<MunicipalityBoundary>),
    Fetched(Arc<MunicipalityBoundary>),
    /// Geocoder knows no municipality here
    NotFound,
    /// Cap already reached before the remote call started
    Skipped,
}

#[derive(Debug, Default)]
struct ResolutionCounters {
    cached: u32,
    fetched: u32,
    not_found: u32,
    skipped: u32,
    failed: u32,
    discarded: u32,
}

/// Resolves a query's busiest cells to municipality summaries.
pub struct MunicipalityResolver<'a, G> {
    geocoder: &'a G,
    boundaries: &'a BoundaryStore,
    config: &'a ResolverConfig,
}

impl<'a, G: BoundaryGeocoder> MunicipalityResolver<'a, G> {
    pub fn new(geocoder: &'a G, boundaries: &'a BoundaryStore, config: &'a ResolverConfig) -> Self {
        Self {
            geocoder,
            boundaries,
            config,
        }
    }

    /// Resolve up to `max_cells` of the busiest cells and measure each distinct
    /// municipality found. Lookup failures are skipped. The result is sorted by
    /// contained cells, most first.
    pub async fn resolve(
        &self,
        tally: &GridTally,
        containment: &ContainmentEngine,
    ) -> Vec<MunicipalitySummary> {
        let candidates = tally.top_cells(self.config.max_cells);
        if candidates.is_empty() {
            return Vec::new();
        }

        let start = Instant::now();
        let total = candidates.len();
        let cap = self.config.max_municipalities;
        let saturated_flag = AtomicBool::new(cap == 0);
        let saturated = &saturated_flag;

        let mut lookups = stream::iter(candidates)
            .map(move |cell| self.lookup_cell(cell, saturated))
            .buffer_unordered(self.config.max_concurrent_lookups.max(1));

        let mut counters = ResolutionCounters::default();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut accepted: Vec<MunicipalitySummary> = Vec::new();

        while let Some(outcome) = lookups.next().await {
            let boundary = match outcome {
                Ok(LookupOutcome::Cached(boundary)) => {
                    counters.cached += 1;
                    boundary
                }
                Ok(LookupOutcome::Fetched(boundary)) => {
                    counters.fetched += 1;
                    boundary
                }
                Ok(LookupOutcome::NotFound) => {
                    counters.not_found += 1;
                    continue;
                }
                Ok(LookupOutcome::Skipped) => {
                    counters.skipped += 1;
                    continue;
                }
                Err(e) => {
                    counters.failed += 1;
                    debug!("[Resolver] Lookup skipped: {}", e);
                    continue;
                }
            };

            if accepted.len() >= cap {
                counters.discarded += 1;
                continue;
            }
            if claimed.contains(&boundary.name) {
                continue;
            }

            // Homonymous communes are distinct places: a name only counts as
            // taken once one of its outlines holds cells.
            match containment.measure(&boundary) {
                Ok(Some(summary)) => {
                    claimed.insert(summary.name.clone());
                    accepted.push(summary);
                    if accepted.len() >= cap {
                        saturated.store(true, Ordering::Release);
                    }
                }
                Ok(None) => debug!("[Resolver] No cells inside '{}'", boundary.name),
                Err(e) => warn!("[Resolver] Skipping municipality: {}", e),
            }
        }

        rank_summaries(&mut accepted);

        info!(
            "[Resolver] {} cells -> {} municipalities in {} ms (cached={}, fetched={}, not_found={}, failed={}, skipped={}, discarded={})",
            total,
            accepted.len(),
            start.elapsed().as_millis(),
            counters.cached,
            counters.fetched,
            counters.not_found,
            counters.failed,
            counters.skipped,
            counters.discarded
        );

        if let Err(e) = self.boundaries.flush().await {
            warn!("[Resolver] Boundary snapshot not saved: {}", e);
        }

        accepted
    }

    async fn lookup_cell(&self, cell: GridCell, saturated: &AtomicBool) -> Result<LookupOutcome> {
        let key = BoundaryKey::from_coords(cell.lat(), cell.lon());
        if let Some(hit) = self.boundaries.get(&key) {
            return Ok(LookupOutcome::Cached(hit));
        }
        if saturated.load(Ordering::Acquire) {
            return Ok(LookupOutcome::Skipped);
        }

        let lookup = self.geocoder.lookup(cell.lat(), cell.lon());
        let resolved = match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConquestError::upstream(
                    format!(
                        "lookup at {} timed out after {:?}",
                        key, self.config.lookup_timeout
                    ),
                    None,
                ))
            }
        };

        Ok(match resolved {
            Some(boundary) => {
                let boundary = Arc::new(boundary);
                self.boundaries.insert(key, Arc::clone(&boundary));
                LookupOutcome::Fetched(boundary)
            }
            None => LookupOutcome::NotFound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::meters_to_degrees;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Every coordinate resolves to a 0.01° square municipality named after
    /// its south-west corner. Tracks peak concurrency.
    #[derive(Default)]
    struct SquareGeocoder {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_north_of: Option<f64>,
    }

    impl BoundaryGeocoder for SquareGeocoder {
        async fn lookup(&self, lat: f64, lon: f64) -> Result<Option<MunicipalityBoundary>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_north_of.is_some_and(|limit| lat > limit) {
                return Err(ConquestError::upstream("HTTP 404", Some(404)));
            }

            let south = (lat * 100.0).floor() / 100.0;
            let west = (lon * 100.0).floor() / 100.0;
            Ok(Some(MunicipalityBoundary {
                name: format!("{:.2}_{:.2}", south, west),
                area_m2: 1_000_000.0,
                outline: vec![
                    [south, west],
                    [south + 0.01, west],
                    [south + 0.01, west + 0.01],
                    [south, west + 0.01],
                    [south, west],
                ],
            }))
        }
    }

    fn tally_over(squares: usize) -> (GridTally, ContainmentEngine) {
        let res = meters_to_degrees(100.0);
        let mut tally = GridTally::new();
        for i in 0..squares {
            // One cell near the middle of each 0.01° square
            let lat = 45.0 + i as f64 * 0.01 + 0.005;
            tally.record(GridCell::from_coords(lat, 5.005, res), "2024-01");
        }
        let engine = ContainmentEngine::new(tally.cells(), 100.0, 0.15);
        (tally, engine)
    }

    #[tokio::test]
    async fn test_resolves_and_caches() {
        let geocoder = SquareGeocoder::default();
        let store = BoundaryStore::in_memory();
        let config = ResolverConfig::default();
        let (tally, engine) = tally_over(4);

        let resolver = MunicipalityResolver::new(&geocoder, &store, &config);
        let summaries = resolver.resolve(&tally, &engine).await;
        assert_eq!(summaries.len(), 4);
        assert!(summaries.iter().all(|s| s.stats.blocks == 1));
        assert_eq!(store.len(), 4);

        // Second pass is served from the store
        let again = resolver.resolve(&tally, &engine).await;
        assert_eq!(again.len(), 4);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let geocoder = SquareGeocoder::default();
        let store = BoundaryStore::in_memory();
        let config = ResolverConfig {
            max_concurrent_lookups: 3,
            ..ResolverConfig::default()
        };
        let (tally, engine) = tally_over(20);

        MunicipalityResolver::new(&geocoder, &store, &config)
            .resolve(&tally, &engine)
            .await;
        assert!(geocoder.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_municipality_cap() {
        let geocoder = SquareGeocoder::default();
        let store = BoundaryStore::in_memory();
        let config = ResolverConfig {
            max_municipalities: 5,
            max_concurrent_lookups: 2,
            ..ResolverConfig::default()
        };
        let (tally, engine) = tally_over(30);

        let summaries = MunicipalityResolver::new(&geocoder, &store, &config)
            .resolve(&tally, &engine)
            .await;
        assert_eq!(summaries.len(), 5);
        // Lookups not yet started once the cap is hit never reach the geocoder
        assert!(geocoder.calls.load(Ordering::SeqCst) < 30);
    }

    #[tokio::test]
    async fn test_failures_are_skipped() {
        let geocoder = SquareGeocoder {
            fail_north_of: Some(45.02),
            ..SquareGeocoder::default()
        };
        let store = BoundaryStore::in_memory();
        let config = ResolverConfig::default();
        let (tally, engine) = tally_over(5);

        let summaries = MunicipalityResolver::new(&geocoder, &store, &config)
            .resolve(&tally, &engine)
            .await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(store.len(), 2);
    }

    /// Two different communes share a name. The one west of 5.2° holds no
    /// cells; the other surrounds the looked-up point.
    struct HomonymGeocoder;

    impl BoundaryGeocoder for HomonymGeocoder {
        async fn lookup(&self, lat: f64, lon: f64) -> Result<Option<MunicipalityBoundary>> {
            let (south, west) = if lon < 5.2 { (45.5, 5.0) } else { (lat - 0.005, lon - 0.005) };
            Ok(Some(MunicipalityBoundary {
                name: "Saint-Martin".to_string(),
                area_m2: 1_000_000.0,
                outline: vec![
                    [south, west],
                    [south + 0.01, west],
                    [south + 0.01, west + 0.01],
                    [south, west + 0.01],
                    [south, west],
                ],
            }))
        }
    }

    #[tokio::test]
    async fn test_same_name_measured_until_it_holds_cells() {
        let res = meters_to_degrees(100.0);
        let mut tally = GridTally::new();
        // Busiest cell first, so the empty homonym is measured first
        let west = GridCell::from_coords(46.0, 5.0, res);
        tally.record(west, "2024-01");
        tally.record(west, "2024-02");
        tally.record(GridCell::from_coords(46.0, 5.3, res), "2024-01");
        let engine = ContainmentEngine::new(tally.cells(), 100.0, 0.15);

        let store = BoundaryStore::in_memory();
        let config = ResolverConfig {
            max_concurrent_lookups: 1,
            ..ResolverConfig::default()
        };
        let summaries = MunicipalityResolver::new(&HomonymGeocoder, &store, &config)
            .resolve(&tally, &engine)
            .await;

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "Saint-Martin");
        assert_eq!(summaries[0].stats.blocks, 1);
    }

    struct SlowGeocoder;

    impl BoundaryGeocoder for SlowGeocoder {
        async fn lookup(&self, _lat: f64, _lon: f64) -> Result<Option<MunicipalityBoundary>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_timeout_aborts_only_the_lookup() {
        let store = BoundaryStore::in_memory();
        let config = ResolverConfig {
            lookup_timeout: Duration::from_millis(20),
            ..ResolverConfig::default()
        };
        let (tally, engine) = tally_over(3);

        let start = Instant::now();
        let summaries = MunicipalityResolver::new(&SlowGeocoder, &store, &config)
            .resolve(&tally, &engine)
            .await;
        assert!(summaries.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
