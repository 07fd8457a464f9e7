//! Engine configuration.
//!
//! All throughput/cost trade-offs (cell cap, municipality cap, worker count,
//! timeouts, pagination cap) live here instead of being hard-coded, since their
//! right values depend on the upstream services a deployment talks to.

use std::path::PathBuf;
use std::time::Duration;

/// Approximate meters per degree of latitude.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Top-level configuration for [`crate::ConquestService`].
#[derive(Debug, Clone)]
pub struct ConquestConfig {
    /// Grid resolution used when a query does not name one (meters)
    pub default_grid_meters: u32,
    /// Where the boundary snapshot is loaded from and persisted to.
    /// `None` keeps the boundary store purely in memory.
    pub boundary_cache_path: Option<PathBuf>,
    pub provider: ProviderConfig,
    pub resolver: ResolverConfig,
}

impl ConquestConfig {
    /// Defaults without a snapshot file.
    pub fn in_memory() -> Self {
        Self {
            boundary_cache_path: None,
            ..Self::default()
        }
    }
}

impl Default for ConquestConfig {
    fn default() -> Self {
        Self {
            default_grid_meters: 100,
            boundary_cache_path: Some(PathBuf::from("boundary_cache.msgpack")),
            provider: ProviderConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

/// Activity provider pagination settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub activities_url: String,
    /// Activities requested per page
    pub per_page: u32,
    /// Hard cap on pages fetched per credential
    pub max_pages: u32,
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            activities_url: "https://www.strava.com/api/v3/athlete/activities".to_string(),
            per_page: 200,
            max_pages: 10,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Municipality resolution settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub geocoder_url: String,
    /// Most-visited cells considered for resolution
    pub max_cells: usize,
    /// Distinct municipalities accepted per query
    pub max_municipalities: usize,
    /// Lookups in flight at once
    pub max_concurrent_lookups: usize,
    /// Per-lookup deadline; aborts only that lookup
    pub lookup_timeout: Duration,
    /// Latitude half-band around a boundary's first vertex for candidate cells (degrees)
    pub proximity_degrees: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            geocoder_url: "https://geo.api.gouv.fr/communes".to_string(),
            max_cells: 600,
            max_municipalities: 50,
            max_concurrent_lookups: 10,
            lookup_timeout: Duration::from_secs(3),
            proximity_degrees: 0.15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConquestConfig::default();
        assert_eq!(config.default_grid_meters, 100);
        assert_eq!(config.provider.max_pages, 10);
        assert_eq!(config.resolver.max_cells, 600);
        assert_eq!(config.resolver.max_municipalities, 50);
        assert_eq!(config.resolver.max_concurrent_lookups, 10);
        assert_eq!(config.resolver.lookup_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_in_memory_has_no_snapshot() {
        assert!(ConquestConfig::in_memory().boundary_cache_path.is_none());
    }
}
