//! # Conquest
//!
//! Grid "conquest" tracking for GPS activity histories.
//!
//! This library provides:
//! - Grid discretization of activity polylines with gap interpolation
//! - Chronological new/routine classification with monthly aggregation
//! - Three cache tiers (activities, computed results, municipality boundaries)
//! - Bounded-concurrency resolution of grid cells to municipality boundaries
//! - Point-in-polygon containment and coverage percentages
//!
//! ## Features
//!
//! - **`http`** (default) - reqwest-backed clients for the activity provider and
//!   the geocoder
//!
//! ## Quick Start
//!
//! ```rust
//! use conquest::{cells_for, meters_to_degrees, GpsPoint};
//!
//! let track = vec![
//!     GpsPoint::new(45.7640, 4.8357),
//!     GpsPoint::new(45.7700, 4.8400),
//! ];
//!
//! let cells = cells_for(&track, meters_to_degrees(100.0));
//! println!("{} cells crossed", cells.len());
//! ```

use geo::Coord;
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{ConquestError, Result};

// Tunable constants
pub mod config;
pub use config::{ConquestConfig, ProviderConfig, ResolverConfig, METERS_PER_DEGREE};

// Activity records and query filters
pub mod activity;
pub use activity::{ActivityRecord, QueryParams, RawActivity, SportFilter, SportKind, YearFilter};

// Grid discretization
pub mod grid;
pub use grid::{cells_for, meters_to_degrees, GridCell, GridCellStat, GridTally};

// Chronological new/routine classification
pub mod timeline;
pub use timeline::{ConquestAggregator, MonthlyBucket, TimelineResponse};

// Activity and result cache tiers
pub mod cache;
pub use cache::{ActivityStore, CachedResponse, QueryKind, ResultKey, ResultStore};

// Municipality boundaries and their shared cache tier
pub mod boundary;
pub use boundary::{BoundaryKey, BoundaryStore, MunicipalityBoundary};

// Point-in-polygon coverage
pub mod containment;
pub use containment::{ContainmentEngine, MunicipalityStats, MunicipalitySummary};

// External collaborators
pub mod provider;
pub use provider::{ActivityProvider, BoundaryGeocoder};

// Bounded fan-out boundary resolution
pub mod resolver;
pub use resolver::MunicipalityResolver;

// Query entry points
pub mod service;
pub use service::{ConquestService, MapResponse, MapStats, SportLabels};

// HTTP clients for the provider and geocoder
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{GeoApiClient, StravaClient};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use conquest::GpsPoint;
/// let point = GpsPoint::new(48.8566, 2.3522); // Paris
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

impl From<GpsPoint> for Coord {
    fn from(p: GpsPoint) -> Self {
        Coord {
            x: p.longitude,
            y: p.latitude,
        }
    }
}

/// Decode an encoded polyline (precision 5) into GPS points.
pub fn decode_polyline(encoded: &str) -> Result<Vec<GpsPoint>> {
    let line = polyline::decode_polyline(encoded, 5)
        .map_err(|e| ConquestError::malformed(format!("undecodable polyline: {}", e)))?;
    Ok(line
        .coords()
        .map(|c| GpsPoint::new(c.y, c.x))
        .collect())
}
