//! Activity records and query filters.
//!
//! Provider payloads arrive as [`RawActivity`] and are normalized into
//! immutable [`ActivityRecord`]s: only GPS-capable sports with a non-empty
//! polyline survive.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{ConquestError, Result};
use crate::grid::meters_to_degrees;

/// Timestamp layout of `start_date_local`.
const START_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// GPS-capable sport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SportKind {
    Run,
    Ride,
    Hike,
    Walk,
    AlpineSki,
    BackcountrySki,
    VirtualRide,
    VirtualRun,
    GravelRide,
    TrailRun,
    EBikeRide,
    Velomobile,
    NordicSki,
    Snowshoe,
}

impl SportKind {
    pub const ALL: [SportKind; 14] = [
        SportKind::Run,
        SportKind::Ride,
        SportKind::Hike,
        SportKind::Walk,
        SportKind::AlpineSki,
        SportKind::BackcountrySki,
        SportKind::VirtualRide,
        SportKind::VirtualRun,
        SportKind::GravelRide,
        SportKind::TrailRun,
        SportKind::EBikeRide,
        SportKind::Velomobile,
        SportKind::NordicSki,
        SportKind::Snowshoe,
    ];

    /// Provider sport-type code.
    pub fn code(&self) -> &'static str {
        match self {
            SportKind::Run => "Run",
            SportKind::Ride => "Ride",
            SportKind::Hike => "Hike",
            SportKind::Walk => "Walk",
            SportKind::AlpineSki => "AlpineSki",
            SportKind::BackcountrySki => "BackcountrySki",
            SportKind::VirtualRide => "VirtualRide",
            SportKind::VirtualRun => "VirtualRun",
            SportKind::GravelRide => "GravelRide",
            SportKind::TrailRun => "TrailRun",
            SportKind::EBikeRide => "E-BikeRide",
            SportKind::Velomobile => "Velomobile",
            SportKind::NordicSki => "NordicSki",
            SportKind::Snowshoe => "Snowshoe",
        }
    }

    /// Display label shown in filter menus.
    pub fn label(&self) -> &'static str {
        match self {
            SportKind::Run => "Course à pied",
            SportKind::Ride => "Vélo",
            SportKind::Hike => "Randonnée",
            SportKind::Walk => "Marche",
            SportKind::AlpineSki => "Ski Alpin",
            SportKind::BackcountrySki => "Ski de Rando",
            SportKind::VirtualRide => "Vélo Virtuel",
            SportKind::VirtualRun => "Course Virtuelle",
            SportKind::GravelRide => "Gravel",
            SportKind::TrailRun => "Trail",
            SportKind::EBikeRide => "Vélo Électrique",
            SportKind::Velomobile => "Vélomobile",
            SportKind::NordicSki => "Ski de Fond",
            SportKind::Snowshoe => "Raquettes",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }
}

impl fmt::Display for SportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// Records
// ============================================================================

/// A normalized GPS activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub sport: SportKind,
    /// Local start time as reported by the provider
    pub start_local: NaiveDateTime,
    /// Encoded summary polyline
    pub polyline: String,
    /// Distance in meters
    pub distance_m: f64,
}

impl ActivityRecord {
    pub fn year(&self) -> i32 {
        self.start_local.year()
    }

    /// Month bucket key, `YYYY-MM`.
    pub fn month_key(&self) -> String {
        self.start_local.format("%Y-%m").to_string()
    }
}

/// Activity object as returned by the provider's list endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawActivity {
    #[serde(rename = "type")]
    pub sport_type: Option<String>,
    pub start_date_local: Option<String>,
    pub map: Option<RawMap>,
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMap {
    pub summary_polyline: Option<String>,
}

impl RawActivity {
    pub fn new(sport_type: &str, start_date_local: &str, polyline: &str, distance: f64) -> Self {
        Self {
            sport_type: Some(sport_type.to_string()),
            start_date_local: Some(start_date_local.to_string()),
            map: Some(RawMap {
                summary_polyline: Some(polyline.to_string()),
            }),
            distance: Some(distance),
        }
    }

    /// Normalize into an [`ActivityRecord`].
    ///
    /// Returns `Ok(None)` for activities that are not GPS-capable or carry no
    /// polyline, and an error when the start date cannot be read.
    pub fn normalize(&self) -> Result<Option<ActivityRecord>> {
        let Some(sport) = self.sport_type.as_deref().and_then(SportKind::from_code) else {
            return Ok(None);
        };
        let polyline = match self.map.as_ref().and_then(|m| m.summary_polyline.as_deref()) {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(None),
        };

        let raw_start = self
            .start_date_local
            .as_deref()
            .ok_or_else(|| ConquestError::malformed("activity without start_date_local"))?;
        let start_local = NaiveDateTime::parse_from_str(raw_start, START_DATE_FORMAT)
            .map_err(|e| ConquestError::malformed(format!("start date '{}': {}", raw_start, e)))?;

        Ok(Some(ActivityRecord {
            sport,
            start_local,
            polyline: polyline.to_string(),
            distance_m: self.distance.unwrap_or(0.0),
        }))
    }
}

// ============================================================================
// Query filters
// ============================================================================

/// Year filter: everything, or a single calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YearFilter {
    All,
    Year(i32),
}

impl YearFilter {
    pub fn matches(&self, year: i32) -> bool {
        match self {
            YearFilter::All => true,
            YearFilter::Year(y) => *y == year,
        }
    }
}

impl FromStr for YearFilter {
    type Err = ConquestError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(YearFilter::All);
        }
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(year) = s.parse() {
                return Ok(YearFilter::Year(year));
            }
        }
        Err(ConquestError::InvalidQuery {
            message: format!("year must be 'all' or a 4-digit year, got '{}'", s),
        })
    }
}

/// Sport filter: everything, or one provider sport code.
///
/// Unknown codes are accepted and simply match nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SportFilter {
    All,
    Sport(String),
}

impl SportFilter {
    pub fn matches(&self, sport: SportKind) -> bool {
        match self {
            SportFilter::All => true,
            SportFilter::Sport(code) => code == sport.code(),
        }
    }
}

impl FromStr for SportFilter {
    type Err = ConquestError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "all" => SportFilter::All,
            code => SportFilter::Sport(code.to_string()),
        })
    }
}

/// Parameters shared by both query kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryParams {
    /// Grid resolution in meters
    pub grid_meters: u32,
    pub year: YearFilter,
    pub sport: SportFilter,
}

impl QueryParams {
    pub fn new(grid_meters: u32, year: YearFilter, sport: SportFilter) -> Self {
        Self {
            grid_meters,
            year,
            sport,
        }
    }

    /// Parse raw query-string values; absent values take their defaults.
    pub fn parse(
        grid_size: Option<&str>,
        year: Option<&str>,
        sport_type: Option<&str>,
        default_grid_meters: u32,
    ) -> Result<Self> {
        let grid_meters = match grid_size {
            Some(raw) => raw.trim().parse().map_err(|_| ConquestError::InvalidQuery {
                message: format!("grid size must be a whole number of meters, got '{}'", raw),
            })?,
            None => default_grid_meters,
        };
        let params = Self {
            grid_meters,
            year: year.unwrap_or("all").parse()?,
            sport: sport_type.unwrap_or("all").parse()?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_meters == 0 {
            return Err(ConquestError::InvalidQuery {
                message: "grid size must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn resolution_degrees(&self) -> f64 {
        meters_to_degrees(self.grid_meters as f64)
    }

    /// Whether an activity is in scope for this query.
    pub fn includes(&self, activity: &ActivityRecord) -> bool {
        self.year.matches(activity.year()) && self.sport.matches(activity.sport)
    }
}

impl Default for QueryParams {
    fn default() -> Self {
        Self::new(100, YearFilter::All, SportFilter::All)
    }
}
