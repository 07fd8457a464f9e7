//! Grid-cell containment within municipality boundaries.
//!
//! A query's cells are bulk-loaded into an R-tree once. Each boundary only
//! examines cells whose latitude lies within `proximity_degrees` of the
//! outline's first vertex, then runs an exact point-in-polygon test on those.
//!
//! The latitude band is a heuristic, not a bounding box: municipalities
//! spanning more than ~33 km of latitude (at the default 0.15°) can be
//! under-counted.

use geo::{Contains, Coord, LineString, Point, Polygon};
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};

use crate::boundary::MunicipalityBoundary;
use crate::error::{ConquestError, Result};
use crate::grid::GridCell;

/// Coverage figures for one municipality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MunicipalityStats {
    /// Grid cells inside the outline
    pub blocks: u32,
    /// Approximate share of the municipality's area, 0-100
    pub percent: f64,
}

/// A municipality with at least one conquered cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MunicipalitySummary {
    pub name: String,
    /// `[lat, lon]` vertices
    pub outline: Vec<[f64; 2]>,
    pub stats: MunicipalityStats,
}

/// Counts a query's grid cells inside municipality outlines.
#[derive(Debug)]
pub struct ContainmentEngine {
    index: RTree<GridCell>,
    grid_meters: f64,
    proximity_degrees: f64,
}

impl ContainmentEngine {
    pub fn new(
        cells: impl IntoIterator<Item = GridCell>,
        grid_meters: f64,
        proximity_degrees: f64,
    ) -> Self {
        Self {
            index: RTree::bulk_load(cells.into_iter().collect()),
            grid_meters,
            proximity_degrees,
        }
    }

    /// Cells whose latitude is strictly within the band around `anchor_lat`.
    pub fn candidates(&self, anchor_lat: f64) -> impl Iterator<Item = &GridCell> {
        let band = self.proximity_degrees;
        let envelope = AABB::from_corners([-180.0, anchor_lat - band], [180.0, anchor_lat + band]);
        self.index
            .locate_in_envelope(&envelope)
            .filter(move |cell| (cell.lat() - anchor_lat).abs() < band)
    }

    /// Number of candidate cells strictly inside the boundary outline.
    pub fn count_contained(&self, boundary: &MunicipalityBoundary) -> Result<u32> {
        let polygon = outline_polygon(boundary)?;
        let anchor_lat = boundary.outline[0][0];

        let count = self
            .candidates(anchor_lat)
            .filter(|cell| polygon.contains(&Point::new(cell.lon(), cell.lat())))
            .count();
        Ok(count as u32)
    }

    /// Summary for `boundary`, or `None` when no cell falls inside it.
    pub fn measure(&self, boundary: &MunicipalityBoundary) -> Result<Option<MunicipalitySummary>> {
        if !(boundary.area_m2.is_finite() && boundary.area_m2 > 0.0) {
            return Err(ConquestError::geometry(
                &boundary.name,
                format!("non-positive area {}", boundary.area_m2),
            ));
        }

        let blocks = self.count_contained(boundary)?;
        if blocks == 0 {
            return Ok(None);
        }

        Ok(Some(MunicipalitySummary {
            name: boundary.name.clone(),
            outline: boundary.outline.clone(),
            stats: MunicipalityStats {
                blocks,
                percent: coverage_percent(blocks, self.grid_meters, boundary.area_m2),
            },
        }))
    }
}

/// `blocks × grid² / area × 100`, clamped to 100 and rounded to 2 decimals.
pub fn coverage_percent(blocks: u32, grid_meters: f64, area_m2: f64) -> f64 {
    if area_m2 <= 0.0 {
        return 0.0;
    }
    let raw = blocks as f64 * grid_meters * grid_meters / area_m2 * 100.0;
    let clamped = raw.clamp(0.0, 100.0);
    (clamped * 100.0).round() / 100.0
}

/// Order summaries by contained cells, most first.
pub fn rank_summaries(summaries: &mut [MunicipalitySummary]) {
    summaries.sort_by(|a, b| b.stats.blocks.cmp(&a.stats.blocks));
}

fn outline_polygon(boundary: &MunicipalityBoundary) -> Result<Polygon<f64>> {
    if boundary.outline.len() < 3 {
        return Err(ConquestError::geometry(
            &boundary.name,
            format!("outline has {} vertices", boundary.outline.len()),
        ));
    }
    if boundary
        .outline
        .iter()
        .any(|[lat, lon]| !lat.is_finite() || !lon.is_finite())
    {
        return Err(ConquestError::geometry(&boundary.name, "non-finite vertex"));
    }

    let exterior: LineString<f64> = boundary
        .outline
        .iter()
        .map(|[lat, lon]| Coord { x: *lon, y: *lat })
        .collect();
    Ok(Polygon::new(exterior, vec![]))
}
