//! Grid discretization of GPS tracks.
//!
//! Tracks are snapped onto a fixed latitude/longitude grid. Each point is
//! canonicalized to the nearest grid line on both axes (not the corner of the
//! containing cell), so two points straddling a cell boundary may land in
//! neighbouring cells. Segments longer than `0.7 × resolution` are densified
//! so a fast or sparsely sampled track does not skip cells.

use std::collections::{BTreeSet, HashMap};

use rstar::{RTreeObject, AABB};

use crate::config::METERS_PER_DEGREE;
use crate::GpsPoint;

/// Segment length (in resolutions) above which intermediate points are added.
const INTERPOLATION_TRIGGER: f64 = 0.7;

/// Spacing (in resolutions) used to count intermediate points.
const INTERPOLATION_STEP: f64 = 0.5;

/// Canonical keys are kept at this many decimal places.
const KEY_SCALE: f64 = 1e6;

/// Convert a grid resolution in meters to degrees.
#[inline]
pub fn meters_to_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// A grid cell identified by its snapped coordinates.
///
/// Keys are stored as integer micro-degrees so that floating-point inputs that
/// snap to the same grid line compare and hash equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    lat_e6: i64,
    lon_e6: i64,
}

impl GridCell {
    /// Snap a coordinate onto the grid.
    pub fn from_coords(latitude: f64, longitude: f64, resolution_degrees: f64) -> Self {
        Self {
            lat_e6: snap(latitude, resolution_degrees),
            lon_e6: snap(longitude, resolution_degrees),
        }
    }

    /// Latitude key in degrees.
    pub fn lat(&self) -> f64 {
        self.lat_e6 as f64 / KEY_SCALE
    }

    /// Longitude key in degrees.
    pub fn lon(&self) -> f64 {
        self.lon_e6 as f64 / KEY_SCALE
    }
}

impl RTreeObject for GridCell {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon(), self.lat()])
    }
}

/// `round(round(v / r) * r, 6)` with ties going to the even neighbour.
fn snap(value: f64, resolution_degrees: f64) -> i64 {
    let snapped = (value / resolution_degrees).round_ties_even() * resolution_degrees;
    (snapped * KEY_SCALE).round_ties_even() as i64
}

/// Compute the set of grid cells a track passes through.
///
/// Both endpoints are always included. Invalid points are ignored, and a
/// non-positive or non-finite resolution yields an empty set.
pub fn cells_for(points: &[GpsPoint], resolution_degrees: f64) -> BTreeSet<GridCell> {
    let mut cells = BTreeSet::new();
    if !(resolution_degrees.is_finite() && resolution_degrees > 0.0) {
        return cells;
    }

    let mut valid = points.iter().filter(|p| p.is_valid());
    let Some(first) = valid.next() else {
        return cells;
    };

    let mut prev = *first;
    cells.insert(GridCell::from_coords(
        prev.latitude,
        prev.longitude,
        resolution_degrees,
    ));

    for curr in valid {
        let d_lat = curr.latitude - prev.latitude;
        let d_lng = curr.longitude - prev.longitude;
        let distance = d_lat.hypot(d_lng);

        if distance > resolution_degrees * INTERPOLATION_TRIGGER {
            let steps = (distance / (resolution_degrees * INTERPOLATION_STEP)).floor() as usize;
            for j in 1..=steps {
                let frac = j as f64 / (steps + 1) as f64;
                cells.insert(GridCell::from_coords(
                    prev.latitude + d_lat * frac,
                    prev.longitude + d_lng * frac,
                    resolution_degrees,
                ));
            }
        }

        cells.insert(GridCell::from_coords(
            curr.latitude,
            curr.longitude,
            resolution_degrees,
        ));
        prev = *curr;
    }

    cells
}

// ============================================================================
// Per-cell statistics
// ============================================================================

/// Visit statistics for one grid cell across a filtered activity set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCellStat {
    /// Activities that crossed the cell
    pub count: u32,
    /// Earliest month key (`YYYY-MM`)
    pub first_month: String,
    /// Latest month key (`YYYY-MM`)
    pub last_month: String,
}

/// Tally of cell visits, iterated in first-seen order.
#[derive(Debug, Default)]
pub struct GridTally {
    entries: Vec<(GridCell, GridCellStat)>,
    index: HashMap<GridCell, usize>,
}

impl GridTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one activity crossing `cell` during `month`.
    pub fn record(&mut self, cell: GridCell, month: &str) {
        match self.index.get(&cell) {
            Some(&i) => {
                let stat = &mut self.entries[i].1;
                stat.count += 1;
                if month < stat.first_month.as_str() {
                    stat.first_month = month.to_string();
                }
                if month > stat.last_month.as_str() {
                    stat.last_month = month.to_string();
                }
            }
            None => {
                self.index.insert(cell, self.entries.len());
                self.entries.push((
                    cell,
                    GridCellStat {
                        count: 1,
                        first_month: month.to_string(),
                        last_month: month.to_string(),
                    },
                ));
            }
        }
    }

    pub fn get(&self, cell: &GridCell) -> Option<&GridCellStat> {
        self.index.get(cell).map(|&i| &self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(GridCell, GridCellStat)> {
        self.entries.iter()
    }

    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        self.entries.iter().map(|(cell, _)| *cell)
    }

    /// Up to `limit` cells by visit count, highest first. Ties keep first-seen order.
    pub fn top_cells(&self, limit: usize) -> Vec<GridCell> {
        let mut ranked: Vec<&(GridCell, GridCellStat)> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        ranked.into_iter().take(limit).map(|(cell, _)| *cell).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: f64 = 100.0 / METERS_PER_DEGREE;

    #[test]
    fn test_empty_and_single_point() {
        assert!(cells_for(&[], RES).is_empty());

        let cells = cells_for(&[GpsPoint::new(45.0, 5.0)], RES);
        assert_eq!(cells.len(), 1);
    }

    #[test]
    fn test_snap_is_stable_for_close_floats() {
        let a = GridCell::from_coords(45.00001, 5.00001, RES);
        let b = GridCell::from_coords(45.000011, 5.000012, RES);
        assert_eq!(a, b);
    }

    #[test]
    fn test_keys_have_six_decimals() {
        let cell = GridCell::from_coords(45.123456789, 5.987654321, RES);
        let scaled = cell.lat() * 1e6;
        assert!((scaled - scaled.round()).abs() < 1e-6);
    }

    #[test]
    fn test_endpoints_always_included() {
        let points = vec![
            GpsPoint::new(45.0, 5.0),
            GpsPoint::new(45.01, 5.02),
            GpsPoint::new(45.02, 5.03),
        ];
        let cells = cells_for(&points, RES);
        assert!(cells.contains(&GridCell::from_coords(45.0, 5.0, RES)));
        assert!(cells.contains(&GridCell::from_coords(45.02, 5.03, RES)));
    }

    #[test]
    fn test_long_segment_is_interpolated() {
        // ~1.1 km north, 11 resolutions
        let start = GpsPoint::new(45.0, 5.0);
        let end = GpsPoint::new(45.01, 5.0);
        let cells = cells_for(&[start, end], RES);

        let first = GridCell::from_coords(start.latitude, start.longitude, RES);
        let last = GridCell::from_coords(end.latitude, end.longitude, RES);
        let between: Vec<_> = cells
            .iter()
            .filter(|c| c.lat() > first.lat() && c.lat() < last.lat())
            .collect();

        assert!(!between.is_empty());
        // Every grid line crossed is covered
        assert!(cells.len() >= 11);
    }

    #[test]
    fn test_short_segment_not_interpolated() {
        let step = RES * 0.6;
        let points = vec![GpsPoint::new(45.0, 5.0), GpsPoint::new(45.0 + step, 5.0)];
        let cells = cells_for(&points, RES);
        assert!(cells.len() <= 2);
    }

    #[test]
    fn test_invalid_resolution() {
        let points = vec![GpsPoint::new(45.0, 5.0)];
        assert!(cells_for(&points, 0.0).is_empty());
        assert!(cells_for(&points, f64::NAN).is_empty());
    }

    #[test]
    fn test_tally_widens_months() {
        let cell = GridCell::from_coords(45.0, 5.0, RES);
        let mut tally = GridTally::new();
        tally.record(cell, "2024-03");
        tally.record(cell, "2024-01");
        tally.record(cell, "2024-05");

        let stat = tally.get(&cell).unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.first_month, "2024-01");
        assert_eq!(stat.last_month, "2024-05");
    }

    #[test]
    fn test_top_cells_by_count() {
        let a = GridCell::from_coords(45.0, 5.0, RES);
        let b = GridCell::from_coords(46.0, 5.0, RES);
        let c = GridCell::from_coords(47.0, 5.0, RES);
        let mut tally = GridTally::new();
        tally.record(a, "2024-01");
        tally.record(b, "2024-01");
        tally.record(b, "2024-02");
        tally.record(c, "2024-01");

        assert_eq!(tally.top_cells(2), vec![b, a]);
        assert_eq!(tally.top_cells(10).len(), 3);
    }
}
