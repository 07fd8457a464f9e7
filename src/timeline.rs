//! Chronological conquest classification.
//!
//! Activities are replayed oldest first against a growing set of discovered
//! cells. A cell seen for the first time counts as *new* for the month of the
//! activity that found it; every later crossing counts as *routine*. The
//! result depends on replay order, so this never runs in parallel across
//! activities.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityRecord, QueryParams};
use crate::decode_polyline;
use crate::grid::{cells_for, GridCell};

/// New/routine counters for one calendar month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonthlyBucket {
    pub new_cells: u32,
    pub routine_cells: u32,
}

/// Time-series query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineResponse {
    /// Month keys, ascending
    pub labels: Vec<String>,
    /// Cumulative discovered cells per month
    pub conquest: Vec<u32>,
    /// New cells per month
    pub exploration: Vec<u32>,
    /// Re-visited cells per month
    pub routine: Vec<u32>,
    pub total_blocks: u32,
    /// Every year with activities, descending, ignoring filters
    pub available_years: Vec<String>,
    /// Every sport code with activities, ascending, ignoring filters
    pub available_sports: Vec<String>,
}

/// Replays activities in start-time order and classifies their cells.
#[derive(Debug)]
pub struct ConquestAggregator {
    resolution_degrees: f64,
    seen: HashSet<GridCell>,
    months: BTreeMap<String, MonthlyBucket>,
    total_blocks: u32,
    years: BTreeSet<i32>,
    sports: BTreeSet<&'static str>,
}

impl ConquestAggregator {
    pub fn new(resolution_degrees: f64) -> Self {
        Self {
            resolution_degrees,
            seen: HashSet::new(),
            months: BTreeMap::new(),
            total_blocks: 0,
            years: BTreeSet::new(),
            sports: BTreeSet::new(),
        }
    }

    /// Run a full time-series query over `activities`, which must be sorted
    /// by start time ascending.
    pub fn aggregate(activities: &[ActivityRecord], params: &QueryParams) -> TimelineResponse {
        debug_assert!(activities
            .windows(2)
            .all(|w| w[0].start_local <= w[1].start_local));

        let mut aggregator = Self::new(params.resolution_degrees());
        for activity in activities {
            aggregator.observe(activity);
            if params.includes(activity) {
                aggregator.ingest(activity);
            }
        }
        aggregator.finish()
    }

    /// Record an activity's year and sport for the filter menus.
    pub fn observe(&mut self, activity: &ActivityRecord) {
        self.years.insert(activity.year());
        self.sports.insert(activity.sport.code());
    }

    /// Classify one in-scope activity's cells.
    pub fn ingest(&mut self, activity: &ActivityRecord) {
        let month = activity.month_key();
        let points = match decode_polyline(&activity.polyline) {
            Ok(points) => points,
            Err(e) => {
                warn!("[Conquest] Treating activity at {} as empty: {}", activity.start_local, e);
                Vec::new()
            }
        };
        let cells = cells_for(&points, self.resolution_degrees);
        self.ingest_cells(month, cells);
    }

    /// Classify a cell set under `month`. The month bucket exists afterwards
    /// even when `cells` is empty.
    pub fn ingest_cells(&mut self, month: String, cells: impl IntoIterator<Item = GridCell>) {
        let bucket = self.months.entry(month).or_default();
        for cell in cells {
            if self.seen.insert(cell) {
                bucket.new_cells += 1;
                self.total_blocks += 1;
            } else {
                bucket.routine_cells += 1;
            }
        }
    }

    pub fn months(&self) -> &BTreeMap<String, MonthlyBucket> {
        &self.months
    }

    pub fn finish(self) -> TimelineResponse {
        let mut labels = Vec::with_capacity(self.months.len());
        let mut conquest = Vec::with_capacity(self.months.len());
        let mut exploration = Vec::with_capacity(self.months.len());
        let mut routine = Vec::with_capacity(self.months.len());

        let mut running = 0;
        for (month, bucket) in self.months {
            running += bucket.new_cells;
            labels.push(month);
            conquest.push(running);
            exploration.push(bucket.new_cells);
            routine.push(bucket.routine_cells);
        }

        debug!(
            "[Conquest] {} months, {} cells discovered",
            labels.len(),
            self.total_blocks
        );

        TimelineResponse {
            labels,
            conquest,
            exploration,
            routine,
            total_blocks: self.total_blocks,
            available_years: self.years.iter().rev().map(|y| y.to_string()).collect(),
            available_sports: self.sports.iter().map(|s| s.to_string()).collect(),
        }
    }
}
