//! Municipality boundaries and the shared boundary cache.
//!
//! The store maps a rounded coordinate to the municipality containing it.
//! Several keys usually point at the same municipality; entries are keyed by
//! coordinate because that is what a lookup knows before it resolves.
//!
//! The store outlives sessions and is snapshotted to a MessagePack file.
//! A missing or unreadable snapshot degrades to an empty store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConquestError, Result};

/// Key precision: 3 decimal places (~110 m).
const KEY_SCALE: f64 = 1e3;

/// Resolved municipality boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MunicipalityBoundary {
    pub name: String,
    /// Area in square meters
    pub area_m2: f64,
    /// Outline ring as `[lat, lon]` vertices
    pub outline: Vec<[f64; 2]>,
}

/// Rounded coordinate used as the boundary cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundaryKey {
    lat_e3: i64,
    lon_e3: i64,
}

impl BoundaryKey {
    pub fn from_coords(latitude: f64, longitude: f64) -> Self {
        Self {
            lat_e3: (latitude * KEY_SCALE).round_ties_even() as i64,
            lon_e3: (longitude * KEY_SCALE).round_ties_even() as i64,
        }
    }
}

impl fmt::Display for BoundaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}_{:.3}",
            self.lat_e3 as f64 / KEY_SCALE,
            self.lon_e3 as f64 / KEY_SCALE
        )
    }
}

impl FromStr for BoundaryKey {
    type Err = ConquestError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: Option<&str>| -> Result<f64> {
            part.and_then(|p| p.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .ok_or_else(|| ConquestError::persistence(format!("bad boundary key '{}'", s)))
        };
        let mut parts = s.splitn(2, '_');
        let lat = parse(parts.next())?;
        let lon = parse(parts.next())?;
        Ok(Self::from_coords(lat, lon))
    }
}

// ============================================================================
// Boundary Store
// ============================================================================

/// Thread-safe coordinate → boundary cache shared across all sessions.
///
/// Snapshot writes are serialized through `writer`, which remembers the
/// generation last written so an older snapshot never replaces a newer one.
#[derive(Debug, Default)]
pub struct BoundaryStore {
    entries: RwLock<HashMap<BoundaryKey, Arc<MunicipalityBoundary>>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
    generation: AtomicU64,
    writer: Arc<Mutex<u64>>,
}

/// A serialized snapshot waiting to be written.
struct PendingSnapshot {
    path: PathBuf,
    generation: u64,
    bytes: Vec<u8>,
    count: usize,
}

impl PendingSnapshot {
    /// Write under the store's writer lock. Returns `false` when a newer
    /// snapshot already reached the disk.
    fn write(self, writer: &Mutex<u64>) -> Result<bool> {
        let mut written = writer.lock().unwrap_or_else(PoisonError::into_inner);
        if *written >= self.generation {
            return Ok(false);
        }
        write_snapshot(&self.path, &self.bytes)?;
        *written = self.generation;
        debug!(
            "[BoundaryStore] Persisted {} boundaries to {}",
            self.count,
            self.path.display()
        );
        Ok(true)
    }
}

impl BoundaryStore {
    /// Empty store that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path`. Never fails: a missing or corrupt file
    /// yields an empty store that will persist back to `path`.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_snapshot(&path) {
            Ok(Some(entries)) => {
                info!(
                    "[BoundaryStore] Loaded {} boundaries from {}",
                    entries.len(),
                    path.display()
                );
                entries
            }
            Ok(None) => {
                info!(
                    "[BoundaryStore] No snapshot at {}, starting empty",
                    path.display()
                );
                HashMap::new()
            }
            Err(e) => {
                warn!("[BoundaryStore] Ignoring snapshot {}: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            entries: RwLock::new(entries),
            path: Some(path),
            ..Self::default()
        }
    }

    pub fn get(&self, key: &BoundaryKey) -> Option<Arc<MunicipalityBoundary>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: BoundaryKey, boundary: Arc<MunicipalityBoundary>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, boundary);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether entries were inserted since the last successful persist.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the snapshot if anything changed, blocking the calling thread.
    /// Returns whether this call wrote the file.
    pub fn persist(&self) -> Result<bool> {
        let Some(pending) = self.prepare()? else {
            return Ok(false);
        };
        self.settle(pending.write(&self.writer))
    }

    /// [`persist`](Self::persist) with the file I/O moved to tokio's blocking pool.
    pub async fn flush(&self) -> Result<bool> {
        let Some(pending) = self.prepare()? else {
            return Ok(false);
        };
        let writer = Arc::clone(&self.writer);
        let result = tokio::task::spawn_blocking(move || pending.write(&writer))
            .await
            .unwrap_or_else(|e| Err(ConquestError::persistence(format!("snapshot writer: {}", e))));
        self.settle(result)
    }

    /// Serialize the current entries if the store is dirty.
    fn prepare(&self) -> Result<Option<PendingSnapshot>> {
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }

        let generation;
        let encoded = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let snapshot: BTreeMap<String, &MunicipalityBoundary> = entries
                .iter()
                .map(|(key, boundary)| (key.to_string(), boundary.as_ref()))
                .collect();
            rmp_serde::to_vec_named(&snapshot).map(|bytes| (bytes, snapshot.len()))
        };

        match encoded {
            Ok((bytes, count)) => Ok(Some(PendingSnapshot {
                path,
                generation,
                bytes,
                count,
            })),
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(ConquestError::persistence(e.to_string()))
            }
        }
    }

    fn settle(&self, result: Result<bool>) -> Result<bool> {
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }
}

fn read_snapshot(path: &Path) -> Result<Option<HashMap<BoundaryKey, Arc<MunicipalityBoundary>>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConquestError::persistence(e.to_string())),
    };
    let raw: BTreeMap<String, MunicipalityBoundary> = rmp_serde::from_slice(&bytes)
        .map_err(|e| ConquestError::persistence(format!("corrupt snapshot: {}", e)))?;

    let mut entries = HashMap::with_capacity(raw.len());
    for (key, boundary) in raw {
        match key.parse::<BoundaryKey>() {
            Ok(key) => {
                entries.insert(key, Arc::new(boundary));
            }
            Err(e) => debug!("[BoundaryStore] Skipping entry: {}", e),
        }
    }
    Ok(Some(entries))
}

fn write_snapshot(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| ConquestError::persistence(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| ConquestError::persistence(e.to_string()))
}
