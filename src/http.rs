//! HTTP clients for the activity provider and the municipality geocoder.
//!
//! Both clients keep a pooled `reqwest::Client` and map every failure onto
//! [`ConquestError`] so callers can skip the affected page or cell:
//! - Transport errors, timeouts and non-200 statuses → `UpstreamUnavailable`
//! - Bodies of the wrong shape → `MalformedResponse`

use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::activity::RawActivity;
use crate::boundary::MunicipalityBoundary;
use crate::config::{ProviderConfig, ResolverConfig};
use crate::error::{ConquestError, Result};
use crate::provider::{ActivityProvider, BoundaryGeocoder};

/// Square meters per hectare.
const M2_PER_HECTARE: f64 = 10_000.0;

/// Name used when the geocoder omits one.
const UNKNOWN_MUNICIPALITY: &str = "Inconnue";

fn build_client(max_idle: usize, timeout: Duration) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(max_idle)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .map_err(|e| ConquestError::upstream(format!("Failed to create HTTP client: {}", e), None))
}

fn check_status(status: StatusCode, what: &str) -> Result<()> {
    if status != StatusCode::OK {
        return Err(ConquestError::upstream(
            format!("{} returned HTTP {}", what, status),
            Some(status.as_u16()),
        ));
    }
    Ok(())
}

// ============================================================================
// Activity provider
// ============================================================================

/// Strava athlete-activities client (bearer auth, page-numbered).
pub struct StravaClient {
    client: Client,
    config: ProviderConfig,
}

impl StravaClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = build_client(4, config.request_timeout)?;
        Ok(Self { client, config })
    }
}

impl ActivityProvider for StravaClient {
    async fn fetch_page(
        &self,
        credential: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawActivity>> {
        let response = self
            .client
            .get(&self.config.activities_url)
            .bearer_auth(credential)
            .query(&[("per_page", per_page), ("page", page)])
            .send()
            .await
            .map_err(|e| ConquestError::upstream(format!("Request error: {}", e), None))?;

        check_status(response.status(), "activity list")?;

        let items: Vec<Value> = response
            .json()
            .await
            .map_err(|e| ConquestError::malformed(format!("activity page {}: {}", page, e)))?;

        let total = items.len();
        let activities: Vec<RawActivity> = items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(activity) => Some(activity),
                Err(e) => {
                    debug!("[StravaClient] Skipping malformed activity: {}", e);
                    None
                }
            })
            .collect();

        if activities.len() < total {
            warn!(
                "[StravaClient] Page {}: {}/{} activities readable",
                page,
                activities.len(),
                total
            );
        }
        Ok(activities)
    }
}

// ============================================================================
// Geocoder
// ============================================================================

/// Municipality record as returned by geo.api.gouv.fr `/communes`.
#[derive(Debug, Deserialize)]
struct CommuneResponse {
    nom: Option<String>,
    /// Hectares
    surface: Option<f64>,
    contour: Option<Contour>,
}

#[derive(Debug, Deserialize)]
struct Contour {
    coordinates: Value,
}

impl CommuneResponse {
    fn into_boundary(self) -> MunicipalityBoundary {
        let outline = self
            .contour
            .as_ref()
            .map(|c| outer_ring(&c.coordinates))
            .unwrap_or_default();

        MunicipalityBoundary {
            name: self.nom.unwrap_or_else(|| UNKNOWN_MUNICIPALITY.to_string()),
            area_m2: self.surface.unwrap_or(0.0) * M2_PER_HECTARE,
            outline,
        }
    }
}

/// First ring of a GeoJSON polygon, flipped from `[lon, lat]` to `[lat, lon]`.
/// Vertices that are not numeric pairs are dropped.
fn outer_ring(coordinates: &Value) -> Vec<[f64; 2]> {
    let Some(ring) = coordinates.get(0).and_then(Value::as_array) else {
        return Vec::new();
    };
    ring.iter()
        .filter_map(|vertex| {
            let lon = vertex.get(0)?.as_f64()?;
            let lat = vertex.get(1)?.as_f64()?;
            Some([lat, lon])
        })
        .collect()
}

/// Reverse geocoder for French communes.
pub struct GeoApiClient {
    client: Client,
    base_url: String,
}

impl GeoApiClient {
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let client = build_client(config.max_concurrent_lookups, config.lookup_timeout)?;
        Ok(Self {
            client,
            base_url: config.geocoder_url.clone(),
        })
    }
}

impl BoundaryGeocoder for GeoApiClient {
    async fn lookup(&self, latitude: f64, longitude: f64) -> Result<Option<MunicipalityBoundary>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("fields", "nom,contour,surface".to_string()),
                ("format", "json".to_string()),
                ("geometry", "contour".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ConquestError::upstream(format!("Request error: {}", e), None))?;

        check_status(response.status(), "commune lookup")?;

        let communes: Vec<CommuneResponse> = response
            .json()
            .await
            .map_err(|e| ConquestError::malformed(format!("commune lookup: {}", e)))?;

        Ok(communes.into_iter().next().map(CommuneResponse::into_boundary))
    }
}
