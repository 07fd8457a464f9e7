//! External collaborators consumed by the engine.
//!
//! The activity provider and the geocoder are reached through these traits so
//! the engine can be driven by the reqwest clients in [`crate::http`] or by
//! in-process fakes.

use std::future::Future;
use std::sync::Arc;

use crate::activity::RawActivity;
use crate::boundary::MunicipalityBoundary;
use crate::error::Result;

/// Paginated source of a user's activities.
pub trait ActivityProvider: Send + Sync {
    /// Fetch one page (1-based). An empty page ends pagination.
    fn fetch_page(
        &self,
        credential: &str,
        page: u32,
        per_page: u32,
    ) -> impl Future<Output = Result<Vec<RawActivity>>> + Send;
}

/// Reverse geocoder returning the municipality that contains a coordinate.
pub trait BoundaryGeocoder: Send + Sync {
    /// `Ok(None)` when the service knows no municipality at that point.
    fn lookup(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> impl Future<Output = Result<Option<MunicipalityBoundary>>> + Send;
}

impl<T: ActivityProvider> ActivityProvider for Arc<T> {
    fn fetch_page(
        &self,
        credential: &str,
        page: u32,
        per_page: u32,
    ) -> impl Future<Output = Result<Vec<RawActivity>>> + Send {
        (**self).fetch_page(credential, page, per_page)
    }
}

impl<T: BoundaryGeocoder> BoundaryGeocoder for Arc<T> {
    fn lookup(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> impl Future<Output = Result<Option<MunicipalityBoundary>>> + Send {
        (**self).lookup(latitude, longitude)
    }
}
