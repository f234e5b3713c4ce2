//! # Livemap Sync
//!
//! Client-side live geospatial synchronization for location-sharing apps.
//!
//! This library provides:
//! - A durable position buffer with at-least-once batch upload
//! - A tracking session with permission handling and an on-demand throttle
//! - A viewport-driven map orchestrator that polls live feeds with
//!   single-flight guards and merges them with per-feed rules
//!
//! ## Features
//!
//! - **`http`** - Enable the reqwest-backed remote API client
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use livemap_sync::{GpsPoint, geo_utils};
//!
//! // Frame a 2km radius around a point of interest
//! let viewport = geo_utils::viewport_around(GpsPoint::new(51.5074, -0.1278), 2_000.0);
//! let bounds = viewport.bounds();
//! assert!(bounds.contains(&GpsPoint::new(51.5074, -0.1278)));
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod geo_utils;
pub mod merger;
pub mod orchestrator;
pub mod poller;
pub mod queue;
pub mod session;
pub mod spatial;
pub mod store;
pub mod uploader;
pub mod viewport;

// HTTP module for the remote APIs
#[cfg(feature = "http")]
pub mod http;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{
    AreaOfInterest, Event, EventFilter, EventStatus, EventsPage, FeedApi, GroupContext,
    LocationProvider, MemberPosition, PermissionLevel, PositionSink, UserProfile, WatchOptions,
};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use merger::{FeedMode, LiveState};
pub use orchestrator::{MapOrchestrator, MapSnapshot, RefreshOutcome, SkipReason};
pub use poller::{Feed, FeedPoller, Flight, SingleFlight};
pub use queue::DurableSampleQueue;
pub use session::{OnDemandOutcome, TrackingMode, TrackingSession, TrackingState};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use uploader::{BatchUploader, UploadOutcome};
pub use viewport::ViewportController;

#[cfg(feature = "http")]
pub use http::ApiClient;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("LivemapSyncRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use livemap_sync::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
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

/// Axis-aligned bounding box, used for region queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Inclusive containment test.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

/// One timestamped position reading. Immutable once captured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Meters per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Degrees from true north
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Horizontal accuracy radius in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Unix timestamp in milliseconds
    pub captured_at: i64,
}

impl LocationSample {
    /// A bare fix with no motion or accuracy metadata.
    pub fn new(latitude: f64, longitude: f64, captured_at: i64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            speed: None,
            heading: None,
            accuracy: None,
            captured_at,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// The map's visible region: a center plus the spans it covers, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_span: f64,
    pub longitude_span: f64,
}

impl Viewport {
    pub fn new(latitude: f64, longitude: f64, latitude_span: f64, longitude_span: f64) -> Self {
        Self { latitude, longitude, latitude_span, longitude_span }
    }

    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Bounding box covered by this viewport, clamped to valid coordinates.
    pub fn bounds(&self) -> Bounds {
        geo_utils::viewport_bounds(self)
    }
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// FFI Exports
// ============================================================================

#[cfg(feature = "ffi")]
mod ffi {
    use super::*;
    use log::debug;

    /// Bounding box for a map region, as sent to region queries.
    #[uniffi::export]
    pub fn viewport_bounds(viewport: Viewport) -> Bounds {
        init_logging();
        viewport.bounds()
    }

    /// Viewport that frames a circle of `radius_meters` around `center`.
    #[uniffi::export]
    pub fn viewport_around(center: GpsPoint, radius_meters: f64) -> Viewport {
        init_logging();
        crate::geo_utils::viewport_around(center, radius_meters)
    }

    /// Order-independent fingerprint of a set of tracked event ids.
    #[uniffi::export]
    pub fn tracked_set_key(event_ids: Vec<String>) -> String {
        init_logging();
        let key = crate::merger::fingerprint(event_ids.iter().map(String::as_str));
        debug!("[LivemapSyncRust] tracked_set_key for {} ids", event_ids.len());
        key
    }

    /// Great-circle distance between two samples in meters.
    #[uniffi::export]
    pub fn sample_distance_meters(a: LocationSample, b: LocationSample) -> f64 {
        crate::geo_utils::haversine_distance(&a.point(), &b.point())
    }
}

// ============================================================================
// Tests
// ============================================================================
