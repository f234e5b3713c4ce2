//! # Geographic Utilities
//!
//! Distance and viewport math shared by the capture gate, the viewport
//! controller and the spatial index.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//! | [`viewport_bounds`] | Bounding box covered by a viewport |
//! | [`viewport_around`] | Viewport framing a radius around a point |
//!
//! ## Example
//!
//! ```rust
//! use livemap_sync::{GpsPoint, geo_utils};
//!
//! let london = GpsPoint::new(51.5074, -0.1278);
//! let paris = GpsPoint::new(48.8566, 2.3522);
//! let dist = geo_utils::haversine_distance(&london, &paris);
//! assert!((dist - 343_500.0).abs() < 2_000.0);
//! ```
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees).

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint, Viewport};

/// Meters per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Calculate the great-circle distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Convert meters to approximate degrees of longitude at a given latitude.
///
/// Uses a floor of cos(latitude) = 0.1 so spans stay finite near the poles.
/// Latitude spans do not depend on latitude and use the constant directly.
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = METERS_PER_DEGREE * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

/// Bounding box covered by a viewport, clamped to valid coordinates.
pub fn viewport_bounds(viewport: &Viewport) -> Bounds {
    let half_lat = viewport.latitude_span.abs() / 2.0;
    let half_lng = viewport.longitude_span.abs() / 2.0;
    Bounds {
        min_lat: (viewport.latitude - half_lat).max(-90.0),
        max_lat: (viewport.latitude + half_lat).min(90.0),
        min_lng: (viewport.longitude - half_lng).max(-180.0),
        max_lng: (viewport.longitude + half_lng).min(180.0),
    }
}

/// Viewport centred on `center` whose shorter side spans `2 * radius_meters`.
pub fn viewport_around(center: GpsPoint, radius_meters: f64) -> Viewport {
    let radius = radius_meters.abs();
    let latitude_span = 2.0 * radius / METERS_PER_DEGREE;
    let longitude_span = 2.0 * meters_to_degrees(radius, center.latitude);
    Viewport::new(center.latitude, center.longitude, latitude_span, longitude_span)
}
