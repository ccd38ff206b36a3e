//! Distance and point-in-region predicates used by `GeofenceTracker` (§4.5).
//!
//! Adapted from the reference crate's `spatial.rs`: distance uses the `geo`
//! crate's haversine implementation rather than a flat-earth approximation,
//! so circular-geofence radii stay accurate at all latitudes.

use geo::{Distance, Haversine, Point};

/// Great-circle distance between two lat/lng points, in meters.
pub fn distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let a = Point::new(lng1, lat1);
    let b = Point::new(lng2, lat2);
    Haversine.distance(a, b)
}

/// True if the point lies within `radius` meters of `(center_lat,
/// center_lng)` (§4.5 circular test).
pub fn inside_circle(
    lat: f64,
    lng: f64,
    center_lat: f64,
    center_lng: f64,
    radius: f64,
) -> bool {
    distance_meters(lat, lng, center_lat, center_lng) <= radius
}

/// Ray-casting point-in-polygon test over `(lat, lng)` vertices (§4.5).
/// Ties on an edge resolve deterministically: a point lying exactly on a
/// horizontal ray crossing is counted only when the edge's lower endpoint
/// is at or below the ray, matching the standard half-open interval
/// formulation and avoiding double-counting at vertices.
pub fn inside_polygon(lat: f64, lng: f64, vertices: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (yi, xi) = vertices[i];
        let (yj, xj) = vertices[j];

        let intersects = ((yi > lat) != (yj > lat))
            && (lng < (xj - xi) * (lat - yi) / (yj - yi) + xi);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}
