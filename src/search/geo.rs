//! Great-circle helpers for radius searches.

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Distance between two points in kilometres.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// `None` for coordinates outside the valid lat/lng ranges.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
            Some(GeoPoint { lat, lng })
        } else {
            None
        }
    }

    pub fn distance_km(&self, lat: f64, lng: f64) -> f64 {
        haversine_km(self.lat, self.lng, lat, lng)
    }

    pub fn within(&self, lat: f64, lng: f64, radius_km: f64) -> bool {
        self.distance_km(lat, lng) <= radius_km
    }
}
