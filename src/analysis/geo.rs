//! Great-circle distances.

/// Mean of the equatorial and polar radii, in metres.
pub const EARTH_RADIUS_M: f64 = (6384.0 + 6353.0) / 2.0 * 1000.0;

/// Haversine distance in metres between two `(lon, lat)` points in degrees.
pub fn haversine(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lon1, lat1, lon2, lat2) = (
        lon1.to_radians(),
        lat1.to_radians(),
        lon2.to_radians(),
        lat2.to_radians(),
    );
    let dlon = lon2 - lon1;
    let dlat = lat2 - lat1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Summed length of a polyline of `(lon, lat)` points.
pub fn path_length(points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine(w[0].0, w[0].1, w[1].0, w[1].1))
        .sum()
}
