//! Great-circle distance, used by the sampler's speed estimate.

/// Mean Earth radius in metres (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance between two (latitude, longitude) points, in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_m(52.52, 13.405, 52.52, 13.405), 0.0);
    }

    #[test]
    fn test_known_distance() {
        // Berlin -> Potsdam, roughly 26.5 km
        let d = haversine_m(52.5200, 13.4050, 52.3906, 13.0645);
        assert!((26_000.0..28_000.0).contains(&d), "got {}", d);
    }

    #[test]
    fn test_small_displacement() {
        // ~111 m per 0.001 degrees of latitude
        let d = haversine_m(52.0, 13.0, 52.001, 13.0);
        assert!((100.0..125.0).contains(&d), "got {}", d);
    }
}
