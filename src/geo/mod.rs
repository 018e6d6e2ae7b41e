pub mod polyline;

use crate::models::location::Coordinate;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

#[cfg(test)]
mod tests {
    use super::haversine_km;
    use crate::models::location::Coordinate;

    #[test]
    fn zero_distance_for_same_point() {
        let p = Coordinate::new(10.7769, 106.7009);
        assert!(haversine_km(&p, &p) < 1e-9);
    }

    #[test]
    fn saigon_to_hanoi_is_around_1140_km() {
        let saigon = Coordinate::new(10.7769, 106.7009);
        let hanoi = Coordinate::new(21.0278, 105.8342);
        let distance = haversine_km(&saigon, &hanoi);
        assert!((distance - 1140.0).abs() < 15.0);
    }
}
