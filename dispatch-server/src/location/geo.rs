//! Distance and ETA

use shared::order::GeoPoint;

/// 地球平均半径 (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres (haversine)
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Minutes to cover `distance_km` at `speed_kmh`, never below 1
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> u32 {
    if speed_kmh.is_nan() || speed_kmh <= 0.0 || !distance_km.is_finite() {
        return 1;
    }
    let minutes = (distance_km / speed_kmh * 60.0).ceil();
    minutes.clamp(1.0, u32::MAX as f64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.19 km
        let d = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111.19).abs() < 0.01, "got {d}");

        let same = GeoPoint::new(31.23, 121.47);
        assert_eq!(haversine_km(same, same), 0.0);
    }

    #[test]
    fn test_eta_has_one_minute_floor() {
        assert_eq!(eta_minutes(0.0, 30.0), 1);
        assert_eq!(eta_minutes(0.01, 30.0), 1);
        // 15 km at 30 km/h = 30 min
        assert_eq!(eta_minutes(15.0, 30.0), 30);
        // 15.1 km -> 30.2 -> 31
        assert_eq!(eta_minutes(15.1, 30.0), 31);
        assert_eq!(eta_minutes(5.0, 0.0), 1);
    }
}
