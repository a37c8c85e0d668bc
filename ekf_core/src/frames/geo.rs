// ekf_core/src/frames/geo.rs

use serde::{Deserialize, Serialize};

use crate::types::{TimeUs, Vector3f, EARTH_RATE};

/// Mean earth radius used by the local projection (m).
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// Azimuthal equidistant projection about a WGS-84 reference point.
///
/// Maps latitude/longitude onto a local North/East plane in metres. Accurate
/// to a few centimetres over the ranges a local navigation frame spans.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapProjection {
    lat_rad: f64,
    lon_rad: f64,
    sin_lat: f64,
    cos_lat: f64,
    /// Time the reference was set.
    pub timestamp_us: TimeUs,
}

impl MapProjection {
    pub fn new(lat_deg: f64, lon_deg: f64, timestamp_us: TimeUs) -> Self {
        let lat_rad = lat_deg.to_radians();
        let lon_rad = lon_deg.to_radians();
        Self {
            lat_rad,
            lon_rad,
            sin_lat: lat_rad.sin(),
            cos_lat: lat_rad.cos(),
            timestamp_us,
        }
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat_rad.to_degrees()
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon_rad.to_degrees()
    }

    /// Project a geodetic position onto the local North/East plane.
    pub fn project(&self, lat_deg: f64, lon_deg: f64) -> (f32, f32) {
        let lat_rad = lat_deg.to_radians();
        let lon_rad = lon_deg.to_radians();
        let sin_lat = lat_rad.sin();
        let cos_lat = lat_rad.cos();
        let cos_d_lon = (lon_rad - self.lon_rad).cos();

        let arg = (self.sin_lat * sin_lat + self.cos_lat * cos_lat * cos_d_lon).clamp(-1.0, 1.0);
        let c = arg.acos();
        let k = if c.abs() > f64::EPSILON { c / c.sin() } else { 1.0 };

        let north = k * (self.cos_lat * sin_lat - self.sin_lat * cos_lat * cos_d_lon) * EARTH_RADIUS;
        let east = k * cos_lat * (lon_rad - self.lon_rad).sin() * EARTH_RADIUS;
        (north as f32, east as f32)
    }

    /// Inverse of [`MapProjection::project`].
    pub fn reproject(&self, north: f32, east: f32) -> (f64, f64) {
        let x = north as f64 / EARTH_RADIUS;
        let y = east as f64 / EARTH_RADIUS;
        let c = (x * x + y * y).sqrt();

        if c.abs() < f64::EPSILON {
            return (self.lat_deg(), self.lon_deg());
        }

        let sin_c = c.sin();
        let cos_c = c.cos();
        let lat_rad = (cos_c * self.sin_lat + (x * sin_c * self.cos_lat) / c).asin();
        let lon_rad = self.lon_rad
            + (y * sin_c).atan2(c * self.cos_lat * cos_c - x * self.sin_lat * sin_c);
        (lat_rad.to_degrees(), lon_rad.to_degrees())
    }
}

/// Earth rotation vector expressed in NED at the given latitude.
pub fn earth_rate_ned(lat_rad: f32) -> Vector3f {
    Vector3f::new(EARTH_RATE * lat_rad.cos(), 0.0, -EARTH_RATE * lat_rad.sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn origin_projects_to_zero() {
        let proj = MapProjection::new(47.397742, 8.545594, 0);
        let (n, e) = proj.project(47.397742, 8.545594);
        assert_abs_diff_eq!(n, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(e, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn project_and_reproject_agree() {
        let proj = MapProjection::new(47.397742, 8.545594, 0);
        let (lat, lon) = proj.reproject(120.0, -45.0);
        let (n, e) = proj.project(lat, lon);
        assert_abs_diff_eq!(n, 120.0, epsilon = 1e-2);
        assert_abs_diff_eq!(e, -45.0, epsilon = 1e-2);
    }

    #[test]
    fn one_arc_minute_north_is_about_1853_metres() {
        let proj = MapProjection::new(0.0, 0.0, 0);
        let (n, e) = proj.project(1.0 / 60.0, 0.0);
        assert_abs_diff_eq!(n, 1853.3, epsilon = 1.0);
        assert_abs_diff_eq!(e, 0.0, epsilon = 1e-3);
    }
}
