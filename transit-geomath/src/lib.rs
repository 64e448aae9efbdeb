//! Spherical helpers shared by the timetable builder and the reach computation.
//!
//! Locations are embedded on a sphere of radius [`EARTH_RADIUS_APPROX`] so that straight-line
//! (chord) distances can be indexed with an ordinary 3D spatial index and converted back into
//! surface distances afterwards.

pub static EARTH_RADIUS_APPROX: f64 = 6_371_000f64;

pub fn lat_lng_to_cartesian(lat: f64, lng: f64) -> [f64; 3] {
    if !lat.is_finite() || !lng.is_finite() {
        return [0.0; 3];
    }
    let (lat, lng) = (lat.to_radians(), lng.to_radians());
    [
        EARTH_RADIUS_APPROX * lat.cos() * lng.sin(),
        EARTH_RADIUS_APPROX * lat.cos() * lng.cos(),
        EARTH_RADIUS_APPROX * lat.sin(),
    ]
}

pub fn cartesian_to_lat_lng(coords: [f64; 3]) -> (f64, f64) {
    let lng = f64::atan2(coords[0], coords[1]);
    let lat = (coords[2] / EARTH_RADIUS_APPROX).clamp(-1.0, 1.0).asin();
    (lat.to_degrees(), lng.to_degrees())
}

/// Surface distance in meters between two points given in degrees (haversine).
pub fn great_circle_meters(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lng1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lng2) = (to.0.to_radians(), to.1.to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lng2 - lng1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_APPROX * h.sqrt().min(1.0).asin()
}

/// Converts a straight-line distance through the sphere into the matching surface distance.
pub fn chord_to_arc_meters(chord: f64) -> f64 {
    let half = (chord / (2.0 * EARTH_RADIUS_APPROX)).clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_APPROX * half.asin()
}

pub fn arc_to_chord_meters(arc: f64) -> f64 {
    let arc = arc.clamp(0.0, std::f64::consts::PI * EARTH_RADIUS_APPROX);
    2.0 * EARTH_RADIUS_APPROX * (arc / (2.0 * EARTH_RADIUS_APPROX)).sin()
}
