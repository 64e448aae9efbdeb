use rstar::{PointDistance, RTreeObject, AABB};
use s2::{cellid::CellID, latlng::LatLng};
use serde::{Deserialize, Serialize};

pub use transit_geomath::{
    arc_to_chord_meters, chord_to_arc_meters, great_circle_meters, lat_lng_to_cartesian,
    EARTH_RADIUS_APPROX,
};

/// Walking pace used when footpaths are derived from straight-line distance.
pub static FAKE_WALK_SPEED_SECONDS_PER_METER: f64 = 1.2;

/// A location embedded in 3D so it can live in an `rstar` tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedLocation {
    pub coords: [f64; 3],
    pub id: usize,
}

impl IndexedLocation {
    pub fn new(id: usize, lat: f64, lng: f64) -> IndexedLocation {
        IndexedLocation {
            coords: lat_lng_to_cartesian(lat, lng),
            id,
        }
    }
}

impl RTreeObject for IndexedLocation {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.coords)
    }
}

impl PointDistance for IndexedLocation {
    fn distance_2(
        &self,
        point: &<Self::Envelope as rstar::Envelope>::Point,
    ) -> <<Self::Envelope as rstar::Envelope>::Point as rstar::Point>::Scalar {
        (self.coords[0] - point[0]).powi(2)
            + (self.coords[1] - point[1]).powi(2)
            + (self.coords[2] - point[2]).powi(2)
    }
}

#[inline]
pub fn s2cell_lat_lng(s2cell: u64) -> LatLng {
    CellID(s2cell).into()
}

#[inline]
pub fn s2cell_for(lat: f64, lng: f64) -> u64 {
    let cell: CellID = LatLng::from_degrees(lat, lng).into();
    cell.0
}

pub fn distance_meters(from: &LatLng, to: &LatLng) -> f64 {
    from.distance(to).rad() * EARTH_RADIUS_APPROX
}
