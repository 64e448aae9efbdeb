pub mod in_memory;
pub mod mmap;
pub mod rt;

#[cfg(test)]
pub(crate) mod fixtures;

use bytemuck::{Pod, Zeroable};
use chrono::NaiveDate;
use chrono_tz::Tz;
use s2::latlng::LatLng;
use serde::{Deserialize, Serialize};

use super::{geomath::s2cell_lat_lng, time::DateRange, time::DeltaTime};

#[derive(Debug, thiserror::Error)]
pub enum TimetableError {
    #[error("Trip {0} has fewer than two stops")]
    TooFewStops(String),
    #[error("Trip {trip} references unknown location {location}")]
    UnknownLocation { trip: String, location: usize },
    #[error("Trip {trip} goes back in time at stop {stop_seq}")]
    NonMonotonicTimes { trip: String, stop_seq: usize },
    #[error("Trip {trip} has a time outside of the timetable's date range at stop {stop_seq}")]
    TimeOutOfRange { trip: String, stop_seq: usize },
    #[error("Footpath references unknown location {0}")]
    UnknownFootpathLocation(usize),
    #[error("Invalid timezone {0:?}")]
    InvalidTimezone(String),
    #[error("Too many {0} for a 32 bit index")]
    TooLarge(&'static str),
}

/// Read-only network model the search runs against. Everything is laid out as flat arrays
/// indexed by dense ids, and each element knows where its children start so that ranges can be
/// derived from the next element.
pub trait Timetable {
    fn locations(&self) -> &[Location];
    fn location_routes(&self) -> &[LocationRoute];
    fn routes(&self) -> &[Route];
    fn route_stops(&self) -> &[RouteStop];
    fn transports(&self) -> &[Transport];
    fn stop_times(&self) -> &[StopTime];
    fn footpaths_out(&self) -> &[Footpath];
    fn footpaths_in(&self) -> &[Footpath];
    fn metadata(&self) -> &TimetableMetadata;

    #[inline]
    fn n_locations(&self) -> usize {
        self.locations().len()
    }

    #[inline]
    fn n_routes(&self) -> usize {
        self.routes().len()
    }

    #[inline]
    fn n_transports(&self) -> usize {
        self.transports().len()
    }

    #[inline]
    fn location(&self, location_id: usize) -> &Location {
        &self.locations()[location_id]
    }

    #[inline]
    fn route(&self, route_id: usize) -> &Route {
        &self.routes()[route_id]
    }

    #[inline]
    fn transport(&self, transport_id: usize) -> &Transport {
        &self.transports()[transport_id]
    }

    fn location_name(&self, location_id: usize) -> &str {
        &self.metadata().location_names[location_id]
    }

    fn date_range(&self) -> DateRange {
        self.metadata().date_range
    }

    fn base_day(&self) -> NaiveDate {
        self.metadata().date_range.base_day()
    }
}

/// End of the child range of element `index`, given each element's first child index.
#[inline]
fn range_end<T>(elements: &[T], index: usize, children: usize, first: impl Fn(&T) -> u32) -> usize {
    if index + 1 == elements.len() {
        children
    } else {
        first(&elements[index + 1]) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Location {
    s2cell: u64,
    location_index: u32,
    first_location_route: u32,
    first_footpath_out: u32,
    first_footpath_in: u32,
    transfer_time: u16,
    timezone_index: u16,
    _padding: u32,
}

impl<'a> Location {
    #[inline]
    pub fn id(&self) -> usize {
        self.location_index as usize
    }

    #[inline]
    pub fn lat_lng(&self) -> LatLng {
        s2cell_lat_lng(self.s2cell)
    }

    /// Minimum time needed to change vehicles at this location, in minutes.
    #[inline]
    pub fn transfer_time(&self) -> u16 {
        self.transfer_time
    }

    #[inline]
    pub fn timezone_index(&self) -> u16 {
        self.timezone_index
    }

    pub fn routes(&self, timetable: &'a dyn Timetable) -> &'a [LocationRoute] {
        let end = range_end(
            timetable.locations(),
            self.id(),
            timetable.location_routes().len(),
            |l| l.first_location_route,
        );
        &timetable.location_routes()[self.first_location_route as usize..end]
    }

    pub fn footpaths_out(&self, timetable: &'a dyn Timetable) -> &'a [Footpath] {
        let end = range_end(
            timetable.locations(),
            self.id(),
            timetable.footpaths_out().len(),
            |l| l.first_footpath_out,
        );
        &timetable.footpaths_out()[self.first_footpath_out as usize..end]
    }

    pub fn footpaths_in(&self, timetable: &'a dyn Timetable) -> &'a [Footpath] {
        let end = range_end(
            timetable.locations(),
            self.id(),
            timetable.footpaths_in().len(),
            |l| l.first_footpath_in,
        );
        &timetable.footpaths_in()[self.first_footpath_in as usize..end]
    }
}

/// A route serving a location, with the position of the location in the route's stop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct LocationRoute {
    route_index: u32,
    stop_seq: u32,
}

impl LocationRoute {
    #[inline]
    pub fn route_id(&self) -> usize {
        self.route_index as usize
    }

    #[inline]
    pub fn stop_seq(&self) -> usize {
        self.stop_seq as usize
    }
}

/// A fixed stop sequence served by transports that never overtake each other. Transports are
/// sorted by departure, which holds at every stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Route {
    route_index: u32,
    first_route_stop: u32,
    first_transport: u32,
}

impl<'a> Route {
    #[inline]
    pub fn id(&self) -> usize {
        self.route_index as usize
    }

    pub fn route_stops(&self, timetable: &'a dyn Timetable) -> &'a [RouteStop] {
        let end = range_end(
            timetable.routes(),
            self.id(),
            timetable.route_stops().len(),
            |r| r.first_route_stop,
        );
        &timetable.route_stops()[self.first_route_stop as usize..end]
    }

    pub fn transports(&self, timetable: &'a dyn Timetable) -> &'a [Transport] {
        let end = range_end(
            timetable.routes(),
            self.id(),
            timetable.transports().len(),
            |r| r.first_transport,
        );
        &timetable.transports()[self.first_transport as usize..end]
    }

    pub fn name(&self, timetable: &'a dyn Timetable) -> Option<&'a str> {
        timetable.metadata().route_names[self.id()].as_deref()
    }
}

pub const ROUTE_STOP_IN_ALLOWED: u16 = 1;
pub const ROUTE_STOP_OUT_ALLOWED: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct RouteStop {
    route_index: u32,
    location_index: u32,
    stop_seq: u16,
    flags: u16,
}

impl RouteStop {
    #[inline]
    pub fn route_id(&self) -> usize {
        self.route_index as usize
    }

    #[inline]
    pub fn location_id(&self) -> usize {
        self.location_index as usize
    }

    #[inline]
    pub fn stop_seq(&self) -> usize {
        self.stop_seq as usize
    }

    #[inline]
    pub fn in_allowed(&self) -> bool {
        self.flags & ROUTE_STOP_IN_ALLOWED != 0
    }

    #[inline]
    pub fn out_allowed(&self) -> bool {
        self.flags & ROUTE_STOP_OUT_ALLOWED != 0
    }
}

/// One trip on one service day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Transport {
    transport_index: u32,
    route_index: u32,
    first_stop_time: u32,
    last_stop_time: u32,
}

impl<'a> Transport {
    #[inline]
    pub fn id(&self) -> usize {
        self.transport_index as usize
    }

    #[inline]
    pub fn route_id(&self) -> usize {
        self.route_index as usize
    }

    #[inline]
    pub fn stop_times(&self, timetable: &'a dyn Timetable) -> &'a [StopTime] {
        &timetable.stop_times()[self.first_stop_time as usize..self.last_stop_time as usize]
    }

    pub fn trip_id(&self, timetable: &'a dyn Timetable) -> &'a str {
        &timetable.metadata().transport_trip_ids[self.id()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct StopTime {
    arrival: DeltaTime,
    departure: DeltaTime,
}

impl StopTime {
    pub fn new(arrival: DeltaTime, departure: DeltaTime) -> StopTime {
        StopTime { arrival, departure }
    }

    #[inline]
    pub fn arrival(&self) -> DeltaTime {
        self.arrival
    }

    #[inline]
    pub fn departure(&self) -> DeltaTime {
        self.departure
    }
}

/// A walking connection. In `footpaths_out` the location is the target, in `footpaths_in` it is
/// the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Footpath {
    location: u32,
    duration: u16,
    _padding: u16,
}

impl Footpath {
    #[inline]
    pub fn location_id(&self) -> usize {
        self.location as usize
    }

    /// Walking time in minutes.
    #[inline]
    pub fn duration(&self) -> u16 {
        self.duration
    }
}

/// Everything that isn't needed in the search loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimetableMetadata {
    pub date_range: DateRange,
    pub location_ids: Vec<String>,
    pub location_names: Vec<String>,
    pub timezones: Vec<String>,
    pub route_names: Vec<Option<String>>,
    pub transport_trip_ids: Vec<String>,
    #[serde(skip)]
    resolved_timezones: Vec<Tz>,
}

impl TimetableMetadata {
    pub fn new(date_range: DateRange) -> TimetableMetadata {
        TimetableMetadata {
            date_range,
            location_ids: vec![],
            location_names: vec![],
            timezones: vec![],
            route_names: vec![],
            transport_trip_ids: vec![],
            resolved_timezones: vec![],
        }
    }

    pub fn resolve_timezones(&mut self) -> Result<(), TimetableError> {
        self.resolved_timezones = self
            .timezones
            .iter()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| TimetableError::InvalidTimezone(name.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    pub fn timezones_resolved(&self) -> bool {
        self.resolved_timezones.len() == self.timezones.len()
    }

    /// Panics if timezones have not been resolved yet.
    pub fn timezone(&self, timezone_index: u16) -> Tz {
        assert!(
            self.timezones_resolved(),
            "Timezones must be resolved before use"
        );
        self.resolved_timezones[timezone_index as usize]
    }

    pub fn location_timezone(&self, location: &Location) -> Tz {
        self.timezone(location.timezone_index())
    }
}
