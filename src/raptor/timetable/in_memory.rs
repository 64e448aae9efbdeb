use std::collections::{BTreeMap, HashMap};

use chrono_tz::Tz;
use log::{debug, info};
use rstar::RTree;

use crate::raptor::{
    geomath::{arc_to_chord_meters, chord_to_arc_meters, s2cell_for, IndexedLocation},
    time::{DateRange, DeltaTime},
};

use super::{
    Footpath, Location, LocationRoute, Route, RouteStop, StopTime, Timetable, TimetableError,
    TimetableMetadata, Transport, ROUTE_STOP_IN_ALLOWED, ROUTE_STOP_OUT_ALLOWED,
};

#[derive(Debug, Clone)]
pub struct InMemoryTimetable {
    locations: Vec<Location>,
    location_routes: Vec<LocationRoute>,
    routes: Vec<Route>,
    route_stops: Vec<RouteStop>,
    transports: Vec<Transport>,
    stop_times: Vec<StopTime>,
    footpaths_out: Vec<Footpath>,
    footpaths_in: Vec<Footpath>,
    metadata: TimetableMetadata,
}

impl Timetable for InMemoryTimetable {
    #[inline]
    fn locations(&self) -> &[Location] {
        &self.locations
    }

    #[inline]
    fn location_routes(&self) -> &[LocationRoute] {
        &self.location_routes
    }

    #[inline]
    fn routes(&self) -> &[Route] {
        &self.routes
    }

    #[inline]
    fn route_stops(&self) -> &[RouteStop] {
        &self.route_stops
    }

    #[inline]
    fn transports(&self) -> &[Transport] {
        &self.transports
    }

    #[inline]
    fn stop_times(&self) -> &[StopTime] {
        &self.stop_times
    }

    #[inline]
    fn footpaths_out(&self) -> &[Footpath] {
        &self.footpaths_out
    }

    #[inline]
    fn footpaths_in(&self) -> &[Footpath] {
        &self.footpaths_in
    }

    #[inline]
    fn metadata(&self) -> &TimetableMetadata {
        &self.metadata
    }
}

/// One stop of a trip handed to [`TimetableBuilder::add_trip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripStop {
    pub location: usize,
    pub arrival: DeltaTime,
    pub departure: DeltaTime,
    pub in_allowed: bool,
    pub out_allowed: bool,
}

impl TripStop {
    pub fn new(location: usize, arrival: DeltaTime, departure: DeltaTime) -> TripStop {
        TripStop {
            location,
            arrival,
            departure,
            in_allowed: true,
            out_allowed: true,
        }
    }
}

#[derive(Debug, Clone)]
struct LocationData {
    id: String,
    name: String,
    lat: f64,
    lng: f64,
    transfer_time: u16,
    timezone_index: u16,
}

/// Trips with the same key share a stop sequence. They become one route, or several if some of
/// them overtake others.
#[derive(Debug, Clone, PartialOrd, PartialEq, Eq, Ord)]
struct RouteKey {
    stops: Vec<(usize, u16)>,
    name: Option<String>,
}

#[derive(Debug, Clone)]
struct TripData {
    trip_id: String,
    times: Vec<StopTime>,
}

impl TripData {
    /// True if `self` is nowhere later than `other`, so both can share a route in this order.
    fn precedes(&self, other: &TripData) -> bool {
        self.times.iter().zip(other.times.iter()).all(|(a, b)| {
            a.arrival() <= b.arrival() && a.departure() <= b.departure()
        })
    }
}

/// Collects locations, trips and footpaths and lays them out as an [`InMemoryTimetable`].
#[derive(Debug)]
pub struct TimetableBuilder {
    date_range: DateRange,
    locations: Vec<LocationData>,
    location_index: HashMap<String, usize>,
    timezones: Vec<String>,
    timezone_index: HashMap<Tz, u16>,
    route_table: BTreeMap<RouteKey, Vec<TripData>>,
    footpaths: BTreeMap<(usize, usize), u16>,
    trip_count: usize,
}

impl TimetableBuilder {
    pub fn new(date_range: DateRange) -> TimetableBuilder {
        TimetableBuilder {
            date_range,
            locations: vec![],
            location_index: HashMap::new(),
            timezones: vec![],
            timezone_index: HashMap::new(),
            route_table: BTreeMap::new(),
            footpaths: BTreeMap::new(),
            trip_count: 0,
        }
    }

    pub fn date_range(&self) -> DateRange {
        self.date_range
    }

    pub fn n_locations(&self) -> usize {
        self.locations.len()
    }

    pub fn location_by_id(&self, id: &str) -> Option<usize> {
        self.location_index.get(id).copied()
    }

    /// Adds a location, or returns the existing index if a location with this id is known.
    pub fn add_location(
        &mut self,
        id: &str,
        name: &str,
        lat: f64,
        lng: f64,
        transfer_time: u16,
        timezone: Tz,
    ) -> Result<usize, TimetableError> {
        if let Some(index) = self.location_index.get(id) {
            return Ok(*index);
        }
        if self.locations.len() >= u32::MAX as usize {
            return Err(TimetableError::TooLarge("locations"));
        }
        let timezone_index = match self.timezone_index.get(&timezone) {
            Some(index) => *index,
            None => {
                let index = u16::try_from(self.timezones.len())
                    .map_err(|_| TimetableError::TooLarge("timezones"))?;
                self.timezones.push(timezone.name().to_string());
                self.timezone_index.insert(timezone, index);
                index
            }
        };
        let index = self.locations.len();
        self.locations.push(LocationData {
            id: id.to_string(),
            name: name.to_string(),
            lat,
            lng,
            transfer_time,
            timezone_index,
        });
        self.location_index.insert(id.to_string(), index);
        Ok(index)
    }

    /// Adds a directed footpath. If one already exists between the two locations, the faster one
    /// is kept. Self loops are dropped since in-station changes are covered by the transfer time.
    pub fn add_footpath(
        &mut self,
        from: usize,
        to: usize,
        duration_minutes: u16,
    ) -> Result<(), TimetableError> {
        for location in [from, to] {
            if location >= self.locations.len() {
                return Err(TimetableError::UnknownFootpathLocation(location));
            }
        }
        if from == to {
            return Ok(());
        }
        self.footpaths
            .entry((from, to))
            .and_modify(|duration| *duration = (*duration).min(duration_minutes))
            .or_insert(duration_minutes);
        Ok(())
    }

    /// Connects every pair of locations closer than `max_meters` by a footpath whose duration is
    /// derived from the distance. Returns the number of footpaths added or shortened.
    pub fn generate_footpaths(&mut self, max_meters: f64, walk_seconds_per_meter: f64) -> usize {
        let tree = RTree::bulk_load(
            self.locations
                .iter()
                .enumerate()
                .map(|(id, location)| IndexedLocation::new(id, location.lat, location.lng))
                .collect(),
        );
        let max_chord_2 = arc_to_chord_meters(max_meters).powi(2);
        let mut pairs = vec![];
        for from in tree.iter() {
            for (to, distance_2) in tree.nearest_neighbor_iter_with_distance_2(&from.coords) {
                if distance_2 > max_chord_2 {
                    break;
                }
                if to.id == from.id {
                    continue;
                }
                let meters = chord_to_arc_meters(distance_2.sqrt());
                let minutes = (meters * walk_seconds_per_meter / 60.0).ceil().max(1.0);
                pairs.push((from.id, to.id, minutes.min(u16::MAX as f64) as u16));
            }
        }
        let mut changed = 0;
        for (from, to, minutes) in pairs {
            let previous = self.footpaths.get(&(from, to)).copied();
            if previous.map_or(true, |previous| minutes < previous) {
                self.footpaths.insert((from, to), minutes);
                changed += 1;
            }
        }
        debug!("Generated {} footpaths within {} meters", changed, max_meters);
        changed
    }

    pub fn add_trip(
        &mut self,
        route_name: Option<&str>,
        trip_id: &str,
        stops: Vec<TripStop>,
    ) -> Result<(), TimetableError> {
        if stops.len() < 2 {
            return Err(TimetableError::TooFewStops(trip_id.to_string()));
        }
        if stops.len() > u16::MAX as usize {
            return Err(TimetableError::TooLarge("stops in one trip"));
        }
        let mut previous = DeltaTime::from_minutes(i16::MIN);
        for (stop_seq, stop) in stops.iter().enumerate() {
            if stop.location >= self.locations.len() {
                return Err(TimetableError::UnknownLocation {
                    trip: trip_id.to_string(),
                    location: stop.location,
                });
            }
            if !stop.arrival.is_valid() || !stop.departure.is_valid() {
                return Err(TimetableError::TimeOutOfRange {
                    trip: trip_id.to_string(),
                    stop_seq,
                });
            }
            if stop.arrival < previous || stop.departure < stop.arrival {
                return Err(TimetableError::NonMonotonicTimes {
                    trip: trip_id.to_string(),
                    stop_seq,
                });
            }
            previous = stop.departure;
        }

        let key = RouteKey {
            stops: stops
                .iter()
                .map(|stop| {
                    let mut flags = 0;
                    if stop.in_allowed {
                        flags |= ROUTE_STOP_IN_ALLOWED;
                    }
                    if stop.out_allowed {
                        flags |= ROUTE_STOP_OUT_ALLOWED;
                    }
                    (stop.location, flags)
                })
                .collect(),
            name: route_name.map(str::to_string),
        };
        self.route_table.entry(key).or_default().push(TripData {
            trip_id: trip_id.to_string(),
            times: stops
                .iter()
                .map(|stop| StopTime::new(stop.arrival, stop.departure))
                .collect(),
        });
        self.trip_count += 1;
        Ok(())
    }

    pub fn build(self) -> Result<InMemoryTimetable, TimetableError> {
        let mut timetable = InMemoryTimetable {
            locations: vec![],
            location_routes: vec![],
            routes: vec![],
            route_stops: vec![],
            transports: vec![],
            stop_times: vec![],
            footpaths_out: vec![],
            footpaths_in: vec![],
            metadata: TimetableMetadata::new(self.date_range),
        };
        let mut served: Vec<Vec<LocationRoute>> = vec![vec![]; self.locations.len()];

        for (key, mut trips) in self.route_table {
            trips.sort_by(|a, b| a.times.cmp(&b.times));
            // Greedily split into overtaking-free groups. Trips are sorted by first departure, so
            // a trip can follow a group if it is nowhere earlier than the group's last trip.
            let mut groups: Vec<Vec<TripData>> = vec![];
            for trip in trips {
                match groups.iter_mut().find(|group| {
                    group
                        .last()
                        .map_or(false, |last: &TripData| last.precedes(&trip))
                }) {
                    Some(group) => group.push(trip),
                    None => groups.push(vec![trip]),
                }
            }
            if groups.len() > 1 {
                debug!(
                    "Split trips of route {:?} into {} overtaking-free routes",
                    key.name,
                    groups.len()
                );
            }

            for group in groups {
                let route_index = index_u32(timetable.routes.len(), "routes")?;
                timetable.routes.push(Route {
                    route_index,
                    first_route_stop: index_u32(timetable.route_stops.len(), "route stops")?,
                    first_transport: index_u32(timetable.transports.len(), "transports")?,
                });
                timetable.metadata.route_names.push(key.name.clone());
                for (stop_seq, (location, flags)) in key.stops.iter().enumerate() {
                    timetable.route_stops.push(RouteStop {
                        route_index,
                        location_index: *location as u32,
                        stop_seq: stop_seq as u16,
                        flags: *flags,
                    });
                    served[*location].push(LocationRoute {
                        route_index,
                        stop_seq: stop_seq as u32,
                    });
                }

                #[cfg(feature = "enforce_invariants")]
                for pair in group.windows(2) {
                    assert!(pair[0].precedes(&pair[1]));
                }

                for trip in group {
                    let first_stop_time = index_u32(timetable.stop_times.len(), "stop times")?;
                    timetable.stop_times.extend_from_slice(&trip.times);
                    timetable.transports.push(Transport {
                        transport_index: index_u32(timetable.transports.len(), "transports")?,
                        route_index,
                        first_stop_time,
                        last_stop_time: index_u32(timetable.stop_times.len(), "stop times")?,
                    });
                    timetable.metadata.transport_trip_ids.push(trip.trip_id);
                }
            }
        }

        let mut footpaths_in: Vec<(usize, usize, u16)> = self
            .footpaths
            .iter()
            .map(|((from, to), duration)| (*to, *from, *duration))
            .collect();
        footpaths_in.sort();
        let mut out_iter = self.footpaths.iter().peekable();
        let mut in_iter = footpaths_in.iter().peekable();

        for (location_index, location) in self.locations.iter().enumerate() {
            timetable.locations.push(Location {
                s2cell: s2cell_for(location.lat, location.lng),
                location_index: location_index as u32,
                first_location_route: index_u32(
                    timetable.location_routes.len(),
                    "location routes",
                )?,
                first_footpath_out: index_u32(timetable.footpaths_out.len(), "footpaths")?,
                first_footpath_in: index_u32(timetable.footpaths_in.len(), "footpaths")?,
                transfer_time: location.transfer_time,
                timezone_index: location.timezone_index,
                _padding: 0,
            });
            timetable
                .location_routes
                .extend_from_slice(&served[location_index]);
            while let Some(((_, to), duration)) =
                out_iter.next_if(|((from, _), _)| *from == location_index)
            {
                timetable.footpaths_out.push(Footpath {
                    location: *to as u32,
                    duration: *duration,
                    _padding: 0,
                });
            }
            while let Some((_, from, duration)) =
                in_iter.next_if(|(to, _, _)| *to == location_index)
            {
                timetable.footpaths_in.push(Footpath {
                    location: *from as u32,
                    duration: *duration,
                    _padding: 0,
                });
            }
            timetable.metadata.location_ids.push(location.id.clone());
            timetable.metadata.location_names.push(location.name.clone());
        }

        timetable.metadata.timezones = self.timezones;
        timetable.metadata.resolve_timezones()?;

        info!(
            "Built timetable with {} locations, {} routes, {} transports from {} trips",
            timetable.locations.len(),
            timetable.routes.len(),
            timetable.transports.len(),
            self.trip_count
        );
        Ok(timetable)
    }
}

fn index_u32(index: usize, what: &'static str) -> Result<u32, TimetableError> {
    u32::try_from(index).map_err(|_| TimetableError::TooLarge(what))
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;

    use crate::raptor::{
        time::{DateRange, DeltaTime},
        timetable::{Timetable, TimetableError},
    };

    use super::{TimetableBuilder, TripStop};

    fn builder() -> TimetableBuilder {
        TimetableBuilder::new(
            DateRange::new(
                NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
                NaiveDate::from_ymd_opt(2024, 5, 7).unwrap(),
            )
            .unwrap(),
        )
    }

    fn stop(location: usize, arrival: i16, departure: i16) -> TripStop {
        TripStop::new(
            location,
            DeltaTime::from_minutes(arrival),
            DeltaTime::from_minutes(departure),
        )
    }

    fn add_line(builder: &mut TimetableBuilder, n: usize) -> Vec<usize> {
        (0..n)
            .map(|i| {
                builder
                    .add_location(
                        &format!("s{i}"),
                        &format!("Stop {i}"),
                        48.0 + i as f64 * 0.01,
                        11.0,
                        2,
                        chrono_tz::UTC,
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn locations_are_deduplicated_by_id() {
        let mut builder = builder();
        let a = builder
            .add_location("a", "A", 1.0, 2.0, 2, chrono_tz::UTC)
            .unwrap();
        let again = builder
            .add_location("a", "Other name", 3.0, 4.0, 5, chrono_tz::UTC)
            .unwrap();
        assert_eq!(a, again);
        assert_eq!(builder.n_locations(), 1);
        assert_eq!(builder.location_by_id("a"), Some(a));
        assert_eq!(builder.location_by_id("b"), None);
    }

    #[test]
    fn single_route_layout() {
        let mut builder = builder();
        let l = add_line(&mut builder, 3);
        builder
            .add_trip(
                Some("1"),
                "late",
                vec![stop(l[0], 30, 30), stop(l[1], 40, 41), stop(l[2], 50, 50)],
            )
            .unwrap();
        builder
            .add_trip(
                Some("1"),
                "early",
                vec![stop(l[0], 0, 0), stop(l[1], 10, 11), stop(l[2], 20, 20)],
            )
            .unwrap();
        let tt = builder.build().unwrap();

        assert_eq!(tt.n_locations(), 3);
        assert_eq!(tt.n_routes(), 1);
        let route = tt.route(0);
        assert_eq!(route.route_stops(&tt).len(), 3);
        assert_eq!(route.name(&tt), Some("1"));
        let trips: Vec<&str> = route
            .transports(&tt)
            .iter()
            .map(|t| t.trip_id(&tt))
            .collect();
        assert_eq!(trips, vec!["early", "late"]);
        assert_eq!(
            tt.transport(0).stop_times(&tt)[2].arrival(),
            DeltaTime::from_minutes(20)
        );
        for (seq, location) in l.iter().enumerate() {
            let served = tt.location(*location).routes(&tt);
            assert_eq!(served.len(), 1);
            assert_eq!(served[0].route_id(), 0);
            assert_eq!(served[0].stop_seq(), seq);
        }
        assert_eq!(tt.location(l[1]).transfer_time(), 2);
        assert_eq!(tt.location_name(l[2]), "Stop 2");
    }

    #[test]
    fn overtaking_trips_are_split_into_separate_routes() {
        let mut builder = builder();
        let l = add_line(&mut builder, 3);
        builder
            .add_trip(
                None,
                "slow",
                vec![stop(l[0], 0, 0), stop(l[1], 20, 20), stop(l[2], 60, 60)],
            )
            .unwrap();
        builder
            .add_trip(
                None,
                "express",
                vec![stop(l[0], 5, 5), stop(l[1], 15, 15), stop(l[2], 25, 25)],
            )
            .unwrap();
        builder
            .add_trip(
                None,
                "slow2",
                vec![stop(l[0], 30, 30), stop(l[1], 50, 50), stop(l[2], 90, 90)],
            )
            .unwrap();
        let tt = builder.build().unwrap();

        assert_eq!(tt.n_routes(), 2);
        assert_eq!(tt.route(0).transports(&tt).len(), 2);
        assert_eq!(tt.route(1).transports(&tt).len(), 1);
        assert_eq!(tt.route(1).transports(&tt)[0].trip_id(&tt), "express");
        assert_eq!(tt.location(l[1]).routes(&tt).len(), 2);
        for route in tt.routes() {
            let transports = route.transports(&tt);
            for pair in transports.windows(2) {
                for (a, b) in pair[0]
                    .stop_times(&tt)
                    .iter()
                    .zip(pair[1].stop_times(&tt))
                {
                    assert!(a.departure() <= b.departure());
                }
            }
        }
    }

    #[test]
    fn different_boarding_rules_make_different_routes() {
        let mut builder = builder();
        let l = add_line(&mut builder, 2);
        builder
            .add_trip(None, "a", vec![stop(l[0], 0, 0), stop(l[1], 10, 10)])
            .unwrap();
        let mut no_boarding = stop(l[0], 20, 20);
        no_boarding.in_allowed = false;
        builder
            .add_trip(None, "b", vec![no_boarding, stop(l[1], 30, 30)])
            .unwrap();
        let tt = builder.build().unwrap();
        assert_eq!(tt.n_routes(), 2);
        let flags: Vec<bool> = tt
            .routes()
            .iter()
            .map(|r| r.route_stops(&tt)[0].in_allowed())
            .collect();
        assert!(flags.contains(&true) && flags.contains(&false));
    }

    #[test]
    fn invalid_trips_are_rejected() {
        let mut builder = builder();
        let l = add_line(&mut builder, 2);
        assert!(matches!(
            builder.add_trip(None, "short", vec![stop(l[0], 0, 0)]),
            Err(TimetableError::TooFewStops(_))
        ));
        assert!(matches!(
            builder.add_trip(None, "unknown", vec![stop(l[0], 0, 0), stop(7, 5, 5)]),
            Err(TimetableError::UnknownLocation { location: 7, .. })
        ));
        assert!(matches!(
            builder.add_trip(None, "backwards", vec![stop(l[0], 10, 10), stop(l[1], 5, 5)]),
            Err(TimetableError::NonMonotonicTimes { stop_seq: 1, .. })
        ));
        assert!(matches!(
            builder.add_trip(
                None,
                "sentinel",
                vec![
                    stop(l[0], 0, 0),
                    TripStop::new(l[1], DeltaTime::INVALID, DeltaTime::INVALID)
                ]
            ),
            Err(TimetableError::TimeOutOfRange { stop_seq: 1, .. })
        ));
    }

    #[test]
    fn footpaths_keep_the_fastest_and_index_both_directions() {
        let mut builder = builder();
        let l = add_line(&mut builder, 3);
        builder.add_footpath(l[0], l[1], 9).unwrap();
        builder.add_footpath(l[0], l[1], 4).unwrap();
        builder.add_footpath(l[0], l[1], 6).unwrap();
        builder.add_footpath(l[2], l[1], 3).unwrap();
        builder.add_footpath(l[1], l[1], 1).unwrap();
        assert!(matches!(
            builder.add_footpath(l[0], 42, 1),
            Err(TimetableError::UnknownFootpathLocation(42))
        ));
        let tt = builder.build().unwrap();

        let out = tt.location(l[0]).footpaths_out(&tt);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location_id(), l[1]);
        assert_eq!(out[0].duration(), 4);
        assert!(tt.location(l[1]).footpaths_out(&tt).is_empty());

        let incoming: Vec<(usize, u16)> = tt
            .location(l[1])
            .footpaths_in(&tt)
            .iter()
            .map(|f| (f.location_id(), f.duration()))
            .collect();
        assert_eq!(incoming, vec![(l[0], 4), (l[2], 3)]);
    }

    #[test]
    fn generated_footpaths_follow_distance() {
        let mut builder = builder();
        // ~111 m apart, and a third location ~11 km away.
        let a = builder
            .add_location("a", "A", 48.0, 11.0, 2, chrono_tz::UTC)
            .unwrap();
        let b = builder
            .add_location("b", "B", 48.001, 11.0, 2, chrono_tz::UTC)
            .unwrap();
        let c = builder
            .add_location("c", "C", 48.1, 11.0, 2, chrono_tz::UTC)
            .unwrap();
        assert_eq!(builder.generate_footpaths(400.0, 1.2), 2);
        builder.add_footpath(a, b, 1).unwrap();
        let tt = builder.build().unwrap();

        let from_a = tt.location(a).footpaths_out(&tt);
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].duration(), 1);
        let from_b = tt.location(b).footpaths_out(&tt);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].location_id(), a);
        // 111 m at 1.2 s/m is a bit over two minutes.
        assert_eq!(from_b[0].duration(), 3);
        assert!(tt.location(c).footpaths_out(&tt).is_empty());
        assert!(tt.location(c).footpaths_in(&tt).is_empty());
    }
}
