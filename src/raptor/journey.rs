use std::io;

use chrono::TimeZone;
use log::warn;
use serde::Serialize;

use super::{
    engine::{Query, RaptorEngine},
    state::SearchState,
    time::DeltaTime,
    timetable::{rt::RtTimetable, Route, Timetable},
    MAX_VIAS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Leg {
    Transport {
        route: usize,
        transport: usize,
        from: usize,
        to: usize,
        from_seq: usize,
        to_seq: usize,
        departure: DeltaTime,
        arrival: DeltaTime,
    },
    RtTransport {
        rt_transport: usize,
        from: usize,
        to: usize,
        from_seq: usize,
        to_seq: usize,
        departure: DeltaTime,
        arrival: DeltaTime,
    },
    Footpath {
        from: usize,
        to: usize,
        departure: DeltaTime,
        arrival: DeltaTime,
    },
}

impl Leg {
    pub fn from(&self) -> usize {
        match self {
            Leg::Transport { from, .. }
            | Leg::RtTransport { from, .. }
            | Leg::Footpath { from, .. } => *from,
        }
    }

    pub fn to(&self) -> usize {
        match self {
            Leg::Transport { to, .. } | Leg::RtTransport { to, .. } | Leg::Footpath { to, .. } => {
                *to
            }
        }
    }

    pub fn departure(&self) -> DeltaTime {
        match self {
            Leg::Transport { departure, .. }
            | Leg::RtTransport { departure, .. }
            | Leg::Footpath { departure, .. } => *departure,
        }
    }

    pub fn arrival(&self) -> DeltaTime {
        match self {
            Leg::Transport { arrival, .. }
            | Leg::RtTransport { arrival, .. }
            | Leg::Footpath { arrival, .. } => *arrival,
        }
    }

    pub fn is_transport(&self) -> bool {
        !matches!(self, Leg::Footpath { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Journey {
    pub legs: Vec<Leg>,
    pub start_time: DeltaTime,
    pub dest_time: DeltaTime,
    pub transfers: usize,
    pub destination: usize,
}

impl Journey {
    pub fn n_transports(&self) -> usize {
        self.legs.iter().filter(|leg| leg.is_transport()).count()
    }

    /// Writes one line per leg with location names and local times.
    pub fn print(&self, out: &mut dyn io::Write, timetable: &dyn Timetable) -> io::Result<()> {
        writeln!(
            out,
            "Journey to {} with {} transfers: {} -> {}",
            timetable.location_name(self.destination),
            self.transfers,
            format_time(timetable, self.destination, self.start_time),
            format_time(timetable, self.destination, self.dest_time),
        )?;
        for leg in &self.legs {
            let what = match leg {
                Leg::Transport {
                    route, transport, ..
                } => format!(
                    "{} ({})",
                    timetable.route(*route).name(timetable).unwrap_or("unnamed route"),
                    timetable.transport(*transport).trip_id(timetable)
                ),
                Leg::RtTransport { rt_transport, .. } => {
                    format!("real-time transport {}", rt_transport)
                }
                Leg::Footpath { .. } => "walk".to_string(),
            };
            writeln!(
                out,
                "  {:30} {} at {} -> {} at {}",
                what,
                timetable.location_name(leg.from()),
                format_time(timetable, leg.from(), leg.departure()),
                timetable.location_name(leg.to()),
                format_time(timetable, leg.to(), leg.arrival()),
            )?;
        }
        Ok(())
    }
}

/// Formats a time in the timezone of a location.
pub fn format_time(timetable: &dyn Timetable, location: usize, time: DeltaTime) -> String {
    let Some(utc) = time.naive_date_time(timetable.base_day()) else {
        return "--".to_string();
    };
    let tz = timetable
        .metadata()
        .location_timezone(timetable.location(location));
    tz.from_utc_datetime(&utc)
        .format("%Y-%m-%d %H:%M %Z")
        .to_string()
}

type SlotMask = [bool; MAX_VIAS + 1];

impl<'a> RaptorEngine<'a> {
    /// Pareto-optimal journeys to the query's destinations: each has fewer transfers than the
    /// next and arrives strictly later.
    pub fn journeys(&self) -> Vec<Journey> {
        self.pareto_journeys(&self.query.destinations)
    }

    /// Like [`RaptorEngine::journeys`], for any location.
    pub fn journeys_to(&self, location: usize) -> Vec<Journey> {
        self.pareto_journeys(&[location])
    }

    fn pareto_journeys(&self, targets: &[usize]) -> Vec<Journey> {
        let mut journeys = vec![];
        let mut best = DeltaTime::INVALID;
        for target in targets {
            if let Some(start) = self.start_labels.get(target) {
                let time = start.labels[self.n_vias];
                if time < best {
                    journeys.clear();
                    journeys.push(Journey {
                        legs: self.start_legs(*target),
                        start_time: start.start_time,
                        dest_time: time,
                        transfers: 0,
                        destination: *target,
                    });
                    best = time;
                }
            }
        }
        for k in 0..self.rounds().min(self.max_transfers + 1) {
            let Some((target, time)) = targets
                .iter()
                .map(|target| (*target, self.state.round_times(k, *target)[self.n_vias]))
                .min_by_key(|(_, time)| *time)
            else {
                continue;
            };
            if time >= best {
                continue;
            }
            match self.reconstruct_at(k, target, time) {
                Some(journey) => {
                    journeys.push(journey);
                    best = time;
                }
                None => warn!(
                    "Failed to reconstruct journey to {} arriving {:?} in round {}",
                    target, time, k
                ),
            }
        }
        journeys
    }

    /// The journey behind the label of `location` in round `round`, if there is one.
    pub fn reconstruct(&self, location: usize, round: usize) -> Option<Journey> {
        if round > self.max_transfers {
            return None;
        }
        let time = self.state.round_times(round, location)[self.n_vias];
        if !time.is_valid() {
            return None;
        }
        self.reconstruct_at(round, location, time)
    }

    fn reconstruct_at(&self, k: usize, location: usize, time: DeltaTime) -> Option<Journey> {
        let legs = self.find(k, location, self.n_vias, time, true)?;
        let first = legs.first()?;
        let start_time = self
            .start_labels
            .get(&first.from())
            .map_or(first.departure(), |start| start.start_time);
        let dest_time = legs.last().map_or(time, Leg::arrival);
        let transfers = legs
            .iter()
            .filter(|leg| leg.is_transport())
            .count()
            .saturating_sub(1);
        Some(Journey {
            legs,
            start_time,
            dest_time,
            transfers,
            destination: location,
        })
    }

    /// Legs from the origin to a seeded location: nothing, or the initial walk.
    fn start_legs(&self, location: usize) -> Vec<Leg> {
        match self.start_labels.get(&location) {
            Some(start) => match start.walk {
                Some(duration) => vec![Leg::Footpath {
                    from: start.origin,
                    to: location,
                    departure: start.start_time,
                    arrival: start.start_time.plus_minutes(duration),
                }],
                None => vec![],
            },
            None => vec![],
        }
    }

    /// Finds legs reaching `location` in via slot `v` no later than `time`, using at most `k + 1`
    /// transports with the last one taken in round `k`.
    fn find(
        &self,
        k: usize,
        location: usize,
        v: usize,
        time: DeltaTime,
        allow_footpath: bool,
    ) -> Option<Vec<Leg>> {
        if v > 0 && self.query.vias[v - 1].location == location {
            let stay = self.query.vias[v - 1].stay;
            if let Some(legs) = self.find(k, location, v - 1, time.minus_minutes(stay), allow_footpath)
            {
                return Some(legs);
            }
        }

        let tt = self.timetable;
        for location_route in tt.location(location).routes(tt) {
            let to_seq = location_route.stop_seq();
            let route = tt.route(location_route.route_id());
            if to_seq == 0 || !route.route_stops(tt)[to_seq].out_allowed() {
                continue;
            }
            let transports = route.transports(tt);
            let end = transports
                .partition_point(|transport| transport.stop_times(tt)[to_seq].arrival() <= time);
            for t in (0..end).rev() {
                if self.is_cancelled(transports[t].id()) {
                    continue;
                }
                if let Some(legs) = self.trace_transport(k, route, t, to_seq, v) {
                    return Some(legs);
                }
            }
        }

        if let Some(rt) = self.rt {
            for (rt_transport, to_seq) in rt.transports_at(location) {
                let stops = rt.stops(*rt_transport);
                if *to_seq == 0 || stops[*to_seq].arrival > time {
                    continue;
                }
                if let Some(legs) = self.trace_rt_transport(k, *rt_transport, *to_seq, v) {
                    return Some(legs);
                }
            }
        }

        if allow_footpath {
            for footpath in tt.location(location).footpaths_in(tt) {
                // Walks leave from this round's transport arrivals, which a walk into `from`
                // may have since undercut in `round_times`.
                let from = footpath.location_id();
                let departure = time.minus_minutes(footpath.duration());
                if !departure.is_valid() {
                    continue;
                }
                if let Some(mut legs) = self.find(k, from, v, departure, false) {
                    legs.push(Leg::Footpath {
                        from,
                        to: location,
                        departure,
                        arrival: time,
                    });
                    return Some(legs);
                }
            }
        }
        None
    }

    /// Slots the vehicle could have been in before `location`, given the slots it's in after.
    fn expand_slots(&self, location: usize, slots: &mut SlotMask) {
        for x in (0..self.n_vias).rev() {
            if slots[x + 1] && self.via_at(location, x) == Some(0) {
                slots[x] = true;
            }
        }
    }

    /// Legs reaching the boarding stop `location` in slot `x` in time for `departure`.
    fn find_boarding(
        &self,
        k: usize,
        location: usize,
        x: usize,
        departure: DeltaTime,
    ) -> Option<Vec<Leg>> {
        let label = self.boarding_label(k, location, x);
        if !label.is_valid() || label > departure {
            return None;
        }
        if k == 0 {
            Some(self.start_legs(location))
        } else {
            let arrival = self.state.round_times(k - 1, location)[x];
            self.find(k - 1, location, x, arrival, true)
        }
    }

    fn trace_transport(
        &self,
        k: usize,
        route: &Route,
        t: usize,
        to_seq: usize,
        v: usize,
    ) -> Option<Vec<Leg>> {
        let tt = self.timetable;
        let stops = route.route_stops(tt);
        let transport = &route.transports(tt)[t];
        let stop_times = transport.stop_times(tt);
        let mut slots: SlotMask = [false; MAX_VIAS + 1];
        slots[v] = true;
        for from_seq in (0..to_seq).rev() {
            let stop = &stops[from_seq];
            let location = stop.location_id();
            self.expand_slots(location, &mut slots);
            if !stop.in_allowed() {
                continue;
            }
            let departure = stop_times[from_seq].departure();
            for x in (0..=v).filter(|x| slots[*x]) {
                if let Some(mut legs) = self.find_boarding(k, location, x, departure) {
                    legs.push(Leg::Transport {
                        route: route.id(),
                        transport: transport.id(),
                        from: location,
                        to: stops[to_seq].location_id(),
                        from_seq,
                        to_seq,
                        departure,
                        arrival: stop_times[to_seq].arrival(),
                    });
                    return Some(legs);
                }
            }
        }
        None
    }

    fn trace_rt_transport(
        &self,
        k: usize,
        rt_transport: usize,
        to_seq: usize,
        v: usize,
    ) -> Option<Vec<Leg>> {
        let rt = self.rt?;
        let stops = rt.stops(rt_transport);
        let mut slots: SlotMask = [false; MAX_VIAS + 1];
        slots[v] = true;
        for from_seq in (0..to_seq).rev() {
            let stop = &stops[from_seq];
            self.expand_slots(stop.location, &mut slots);
            for x in (0..=v).filter(|x| slots[*x]) {
                if let Some(mut legs) = self.find_boarding(k, stop.location, x, stop.departure) {
                    legs.push(Leg::RtTransport {
                        rt_transport,
                        from: stop.location,
                        to: stops[to_seq].location,
                        from_seq,
                        to_seq,
                        departure: stop.departure,
                        arrival: stops[to_seq].arrival,
                    });
                    return Some(legs);
                }
            }
        }
        None
    }
}

/// Runs a query and returns its Pareto-optimal journeys.
pub fn route(
    timetable: &dyn Timetable,
    rt: Option<&RtTimetable>,
    state: &mut SearchState,
    query: &Query,
) -> Vec<Journey> {
    let mut engine = RaptorEngine::new(timetable, rt, state, query);
    engine.execute();
    engine.journeys()
}

#[cfg(test)]
mod test {
    use crate::raptor::{
        engine::{Query, RaptorEngine, Start, Via},
        state::SearchState,
        time::DeltaTime,
        timetable::{
            fixtures::{self, builder_with_locations, stop},
            rt::{RtStop, RtTimetable},
            Timetable,
        },
    };

    use super::{route, Leg};

    fn minutes(m: i16) -> DeltaTime {
        DeltaTime::from_minutes(m)
    }

    fn query(from: usize, time: i16, to: usize) -> Query {
        Query::new(
            vec![Start {
                location: from,
                time: minutes(time),
            }],
            vec![to],
        )
    }

    fn route_name(tt: &dyn Timetable, leg: &Leg) -> Option<String> {
        match leg {
            Leg::Transport { route, .. } => tt.route(*route).name(tt).map(str::to_string),
            _ => None,
        }
    }

    #[test]
    fn single_trip_journey() {
        let tt = fixtures::line_abc();
        let mut state = SearchState::new();
        let journeys = route(&tt, None, &mut state, &query(0, 0, 2));
        assert_eq!(journeys.len(), 1);
        let journey = &journeys[0];
        assert_eq!(journey.transfers, 0);
        assert_eq!(journey.start_time, minutes(0));
        assert_eq!(journey.dest_time, minutes(20));
        assert_eq!(journey.destination, 2);
        assert_eq!(
            journey.legs,
            vec![Leg::Transport {
                route: 0,
                transport: 0,
                from: 0,
                to: 2,
                from_seq: 0,
                to_seq: 2,
                departure: minutes(0),
                arrival: minutes(20),
            }]
        );
    }

    #[test]
    fn pareto_set_over_transfers() {
        let tt = fixtures::two_lines();
        let mut state = SearchState::new();
        let journeys = route(&tt, None, &mut state, &query(0, 0, 3));
        assert_eq!(journeys.len(), 2);

        let direct = &journeys[0];
        assert_eq!(direct.transfers, 0);
        assert_eq!(direct.dest_time, minutes(40));
        assert_eq!(direct.legs.len(), 2);
        assert_eq!(route_name(&tt, &direct.legs[0]).as_deref(), Some("3"));
        assert_eq!(
            direct.legs[1],
            Leg::Footpath {
                from: 4,
                to: 3,
                departure: minutes(30),
                arrival: minutes(40),
            }
        );

        let transfer = &journeys[1];
        assert_eq!(transfer.transfers, 1);
        assert_eq!(transfer.dest_time, minutes(35));
        assert_eq!(transfer.n_transports(), 2);
        assert_eq!(route_name(&tt, &transfer.legs[0]).as_deref(), Some("1"));
        assert_eq!(route_name(&tt, &transfer.legs[1]).as_deref(), Some("2"));
        assert_eq!(transfer.legs[0].to(), 2);
        assert_eq!(transfer.legs[1].departure(), minutes(25));
        for pair in transfer.legs.windows(2) {
            assert_eq!(pair[0].to(), pair[1].from());
            assert!(pair[0].arrival() <= pair[1].departure());
        }
    }

    #[test]
    fn walk_only_journey_to_start() {
        let tt = fixtures::two_lines();
        let mut state = SearchState::new();
        let journeys = route(&tt, None, &mut state, &query(4, 0, 3).with_start_footpaths(true));
        assert_eq!(journeys.len(), 1);
        assert_eq!(journeys[0].dest_time, minutes(10));
        assert_eq!(
            journeys[0].legs,
            vec![Leg::Footpath {
                from: 4,
                to: 3,
                departure: minutes(0),
                arrival: minutes(10),
            }]
        );
    }

    #[test]
    fn journey_through_via() {
        let tt = fixtures::two_lines();
        let mut state = SearchState::new();
        let q = query(0, 0, 3).with_vias(vec![Via {
            location: 4,
            stay: 5,
        }]);
        let journeys = route(&tt, None, &mut state, &q);
        assert_eq!(journeys.len(), 1);
        let journey = &journeys[0];
        assert_eq!(journey.dest_time, minutes(45));
        assert_eq!(route_name(&tt, &journey.legs[0]).as_deref(), Some("3"));
        assert_eq!(journey.legs[0].to(), 4);
        assert_eq!(
            journey.legs[1],
            Leg::Footpath {
                from: 4,
                to: 3,
                departure: minutes(35),
                arrival: minutes(45),
            }
        );
    }

    #[test]
    fn journey_through_via_on_board() {
        let tt = fixtures::two_lines();
        let mut state = SearchState::new();
        let q = query(0, 0, 3).with_vias(vec![Via {
            location: 1,
            stay: 0,
        }]);
        let journeys = route(&tt, None, &mut state, &q);
        assert_eq!(journeys.len(), 1);
        let journey = &journeys[0];
        // Line 1 passes B on the way to C, then line 2.
        assert_eq!(journey.dest_time, minutes(35));
        assert_eq!(journey.legs.len(), 2);
        assert_eq!(journey.legs[0].from(), 0);
        assert_eq!(journey.legs[0].to(), 2);
    }

    #[test]
    fn journey_with_real_time_transport() {
        let tt = fixtures::two_lines();
        let mut rt = RtTimetable::new(&tt);
        let extra = rt
            .add_transport(
                None,
                None,
                vec![
                    RtStop {
                        location: 2,
                        arrival: minutes(24),
                        departure: minutes(24),
                    },
                    RtStop {
                        location: 3,
                        arrival: minutes(30),
                        departure: minutes(30),
                    },
                ],
            )
            .unwrap();
        let mut state = SearchState::new();
        let journeys = route(&tt, Some(&rt), &mut state, &query(0, 0, 3));
        let last = journeys.last().unwrap();
        assert_eq!(last.dest_time, minutes(30));
        assert_eq!(
            last.legs[1],
            Leg::RtTransport {
                rt_transport: extra,
                from: 2,
                to: 3,
                from_seq: 0,
                to_seq: 1,
                departure: minutes(24),
                arrival: minutes(30),
            }
        );
    }

    #[test]
    fn reconstruct_any_reached_location() {
        let tt = fixtures::two_lines();
        let mut state = SearchState::new();
        let q = Query::one_to_all(0, minutes(0));
        let mut engine = RaptorEngine::new(&tt, None, &mut state, &q);
        engine.execute();
        assert!(engine.journeys().is_empty());
        let to_b = engine.reconstruct(1, 0).unwrap();
        assert_eq!(to_b.dest_time, minutes(10));
        assert_eq!(to_b.legs[0].to(), 1);
        assert!(engine.reconstruct(1, 1).is_none());
        assert!(engine.reconstruct(1, 99).is_none());
        assert_eq!(engine.journeys_to(3).len(), 2);
    }

    #[test]
    fn print_uses_local_time() {
        let (mut builder, l) = builder_with_locations(&["A", "B"]);
        builder
            .add_trip(Some("S1"), "s1", vec![stop(l[0], 360, 360), stop(l[1], 375, 375)])
            .unwrap();
        let tt = builder.build().unwrap();
        let mut state = SearchState::new();
        let journeys = route(&tt, None, &mut state, &query(l[0], 300, l[1]));
        let mut out = vec![];
        journeys[0].print(&mut out, &tt).unwrap();
        let text = String::from_utf8(out).unwrap();
        // 06:00 UTC is 08:00 in Berlin in May.
        assert!(text.contains("S1 (s1)"));
        assert!(text.contains("2024-05-06 08:00 CEST"));
        assert!(text.contains("2024-05-06 08:15 CEST"));
    }

    #[test]
    fn walk_leaves_from_transport_arrival() {
        let tt = fixtures::walk_after_walk();
        let mut state = SearchState::new();
        let query = Query::one_to_all(0, minutes(0));
        let mut engine = RaptorEngine::new(&tt, None, &mut state, &query);
        engine.execute();
        assert_eq!(engine.state().round_times(0, 2)[0], minutes(15));
        assert_eq!(engine.arrival(3), minutes(40));

        let journeys = engine.journeys_to(3);
        assert_eq!(journeys.len(), 1);
        let legs = &journeys[0].legs;
        assert_eq!(legs.len(), 2);
        assert_eq!(route_name(&tt, &legs[0]).as_deref(), Some("2"));
        assert_eq!(legs[0].arrival(), minutes(30));
        assert_eq!(
            legs[1],
            Leg::Footpath {
                from: 2,
                to: 3,
                departure: minutes(30),
                arrival: minutes(40),
            }
        );

        let to_y = engine.journeys_to(2);
        assert_eq!(to_y.len(), 1);
        assert_eq!(route_name(&tt, &to_y[0].legs[0]).as_deref(), Some("1"));
        assert_eq!(to_y[0].dest_time, minutes(15));
    }

    #[test]
    fn every_reached_location_has_a_journey() {
        for tt in [fixtures::walk_after_walk(), fixtures::two_lines()] {
            let mut state = SearchState::new();
            for source in 0..tt.n_locations() {
                let query = Query::one_to_all(source, minutes(0));
                let mut engine = RaptorEngine::new(&tt, None, &mut state, &query);
                engine.execute();
                for location in 0..tt.n_locations() {
                    let arrival = engine.arrival(location);
                    let journeys = engine.journeys_to(location);
                    if !arrival.is_valid() {
                        assert!(journeys.is_empty());
                        continue;
                    }
                    let best = journeys.last().unwrap();
                    assert_eq!(best.dest_time, arrival, "{} -> {}", source, location);
                    if let Some(last) = best.legs.last() {
                        assert_eq!(last.to(), location);
                        assert_eq!(last.arrival(), arrival);
                        assert_eq!(best.legs[0].from(), source);
                    }
                    for pair in best.legs.windows(2) {
                        assert_eq!(pair[0].to(), pair[1].from());
                        assert!(pair[0].arrival() <= pair[1].departure());
                    }
                }
            }
        }
    }
}
