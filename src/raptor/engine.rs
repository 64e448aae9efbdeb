use std::collections::HashMap;

use bit_set::BitSet;
use log::{debug, trace};

use super::{
    state::SearchState,
    time::DeltaTime,
    timetable::{rt::RtTimetable, Timetable, Transport},
    ViaLabels, INVALID_LABELS, MAX_TRANSFERS, MAX_VIAS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    pub location: usize,
    pub time: DeltaTime,
}

/// A location the journey has to pass, and how long it has to stay there in minutes. With a
/// stay of zero, passing through on board counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Via {
    pub location: usize,
    pub stay: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub starts: Vec<Start>,
    /// Alternative targets. Empty means one-to-all without pruning.
    pub destinations: Vec<usize>,
    pub vias: Vec<Via>,
    /// Capped at [`MAX_TRANSFERS`].
    pub max_transfers: usize,
    /// Also start from everything reachable on foot from the start locations.
    pub start_footpaths: bool,
}

impl Query {
    pub fn new(starts: Vec<Start>, destinations: Vec<usize>) -> Query {
        Query {
            starts,
            destinations,
            vias: vec![],
            max_transfers: MAX_TRANSFERS,
            start_footpaths: false,
        }
    }

    pub fn one_to_all(location: usize, time: DeltaTime) -> Query {
        Query::new(vec![Start { location, time }], vec![])
    }

    pub fn with_vias(mut self, vias: Vec<Via>) -> Query {
        self.vias = vias;
        self
    }

    pub fn with_max_transfers(mut self, max_transfers: usize) -> Query {
        self.max_transfers = max_transfers;
        self
    }

    pub fn with_start_footpaths(mut self, start_footpaths: bool) -> Query {
        self.start_footpaths = start_footpaths;
        self
    }
}

/// How a location was seeded before the first round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct StartLabel {
    pub(super) labels: ViaLabels,
    pub(super) origin: usize,
    pub(super) start_time: DeltaTime,
    /// Walking time from `origin` if this location was seeded through a footpath.
    pub(super) walk: Option<u16>,
}

/// Round-based earliest arrival search.
///
/// Round `k` finds arrivals using exactly `k` transfers, i.e. `k + 1` transports, and commits them
/// into row `k` of the state's round times. Each location carries one label per number of
/// satisfied vias.
pub struct RaptorEngine<'a> {
    pub(super) timetable: &'a dyn Timetable,
    pub(super) rt: Option<&'a RtTimetable>,
    pub(super) state: &'a mut SearchState,
    pub(super) query: &'a Query,
    pub(super) n_vias: usize,
    pub(super) max_transfers: usize,
    pub(super) start_labels: HashMap<usize, StartLabel>,
    destinations: BitSet,
    time_at_destination: DeltaTime,
    rounds: usize,
}

impl<'a> RaptorEngine<'a> {
    /// Panics if the query names more than [`MAX_VIAS`] vias or locations outside the timetable.
    pub fn new(
        timetable: &'a dyn Timetable,
        rt: Option<&'a RtTimetable>,
        state: &'a mut SearchState,
        query: &'a Query,
    ) -> RaptorEngine<'a> {
        assert!(
            query.vias.len() <= MAX_VIAS,
            "At most {} vias are supported, got {}",
            MAX_VIAS,
            query.vias.len()
        );
        let n_locations = timetable.n_locations();
        assert!(
            query
                .starts
                .iter()
                .map(|start| start.location)
                .chain(query.destinations.iter().copied())
                .chain(query.vias.iter().map(|via| via.location))
                .all(|location| location < n_locations),
            "Query references a location outside of the timetable"
        );
        RaptorEngine {
            timetable,
            rt,
            state,
            query,
            n_vias: query.vias.len(),
            max_transfers: query.max_transfers.min(MAX_TRANSFERS),
            start_labels: HashMap::new(),
            destinations: query.destinations.iter().copied().collect(),
            time_at_destination: DeltaTime::INVALID,
            rounds: 0,
        }
    }

    /// Runs the search and returns the number of rounds executed.
    pub fn execute(&mut self) -> usize {
        let tt = self.timetable;
        let n_rt_transports = self.rt.map_or(0, |rt| rt.n_rt_transports());
        self.state
            .resize(tt.n_locations(), tt.n_routes(), n_rt_transports);
        self.state.reset();
        self.start_labels.clear();
        self.time_at_destination = DeltaTime::INVALID;
        self.rounds = 0;

        if self.query.starts.is_empty() {
            return 0;
        }
        self.init();

        for k in 0..=self.max_transfers {
            self.rounds = k + 1;
            let improved = self.round(k);
            #[cfg(feature = "enforce_invariants")]
            self.check_invariants(k);
            if !improved {
                break;
            }
        }
        debug!(
            "Search finished after {} rounds, best arrival at destination {:?}",
            self.rounds, self.time_at_destination
        );
        self.rounds
    }

    #[inline]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    #[inline]
    pub fn n_vias(&self) -> usize {
        self.n_vias
    }

    #[inline]
    pub fn max_transfers(&self) -> usize {
        self.max_transfers
    }

    pub fn state(&self) -> &SearchState {
        &*self.state
    }

    /// Earliest arrival at a location having passed every via.
    pub fn arrival(&self, location: usize) -> DeltaTime {
        self.state.best(location)[self.n_vias]
    }

    pub fn is_destination(&self, location: usize) -> bool {
        self.destinations.contains(location)
    }

    fn init(&mut self) {
        let tt = self.timetable;
        let query = self.query;
        for destination in &query.destinations {
            self.state.end_reachable[*destination] = true;
            for footpath in tt.location(*destination).footpaths_in(tt) {
                self.state.end_reachable[footpath.location_id()] = true;
            }
        }
        for start in &query.starts {
            self.seed(start.location, start.time, start.location, start.time, None);
            if query.start_footpaths {
                for footpath in tt.location(start.location).footpaths_out(tt) {
                    self.seed(
                        footpath.location_id(),
                        start.time.plus_minutes(footpath.duration()),
                        start.location,
                        start.time,
                        Some(footpath.duration()),
                    );
                }
            }
        }
        self.update_destination_bound();
    }

    fn seed(
        &mut self,
        location: usize,
        time: DeltaTime,
        origin: usize,
        start_time: DeltaTime,
        walk: Option<u16>,
    ) {
        if !time.is_valid() {
            return;
        }
        let mut labels = INVALID_LABELS;
        labels[0] = time;
        let mut v = 0;
        while let Some(stay) = self.via_at(location, v) {
            labels[v + 1] = labels[v].plus_minutes(stay);
            v += 1;
        }
        let label = StartLabel {
            labels,
            origin,
            start_time,
            walk,
        };
        self.start_labels
            .entry(location)
            .and_modify(|existing| {
                if time < existing.labels[0] {
                    *existing = label;
                }
            })
            .or_insert(label);
        for v in 0..=self.n_vias {
            let best = &mut self.state.best[location][v];
            *best = (*best).min(labels[v]);
            let tmp = &mut self.state.tmp[location][v];
            *tmp = (*tmp).min(labels[v]);
        }
        self.state.station_mark[location] = true;
    }

    /// Stay time if `location` is the next via to satisfy from slot `v`.
    #[inline]
    pub(super) fn via_at(&self, location: usize, v: usize) -> Option<u16> {
        if v < self.n_vias && self.query.vias[v].location == location {
            Some(self.query.vias[v].stay)
        } else {
            None
        }
    }

    #[inline]
    pub(super) fn is_cancelled(&self, transport: usize) -> bool {
        self.rt.map_or(false, |rt| rt.is_cancelled(transport))
    }

    /// Earliest time a vehicle can be boarded at `location` in round `k` in via slot `v`. In round
    /// zero this is the start label, later it's the previous round's arrival plus the location's
    /// transfer time.
    pub(super) fn boarding_label(&self, k: usize, location: usize, v: usize) -> DeltaTime {
        if k == 0 {
            self.start_labels
                .get(&location)
                .map_or(DeltaTime::INVALID, |start| start.labels[v])
        } else {
            self.state.round_times(k - 1, location)[v]
                .plus_minutes(self.timetable.location(location).transfer_time())
        }
    }

    fn round(&mut self, k: usize) -> bool {
        let tt = self.timetable;
        let rt = self.rt;
        std::mem::swap(
            &mut self.state.station_mark,
            &mut self.state.prev_station_mark,
        );
        self.state.station_mark.fill(false);

        let mut any_marked = false;
        for location in 0..tt.n_locations() {
            if !self.state.prev_station_mark[location] {
                continue;
            }
            for location_route in tt.location(location).routes(tt) {
                self.state.route_mark[location_route.route_id()] = true;
                any_marked = true;
            }
            if let Some(rt) = rt {
                for (rt_transport, _) in rt.transports_at(location) {
                    self.state.rt_transport_mark[*rt_transport] = true;
                    any_marked = true;
                }
            }
        }
        if !any_marked {
            return false;
        }

        self.state.tmp.fill(INVALID_LABELS);
        let mut scanned_routes = 0;
        for route_id in 0..tt.n_routes() {
            if self.state.route_mark[route_id] {
                self.state.route_mark[route_id] = false;
                self.scan_route(k, route_id);
                scanned_routes += 1;
            }
        }
        let mut scanned_rt = 0;
        for rt_transport in 0..self.state.rt_transport_mark.len() {
            if self.state.rt_transport_mark[rt_transport] {
                self.state.rt_transport_mark[rt_transport] = false;
                self.scan_rt_transport(k, rt_transport);
                scanned_rt += 1;
            }
        }
        let marked = self.relax_transfers(k);
        debug!(
            "Round {}: scanned {} routes and {} real-time transports, marked {} locations",
            k, scanned_routes, scanned_rt, marked
        );
        marked > 0
    }

    fn scan_route(&mut self, k: usize, route_id: usize) {
        let tt = self.timetable;
        let route = tt.route(route_id);
        let stops = route.route_stops(tt);
        let transports = route.transports(tt);
        // Boarded transport per via slot, as an index into `transports`.
        let mut et: [Option<usize>; MAX_VIAS + 1] = [None; MAX_VIAS + 1];

        for (seq, stop) in stops.iter().enumerate() {
            let location = stop.location_id();
            if stop.out_allowed() {
                for v in (0..=self.n_vias).rev() {
                    if let Some(t) = et[v] {
                        let arrival = transports[t].stop_times(tt)[seq].arrival();
                        self.update_arrival(location, v, arrival);
                    }
                }
            }
            for v in 0..self.n_vias {
                if self.via_at(location, v) == Some(0) {
                    et[v + 1] = match (et[v + 1], et[v]) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
            }
            if seq + 1 == stops.len() || !stop.in_allowed() {
                continue;
            }
            for v in 0..=self.n_vias {
                let label = self.boarding_label(k, location, v);
                if !label.is_valid() {
                    continue;
                }
                let limit = et[v].unwrap_or(transports.len());
                if let Some(t) = self.earliest_transport(&transports[..limit], seq, label) {
                    trace!(
                        "Boarding transport {} at location {} in slot {}",
                        transports[t].id(),
                        location,
                        v
                    );
                    et[v] = Some(t);
                }
            }
        }
    }

    /// First transport not cancelled that departs from stop `seq` at or after `time`.
    fn earliest_transport(
        &self,
        transports: &[Transport],
        seq: usize,
        time: DeltaTime,
    ) -> Option<usize> {
        let tt = self.timetable;
        let first = transports
            .partition_point(|transport| transport.stop_times(tt)[seq].departure() < time);
        (first..transports.len()).find(|i| !self.is_cancelled(transports[*i].id()))
    }

    fn scan_rt_transport(&mut self, k: usize, rt_transport: usize) {
        let Some(rt) = self.rt else {
            return;
        };
        let stops = rt.stops(rt_transport);
        let mut boarded = [false; MAX_VIAS + 1];
        for (seq, stop) in stops.iter().enumerate() {
            for v in (0..=self.n_vias).rev() {
                if boarded[v] {
                    self.update_arrival(stop.location, v, stop.arrival);
                }
            }
            for v in 0..self.n_vias {
                if self.via_at(stop.location, v) == Some(0) {
                    boarded[v + 1] |= boarded[v];
                }
            }
            if seq + 1 == stops.len() {
                continue;
            }
            for v in 0..=self.n_vias {
                let label = self.boarding_label(k, stop.location, v);
                if label.is_valid() && label <= stop.departure {
                    boarded[v] = true;
                }
            }
        }
    }

    /// Records a transport arrival in `tmp` if it beats everything known so far, and carries it
    /// over to the next via slot when the location is that via.
    fn update_arrival(&mut self, location: usize, mut v: usize, mut time: DeltaTime) {
        loop {
            if !(time < self.state.tmp[location][v]
                && time < self.state.best[location][v]
                && time < self.time_at_destination)
            {
                return;
            }
            self.state.tmp[location][v] = time;
            self.state.station_mark[location] = true;
            match self.via_at(location, v) {
                Some(stay) => {
                    time = time.plus_minutes(stay);
                    v += 1;
                }
                None => return,
            }
        }
    }

    /// Like `update_arrival`, but writes straight into `best` and round `k`.
    fn update_committed(&mut self, k: usize, location: usize, mut v: usize, mut time: DeltaTime) {
        loop {
            if !(time < self.state.best[location][v] && time < self.time_at_destination) {
                return;
            }
            self.state.best[location][v] = time;
            let round_times = self.state.round_times_mut(k, location);
            round_times[v] = round_times[v].min(time);
            self.state.station_mark[location] = true;
            match self.via_at(location, v) {
                Some(stay) => {
                    time = time.plus_minutes(stay);
                    v += 1;
                }
                None => return,
            }
        }
    }

    /// Commits this round's transport arrivals and walks from them. Returns the number of
    /// locations marked for the next round.
    fn relax_transfers(&mut self, k: usize) -> usize {
        let tt = self.timetable;
        std::mem::swap(
            &mut self.state.station_mark,
            &mut self.state.prev_station_mark,
        );
        self.state.station_mark.fill(false);

        for location in 0..tt.n_locations() {
            if !self.state.prev_station_mark[location] {
                continue;
            }
            for v in 0..=self.n_vias {
                let time = self.state.tmp[location][v];
                if time < self.state.best[location][v] {
                    self.state.best[location][v] = time;
                    let round_times = self.state.round_times_mut(k, location);
                    round_times[v] = round_times[v].min(time);
                    self.state.station_mark[location] = true;
                }
            }
        }

        for location in 0..tt.n_locations() {
            if !self.state.prev_station_mark[location] {
                continue;
            }
            for footpath in tt.location(location).footpaths_out(tt) {
                for v in 0..=self.n_vias {
                    let time = self.state.tmp[location][v];
                    if time.is_valid() {
                        self.update_committed(
                            k,
                            footpath.location_id(),
                            v,
                            time.plus_minutes(footpath.duration()),
                        );
                    }
                }
            }
        }

        let mut marked = 0;
        let mut touches_end = false;
        for location in 0..tt.n_locations() {
            if self.state.station_mark[location] {
                marked += 1;
                touches_end |= self.state.end_reachable[location];
            }
        }
        if touches_end {
            self.update_destination_bound();
        }
        marked
    }

    /// Nothing arriving at or after the best destination arrival can lead to a better journey.
    fn update_destination_bound(&mut self) {
        let n_vias = self.n_vias;
        for destination in self.destinations.iter() {
            let time = self.state.best[destination][n_vias];
            if time < self.time_at_destination {
                self.time_at_destination = time;
            }
        }
    }

    #[cfg(feature = "enforce_invariants")]
    fn check_invariants(&self, k: usize) {
        for location in 0..self.timetable.n_locations() {
            let best = self.state.best(location);
            for kk in 0..=k {
                let round_times = self.state.round_times(kk, location);
                for v in 0..=self.n_vias {
                    assert!(best[v] <= round_times[v]);
                }
            }
        }
    }
}
