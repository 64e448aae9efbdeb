use std::io;

use geo::BoundingRect;
use geo_types::{coord, LineString};
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;

use super::{
    engine::{Query, RaptorEngine},
    geomath::{distance_meters, great_circle_meters},
    journey::{Journey, Leg},
    state::SearchState,
    time::{DateRange, DeltaTime, MINUTES_PER_DAY},
    timetable::Timetable,
    MAX_TRANSFERS,
};

/// How far from a sampled source a route was still part of an optimal journey, in meters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReachInfo {
    pub reach: f64,
    pub journey: Option<Journey>,
}

impl ReachInfo {
    /// False if no sampled query ever used the route.
    pub fn valid(&self) -> bool {
        self.journey.is_some()
    }

    fn update(&mut self, reach: f64, journey: &Journey) {
        if !self.valid() || reach > self.reach {
            self.reach = reach;
            self.journey = Some(journey.clone());
        }
    }

    fn merge(&mut self, other: ReachInfo) {
        if other.valid() && (!self.valid() || other.reach > self.reach) {
            *self = other;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachConfig {
    pub max_transfers: usize,
    /// Only the first departures of each source are queried if set.
    pub max_departures_per_source: Option<usize>,
}

impl Default for ReachConfig {
    fn default() -> Self {
        ReachConfig {
            max_transfers: MAX_TRANSFERS,
            max_departures_per_source: None,
        }
    }
}

/// Reach of every route, indexed by route id, from queries at every departure of the given
/// sources within `date_range`. Sampling only a subset of locations makes this an approximation.
pub fn get_reach_values(
    timetable: &(dyn Timetable + Sync),
    sources: &[usize],
    date_range: DateRange,
) -> Vec<ReachInfo> {
    get_reach_values_with(timetable, sources, date_range, &ReachConfig::default())
}

pub fn get_reach_values_with(
    timetable: &(dyn Timetable + Sync),
    sources: &[usize],
    date_range: DateRange,
    config: &ReachConfig,
) -> Vec<ReachInfo> {
    info!(
        "Computing reach for {} routes from {} sources",
        timetable.n_routes(),
        sources.len()
    );
    let reachs = sources
        .par_iter()
        .map_init(SearchState::new, |state, source| {
            source_reach(timetable, state, *source, date_range, config)
        })
        .reduce(
            || vec![ReachInfo::default(); timetable.n_routes()],
            |mut a, b| {
                for (a, b) in a.iter_mut().zip(b) {
                    a.merge(b);
                }
                a
            },
        );
    info!(
        "{} of {} routes were used",
        reachs.iter().filter(|r| r.valid()).count(),
        reachs.len()
    );
    reachs
}

/// Distinct departure times of transports leaving `location` within `date_range`.
fn departures(timetable: &dyn Timetable, location: usize, date_range: DateRange) -> Vec<DeltaTime> {
    let base_day = timetable.base_day();
    let window = (date_range.from() - base_day).num_days() * MINUTES_PER_DAY as i64
        ..(date_range.to() - base_day).num_days() * MINUTES_PER_DAY as i64;
    let mut times = vec![];
    for location_route in timetable.location(location).routes(timetable) {
        let route = timetable.route(location_route.route_id());
        let seq = location_route.stop_seq();
        let stops = route.route_stops(timetable);
        if seq + 1 == stops.len() || !stops[seq].in_allowed() {
            continue;
        }
        times.extend(
            route
                .transports(timetable)
                .iter()
                .map(|transport| transport.stop_times(timetable)[seq].departure())
                .filter(|departure| {
                    departure.is_valid() && window.contains(&(departure.minutes() as i64))
                }),
        );
    }
    times.sort();
    times.dedup();
    times
}

fn source_reach(
    timetable: &dyn Timetable,
    state: &mut SearchState,
    source: usize,
    date_range: DateRange,
    config: &ReachConfig,
) -> Vec<ReachInfo> {
    let mut reachs = vec![ReachInfo::default(); timetable.n_routes()];
    let origin = timetable.location(source).lat_lng();
    let mut times = departures(timetable, source, date_range);
    if let Some(max) = config.max_departures_per_source {
        times.truncate(max);
    }
    debug!("Source {}: {} departures", source, times.len());

    for time in times {
        let query = Query::one_to_all(source, time).with_max_transfers(config.max_transfers);
        let mut engine = RaptorEngine::new(timetable, None, state, &query);
        engine.execute();
        for location in 0..timetable.n_locations() {
            if location == source || !engine.arrival(location).is_valid() {
                continue;
            }
            for journey in engine.journeys_to(location) {
                for leg in &journey.legs {
                    let Leg::Transport {
                        route,
                        from_seq,
                        to_seq,
                        ..
                    } = leg
                    else {
                        continue;
                    };
                    let stops = timetable.route(*route).route_stops(timetable);
                    for stop in &stops[*from_seq..=*to_seq] {
                        let lat_lng = timetable.location(stop.location_id()).lat_lng();
                        reachs[*route].update(distance_meters(&origin, &lat_lng), &journey);
                    }
                }
            }
        }
    }
    reachs
}

/// Diagonal of the bounding box of a route's stops, in meters.
pub fn route_bounding_box_diagonal(timetable: &dyn Timetable, route: usize) -> f64 {
    let line: LineString<f64> = timetable
        .route(route)
        .route_stops(timetable)
        .iter()
        .map(|stop| {
            let lat_lng = timetable.location(stop.location_id()).lat_lng();
            coord! { x: lat_lng.lng.deg(), y: lat_lng.lat.deg() }
        })
        .collect();
    match line.bounding_rect() {
        Some(rect) => great_circle_meters(
            (rect.min().y, rect.min().x),
            (rect.max().y, rect.max().x),
        ),
        None => 0.0,
    }
}

/// Valid routes with a bounding box diagonal of at most `max_diagonal`, by descending reach.
pub fn top_routes(reachs: &[ReachInfo], bboxes: &[f64], max_diagonal: f64, n: usize) -> Vec<usize> {
    let mut routes: Vec<usize> = (0..reachs.len())
        .filter(|route| reachs[*route].valid() && bboxes[*route] <= max_diagonal)
        .collect();
    routes.sort_by(|a, b| reachs[*b].reach.total_cmp(&reachs[*a].reach));
    routes.truncate(n);
    routes
}

/// One `reach bbox` line per valid route.
pub fn write_reach_report(
    out: &mut dyn io::Write,
    reachs: &[ReachInfo],
    bboxes: &[f64],
) -> io::Result<usize> {
    let mut lines = 0;
    for (reach, bbox) in reachs.iter().zip(bboxes) {
        if reach.valid() {
            writeln!(out, "{} {}", reach.reach, bbox)?;
            lines += 1;
        }
    }
    Ok(lines)
}

#[derive(Debug, Serialize)]
pub struct ReachSummaryEntry<'a> {
    pub route: usize,
    pub name: Option<&'a str>,
    pub reach: f64,
    pub bbox_diagonal: f64,
    pub journey: Option<&'a Journey>,
}

pub fn summary<'a>(
    timetable: &'a dyn Timetable,
    reachs: &'a [ReachInfo],
    bboxes: &[f64],
    routes: &[usize],
) -> Vec<ReachSummaryEntry<'a>> {
    routes
        .iter()
        .map(|route| ReachSummaryEntry {
            route: *route,
            name: timetable.route(*route).name(timetable),
            reach: reachs[*route].reach,
            bbox_diagonal: bboxes[*route],
            journey: reachs[*route].journey.as_ref(),
        })
        .collect()
}
