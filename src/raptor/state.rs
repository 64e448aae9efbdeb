use std::io;

use chrono::NaiveDate;

use super::{timetable::Timetable, ViaLabels, INVALID_LABELS, MAX_TRANSFERS};

/// Scratch space of one search. It is sized against a timetable once and reused across queries;
/// the engine resets it before every query, so nothing carries over between them.
#[derive(Debug, Clone, Default)]
pub struct SearchState {
    /// Arrivals found while scanning routes in the current round, not yet committed.
    pub(super) tmp: Vec<ViaLabels>,
    /// Best committed arrival over all rounds so far.
    pub(super) best: Vec<ViaLabels>,
    /// `MAX_TRANSFERS + 1` rows of `n_locations` labels, one row per round.
    pub(super) round_times: Vec<ViaLabels>,
    pub(super) station_mark: Vec<bool>,
    pub(super) prev_station_mark: Vec<bool>,
    pub(super) route_mark: Vec<bool>,
    pub(super) rt_transport_mark: Vec<bool>,
    /// Destinations, and locations with a footpath into one.
    pub(super) end_reachable: Vec<bool>,
    n_locations: usize,
}

impl SearchState {
    pub fn new() -> SearchState {
        SearchState::default()
    }

    pub fn for_timetable(timetable: &dyn Timetable, n_rt_transports: usize) -> SearchState {
        let mut state = SearchState::new();
        state.resize(
            timetable.n_locations(),
            timetable.n_routes(),
            n_rt_transports,
        );
        state
    }

    /// Sizes every array to the given dimensions. New slots are filled with the sentinel or
    /// `false`. Calling this with the current dimensions leaves the contents untouched.
    pub fn resize(&mut self, n_locations: usize, n_routes: usize, n_rt_transports: usize) {
        self.tmp.resize(n_locations, INVALID_LABELS);
        self.best.resize(n_locations, INVALID_LABELS);
        self.station_mark.resize(n_locations, false);
        self.prev_station_mark.resize(n_locations, false);
        self.end_reachable.resize(n_locations, false);
        self.route_mark.resize(n_routes, false);
        self.rt_transport_mark.resize(n_rt_transports, false);
        if n_locations != self.n_locations || self.round_times.is_empty() {
            // Rows are laid out by location count, so existing rows would be misaligned.
            self.round_times.clear();
            self.round_times
                .resize((MAX_TRANSFERS + 1) * n_locations, INVALID_LABELS);
            self.n_locations = n_locations;
        }
    }

    /// Sets every label to the sentinel and every mark to `false`.
    pub fn reset(&mut self) {
        self.tmp.fill(INVALID_LABELS);
        self.best.fill(INVALID_LABELS);
        self.round_times.fill(INVALID_LABELS);
        self.station_mark.fill(false);
        self.prev_station_mark.fill(false);
        self.route_mark.fill(false);
        self.rt_transport_mark.fill(false);
        self.end_reachable.fill(false);
    }

    #[inline]
    pub fn n_locations(&self) -> usize {
        self.n_locations
    }

    #[inline]
    pub fn n_routes(&self) -> usize {
        self.route_mark.len()
    }

    #[inline]
    pub fn n_rt_transports(&self) -> usize {
        self.rt_transport_mark.len()
    }

    pub fn is_sized_for(&self, timetable: &dyn Timetable) -> bool {
        self.n_locations == timetable.n_locations()
            && self.tmp.len() == timetable.n_locations()
            && self.route_mark.len() == timetable.n_routes()
            && self.round_times.len() == (MAX_TRANSFERS + 1) * timetable.n_locations()
    }

    #[inline]
    pub fn tmp(&self, location: usize) -> &ViaLabels {
        &self.tmp[location]
    }

    #[inline]
    pub fn best(&self, location: usize) -> &ViaLabels {
        &self.best[location]
    }

    #[inline]
    pub fn round_times(&self, round: usize, location: usize) -> &ViaLabels {
        assert!(round <= MAX_TRANSFERS);
        &self.round_times[round * self.n_locations + location]
    }

    #[inline]
    pub(super) fn round_times_mut(&mut self, round: usize, location: usize) -> &mut ViaLabels {
        &mut self.round_times[round * self.n_locations + location]
    }

    #[inline]
    pub fn station_mark(&self, location: usize) -> bool {
        self.station_mark[location]
    }

    #[inline]
    pub fn end_reachable(&self, location: usize) -> bool {
        self.end_reachable[location]
    }

    fn has_empty_rounds(&self, location: usize) -> bool {
        (0..=MAX_TRANSFERS).all(|k| *self.round_times(k, location) == INVALID_LABELS)
    }

    /// Writes one row per location that was ever reached, with all labels as unix timestamps.
    /// Returns the number of rows. Panics if the state isn't sized for `timetable`.
    pub fn debug_dump(
        &self,
        timetable: &dyn Timetable,
        base_day: NaiveDate,
        out: &mut dyn io::Write,
    ) -> io::Result<usize> {
        assert!(
            self.is_sized_for(timetable),
            "Search state is not sized for this timetable"
        );
        fn write_labels(
            out: &mut dyn io::Write,
            labels: &ViaLabels,
            base_day: NaiveDate,
        ) -> io::Result<()> {
            write!(out, "[ ")?;
            for label in labels {
                match label.to_unix(base_day) {
                    Some(unix) => write!(out, "{:16} ", unix)?,
                    None => write!(out, "________________ ")?,
                }
            }
            write!(out, "]")
        }

        let mut rows = 0;
        for location in 0..timetable.n_locations() {
            if self.best[location] == INVALID_LABELS && self.has_empty_rounds(location) {
                continue;
            }
            write!(
                out,
                "{:40}  tmp=",
                format!(
                    "{} ({})",
                    timetable.location_name(location),
                    timetable.metadata().location_ids[location]
                )
            )?;
            write_labels(out, &self.tmp[location], base_day)?;
            write!(out, ", best=")?;
            write_labels(out, &self.best[location], base_day)?;
            write!(out, ", round_times: ")?;
            for k in 0..=MAX_TRANSFERS {
                write!(out, "{}:", k)?;
                write_labels(out, self.round_times(k, location), base_day)?;
                write!(out, " ")?;
            }
            writeln!(out)?;
            rows += 1;
        }
        Ok(rows)
    }
}
