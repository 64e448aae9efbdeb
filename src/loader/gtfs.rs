use std::{collections::HashMap, path::Path};

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use gtfs_structures::{Gtfs, PickupDropOffType};
use log::{debug, info, warn};

use crate::raptor::{
    time::DeltaTime,
    timetable::in_memory::{TimetableBuilder, TripStop},
};

use super::{Loader, LoaderConfig, LoaderError};

const REQUIRED_FILES: [&str; 5] = [
    "agency.txt",
    "stops.txt",
    "routes.txt",
    "trips.txt",
    "stop_times.txt",
];

/// Reads GTFS feeds, either unpacked into a directory or as a zip archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct GtfsLoader;

impl Loader for GtfsLoader {
    fn name(&self) -> &'static str {
        "GTFS"
    }

    fn applicable(&self, path: &Path) -> bool {
        if path.is_dir() {
            REQUIRED_FILES.iter().all(|file| path.join(file).is_file())
        } else {
            path.is_file()
                && path
                    .extension()
                    .map_or(false, |extension| extension.eq_ignore_ascii_case("zip"))
        }
    }

    fn load(
        &self,
        config: &LoaderConfig,
        source_idx: usize,
        path: &Path,
        builder: &mut TimetableBuilder,
    ) -> Result<(), LoaderError> {
        let gtfs = Gtfs::from_path(&*path.to_string_lossy())?;
        let timezones = AgencyTimezones::new(&gtfs)?;
        let date_range = builder.date_range();
        // Trips of the previous service day can run past midnight into the range.
        let Some(first_service_day) = date_range.from().pred_opt() else {
            return Ok(());
        };

        let mut trips: Vec<_> = gtfs.trips.iter().collect();
        trips.sort_by(|a, b| a.0.cmp(b.0));
        let mut added = 0;
        let mut skipped = 0;
        for (trip_id, trip) in trips {
            let Some(route) = gtfs.routes.get(&trip.route_id) else {
                warn!("Skipping trip {}: unknown route {}", trip_id, trip.route_id);
                skipped += 1;
                continue;
            };
            let Some(tz) = timezones.get(route.agency_id.as_deref()) else {
                warn!("Skipping trip {}: no agency timezone", trip_id);
                skipped += 1;
                continue;
            };
            if trip.stop_times.len() < 2
                || trip
                    .stop_times
                    .iter()
                    .any(|st| st.arrival_time.is_none() && st.departure_time.is_none())
            {
                warn!("Skipping trip {}: too few stops or missing times", trip_id);
                skipped += 1;
                continue;
            }

            let mut locations = Vec::with_capacity(trip.stop_times.len());
            for stop_time in &trip.stop_times {
                let stop = &stop_time.stop;
                let id = format!("{}:{}", source_idx, stop.id);
                let location = match builder.location_by_id(&id) {
                    Some(location) => location,
                    None => {
                        let (Some(lat), Some(lng)) = (stop.latitude, stop.longitude) else {
                            return Err(LoaderError::MissingCoordinates(stop.id.clone()));
                        };
                        builder.add_location(
                            &id,
                            &stop.to_string(),
                            lat,
                            lng,
                            config.transfer_minutes,
                            tz,
                        )?
                    }
                };
                locations.push(location);
            }
            let route_name = Some(route.to_string()).filter(|name| !name.is_empty());

            for day in gtfs.trip_days(&trip.service_id, first_service_day) {
                let Some(date) = first_service_day.checked_add_days(Days::new(day as u64)) else {
                    continue;
                };
                if date >= date_range.to() {
                    continue;
                }
                let Some(day_start) = service_day_start(tz, date) else {
                    warn!("No service day start for {} in {}", date, tz);
                    continue;
                };
                let stops: Option<Vec<TripStop>> = trip
                    .stop_times
                    .iter()
                    .zip(&locations)
                    .map(|(stop_time, location)| {
                        let arrival = stop_time.arrival_time.or(stop_time.departure_time)?;
                        let departure = stop_time.departure_time.or(stop_time.arrival_time)?;
                        let mut stop = TripStop::new(
                            *location,
                            time_at(date_range.base_day(), day_start, arrival)?,
                            time_at(date_range.base_day(), day_start, departure)?,
                        );
                        stop.in_allowed =
                            !matches!(stop_time.pickup_type, PickupDropOffType::NotAvailable);
                        stop.out_allowed =
                            !matches!(stop_time.drop_off_type, PickupDropOffType::NotAvailable);
                        Some(stop)
                    })
                    .collect();
                let Some(stops) = stops else {
                    debug!("Trip {} on {} is outside the representable range", trip_id, date);
                    skipped += 1;
                    continue;
                };
                let transport_id = format!("{}:{}:{}", source_idx, trip_id, date);
                match builder.add_trip(route_name.as_deref(), &transport_id, stops) {
                    Ok(()) => added += 1,
                    Err(err) => {
                        warn!("Skipping trip {} on {}: {}", trip_id, date, err);
                        skipped += 1;
                    }
                }
            }
        }
        info!(
            "Added {} transports from {:?}, skipped {}",
            added, path, skipped
        );
        Ok(())
    }
}

struct AgencyTimezones {
    by_agency: HashMap<String, Tz>,
    /// Routes may leave out their agency if the feed has only one.
    only: Option<Tz>,
}

impl AgencyTimezones {
    fn new(gtfs: &Gtfs) -> Result<AgencyTimezones, LoaderError> {
        let mut by_agency = HashMap::new();
        for agency in &gtfs.agencies {
            let tz: Tz = agency
                .timezone
                .parse()
                .map_err(|_| LoaderError::InvalidTimezone(agency.timezone.clone()))?;
            by_agency.insert(agency.id.clone().unwrap_or_default(), tz);
        }
        let only = if by_agency.len() == 1 {
            by_agency.values().next().copied()
        } else {
            None
        };
        Ok(AgencyTimezones { by_agency, only })
    }

    fn get(&self, agency_id: Option<&str>) -> Option<Tz> {
        agency_id
            .and_then(|id| self.by_agency.get(id).copied())
            .or(self.only)
    }
}

/// The start of a service day is defined as noon minus 12 hours, which differs from midnight on
/// days with a DST change.
fn service_day_start(tz: Tz, date: NaiveDate) -> Option<NaiveDateTime> {
    let noon = date.and_time(NaiveTime::from_hms_opt(12, 0, 0)?);
    let noon = tz.from_local_datetime(&noon).earliest()?;
    Some(noon.naive_utc() - TimeDelta::hours(12))
}

fn time_at(base_day: NaiveDate, day_start: NaiveDateTime, seconds: u32) -> Option<DeltaTime> {
    DeltaTime::from_utc(base_day, day_start + TimeDelta::seconds(seconds as i64))
}
