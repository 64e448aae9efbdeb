//! Small hand-written networks shared by the search tests.

use chrono::NaiveDate;

use crate::raptor::time::{DateRange, DeltaTime};

use super::in_memory::{InMemoryTimetable, TimetableBuilder, TripStop};

pub(crate) const TRANSFER_MINUTES: u16 = 2;

pub(crate) fn date_range() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        NaiveDate::from_ymd_opt(2024, 5, 7).unwrap(),
    )
    .unwrap()
}

pub(crate) fn stop(location: usize, arrival: i16, departure: i16) -> TripStop {
    TripStop::new(
        location,
        DeltaTime::from_minutes(arrival),
        DeltaTime::from_minutes(departure),
    )
}

/// Adds one location per name, spaced 0.01 degrees of latitude (about 1.1 km) apart.
pub(crate) fn builder_with_locations(names: &[&str]) -> (TimetableBuilder, Vec<usize>) {
    let mut builder = TimetableBuilder::new(date_range());
    let locations = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            builder
                .add_location(
                    name,
                    name,
                    48.0 + i as f64 * 0.01,
                    11.0,
                    TRANSFER_MINUTES,
                    chrono_tz::Europe::Berlin,
                )
                .unwrap()
        })
        .collect();
    (builder, locations)
}

/// A single trip A -> B -> C departing A at minute 0 and arriving at C at minute 20.
pub(crate) fn line_abc() -> InMemoryTimetable {
    let (mut builder, l) = builder_with_locations(&["A", "B", "C"]);
    builder
        .add_trip(
            Some("1"),
            "t1",
            vec![stop(l[0], 0, 0), stop(l[1], 10, 11), stop(l[2], 20, 20)],
        )
        .unwrap();
    builder.build().unwrap()
}

/// Line 1 runs A -> B -> C, line 2 runs C -> D, and line 3 runs A -> E -> D slowly. E has a
/// footpath to D.
///
/// ```text
/// 1: A 0     B 10/11  C 20
/// 2: C 25    D 35
///    C 45    D 55
/// 3: A 5     E 30/30  D 60
/// E -> D on foot: 10 minutes
/// ```
pub(crate) fn two_lines() -> InMemoryTimetable {
    let (mut builder, l) = builder_with_locations(&["A", "B", "C", "D", "E"]);
    builder
        .add_trip(
            Some("1"),
            "1a",
            vec![stop(l[0], 0, 0), stop(l[1], 10, 11), stop(l[2], 20, 20)],
        )
        .unwrap();
    builder
        .add_trip(Some("2"), "2a", vec![stop(l[2], 25, 25), stop(l[3], 35, 35)])
        .unwrap();
    builder
        .add_trip(Some("2"), "2b", vec![stop(l[2], 45, 45), stop(l[3], 55, 55)])
        .unwrap();
    builder
        .add_trip(
            Some("3"),
            "3a",
            vec![stop(l[0], 5, 5), stop(l[4], 30, 30), stop(l[3], 60, 60)],
        )
        .unwrap();
    builder.add_footpath(l[4], l[3], 10).unwrap();
    builder.build().unwrap()
}

/// Line 1 runs S -> X, line 2 runs S -> Y. Walking from X undercuts line 2 at Y, but only line 2
/// arrives at Y in time to walk on to Z.
///
/// ```text
/// 1: S 0  X 10
/// 2: S 0  Y 30
/// X -> Y on foot: 5 minutes
/// Y -> Z on foot: 10 minutes
/// ```
pub(crate) fn walk_after_walk() -> InMemoryTimetable {
    let (mut builder, l) = builder_with_locations(&["S", "X", "Y", "Z"]);
    builder
        .add_trip(Some("1"), "1a", vec![stop(l[0], 0, 0), stop(l[1], 10, 10)])
        .unwrap();
    builder
        .add_trip(Some("2"), "2a", vec![stop(l[0], 0, 0), stop(l[2], 30, 30)])
        .unwrap();
    builder.add_footpath(l[1], l[2], 5).unwrap();
    builder.add_footpath(l[2], l[3], 10).unwrap();
    builder.build().unwrap()
}
