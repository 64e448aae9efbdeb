//! Turning timetable sources on disk into a [`TimetableBuilder`].

use std::path::{Path, PathBuf};

use log::info;

use crate::raptor::{
    geomath::FAKE_WALK_SPEED_SECONDS_PER_METER,
    time::DateRange,
    timetable::{
        in_memory::{InMemoryTimetable, TimetableBuilder},
        TimetableError,
    },
};

pub mod gtfs;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("No loader found for {0}")]
    NoApplicableLoader(PathBuf),
    #[error("Failed to read GTFS feed: {0}")]
    Gtfs(#[from] gtfs_structures::Error),
    #[error(transparent)]
    Timetable(#[from] TimetableError),
    #[error("Stop {0} has no coordinates")]
    MissingCoordinates(String),
    #[error("Invalid timezone {0}")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderConfig {
    /// Locations closer than this are connected by footpaths.
    pub max_footpath_meters: f64,
    pub walk_seconds_per_meter: f64,
    /// Transfer time of locations whose source doesn't specify one, in minutes.
    pub transfer_minutes: u16,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            max_footpath_meters: 400.0,
            walk_seconds_per_meter: FAKE_WALK_SPEED_SECONDS_PER_METER,
            transfer_minutes: 2,
        }
    }
}

pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap check whether `path` looks like something this loader reads.
    fn applicable(&self, path: &Path) -> bool;

    /// Adds everything in `path` to the builder. `source_idx` distinguishes ids of different
    /// sources loaded into the same timetable.
    fn load(
        &self,
        config: &LoaderConfig,
        source_idx: usize,
        path: &Path,
        builder: &mut TimetableBuilder,
    ) -> Result<(), LoaderError>;
}

pub fn default_loaders() -> Vec<Box<dyn Loader>> {
    vec![Box::new(gtfs::GtfsLoader)]
}

pub fn find_loader<'a>(loaders: &'a [Box<dyn Loader>], path: &Path) -> Option<&'a dyn Loader> {
    loaders
        .iter()
        .find(|loader| loader.applicable(path))
        .map(|loader| &**loader)
}

/// Loads every path into one timetable. Fails before loading anything if a path has no loader.
pub fn load_timetable(
    date_range: DateRange,
    paths: &[PathBuf],
    config: &LoaderConfig,
) -> Result<InMemoryTimetable, LoaderError> {
    let loaders = default_loaders();
    let chosen = paths
        .iter()
        .map(|path| {
            find_loader(&loaders, path)
                .map(|loader| (path, loader))
                .ok_or_else(|| LoaderError::NoApplicableLoader(path.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = TimetableBuilder::new(date_range);
    for (source_idx, (path, loader)) in chosen.into_iter().enumerate() {
        info!("Loading {:?} with the {} loader", path, loader.name());
        loader.load(config, source_idx, path, &mut builder)?;
    }
    let footpaths =
        builder.generate_footpaths(config.max_footpath_meters, config.walk_seconds_per_meter);
    info!(
        "Loaded {} locations, generated {} footpaths",
        builder.n_locations(),
        footpaths
    );
    Ok(builder.build()?)
}
