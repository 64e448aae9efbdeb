use std::{
    fs::File,
    mem::size_of,
    ops::Range,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail};
use bytemuck::{bytes_of, cast_slice, pod_read_unaligned, try_cast_slice, Pod, Zeroable};
use log::{debug, info};
use memmap2::{Mmap, MmapOptions};

use super::{
    in_memory::InMemoryTimetable, Footpath, Location, LocationRoute, Route, RouteStop, StopTime,
    Timetable, TimetableMetadata, Transport,
};

const MAGIC: [u8; 8] = *b"TRREACH1";
const VERSION: u32 = 1;
const SECTION_COUNT: usize = 9;
const SECTION_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Locations = 0,
    LocationRoutes,
    Routes,
    RouteStops,
    Transports,
    StopTimes,
    FootpathsOut,
    FootpathsIn,
    Metadata,
}

impl Section {
    const ALL: [Section; SECTION_COUNT] = [
        Section::Locations,
        Section::LocationRoutes,
        Section::Routes,
        Section::RouteStops,
        Section::Transports,
        Section::StopTimes,
        Section::FootpathsOut,
        Section::FootpathsIn,
        Section::Metadata,
    ];
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BlobSection {
    offset: u64,
    len: u64,
}

/// Fixed-size header at the start of the file. Sections follow, each starting on an 8 byte
/// boundary.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BlobHeader {
    magic: [u8; 8],
    version: u32,
    section_count: u32,
    sections: [BlobSection; SECTION_COUNT],
}

#[inline]
fn align_up(offset: usize) -> usize {
    offset.div_ceil(SECTION_ALIGN) * SECTION_ALIGN
}

/// Writes a timetable into a single self-describing file that [`MmapTimetable::open`] can map.
pub fn write_timetable(timetable: &dyn Timetable, path: &Path) -> Result<(), anyhow::Error> {
    let metadata = rmp_serde::to_vec(timetable.metadata())?;
    let payloads: [&[u8]; SECTION_COUNT] = [
        cast_slice(timetable.locations()),
        cast_slice(timetable.location_routes()),
        cast_slice(timetable.routes()),
        cast_slice(timetable.route_stops()),
        cast_slice(timetable.transports()),
        cast_slice(timetable.stop_times()),
        cast_slice(timetable.footpaths_out()),
        cast_slice(timetable.footpaths_in()),
        &metadata,
    ];

    let mut header = BlobHeader {
        magic: MAGIC,
        version: VERSION,
        section_count: SECTION_COUNT as u32,
        sections: [BlobSection { offset: 0, len: 0 }; SECTION_COUNT],
    };
    let mut offset = align_up(size_of::<BlobHeader>());
    for (section, payload) in header.sections.iter_mut().zip(payloads.iter()) {
        section.offset = offset as u64;
        section.len = payload.len() as u64;
        offset = align_up(offset + payload.len());
    }

    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(offset as u64)?;
    let mut backing = unsafe { MmapOptions::new().map_mut(&file)? };
    backing[..size_of::<BlobHeader>()].copy_from_slice(bytes_of(&header));
    for (section, payload) in header.sections.iter().zip(payloads.iter()) {
        let start = section.offset as usize;
        backing[start..start + payload.len()].copy_from_slice(payload);
    }
    backing.flush()?;
    info!(
        "Done writing timetable to {} ({} bytes)",
        path.display(),
        offset
    );
    Ok(())
}

/// A timetable read straight out of a memory-mapped file written by [`write_timetable`].
pub struct MmapTimetable {
    path: PathBuf,
    backing: Mmap,
    sections: [Range<usize>; SECTION_COUNT],
    metadata: TimetableMetadata,
}

impl std::fmt::Debug for MmapTimetable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapTimetable")
            .field("path", &self.path)
            .field("bytes", &self.backing.len())
            .finish()
    }
}

impl Timetable for MmapTimetable {
    #[inline]
    fn locations(&self) -> &[Location] {
        self.section(Section::Locations)
    }

    #[inline]
    fn location_routes(&self) -> &[LocationRoute] {
        self.section(Section::LocationRoutes)
    }

    #[inline]
    fn routes(&self) -> &[Route] {
        self.section(Section::Routes)
    }

    #[inline]
    fn route_stops(&self) -> &[RouteStop] {
        self.section(Section::RouteStops)
    }

    #[inline]
    fn transports(&self) -> &[Transport] {
        self.section(Section::Transports)
    }

    #[inline]
    fn stop_times(&self) -> &[StopTime] {
        self.section(Section::StopTimes)
    }

    #[inline]
    fn footpaths_out(&self) -> &[Footpath] {
        self.section(Section::FootpathsOut)
    }

    #[inline]
    fn footpaths_in(&self) -> &[Footpath] {
        self.section(Section::FootpathsIn)
    }

    #[inline]
    fn metadata(&self) -> &TimetableMetadata {
        &self.metadata
    }
}

impl MmapTimetable {
    /// Sections were checked with `try_cast_slice` in `open`, so this can't fail.
    #[inline]
    fn section<T: Pod>(&self, section: Section) -> &[T] {
        cast_slice(&self.backing[self.sections[section as usize].clone()])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(path: &Path) -> Result<MmapTimetable, anyhow::Error> {
        debug!("Opening timetable {}", path.display());
        let file = File::open(path)?;
        let backing = unsafe { MmapOptions::new().map(&file)? };
        if backing.len() < size_of::<BlobHeader>() {
            bail!("{} is too short to be a timetable", path.display());
        }
        let header: BlobHeader = pod_read_unaligned(&backing[..size_of::<BlobHeader>()]);
        if header.magic != MAGIC {
            bail!("{} is not a timetable file", path.display());
        }
        if header.version != VERSION || header.section_count as usize != SECTION_COUNT {
            bail!(
                "Unsupported timetable version {} with {} sections",
                header.version,
                header.section_count
            );
        }

        let mut sections: [Range<usize>; SECTION_COUNT] = Default::default();
        for (range, (section, kind)) in sections
            .iter_mut()
            .zip(header.sections.iter().zip(Section::ALL))
        {
            let start = usize::try_from(section.offset)?;
            let end = usize::try_from(section.len)?
                .checked_add(start)
                .filter(|end| *end <= backing.len())
                .ok_or_else(|| anyhow!("Section {:?} exceeds the file", kind))?;
            if start % SECTION_ALIGN != 0 {
                bail!("Section {:?} is misaligned", kind);
            }
            *range = start..end;
        }

        fn check<T: Pod>(
            backing: &Mmap,
            range: &Range<usize>,
            kind: Section,
        ) -> Result<usize, anyhow::Error> {
            try_cast_slice::<u8, T>(&backing[range.clone()])
                .map(|slice| slice.len())
                .map_err(|err| anyhow!("Section {:?} is malformed: {:?}", kind, err))
        }
        let n_locations = check::<Location>(&backing, &sections[0], Section::Locations)?;
        check::<LocationRoute>(&backing, &sections[1], Section::LocationRoutes)?;
        let n_routes = check::<Route>(&backing, &sections[2], Section::Routes)?;
        check::<RouteStop>(&backing, &sections[3], Section::RouteStops)?;
        let n_transports = check::<Transport>(&backing, &sections[4], Section::Transports)?;
        check::<StopTime>(&backing, &sections[5], Section::StopTimes)?;
        check::<Footpath>(&backing, &sections[6], Section::FootpathsOut)?;
        check::<Footpath>(&backing, &sections[7], Section::FootpathsIn)?;

        let mut metadata: TimetableMetadata =
            rmp_serde::from_slice(&backing[sections[Section::Metadata as usize].clone()])?;
        if metadata.location_ids.len() != n_locations
            || metadata.location_names.len() != n_locations
            || metadata.route_names.len() != n_routes
            || metadata.transport_trip_ids.len() != n_transports
        {
            bail!("Timetable metadata does not match its tables");
        }
        metadata.resolve_timezones()?;

        let timetable = MmapTimetable {
            path: path.to_path_buf(),
            backing,
            sections,
            metadata,
        };
        timetable.validate()?;
        info!(
            "Opened timetable with {} locations, {} routes, {} transports for {}..{}",
            n_locations,
            n_routes,
            n_transports,
            timetable.metadata.date_range.from(),
            timetable.metadata.date_range.to()
        );
        Ok(timetable)
    }

    pub fn from_in_memory(
        timetable: &InMemoryTimetable,
        path: &Path,
    ) -> Result<MmapTimetable, anyhow::Error> {
        write_timetable(timetable, path)?;
        MmapTimetable::open(path)
    }

    /// Checks that every index stored in the file stays in bounds so that accessors can't panic.
    fn validate(&self) -> Result<(), anyhow::Error> {
        fn ascending(
            firsts: impl Iterator<Item = u32>,
            len: usize,
            what: &str,
        ) -> Result<(), anyhow::Error> {
            let mut previous = 0;
            for first in firsts {
                if first < previous || first as usize > len {
                    bail!("Corrupt {} index", what);
                }
                previous = first;
            }
            Ok(())
        }
        let locations = self.locations();
        ascending(
            locations.iter().map(|l| l.first_location_route),
            self.location_routes().len(),
            "location route",
        )?;
        ascending(
            locations.iter().map(|l| l.first_footpath_out),
            self.footpaths_out().len(),
            "outgoing footpath",
        )?;
        ascending(
            locations.iter().map(|l| l.first_footpath_in),
            self.footpaths_in().len(),
            "incoming footpath",
        )?;
        ascending(
            self.routes().iter().map(|r| r.first_route_stop),
            self.route_stops().len(),
            "route stop",
        )?;
        ascending(
            self.routes().iter().map(|r| r.first_transport),
            self.transports().len(),
            "transport",
        )?;
        let n_timezones = self.metadata.timezones.len();
        if locations
            .iter()
            .enumerate()
            .any(|(i, l)| l.id() != i || l.timezone_index() as usize >= n_timezones)
        {
            bail!("Corrupt location table");
        }
        let n_locations = locations.len();
        if self
            .footpaths_out()
            .iter()
            .chain(self.footpaths_in())
            .any(|f| f.location_id() >= n_locations)
            || self
                .route_stops()
                .iter()
                .any(|s| s.location_id() >= n_locations || s.route_id() >= self.n_routes())
            || self
                .location_routes()
                .iter()
                .any(|r| r.route_id() >= self.n_routes())
        {
            bail!("Corrupt location reference");
        }
        if self.routes().iter().enumerate().any(|(i, r)| r.id() != i)
            || self.transports().iter().enumerate().any(|(i, t)| t.id() != i)
        {
            bail!("Corrupt route or transport table");
        }
        for transport in self.transports() {
            if transport.route_id() >= self.n_routes() {
                bail!("Corrupt transport {}", transport.id());
            }
            let n_stops = self.route(transport.route_id()).route_stops(self).len();
            if transport.first_stop_time > transport.last_stop_time
                || transport.last_stop_time as usize > self.stop_times().len()
                || (transport.last_stop_time - transport.first_stop_time) as usize != n_stops
            {
                bail!("Corrupt transport {}", transport.id());
            }
        }
        for route in self.routes() {
            if route
                .transports(self)
                .iter()
                .any(|transport| transport.route_id() != route.id())
            {
                bail!("Corrupt transports of route {}", route.id());
            }
        }
        for location in locations {
            if location.routes(self).iter().any(|location_route| {
                location_route.stop_seq()
                    >= self
                        .route(location_route.route_id())
                        .route_stops(self)
                        .len()
            }) {
                bail!("Corrupt routes of location {}", location.id());
            }
        }
        Ok(())
    }
}
