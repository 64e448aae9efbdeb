use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    process::exit,
};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use transit_reach::{
    loader::{load_timetable, LoaderConfig},
    raptor::{
        geomath::FAKE_WALK_SPEED_SECONDS_PER_METER,
        reach::{
            get_reach_values_with, route_bounding_box_diagonal, summary, top_routes,
            write_reach_report, ReachConfig,
        },
        time::{parse_date, DateRange},
        timetable::{mmap::MmapTimetable, Timetable},
        MAX_TRANSFERS,
    },
};

extern crate transit_reach;

#[derive(Parser)]
#[command(about = "Builds timetables and computes route reach")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Builds a timetable from GTFS feeds and writes it to disk.
    Load(LoadArgs),
    /// Computes the reach of every route from a sample of locations.
    Reach(ReachArgs),
}

#[derive(Args)]
struct LoadArgs {
    #[arg(value_parser = parse_date)]
    from: NaiveDate,
    #[arg(value_parser = parse_date)]
    to: NaiveDate,
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    #[arg(short, long, default_value = "timetable.bin")]
    timetable: PathBuf,
    #[arg(long, default_value_t = 400.0)]
    max_footpath_meters: f64,
    #[arg(long, default_value_t = FAKE_WALK_SPEED_SECONDS_PER_METER)]
    walk_seconds_per_meter: f64,
    #[arg(long, default_value_t = 2)]
    transfer_minutes: u16,
}

#[derive(Args)]
struct ReachArgs {
    #[arg(value_parser = parse_date)]
    from: NaiveDate,
    #[arg(value_parser = parse_date)]
    to: NaiveDate,
    #[arg(short, long, default_value = "timetable.bin")]
    timetable: PathBuf,
    #[arg(short, long, default_value_t = 10)]
    samples: usize,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(short, long, default_value = "reach.txt")]
    output: PathBuf,
    #[arg(long, default_value_t = 30_000.0)]
    max_bbox_diagonal: f64,
    #[arg(long, default_value_t = 10)]
    top: usize,
    #[arg(long)]
    max_departures: Option<usize>,
    #[arg(long)]
    json: Option<PathBuf>,
}

fn load(args: LoadArgs) -> Result<(), anyhow::Error> {
    let date_range = DateRange::new(args.from, args.to)?;
    let config = LoaderConfig {
        max_footpath_meters: args.max_footpath_meters,
        walk_seconds_per_meter: args.walk_seconds_per_meter,
        transfer_minutes: args.transfer_minutes,
    };
    let timetable = load_timetable(date_range, &args.paths, &config)?;
    let timetable = MmapTimetable::from_in_memory(&timetable, &args.timetable)
        .with_context(|| format!("Failed to write timetable to {:?}", args.timetable))?;
    info!(
        "Wrote {} locations, {} routes and {} transports to {:?}",
        timetable.n_locations(),
        timetable.n_routes(),
        timetable.n_transports(),
        timetable.path()
    );
    Ok(())
}

fn reach(args: ReachArgs) -> Result<(), anyhow::Error> {
    let date_range = DateRange::new(args.from, args.to)?;
    let timetable = MmapTimetable::open(&args.timetable)
        .with_context(|| format!("Failed to open timetable {:?}", args.timetable))?;
    let available = timetable.date_range();
    if date_range.from() < available.from() || date_range.to() > available.to() {
        warn!(
            "Requested {} to {}, but the timetable only covers {} to {}",
            date_range.from(),
            date_range.to(),
            available.from(),
            available.to()
        );
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("Sampling {} locations with seed {}", args.samples, seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sources: Vec<usize> = (0..timetable.n_locations()).collect();
    sources.shuffle(&mut rng);
    sources.truncate(args.samples);

    let config = ReachConfig {
        max_transfers: MAX_TRANSFERS,
        max_departures_per_source: args.max_departures,
    };
    let reachs = get_reach_values_with(&timetable, &sources, date_range, &config);
    let bboxes: Vec<f64> = (0..timetable.n_routes())
        .map(|route| route_bounding_box_diagonal(&timetable, route))
        .collect();

    let mut report = BufWriter::new(
        File::create(&args.output)
            .with_context(|| format!("Failed to create {:?}", args.output))?,
    );
    let lines = write_reach_report(&mut report, &reachs, &bboxes)?;
    report.flush()?;
    info!("Wrote {} routes to {:?}", lines, args.output);

    let top = top_routes(&reachs, &bboxes, args.max_bbox_diagonal, args.top);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for route in &top {
        let stops: Vec<&str> = timetable
            .route(*route)
            .route_stops(&timetable)
            .iter()
            .map(|stop| timetable.location_name(stop.location_id()))
            .collect();
        writeln!(
            out,
            "{} ({}): reach {:.0} m, bbox {:.0} m",
            timetable.route(*route).name(&timetable).unwrap_or("unnamed route"),
            stops.join(" - "),
            reachs[*route].reach,
            bboxes[*route]
        )?;
        if let Some(journey) = &reachs[*route].journey {
            journey.print(&mut out, &timetable)?;
        }
    }

    if let Some(path) = &args.json {
        let file = BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        );
        serde_json::to_writer_pretty(file, &summary(&timetable, &reachs, &bboxes, &top))?;
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            exit(if err.use_stderr() { 1 } else { 0 });
        }
    };
    let result = match cli.command {
        Command::Load(args) => load(args),
        Command::Reach(args) => reach(args),
    };
    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        exit(1);
    }
}
