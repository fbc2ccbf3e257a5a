use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use flate2::read::GzDecoder;
use head_tracker_rs::{HeadTracker, ReplaySource, SensorEvent, TrackerConfig};
use serde::Deserialize;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a recorded sensor log (.json or .json.gz)
    #[arg(long)]
    log: PathBuf,

    /// Tracker config JSON; missing fields fall back to defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the heading every N events in synchronous mode (0 disables)
    #[arg(long, default_value_t = 200)]
    print_every: usize,

    /// Replay through the tracker's worker thread in real time
    #[arg(long, default_value_t = false)]
    threaded: bool,

    /// Feed magnetometer samples to the filter (overrides config)
    #[arg(long, default_value_t = false)]
    enable_mag: bool,
}

#[derive(Deserialize)]
struct LogFile {
    events: Vec<SensorEvent>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TrackerConfig> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("opening config {}", path.display()))?;
            Ok(serde_json::from_reader(BufReader::new(file))?)
        }
        None => Ok(TrackerConfig::default()),
    }
}

/// Seconds from `first_ns` to `ts_ns`, saturating on extreme timestamps
fn seconds_since(first_ns: i64, ts_ns: i64) -> f64 {
    ts_ns.saturating_sub(first_ns) as f64 * 1e-9
}

/// Recorded duration between the first and last event
fn recorded_span(events: &[SensorEvent]) -> Duration {
    let span_ns = match (events.first(), events.last()) {
        (Some(first), Some(last)) => last.timestamp_ns().saturating_sub(first.timestamp_ns()),
        _ => 0,
    };
    Duration::from_nanos(span_ns.max(0) as u64)
}

/// Feed every event on this thread. Returns the number of rejected samples.
fn run_sync(
    tracker: &HeadTracker,
    events: &[SensorEvent],
    print_every: usize,
) -> anyhow::Result<u64> {
    let mut rejected = 0u64;
    let first_ts = events.first().map(|e| e.timestamp_ns()).unwrap_or(0);

    for (i, event) in events.iter().enumerate() {
        if let Err(e) = tracker.process_sensor_event(event) {
            if e.is_rejected_sample() {
                rejected += 1;
                continue;
            }
            return Err(e.into());
        }

        if print_every > 0 && (i + 1) % print_every == 0 {
            let t = seconds_since(first_ts, event.timestamp_ns());
            println!(
                "[HEADING] t={:.3}s heading={:.1}° ready={}",
                t,
                tracker.heading_degrees()?,
                tracker.is_ready()?
            );
        }
    }
    Ok(rejected)
}

/// Replay through a paced source and the tracker's worker, polling the head view.
fn run_threaded(tracker: &mut HeadTracker, events: Vec<SensorEvent>) -> anyhow::Result<()> {
    let span = recorded_span(&events);

    tracker.start_tracking(Box::new(ReplaySource::new(events).realtime(true)))?;

    let start = Instant::now();
    let settle = Duration::from_millis(250);
    while start.elapsed() < span + settle {
        thread::sleep(Duration::from_millis(500));
        let view = tracker.last_head_view()?;
        let euler = view.euler_angles();
        println!(
            "[HEAD] t={:.1}s heading={:.1}° pitch={:.1}° yaw={:.1}° roll={:.1}°",
            start.elapsed().as_secs_f64(),
            tracker.heading_degrees()?,
            euler.x.to_degrees(),
            euler.y.to_degrees(),
            euler.z.to_degrees()
        );
    }

    tracker.stop_tracking()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if args.enable_mag {
        config.enable_magnetometer = true;
    }

    let log = load_log(&args.log).with_context(|| format!("loading {}", args.log.display()))?;
    let event_count = log.events.len();
    println!("Loaded {} events from {}", event_count, args.log.display());

    let mut tracker = HeadTracker::new(config)?;
    let started = Instant::now();

    let rejected = if args.threaded {
        run_threaded(&mut tracker, log.events)?;
        None
    } else {
        Some(run_sync(&tracker, &log.events, args.print_every)?)
    };

    let state = tracker.filter_state()?;
    let view = tracker.last_head_view()?;
    let summary = json!({
        "log": args.log.display().to_string(),
        "mode": if args.threaded { "threaded" } else { "sync" },
        "events": event_count,
        "rejected": rejected,
        "elapsed_ms": started.elapsed().as_secs_f64() * 1000.0,
        "filter": serde_json::to_value(&state)?,
        "head_view": {
            "quaternion": view.quaternion(),
            "forward": [view.forward_vector().x, view.forward_vector().y, view.forward_vector().z],
            "row_major": view.head_view_row_major().to_vec(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
