//! tilepipe - demo runner
//!
//! Pushes a synthetic set of road features through a three-stage pipeline
//! (read → classify → merge) sized from a TOML config file.
//!
//! ```text
//! tilepipe [config.toml] [feature-count]
//! ```

use anyhow::Context;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tilepipe::config::{LogConfig, LogFormat};
use tilepipe::{PipelineConfig, ProgressLogger, Stats};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FEATURE_COUNT: u64 = 1_000_000;

const HIGHWAYS: [&str; 7] = [
    "motorway",
    "trunk",
    "primary",
    "residential",
    "path",
    "track",
    "motorway_link",
];

/// A road segment as read from the input.
#[derive(Debug, Clone)]
struct RoadFeature {
    id: u64,
    highway: &'static str,
    name: Option<String>,
    length_m: f64,
}

/// A named road segment with its render class.
#[derive(Debug, Clone)]
struct NamedRoad {
    name: String,
    class: &'static str,
    min_zoom: u8,
    length_m: f64,
}

fn synthesize(id: u64) -> RoadFeature {
    let highway = HIGHWAYS[(id % HIGHWAYS.len() as u64) as usize];
    let name = (id % 5 != 0).then(|| format!("Road {}", id % 97));
    RoadFeature {
        id,
        highway,
        name,
        length_m: 10.0 + (id % 1_000) as f64,
    }
}

fn classify(feature: RoadFeature) -> Option<NamedRoad> {
    let name = feature.name?;
    let is_link = feature.highway.ends_with("_link");
    let class = feature.highway.trim_end_matches("_link");
    let mut min_zoom = match class {
        "motorway" => 6,
        "trunk" => 8,
        "path" | "residential" => 13,
        "track" => 14,
        _ => 12,
    };
    if is_link {
        min_zoom = min_zoom.max(13);
    }
    Some(NamedRoad {
        name,
        class,
        min_zoom,
        length_m: feature.length_m,
    })
}

fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let stdout = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {:?}", path))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout.with_filter(filter()))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };
    let feature_count = match args.next() {
        Some(count) => count
            .parse::<u64>()
            .with_context(|| format!("Invalid feature count '{}'", count))?,
        None => DEFAULT_FEATURE_COUNT,
    };

    let _log_guard = init_logging(&config.log)?;
    tracing::info!("Starting tilepipe demo with {} features", feature_count);

    let stats = Stats::new();
    let read = config.stage("read");
    let classify_settings = config.stage("classify");
    let merge = config.stage("merge");

    let next_id = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let merged: Arc<Mutex<HashMap<(String, &'static str), (u8, f64, u64)>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let merged_sink = merged.clone();

    let pipeline = config
        .builder(stats.clone())
        .from_generator("read", read.threads, move |emit| {
            loop {
                let id = next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if id >= feature_count {
                    return Ok(());
                }
                emit.emit(synthesize(id))?;
            }
        })
        .add_buffer("read_queue", read.queue_capacity, read.batch_size)
        .add_worker("classify", classify_settings.threads, |next, emit| {
            for feature in next {
                let id = feature.id;
                match classify(feature) {
                    Some(road) => emit.emit(road)?,
                    None => tracing::trace!("Skipping unnamed feature {}", id),
                }
            }
            Ok(())
        })
        .add_buffer(
            "classify_queue",
            classify_settings.queue_capacity,
            classify_settings.batch_size,
        )
        .sink_to("merge", merge.threads, move |next| {
            let mut local: HashMap<(String, &'static str), (u8, f64, u64)> = HashMap::new();
            for road in next {
                let entry = local
                    .entry((road.name, road.class))
                    .or_insert((road.min_zoom, 0.0, 0));
                entry.0 = entry.0.min(road.min_zoom);
                entry.1 += road.length_m;
                entry.2 += 1;
            }
            let mut merged = merged_sink
                .lock()
                .map_err(|_| anyhow::anyhow!("merge table lock poisoned"))?;
            for (key, (zoom, length, count)) in local {
                let entry = merged.entry(key).or_insert((zoom, 0.0, 0));
                entry.0 = entry.0.min(zoom);
                entry.1 += length;
                entry.2 += count;
            }
            Ok(())
        });

    let progress = ProgressLogger::new("roads", stats.clone());
    let result = pipeline.await_and_log(&progress, config.log_interval());

    if let Some(path) = &config.stats_output {
        stats.write_json(path)?;
    }
    result?;

    let merged = merged
        .lock()
        .map_err(|_| anyhow::anyhow!("merge table lock poisoned"))?;
    let segments: u64 = merged.values().map(|(_, _, count)| count).sum();
    tracing::info!(
        "Merged {} named segments into {} roads",
        segments,
        merged.len()
    );

    let mut longest: Vec<_> = merged.iter().collect();
    longest.sort_by(|a, b| b.1 .1.total_cmp(&a.1 .1));
    for ((name, class), (zoom, length, count)) in longest.into_iter().take(5) {
        tracing::info!(
            "{} ({}, z{}+): {:.1} km from {} segments",
            name,
            class,
            zoom,
            length / 1000.0,
            count
        );
    }

    Ok(())
}
