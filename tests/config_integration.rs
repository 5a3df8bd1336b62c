//! Configuration files driving pipeline construction

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tilepipe::config::{LogFormat, StageSettings};
use tilepipe::{PipelineConfig, Stats, TilepipeError};

#[test]
fn test_save_and_load_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("pipeline.toml");

    let mut config = PipelineConfig::new();
    config.cancel_on_failure = true;
    config.stats_output = Some(dir.path().join("stats.json"));
    config.log.format = LogFormat::Compact;
    config.set_stage(
        "classify",
        StageSettings {
            threads: 6,
            queue_capacity: 2_000,
            batch_size: 200,
        },
    );
    config.save(&path).unwrap();

    let loaded = PipelineConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");

    assert!(matches!(
        PipelineConfig::load(&missing),
        Err(TilepipeError::Config(_))
    ));
    assert_eq!(PipelineConfig::load_or_default(&missing), PipelineConfig::default());
}

#[test]
fn test_invalid_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[defaults]\nbatch_size = 0\n").unwrap();

    let err = PipelineConfig::load(&path).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("bad.toml"));
    assert!(msg.contains("batch_size"));
}

#[test]
fn test_config_sizes_pipeline_and_writes_stats() {
    let dir = tempfile::tempdir().unwrap();
    let stats_path = dir.path().join("stats.json");
    let config = PipelineConfig::from_toml_str(&format!(
        r#"
        log_interval_secs = 1
        stats_output = {:?}

        [defaults]
        threads = 2
        queue_capacity = 64
        batch_size = 8

        [stages.read]
        threads = 1
        "#,
        stats_path.to_string_lossy()
    ))
    .unwrap();

    let stats = Stats::new();
    let read = config.stage("read");
    let sink = config.stage("count");
    let counted = Arc::new(AtomicU64::new(0));
    let counter = counted.clone();

    let pipeline = config
        .builder(stats.clone())
        .read_from_iter("read", 0..500u32)
        .add_buffer("numbers", read.queue_capacity, read.batch_size)
        .sink_to_consumer("count", sink.threads, move |_x| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    assert!(!pipeline.cancels_on_failure());

    pipeline
        .await_and_log(&|| {}, config.log_interval().min(Duration::from_millis(100)))
        .unwrap();
    stats.write_json(config.stats_output.as_ref().unwrap()).unwrap();

    assert_eq!(counted.load(Ordering::Relaxed), 500);
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&stats_path).unwrap()).unwrap();
    let stages = json["stages"].as_array().unwrap();
    let count = stages.iter().find(|s| s["name"] == "count").unwrap();
    assert_eq!(count["threads"], 2);
    assert_eq!(count["items_in"], 500);
}
