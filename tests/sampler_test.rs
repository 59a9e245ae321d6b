//! Job and camera sampling driven tick by tick.

mod common;

use common::harness::test_config;
use common::LinkHarness;
use httpmock::prelude::*;
use printer_cloud_link::config::{CameraConfig, LinkConfig, SamplerConfig};
use printer_cloud_link::devices::{Destination, FileStorage};
use printer_cloud_link::sampler::Sampler;
use std::time::Duration;

fn sampler_config(base_url: &str, cameras: Vec<CameraConfig>) -> LinkConfig {
    LinkConfig {
        sampler: SamplerConfig {
            tick_ms: 1000,
            cameras,
        },
        ..test_config(base_url)
    }
}

fn camera(server: &MockServer, path: &str, interval_secs: u64, label: &str) -> CameraConfig {
    CameraConfig {
        snapshot_url: server.url(path),
        interval_secs,
        label: Some(label.to_string()),
    }
}

#[tokio::test]
async fn test_new_job_posts_gcode_and_snapshots() {
    let cameras = MockServer::start_async().await;
    cameras
        .mock_async(|when, then| {
            when.method(GET).path("/cam1");
            then.status(200).body(vec![0xff, 0xd8, 0xff, 0xe0]);
        })
        .await;
    cameras
        .mock_async(|when, then| {
            when.method(GET).path("/cam2");
            then.status(200).body(vec![0xff, 0xd8]);
        })
        .await;

    let config = sampler_config(
        "http://127.0.0.1:9",
        vec![
            camera(&cameras, "/cam1", 1, "primary"),
            camera(&cameras, "/cam2", 2, "secondary"),
        ],
    );
    let harness = LinkHarness::new(config.clone(), Duration::from_millis(50));
    harness
        .storage
        .add_file(Destination::Local, "benchy.gcode", b"G28\nG1 Z5\n".to_vec())
        .await
        .unwrap();
    let mut sampler = Sampler::new(config, harness.telemetry.clone());

    let report = sampler.tick().await;
    assert!(report.ready);
    assert!(!report.new_job);
    assert!(report.snapshots.is_empty());

    harness.printer.set_job_active(true);
    let report = sampler.tick().await;
    assert!(report.new_job);
    assert_eq!(report.snapshots, vec!["benchy-0-cam1.jpg"]);
    assert_eq!(harness.uploads.gcode(), vec![("benchy.gcode".to_string(), b"G28\nG1 Z5\n".to_vec())]);
    assert_eq!(harness.printer.calls().last().map(String::as_str), Some("commands:M221"));

    let report = sampler.tick().await;
    assert!(!report.new_job);
    assert_eq!(report.snapshots, vec!["benchy-1-cam1.jpg", "benchy-2-cam2.jpg"]);
    assert_eq!(
        harness.uploads.images()[2],
        ("benchy-2-cam2.jpg".to_string(), "secondary".to_string(), 2)
    );
    assert_eq!(harness.state.images_sent(), 3);
    assert_eq!(harness.uploads.gcode().len(), 1);

    harness.printer.set_job_active(false);
    sampler.tick().await;
    assert_eq!(sampler.snapshot_count(), 0);

    harness.printer.set_job_active(true);
    let report = sampler.tick().await;
    assert!(report.new_job);
    assert_eq!(report.snapshots, vec!["benchy-0-cam1.jpg"]);
    assert_eq!(harness.uploads.gcode().len(), 2);
}

#[tokio::test]
async fn test_failed_snapshot_is_not_posted() {
    let cameras = MockServer::start_async().await;
    cameras
        .mock_async(|when, then| {
            when.method(GET).path("/cam1");
            then.status(404);
        })
        .await;

    let config = sampler_config("http://127.0.0.1:9", vec![camera(&cameras, "/cam1", 1, "primary")]);
    let harness = LinkHarness::new(config.clone(), Duration::from_millis(50));
    let mut sampler = Sampler::new(config, harness.telemetry.clone());

    harness.printer.set_job_active(true);
    let report = sampler.tick().await;
    assert!(report.new_job);
    assert!(report.snapshots.is_empty());
    assert!(harness.uploads.images().is_empty());
    // The job file is not in storage, so there is nothing to post.
    assert!(harness.uploads.gcode().is_empty());
}

#[tokio::test]
async fn test_not_ready_skips_tick() {
    let mut config = sampler_config("http://127.0.0.1:9", Vec::new());
    config.auth_token = None;
    let harness = LinkHarness::new(config.clone(), Duration::from_millis(50));
    let mut sampler = Sampler::new(config, harness.telemetry.clone());

    harness.printer.set_job_active(true);
    let report = sampler.tick().await;
    assert!(!report.ready);
    assert!(!report.new_job);
    assert!(harness.printer.calls().is_empty());
}

#[tokio::test]
async fn test_run_returns_when_already_shut_down() {
    let config = sampler_config("http://127.0.0.1:9", Vec::new());
    let harness = LinkHarness::new(config.clone(), Duration::from_millis(50));
    harness
        .storage
        .add_file(Destination::Local, "benchy.gcode", b"G28\n".to_vec())
        .await
        .unwrap();
    harness.printer.set_job_active(true);

    let shutdown = harness.shutdown_handle();
    shutdown.shutdown();

    let sampler = Sampler::new(config, harness.telemetry.clone());
    tokio::time::timeout(Duration::from_secs(1), sampler.run(shutdown))
        .await
        .expect("sampler stops without ticking");
    assert!(harness.uploads.gcode().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_later_shutdown() {
    let config = sampler_config("http://127.0.0.1:9", Vec::new());
    let harness = LinkHarness::new(config.clone(), Duration::from_millis(50));
    let shutdown = harness.shutdown_handle();

    let sampler = Sampler::new(config, harness.telemetry.clone());
    let task = tokio::spawn(sampler.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.shutdown();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("sampler stops after shutdown")
        .unwrap();
}
