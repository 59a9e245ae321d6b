use anyhow::Context;
use printer_cloud_link::cloud::CloudApi;
use printer_cloud_link::devices::mock::{MemoryStorage, SimulatedPrinter};
use printer_cloud_link::logging;
use printer_cloud_link::sampler::Sampler;
use printer_cloud_link::{CloudLink, LinkConfig};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => LinkConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => LinkConfig::default(),
    };
    config.apply_env();

    logging::init(&config.log_filter);
    config.validate().context("invalid configuration")?;

    info!(
        base_url = %config.base_url(),
        setup_complete = config.is_setup_complete(),
        "Starting Printer Cloud Link"
    );
    if config.log_config {
        info!("Configuration: {}", serde_json::to_string_pretty(&redacted(&config))?);
    }

    let printer = Arc::new(SimulatedPrinter::new());
    let storage = Arc::new(MemoryStorage::new());
    let cloud = Arc::new(CloudApi::new(config.clone()));

    if let Some(token) = config.token() {
        let check = cloud.test_auth_token(token).await;
        info!(valid = check.valid, "{}", check.message);
    }

    let link = CloudLink::new(config.clone(), printer, storage, cloud);
    let shutdown = link.shutdown_handle();

    let supervisor = link.spawn();
    let sampler = Sampler::new(config, link.telemetry().clone());
    let sampler = tokio::spawn(sampler.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");
    shutdown.shutdown();

    for (name, task) in [("supervisor", supervisor), ("sampler", sampler)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!(status = ?link.state().status(), "Stopped");
    Ok(())
}

fn redacted(config: &LinkConfig) -> LinkConfig {
    let mut config = config.clone();
    config.auth_token = config.auth_token.as_deref().map(logging::redact_token);
    config
}
