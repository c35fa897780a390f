use anyhow::Context;
use ista_meter_sync::sensors::EntityProjection;
use ista_meter_sync::update_coordinator::{RefreshError, UpdateCoordinator};
use ista_meter_sync::Settings;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ISTA meter sync");
    let settings = Settings::from_env().context("Invalid configuration")?;
    info!(
        country = %settings.credentials.country,
        username = %settings.credentials.username,
        interval_secs = settings.update_interval.as_secs(),
        "Loaded configuration"
    );

    let coordinator = UpdateCoordinator::initialize(
        &settings.countries,
        settings.credentials.clone(),
        settings.request_timeout,
    )
    .await
    .context("Setup failed")?;
    let snapshot = coordinator
        .snapshot()
        .context("Setup refresh produced no snapshot")?;

    // The entity set is fixed from here on.
    let mut projection = EntityProjection::new(&snapshot);
    info!(sensors = projection.sensors().len(), "Sensors registered");
    publish(&projection)?;

    let mut ticker = time::interval(settings.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // First tick is immediate; setup already refreshed.

    loop {
        ticker.tick().await;
        match coordinator.refresh().await {
            Ok(snapshot) => projection.apply(&snapshot),
            Err(RefreshError::Auth(reason)) => {
                error!(%reason, "Stored credentials are no longer valid");
                anyhow::bail!(
                    "Credentials rejected; update ISTA_USERNAME/ISTA_PASSWORD and restart"
                );
            }
            Err(err) => {
                warn!(error = %err, "Marking sensors unavailable until the next refresh");
                projection.mark_unavailable();
            }
        }
        publish(&projection)?;
    }
}

/// Emits one JSON line per sensor for the host to pick up.
fn publish(projection: &EntityProjection) -> anyhow::Result<()> {
    for state in projection.states() {
        println!("{}", serde_json::to_string(&state)?);
    }
    Ok(())
}
