use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ergo_bridge::config::Config;
use ergo_bridge::daum::ErgoSession;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ergo_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting ergo-bridge v{}", env!("CARGO_PKG_VERSION"));

    // file -> env vars -> defaults
    let config = Config::load("config.toml");
    info!(
        "configuration: port={}, baud={}, mode={:?}, host_max_gear={}",
        config.serial.port.as_deref().unwrap_or("<auto>"),
        config.serial.baud_rate,
        config.session.mode,
        config.session.host_max_gear
    );

    let (session, handle) = ErgoSession::new(config);

    // downstream consumers (fitness profile, local UI) attach exactly like
    // this: subscribe to telemetry and events, issue setters on the handle
    let mut samples = handle.subscribe_samples();
    tokio::spawn(async move {
        while let Ok(sample) = samples.recv().await {
            info!(
                "telemetry: {}W {}rpm gear {} {:.1}km/h (program {})",
                sample.power, sample.rpm, sample.gear, sample.speed, sample.program
            );
        }
    });

    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("session event: {:?}", event);
        }
    });

    let session_task = tokio::spawn(session.run());

    signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    handle.stop();
    if let Err(e) = session_task.await {
        warn!("session task ended abnormally: {}", e);
    }

    info!("ergo-bridge stopped");
    Ok(())
}
