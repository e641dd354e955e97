// MIT License - Copyright (c) 2026 Peter Wright
// Switch a C-Bus lighting group through C-Gate and print status changes
//
// cargo run --example cgate_groups -- 192.168.1.20 //HOME/254/56/4

use anyhow::{Context, Result};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use homebus_bridge::{CGateConfig, CGateSession};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let address = args.next().unwrap_or_else(|| "//HOME/254/56/1".to_string());

    let session = CGateSession::new(CGateConfig::builder().host(host).build());
    let mut changes = session.subscribe_status_changes();
    session.connect().await.context("Failed to connect to C-Gate")?;

    for project in session.list_projects().await? {
        info!("Project {}", project.name());
    }

    let group = session.resolve_group(&address).await?;
    info!("{} is at level {}", address, session.group_level(&group).await?);

    session.group_ramp(&group, 128, 4).await?;
    info!("Ramping {} to 128 over 4s", address);

    // Show what C-Gate reports for a few seconds
    while let Ok(Ok(change)) = timeout(Duration::from_secs(5), changes.recv()).await {
        match change.resulting_level() {
            Some(level) => info!("{} -> {}", change.address, level),
            None => warn!("Unhandled status change: {}", change.raw),
        }
    }

    session.group_off(&group).await?;
    session.close().await;
    Ok(())
}
