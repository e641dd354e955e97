// MIT License - Copyright (c) 2026 Peter Wright
// Read pool controller state and schedules over an RS-485 adapter
//
// cargo run --example pentair_pool -- /dev/ttyUSB0

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use homebus_bridge::pentair::devices::controller::NUM_SCHEDULES;
use homebus_bridge::pentair::devices::{Controller, IntelliChlor, ScheduleKind, CONTROLLER_ADDRESS};
use homebus_bridge::{GatewayEvent, PentairBridge, PentairConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = std::env::args().nth(1).unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let bridge = PentairBridge::new(PentairConfig::builder().serial(port).build());
    let controller = Arc::new(Controller::new(CONTROLLER_ADDRESS));
    let chlorinator = Arc::new(IntelliChlor::new());
    bridge.register(controller.clone());
    bridge.register(chlorinator.clone());
    let mut events = bridge.subscribe();
    bridge.connect().await.context("Failed to open the Pentair bus")?;

    let bus = bridge.bus();
    let (major, minor) = controller.request_sw_version(bus).await?;
    info!("Controller software {major}.{minor}");

    let heat = controller.request_heat(bus).await?;
    info!(
        "Pool {}F (set {}, {}), spa {}F (set {}, {})",
        heat.pool_temp,
        heat.pool_setpoint,
        heat.pool_mode.as_str(),
        heat.spa_temp,
        heat.spa_setpoint,
        heat.spa_mode.as_str()
    );

    for id in 1..=NUM_SCHEDULES {
        match controller.request_schedule(bus, id).await {
            Ok(s) if s.kind == ScheduleKind::None => {}
            Ok(s) => info!(
                "Schedule {}: {} circuit {} {:02}:{:02}-{:02}:{:02}",
                s.id,
                s.kind.as_str(),
                s.circuit,
                s.start / 60,
                s.start % 60,
                s.end / 60,
                s.end % 60
            ),
            Err(e) => warn!("Schedule {id}: {e}"),
        }
    }

    match chlorinator.request_version(bus).await {
        Ok((version, name)) => info!("Chlorinator {name} version {version}"),
        Err(e) => warn!("No chlorinator answered: {e}"),
    }

    // Follow status broadcasts until interrupted
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(GatewayEvent::PentairUpdate(update)) => info!("{:?}", update),
                Ok(_) => {}
                Err(RecvError::Closed) => break,
                Err(e) => warn!("Event stream: {e}"),
            },
        }
    }

    bridge.disconnect().await;
    Ok(())
}
