// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use homebus_bridge::cgate::TreeEntry;
use homebus_bridge::pentair::devices::controller::{NUM_CIRCUITS, NUM_SCHEDULES};
use homebus_bridge::pentair::devices::{
    Controller, DeviceKind, INTELLIFLO_FIRST_ADDRESS, INTELLIFLO_LAST_ADDRESS, IntelliChlor, IntelliFlo, PentairDevice,
};
use homebus_bridge::{
    CGateConfig, CGateSession, GatewayEvent, Link, PentairBridge, PentairConfig, PentairUpdate, ReconnectPolicy,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "homebus2mqtt")]
#[command(about = "Bridge between C-Gate / Pentair pool equipment and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    mqtt: MqttToml,
    #[serde(default)]
    cgate: Option<CGateToml>,
    #[serde(default)]
    pentair: Option<PentairToml>,
}

#[derive(Debug, Deserialize)]
struct CGateToml {
    host: String,
    #[serde(default = "default_command_port")]
    command_port: u16,
    #[serde(default = "default_event_port")]
    event_port: u16,
    #[serde(default = "default_status_change_port")]
    status_change_port: u16,
    #[serde(default = "default_true")]
    event_channels: bool,
    #[serde(default = "default_response_timeout")]
    response_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval")]
    keepalive_interval_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    /// Project to select with `project use` after connecting
    #[serde(default)]
    project: Option<String>,
    /// Networks (e.g. "//HOME/254") whose tree is loaded after connecting
    #[serde(default)]
    networks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PentairToml {
    /// IP-to-RS485 bridge host; ignored when `serial` is set
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_pentair_port")]
    port: u16,
    /// Serial device path, e.g. /dev/ttyUSB0
    #[serde(default)]
    serial: Option<String>,
    #[serde(default = "default_source_address")]
    source_address: u8,
    #[serde(default = "default_true")]
    controller: bool,
    #[serde(default = "default_controller_address")]
    controller_address: u8,
    /// IntelliFlo pump addresses (0x60-0x6F)
    #[serde(default)]
    pumps: Vec<u8>,
    #[serde(default)]
    intellichlor: bool,
    #[serde(default = "default_pump_poll_interval")]
    pump_poll_interval_ms: u64,
    #[serde(default = "default_pentair_response_timeout")]
    response_timeout_ms: u64,
    #[serde(default = "default_write_retries")]
    write_retries: u32,
    #[serde(default = "default_true")]
    discovery: bool,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_command_port() -> u16 {
    20023
}
fn default_event_port() -> u16 {
    20024
}
fn default_status_change_port() -> u16 {
    20025
}
fn default_response_timeout() -> u64 {
    10000
}
fn default_keepalive_interval() -> u64 {
    10000
}
fn default_reconnect_delay() -> u64 {
    1000
}
fn default_pentair_port() -> u16 {
    10000
}
fn default_source_address() -> u8 {
    0x22
}
fn default_controller_address() -> u8 {
    0x10
}
fn default_pump_poll_interval() -> u64 {
    10000
}
fn default_pentair_response_timeout() -> u64 {
    1000
}
fn default_write_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
}

fn default_client_id() -> String {
    "homebus-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "homebus/cmd".to_string()
}
fn default_publish_topic() -> String {
    "homebus".to_string()
}

fn reconnect_policy(delay_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay_ms: delay_ms,
        ..ReconnectPolicy::default()
    }
}

fn build_cgate_config(toml: &CGateToml) -> CGateConfig {
    CGateConfig::builder()
        .host(&toml.host)
        .command_port(toml.command_port)
        .event_port(toml.event_port)
        .status_change_port(toml.status_change_port)
        .enable_event_channels(toml.event_channels)
        .response_timeout_ms(toml.response_timeout_ms)
        .keepalive_interval_ms(toml.keepalive_interval_ms)
        .reconnect(reconnect_policy(toml.reconnect_delay_ms))
        .build()
}

fn build_pentair_config(toml: &PentairToml) -> Result<PentairConfig> {
    let builder = match (&toml.serial, &toml.host) {
        (Some(path), _) => PentairConfig::builder().serial(path),
        (None, Some(host)) => PentairConfig::builder().tcp(host, toml.port),
        (None, None) => anyhow::bail!("[pentair] needs either host or serial"),
    };
    if let Some(pump) = toml
        .pumps
        .iter()
        .find(|a| !(INTELLIFLO_FIRST_ADDRESS..=INTELLIFLO_LAST_ADDRESS).contains(*a))
    {
        anyhow::bail!("Invalid IntelliFlo address {pump:#04x} (must be 0x60-0x6F)");
    }
    Ok(builder
        .source_address(toml.source_address)
        .response_timeout_ms(toml.response_timeout_ms)
        .write_retries(toml.write_retries)
        .pump_poll_interval_ms(toml.pump_poll_interval_ms)
        .discovery_enabled(toml.discovery)
        .reconnect(reconnect_policy(toml.reconnect_delay_ms))
        .build())
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Everything the MQTT side talks to.
struct Gateway {
    cgate: Option<CGateSession>,
    cgate_project: Option<String>,
    cgate_networks: Vec<String>,
    pentair: Option<PentairBridge>,
    controller: Option<Arc<Controller>>,
    pumps: HashMap<u8, Arc<IntelliFlo>>,
    chlorinator: Option<Arc<IntelliChlor>>,
}

fn build_gateway(config: &Config) -> Result<Gateway> {
    if config.cgate.is_none() && config.pentair.is_none() {
        anyhow::bail!("Nothing to bridge: configure [cgate] and/or [pentair]");
    }

    let mut gateway = Gateway {
        cgate: config.cgate.as_ref().map(|c| CGateSession::new(build_cgate_config(c))),
        cgate_project: config.cgate.as_ref().and_then(|c| c.project.clone()),
        cgate_networks: config.cgate.as_ref().map(|c| c.networks.clone()).unwrap_or_default(),
        pentair: None,
        controller: None,
        pumps: HashMap::new(),
        chlorinator: None,
    };

    if let Some(toml) = &config.pentair {
        let bridge = PentairBridge::new(build_pentair_config(toml)?);
        if toml.controller {
            let controller = Arc::new(Controller::new(toml.controller_address));
            bridge.register(controller.clone());
            gateway.controller = Some(controller);
        }
        for &address in &toml.pumps {
            let pump = Arc::new(IntelliFlo::new(address));
            bridge.register(pump.clone());
            gateway.pumps.insert(address, pump);
        }
        if toml.intellichlor {
            let chlorinator = Arc::new(IntelliChlor::new());
            bridge.register(chlorinator.clone());
            gateway.chlorinator = Some(chlorinator);
        }
        gateway.pentair = Some(bridge);
    }

    Ok(gateway)
}

/// Retry `connect` with exponential backoff while the error is transient.
async fn connect_retrying<F, Fut>(name: &str, base_delay_ms: u64, mut connect: F) -> homebus_bridge::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = homebus_bridge::Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        match connect().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                let delay_ms = base_delay_ms * (1u64 << (attempt - 1).min(4));
                warn!(
                    "{name}: connection attempt {attempt} failed ({e}), retrying in {:.1}s...",
                    delay_ms as f64 / 1000.0
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn connect_gateway(gateway: &Gateway, config: &Config) -> Result<()> {
    if let (Some(session), Some(toml)) = (&gateway.cgate, &config.cgate) {
        connect_retrying("C-Gate", toml.reconnect_delay_ms, || session.connect())
            .await
            .context("Failed to connect to C-Gate")?;
        if let Some(project) = &gateway.cgate_project {
            session.use_project(project).await.context("Failed to select C-Gate project")?;
        }
        for address in &gateway.cgate_networks {
            match session.resolve_network(address).await {
                Ok(network) => match session.tree(&network).await {
                    Ok(entries) => info!("Loaded {} objects from {address}", entries.len()),
                    Err(e) => warn!("Failed to load tree of {address}: {e}"),
                },
                Err(e) => warn!("Invalid network {address}: {e}"),
            }
        }
    }

    if let (Some(bridge), Some(toml)) = (&gateway.pentair, &config.pentair) {
        connect_retrying("Pentair", toml.reconnect_delay_ms, || bridge.connect())
            .await
            .context("Failed to connect to the Pentair bus")?;
        if let Some(controller) = &gateway.controller {
            match controller.request_sw_version(bridge.bus()).await {
                Ok((major, minor)) => info!("Pentair controller software {major}.{minor}"),
                Err(e) => warn!("Controller version request failed: {e}"),
            }
            if let Err(e) = controller.request_heat(bridge.bus()).await {
                warn!("Controller heat request failed: {e}");
            }
            // Replies are published through the event stream
            for id in 1..=NUM_SCHEDULES {
                if let Err(e) = controller.request_schedule(bridge.bus(), id).await {
                    warn!("Schedule {id} request failed: {e}");
                }
            }
        }
    }

    Ok(())
}

async fn disconnect_gateway(gateway: &Gateway) {
    if let Some(session) = &gateway.cgate {
        session.close().await;
    }
    if let Some(bridge) = &gateway.pentair {
        bridge.disconnect().await;
    }
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages all share the flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttLinkEvent {
    now: u64,
    op: String,
    link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Serialize)]
struct MqttCGateEvent {
    now: u64,
    op: String,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    payload: String,
}

#[derive(Serialize)]
struct MqttGroupStatus {
    now: u64,
    op: String,
    application: String,
    action: String,
    group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "rampSecs")]
    ramp_secs: Option<u32>,
}

#[derive(Serialize)]
struct MqttPentairEvent {
    now: u64,
    op: String,
    address: u8,
    state: Value,
}

#[derive(Serialize)]
struct MqttDiscovery {
    now: u64,
    op: String,
    address: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    #[allow(dead_code)]
    op_id: Option<String>,
    /// C-Gate group address, e.g. //HOME/254/56/1
    #[serde(default)]
    group: Option<String>,
    /// C-Gate network address, e.g. //HOME/254
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    level: Option<u8>,
    #[serde(default, rename = "rampSecs")]
    ramp_secs: Option<u32>,
    #[serde(default)]
    circuit: Option<u8>,
    #[serde(default)]
    on: Option<bool>,
    /// "pool" or "spa"
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    temp: Option<u8>,
    #[serde(default)]
    pump: Option<u8>,
    #[serde(default)]
    percent: Option<u8>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_cmd_ack(client: &AsyncClient, topic: &str, success: bool, src: Option<Value>, data: Option<Value>) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_link_event(client: &AsyncClient, topic: &str, op: &str, link: Link, reason: Option<String>) {
    let msg = MqttLinkEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
        link: link.to_string(),
        reason,
    };
    publish_json(client, topic, &msg, false).await;
}

/// MQTT op name and state object for a Pentair device update.
fn pentair_state(update: &PentairUpdate) -> (&'static str, Value) {
    match update {
        PentairUpdate::ControllerStatus { status, .. } => (
            "CONTROLLER_STATUS",
            json!({
                "time": format!("{:02}:{:02}", status.hour, status.minute),
                "pool": status.pool_on(),
                "spa": status.spa_on(),
                "circuits": (1..=NUM_CIRCUITS).filter(|c| status.circuits.is_on(*c)).collect::<Vec<u8>>(),
                "celsius": status.celsius,
                "serviceMode": status.service_mode,
                "heater": status.heater_on(),
                "solar": status.solar_on(),
                "poolTemp": status.pool_temp,
                "spaTemp": status.spa_temp,
                "airTemp": status.air_temp,
                "solarTemp": status.solar_temp,
            }),
        ),
        PentairUpdate::HeatStatus { heat, .. } => (
            "HEAT_STATUS",
            json!({
                "poolTemp": heat.pool_temp,
                "spaTemp": heat.spa_temp,
                "airTemp": heat.air_temp,
                "poolSetpoint": heat.pool_setpoint,
                "spaSetpoint": heat.spa_setpoint,
                "poolHeatMode": heat.pool_mode.as_str(),
                "spaHeatMode": heat.spa_mode.as_str(),
            }),
        ),
        PentairUpdate::Clock { clock, .. } => (
            "CONTROLLER_CLOCK",
            json!({ "time": clock.to_datetime().map(|dt| dt.to_string()) }),
        ),
        PentairUpdate::CircuitName {
            circuit, function, name, ..
        } => (
            "CIRCUIT_NAME",
            json!({ "circuit": circuit, "function": function, "name": name }),
        ),
        PentairUpdate::SoftwareVersion { major, minor, .. } => {
            ("SOFTWARE_VERSION", json!({ "version": format!("{major}.{minor}") }))
        }
        PentairUpdate::Schedule { schedule, .. } => (
            "SCHEDULE",
            json!({
                "id": schedule.id,
                "type": schedule.kind.as_str(),
                "circuit": schedule.circuit,
                "start": schedule.start,
                "end": schedule.end,
                "days": schedule.days.bits(),
            }),
        ),
        PentairUpdate::Ack { action, .. } => ("ACK", json!({ "action": action })),
        PentairUpdate::PumpStatus { status, .. } => (
            "PUMP_STATUS",
            json!({
                "run": status.running,
                "mode": status.mode,
                "driveState": status.drive_state,
                "watts": status.watts,
                "rpm": status.rpm,
                "gpm": status.gpm,
                "ppc": status.ppc,
                "error": status.error,
                "timer": status.timer,
            }),
        ),
        PentairUpdate::ChlorinatorStatus { status, .. } => (
            "CHLORINATOR_STATUS",
            json!({
                "saltPpm": status.salt_ppm,
                "status": status.status,
                "alarms": status.alarms().bits(),
                "generatePercent": status.generate_percent,
            }),
        ),
        PentairUpdate::ChlorinatorVersion { version, name, .. } => {
            ("CHLORINATOR_VERSION", json!({ "version": version, "name": name }))
        }
    }
}

fn tree_entry_json(network: &str, entry: &TreeEntry) -> Value {
    match entry {
        TreeEntry::Group {
            application,
            group,
            level,
        } => json!({ "group": format!("{network}/{application}/{group}"), "level": level }),
        TreeEntry::Unit { unit, unit_type } => {
            json!({ "unit": format!("{network}/p/{unit}"), "type": unit_type })
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway events → MQTT
// ---------------------------------------------------------------------------

/// Drain a broadcast receiver into `handle` until the channel closes.
async fn forward_events<T, F, Fut>(mut rx: broadcast::Receiver<T>, name: &'static str, mut handle: F)
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        match rx.recv().await {
            Ok(event) => handle(event).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("{name} receiver lagged, missed {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("{name} channel closed");
                break;
            }
        }
    }
}

async fn handle_gateway_event(event: GatewayEvent, client: &AsyncClient, topic: &str) {
    match event {
        GatewayEvent::Connected { link } => {
            info!("{link}: connected");
            publish_link_event(client, topic, "CONNECTED", link, None).await;
        }
        GatewayEvent::Disconnected { link } => {
            warn!("{link}: disconnected");
            publish_link_event(client, topic, "DISCONNECTED", link, None).await;
        }
        GatewayEvent::ConnectionFailed { link, reason } => {
            error!("{link}: gave up reconnecting: {reason}");
            publish_link_event(client, topic, "CONNECTION_FAILED", link, Some(reason)).await;
        }
        GatewayEvent::PentairUpdate(PentairUpdate::Ack { address, action }) => {
            debug!("Ack from {address:02X} for action {action:02X}");
        }
        GatewayEvent::PentairUpdate(update) => {
            let (op, state) = pentair_state(&update);
            let msg = MqttPentairEvent {
                now: now_epoch_ms(),
                op: op.to_string(),
                address: update.address(),
                state,
            };
            publish_json(client, topic, &msg, false).await;
        }
        GatewayEvent::DiscoveryCandidate { address } => {
            let kind = DeviceKind::from_address(address);
            info!("Unregistered Pentair device at {address:02X} ({kind:?})");
            let msg = MqttDiscovery {
                now: now_epoch_ms(),
                op: "PENTAIR_DISCOVERY".to_string(),
                address,
                kind: kind.map(|k| k.to_string()),
            };
            publish_json(client, topic, &msg, false).await;
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

/// Await a gateway operation and log the result. Returns the value on success.
async fn exec_cmd<T, E: std::fmt::Display>(
    op: &str,
    label: &str,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Option<T> {
    match fut.await {
        Ok(value) => {
            info!("{op} {label}: success");
            Some(value)
        }
        Err(e) => {
            error!("{op} {label} failed: {e}");
            None
        }
    }
}

async fn group_command(op: &str, cmd: &MqttCommand, gateway: &Gateway) -> (bool, Option<Value>) {
    let Some(session) = &gateway.cgate else {
        warn!("{op}: no C-Gate session configured");
        return (false, None);
    };
    let Some(address) = cmd.group.as_deref() else {
        warn!("{op}: missing group");
        return (false, None);
    };
    let Some(group) = exec_cmd(op, address, session.resolve_group(address)).await else {
        return (false, None);
    };

    let result = match op {
        "GROUP_ON" => exec_cmd(op, address, session.group_on(&group)).await.map(|_| None),
        "GROUP_OFF" => exec_cmd(op, address, session.group_off(&group)).await.map(|_| None),
        "GROUP_RAMP" => {
            let Some(level) = cmd.level else {
                warn!("{op}: missing level");
                return (false, None);
            };
            let ramp = session.group_ramp(&group, level, cmd.ramp_secs.unwrap_or(0));
            exec_cmd(op, address, ramp).await.map(|_| None)
        }
        _ => exec_cmd(op, address, session.group_level(&group))
            .await
            .map(|level| Some(json!({ "group": address, "level": level }))),
    };

    match result {
        Some(data) => (true, data),
        None => (false, None),
    }
}

async fn tree_command(cmd: &MqttCommand, gateway: &Gateway) -> (bool, Option<Value>) {
    let Some(session) = &gateway.cgate else {
        warn!("TREE: no C-Gate session configured");
        return (false, None);
    };
    let Some(address) = cmd.network.as_deref() else {
        warn!("TREE: missing network");
        return (false, None);
    };
    let Some(network) = exec_cmd("TREE", address, session.resolve_network(address)).await else {
        return (false, None);
    };
    match exec_cmd("TREE", address, session.tree(&network)).await {
        Some(entries) => {
            let objects: Vec<Value> = entries.iter().map(|e| tree_entry_json(address, e)).collect();
            (true, Some(json!({ "network": address, "objects": objects })))
        }
        None => (false, None),
    }
}

async fn pentair_command(op: &str, cmd: &MqttCommand, gateway: &Gateway) -> (bool, Option<Value>) {
    let Some(bridge) = &gateway.pentair else {
        warn!("{op}: no Pentair bus configured");
        return (false, None);
    };
    let bus = bridge.bus();

    let done = match op {
        "CIRCUIT" => {
            let (Some(controller), Some(circuit), Some(on)) = (&gateway.controller, cmd.circuit, cmd.on) else {
                warn!("{op}: needs a controller, circuit and on");
                return (false, None);
            };
            let label = format!("circuit {circuit}");
            exec_cmd(op, &label, controller.set_circuit(bus, circuit, on)).await
        }
        "SETPOINT" => {
            let pool = match cmd.body.as_deref() {
                Some("pool") => true,
                Some("spa") => false,
                other => {
                    warn!("{op}: body must be pool or spa, got {other:?}");
                    return (false, None);
                }
            };
            let (Some(controller), Some(temp)) = (&gateway.controller, cmd.temp) else {
                warn!("{op}: needs a controller and temp");
                return (false, None);
            };
            let label = format!("{} {temp}", if pool { "pool" } else { "spa" });
            exec_cmd(op, &label, controller.set_setpoint(bus, pool, temp)).await
        }
        "PUMP_RUN" => {
            let (Some(pump), Some(on)) = (cmd.pump.and_then(|a| gateway.pumps.get(&a)), cmd.on) else {
                warn!("{op}: needs a configured pump and on");
                return (false, None);
            };
            let label = format!("pump {:02X}", pump.address());
            exec_cmd(op, &label, pump.set_run(bus, on)).await
        }
        _ => {
            let (Some(chlorinator), Some(percent)) = (&gateway.chlorinator, cmd.percent) else {
                warn!("{op}: needs a chlorinator and percent");
                return (false, None);
            };
            exec_cmd(op, &format!("{percent}%"), chlorinator.set_generate(bus, percent)).await
        }
    };
    (done.is_some(), None)
}

async fn handle_command(payload_str: &str, cmd: MqttCommand, client: &AsyncClient, topic: &str, gateway: &Gateway) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<Value>(payload_str).ok();

    let (success, data) = match cmd.op.as_str() {
        "PING" => {
            info!("Command: PING");
            (true, None)
        }
        op @ ("GROUP_ON" | "GROUP_OFF" | "GROUP_RAMP" | "GROUP_LEVEL") => group_command(op, &cmd, gateway).await,
        "TREE" => tree_command(&cmd, gateway).await,
        op @ ("CIRCUIT" | "SETPOINT" | "PUMP_RUN" | "CHLOR_OUTPUT") => pentair_command(op, &cmd, gateway).await,
        other => {
            warn!("Unknown command: {other}");
            (false, None)
        }
    };
    publish_cmd_ack(client, topic, success, src_json, data).await;
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=homebus_bridge=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    let (mut mqtt_host, mut mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let gateway = Arc::new(build_gateway(&config)?);
        let publish_topic = config.mqtt.publish_topic.clone();
        let subscribe_topic = config.mqtt.subscribe_topic.clone();

        // Set up MQTT first so connection events are published
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        let mut handles = Vec::new();

        // Task: lifecycle and Pentair events
        let receivers = [
            gateway.cgate.as_ref().map(|s| s.subscribe()),
            gateway.pentair.as_ref().map(|b| b.subscribe()),
        ];
        for rx in receivers.into_iter().flatten() {
            let client = client.clone();
            let topic = publish_topic.clone();
            handles.push(tokio::spawn(forward_events(rx, "Gateway event", move |event| {
                let client = client.clone();
                let topic = topic.clone();
                async move { handle_gateway_event(event, &client, &topic).await }
            })));
        }

        // Tasks: C-Gate events and status changes
        if let Some(session) = &gateway.cgate {
            let client_events = client.clone();
            let topic_events = publish_topic.clone();
            handles.push(tokio::spawn(forward_events(
                session.subscribe_events(),
                "C-Gate event",
                move |event| {
                    let client = client_events.clone();
                    let topic = topic_events.clone();
                    async move {
                        let msg = MqttCGateEvent {
                            now: now_epoch_ms(),
                            op: "CGATE_EVENT".to_string(),
                            code: event.code,
                            timestamp: event.timestamp.map(|ts| ts.to_string()),
                            payload: event.payload,
                        };
                        publish_json(&client, &topic, &msg, false).await;
                    }
                },
            )));

            let client_changes = client.clone();
            let topic_changes = publish_topic.clone();
            handles.push(tokio::spawn(forward_events(
                session.subscribe_status_changes(),
                "C-Gate status change",
                move |change| {
                    let client = client_changes.clone();
                    let topic = topic_changes.clone();
                    async move {
                        debug!("Status change: {}", change.raw);
                        let msg = MqttGroupStatus {
                            now: now_epoch_ms(),
                            op: "GROUP_STATUS".to_string(),
                            application: change.application.clone(),
                            action: format!("{:?}", change.action).to_uppercase(),
                            group: change.address.clone(),
                            level: change.resulting_level(),
                            ramp_secs: change.ramp_secs,
                        };
                        publish_json(&client, &topic, &msg, false).await;
                    }
                },
            )));
        }

        // Task: MQTT event loop (receives messages, handles commands)
        let gateway_cmds = Arc::clone(&gateway);
        let client_cmds = client.clone();
        let topic_cmds = publish_topic.clone();
        let sub_topic = subscribe_topic.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not re-subscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    info!("MQTT command received: {payload}");
                                    handle_command(&payload, cmd, &client_cmds, &topic_cmds, &gateway_cmds).await;
                                }
                                Err(e) => {
                                    warn!("Failed to parse MQTT command: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));

        connect_gateway(&gateway, &config).await?;

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        for handle in &handles {
            handle.abort();
        }
        disconnect_gateway(&gateway).await;

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config).and_then(|new_config| {
            build_gateway(&new_config)?;
            let (host, port) = parse_mqtt_url(&new_config.mqtt.url)?;
            Ok((new_config, host, port))
        }) {
            Ok((new_config, host, port)) => {
                config = new_config;
                mqtt_host = host;
                mqtt_port = port;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(parse_mqtt_url("10.0.0.2:1884").unwrap(), ("10.0.0.2".to_string(), 1884));
        assert!(parse_mqtt_url("mqtt://broker.local").is_err());
    }

    #[tokio::test]
    async fn test_config_sections() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            url = "mqtt://localhost:1883"

            [cgate]
            host = "10.0.0.5"
            project = "HOME"
            networks = ["//HOME/254"]

            [pentair]
            host = "10.0.0.6"
            pumps = [96, 97]
            intellichlor = true
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.publish_topic, "homebus");
        let cgate = config.cgate.as_ref().unwrap();
        assert_eq!(cgate.command_port, 20023);
        assert!(cgate.event_channels);

        let pentair = config.pentair.as_ref().unwrap();
        assert_eq!(pentair.source_address, 0x22);
        let pentair_config = build_pentair_config(pentair).unwrap();
        assert_eq!(pentair_config.transport.describe(), "10.0.0.6:10000");

        let gateway = build_gateway(&config).unwrap();
        assert_eq!(gateway.pumps.len(), 2);
        assert!(gateway.controller.is_some());
        assert!(gateway.chlorinator.is_some());
        assert_eq!(gateway.pentair.as_ref().unwrap().devices().len(), 4);
    }

    #[test]
    fn test_config_rejects_bad_pentair_sections() {
        let no_transport: PentairToml = toml::from_str("pumps = []").unwrap();
        assert!(build_pentair_config(&no_transport).is_err());

        let bad_pump: PentairToml = toml::from_str("serial = \"/dev/ttyUSB0\"\npumps = [16]").unwrap();
        assert!(build_pentair_config(&bad_pump).is_err());
    }

    #[test]
    fn test_pentair_state_payloads() {
        let update = PentairUpdate::SoftwareVersion {
            address: 0x10,
            major: 2,
            minor: 10,
        };
        let (op, state) = pentair_state(&update);
        assert_eq!(op, "SOFTWARE_VERSION");
        assert_eq!(state["version"], "2.10");
    }

    #[test]
    fn test_tree_entry_json() {
        let entry = TreeEntry::Group {
            application: 56,
            group: 4,
            level: Some(128),
        };
        let value = tree_entry_json("//HOME/254", &entry);
        assert_eq!(value["group"], "//HOME/254/56/4");
        assert_eq!(value["level"], 128);
    }
}
