// MIT License - Copyright (c) 2026 Peter Wright
// Pentair RS-485 bridge: transport, packet dispatch, request/response and pump polling

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, MissedTickBehavior};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, error, info, trace, warn};

use super::devices::{intelliflo, DeviceKind, PentairDevice};
use super::packet::Packet;
use super::parser::run_parser;
use super::registry::DeviceRegistry;
use crate::config::{PentairConfig, PentairTransport};
use crate::connection::{connect_tcp, reconnect_with_backoff, ConnectionState, FramingGuard};
use crate::error::{GatewayError, Result};
use crate::event::{event_channel, EventReceiver, EventSender, GatewayEvent, Link};

/// Pentair adapters always run 9600 8N1.
const BAUD_RATE: u32 = 9600;
const PACKET_QUEUE: usize = 64;

/// A byte stream carrying the bus: a TCP socket or a serial port.
pub trait BusStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BusStream for T {}

type BusReader = ReadHalf<Box<dyn BusStream>>;
type BusWriter = WriteHalf<Box<dyn BusStream>>;

async fn open_transport(config: &PentairConfig) -> Result<Box<dyn BusStream>> {
    match &config.transport {
        PentairTransport::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            let stream = connect_tcp(&addr, Duration::from_millis(config.connect_timeout_ms)).await?;
            Ok(Box::new(stream))
        }
        PentairTransport::Serial { path } => {
            debug!("Opening serial port {}", path);
            let port = tokio_serial::new(path, BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .open_native_async()
                .map_err(|e| GatewayError::ConnectFailed {
                    addr: path.clone(),
                    reason: e.to_string(),
                })?;
            Ok(Box::new(port))
        }
    }
}

/// A request waiting for a packet with `action` from `address`.
struct Waiter {
    address: u8,
    action: u8,
    tx: oneshot::Sender<Packet>,
}

/// The shared half of a bridge: what devices need to talk on the bus.
pub struct Bus {
    source_address: u8,
    write_retries: u32,
    response_timeout: Duration,
    discovery_enabled: bool,
    registry: DeviceRegistry,
    waiters: Mutex<Vec<Waiter>>,
    writer: tokio::sync::Mutex<Option<BusWriter>>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: EventSender,
}

impl Bus {
    fn new(config: &PentairConfig, event_tx: EventSender) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source_address: config.source_address,
            write_retries: config.write_retries.max(1),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            discovery_enabled: config.discovery_enabled,
            registry: DeviceRegistry::new(),
            waiters: Mutex::new(Vec::new()),
            writer: tokio::sync::Mutex::new(None),
            state_tx,
            event_tx,
        }
    }

    /// Address written as the source of our packets.
    pub fn source_address(&self) -> u8 {
        self.source_address
    }

    /// Tries per request, as configured.
    pub fn write_retries(&self) -> u32 {
        self.write_retries
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn waiters(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one packet without waiting for anything in return.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(GatewayError::NotConnected)?;
        trace!("Writing packet: {}", packet);
        writer.write_all(&packet.encode()).await.map_err(|e| {
            error!("Failed to write packet: {}", e);
            GatewayError::Io(e)
        })?;
        writer.flush().await?;
        Ok(())
    }

    /// Write `packet` and wait for a packet with `expected_action` from its
    /// destination. Each of the `retries` tries waits up to the response timeout.
    pub async fn request(&self, packet: Packet, expected_action: u8, retries: u32) -> Result<Packet> {
        let address = match &packet {
            Packet::Standard(p) => p.dest,
            Packet::IntelliChlor(p) => p.dest,
        };
        let tries = retries.max(1);

        for attempt in 1..=tries {
            let (tx, rx) = oneshot::channel();
            self.waiters().push(Waiter {
                address,
                action: expected_action,
                tx,
            });
            self.write_packet(&packet).await?;

            match timeout(self.response_timeout, rx).await {
                Ok(Ok(reply)) => {
                    trace!("Reply from {:02X}: {}", address, reply);
                    return Ok(reply);
                }
                Ok(Err(_)) => return Err(GatewayError::Disconnected),
                Err(_) => debug!(
                    "No {:02X} reply from {:02X} (try {}/{})",
                    expected_action, address, attempt, tries
                ),
            }
        }

        Err(GatewayError::CommandTimeout {
            command: packet.to_string(),
        })
    }

    /// Hand a received packet to its device, then to any waiting request.
    pub(crate) fn dispatch(&self, packet: Packet) {
        trace!("Bus packet: {}", packet);
        let address = packet.device_address();

        match self.registry.get(address) {
            Some(device) => {
                if let Some(update) = device.handle_packet(&packet) {
                    let _ = self.event_tx.send(GatewayEvent::PentairUpdate(update));
                }
            }
            None => {
                if self.discovery_enabled && address != self.source_address && self.registry.mark_seen(address) {
                    info!("Found unregistered device at {:02X}", address);
                    let _ = self.event_tx.send(GatewayEvent::DiscoveryCandidate { address });
                }
            }
        }

        let mut waiters = self.waiters();
        let mut i = 0;
        while i < waiters.len() {
            let waiter = &waiters[i];
            if waiter.address == address && waiter.action == packet.action() {
                let waiter = waiters.swap_remove(i);
                let _ = waiter.tx.send(packet.clone());
            } else if waiter.tx.is_closed() {
                waiters.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    async fn install(&self, stream: Box<dyn BusStream>) -> BusReader {
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected);
        let _ = self.event_tx.send(GatewayEvent::Connected { link: Link::PentairBus });
        reader
    }

    /// Drop the writer and fail every pending request.
    async fn release(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.waiters().clear();
        self.set_state(ConnectionState::Disconnected);
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the bus until shutdown, reconnecting after every failure.
async fn supervise(
    bus: Arc<Bus>,
    config: PentairConfig,
    mut reader: BusReader,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (packet_tx, mut packet_rx) = mpsc::channel(PACKET_QUEUE);
        let (failure_tx, failure_rx) = oneshot::channel();
        let reader_task = AbortOnDrop(tokio::spawn(run_parser(
            reader,
            packet_tx,
            FramingGuard::default(),
            move |e| {
                let _ = failure_tx.send(e);
            },
        )));

        let stopping = loop {
            tokio::select! {
                packet = packet_rx.recv() => match packet {
                    Some(packet) => bus.dispatch(packet),
                    None => break false,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break true;
                    }
                }
            }
        };
        drop(reader_task);
        bus.release().await;
        if stopping {
            debug!("{}: supervisor stopped", Link::PentairBus);
            return;
        }

        let reason = failure_rx.await.unwrap_or(GatewayError::Disconnected);
        warn!("{}: connection lost: {}", Link::PentairBus, reason);
        let _ = bus.event_tx.send(GatewayEvent::Disconnected { link: Link::PentairBus });

        bus.set_state(ConnectionState::Connecting);
        let reconnected = reconnect_with_backoff(Link::PentairBus, &config.reconnect, &mut shutdown_rx, || {
            open_transport(&config)
        })
        .await;
        let Some(stream) = reconnected else {
            if *shutdown_rx.borrow() {
                bus.set_state(ConnectionState::Disconnected);
            } else {
                bus.set_state(ConnectionState::Failed);
                let _ = bus.event_tx.send(GatewayEvent::ConnectionFailed {
                    link: Link::PentairBus,
                    reason: reason.to_string(),
                });
            }
            return;
        };
        reader = bus.install(stream).await;
    }
}

/// Poll every registered IntelliFlo pump, skipping ticks while disconnected.
async fn poll_pumps(bus: Arc<Bus>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !bus.is_connected() {
            continue;
        }
        let pumps: Vec<u8> = bus
            .registry
            .devices()
            .iter()
            .filter(|d| d.kind() == DeviceKind::IntelliFlo)
            .map(|d| d.address())
            .collect();
        for address in pumps {
            if let Err(e) = intelliflo::poll_pump(&bus, address).await {
                debug!("Polling pump {:02X} failed: {}", address, e);
            }
        }
    }
}

/// Connection to one Pentair RS-485 bus.
///
/// ```no_run
/// use std::sync::Arc;
/// use homebus_bridge::{PentairBridge, PentairConfig};
/// use homebus_bridge::pentair::devices::Controller;
///
/// # async fn run() -> homebus_bridge::Result<()> {
/// let bridge = PentairBridge::new(PentairConfig::builder().tcp("192.168.0.200", 10000).build());
/// let controller = Arc::new(Controller::new(0x10));
/// bridge.register(controller.clone());
/// bridge.connect().await?;
/// controller.set_circuit(bridge.bus(), 6, true).await?;
/// # Ok(())
/// # }
/// ```
pub struct PentairBridge {
    config: PentairConfig,
    bus: Arc<Bus>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl PentairBridge {
    pub fn new(config: PentairConfig) -> Self {
        let (event_tx, _) = event_channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus: Arc::new(Bus::new(&config, event_tx)),
            config,
            shutdown_tx,
            supervisor: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn source_address(&self) -> u8 {
        self.bus.source_address
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.event_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.bus.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.bus.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    /// Open the transport and start reading. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.stop_supervisor().await;
        self.shutdown_tx.send_replace(false);
        self.bus.set_state(ConnectionState::Connecting);

        let stream = match open_transport(&self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}: connect failed: {}", Link::PentairBus, e);
                self.bus.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        info!("{}: connected to {}", Link::PentairBus, self.config.transport.describe());

        let reader = self.bus.install(stream).await;
        let handle = tokio::spawn(supervise(
            self.bus.clone(),
            self.config.clone(),
            reader,
            self.shutdown_tx.subscribe(),
        ));
        *lock(&self.supervisor) = Some(handle);

        if self.bus.registry.has_kind(DeviceKind::IntelliFlo) {
            self.start_poller();
        }
        Ok(())
    }

    /// Close the transport. No reconnect follows; registered devices stay.
    pub async fn disconnect(&self) {
        let was_connected = self.is_connected();
        info!("{}: disconnecting", Link::PentairBus);
        self.stop_poller();
        self.stop_supervisor().await;
        self.bus.release().await;
        if was_connected {
            let _ = self.bus.event_tx.send(GatewayEvent::Disconnected { link: Link::PentairBus });
        }
    }

    async fn stop_supervisor(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = lock(&self.supervisor).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Register `device` under its address. The first IntelliFlo pump starts
    /// the polling job.
    pub fn register(&self, device: Arc<dyn PentairDevice>) {
        let kind = device.kind();
        self.bus.registry.register(device);
        if kind == DeviceKind::IntelliFlo {
            self.start_poller();
        }
    }

    /// Remove the device at `address`. Removing the last pump stops polling.
    pub fn unregister(&self, address: u8) -> Option<Arc<dyn PentairDevice>> {
        let removed = self.bus.registry.unregister(address);
        if !self.bus.registry.has_kind(DeviceKind::IntelliFlo) {
            self.stop_poller();
        }
        removed
    }

    pub fn device(&self, address: u8) -> Option<Arc<dyn PentairDevice>> {
        self.bus.registry.get(address)
    }

    pub fn devices(&self) -> Vec<Arc<dyn PentairDevice>> {
        self.bus.registry.devices()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.poller).as_ref().is_some_and(|h| !h.is_finished())
    }

    fn start_poller(&self) {
        let mut poller = lock(&self.poller);
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let interval = Duration::from_millis(self.config.pump_poll_interval_ms.max(1));
        debug!("Starting pump polling every {:?}", interval);
        *poller = Some(tokio::spawn(poll_pumps(self.bus.clone(), interval)));
    }

    fn stop_poller(&self) {
        if let Some(handle) = lock(&self.poller).take() {
            debug!("Stopping pump polling");
            handle.abort();
        }
    }

    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.bus.write_packet(packet).await
    }

    pub async fn request(&self, packet: Packet, expected_action: u8, retries: u32) -> Result<Packet> {
        self.bus.request(packet, expected_action, retries).await
    }
}

fn lock(handle: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for PentairBridge {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(h) = lock(&self.supervisor).take() {
            h.abort();
        }
        if let Some(h) = lock(&self.poller).take() {
            h.abort();
        }
    }
}
