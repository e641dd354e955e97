// MIT License - Copyright (c) 2026 Peter Wright
// IntelliFlo variable speed pump

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, trace};

use super::{DeviceKind, PentairDevice, PentairUpdate};
use crate::error::{GatewayError, Result};
use crate::pentair::bridge::Bus;
use crate::pentair::packet::{Packet, PentairPacket};

const ACTION_REMOTE_CONTROL: u8 = 0x04;
const ACTION_RUN: u8 = 0x06;
const ACTION_STATUS: u8 = 0x07;

const REMOTE_ON: u8 = 0xFF;
const RUN_ON: u8 = 0x0A;
const RUN_OFF: u8 = 0x04;

const STATUS_LEN: usize = 15;

/// Pumps always speak protocol version 0.
const PUMP_VERSION: u8 = 0x00;

/// Pump status report (action 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStatus {
    pub running: bool,
    pub mode: u8,
    pub drive_state: u8,
    pub watts: u16,
    pub rpm: u16,
    pub gpm: u8,
    pub ppc: u8,
    pub error: u8,
    /// Minutes left on the pump timer
    pub timer: u8,
    pub hour: u8,
    pub minute: u8,
}

impl PumpStatus {
    pub fn from_payload(b: &[u8]) -> Option<Self> {
        if b.len() != STATUS_LEN {
            return None;
        }
        Some(Self {
            running: b[0] == RUN_ON,
            mode: b[1],
            drive_state: b[2],
            watts: u16::from_be_bytes([b[3], b[4]]),
            rpm: u16::from_be_bytes([b[5], b[6]]),
            gpm: b[7],
            ppc: b[8],
            error: b[10],
            timer: b[12],
            hour: b[13],
            minute: b[14],
        })
    }
}

#[derive(Debug)]
pub struct IntelliFlo {
    address: u8,
    status: Mutex<Option<PumpStatus>>,
}

impl IntelliFlo {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            status: Mutex::new(None),
        }
    }

    pub fn status(&self) -> Option<PumpStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn poll(&self, bus: &Bus) -> Result<PumpStatus> {
        poll_pump(bus, self.address).await
    }

    pub async fn set_run(&self, bus: &Bus, on: bool) -> Result<()> {
        info!("Pump {:02X} run {}", self.address, if on { "on" } else { "off" });
        let packet = pump_packet(bus, self.address, ACTION_RUN, vec![if on { RUN_ON } else { RUN_OFF }]);
        bus.request(packet, ACTION_RUN, bus.write_retries()).await?;
        Ok(())
    }
}

fn pump_packet(bus: &Bus, address: u8, action: u8, payload: Vec<u8>) -> Packet {
    PentairPacket::new(PUMP_VERSION, address, bus.source_address(), action, payload).into()
}

/// Put the pump at `address` under remote control, then ask for its status.
///
/// The status reply also reaches the registered device through the dispatcher.
pub(crate) async fn poll_pump(bus: &Bus, address: u8) -> Result<PumpStatus> {
    trace!("Polling pump {:02X}", address);
    let retries = bus.write_retries();
    let remote = pump_packet(bus, address, ACTION_REMOTE_CONTROL, vec![REMOTE_ON]);
    bus.request(remote, ACTION_REMOTE_CONTROL, retries).await?;
    let reply = bus
        .request(pump_packet(bus, address, ACTION_STATUS, vec![]), ACTION_STATUS, retries)
        .await?;

    match &reply {
        Packet::Standard(p) => PumpStatus::from_payload(&p.payload),
        Packet::IntelliChlor(_) => None,
    }
    .ok_or_else(|| GatewayError::InvalidResponse {
        details: format!("malformed pump status {reply}"),
    })
}

impl PentairDevice for IntelliFlo {
    fn address(&self) -> u8 {
        self.address
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::IntelliFlo
    }

    fn handle_packet(&self, packet: &Packet) -> Option<PentairUpdate> {
        let Packet::Standard(p) = packet else {
            return None;
        };
        if p.action != ACTION_STATUS {
            trace!("Pump {:02X} action {:02X} ignored", self.address, p.action);
            return None;
        }
        let Some(status) = PumpStatus::from_payload(&p.payload) else {
            debug!("Expected pump status length of {}: {}", STATUS_LEN, p);
            return None;
        };

        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == Some(status) {
            return None;
        }
        *current = Some(status);
        Some(PentairUpdate::PumpStatus {
            address: self.address,
            status,
        })
    }
}
