// MIT License - Copyright (c) 2026 Peter Wright
// IntelliChlor salt chlorinator

use std::sync::{Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use tracing::{debug, info};

use super::{DeviceKind, INTELLICHLOR_ADDRESS, PentairDevice, PentairUpdate};
use crate::error::{GatewayError, Result};
use crate::pentair::bridge::Bus;
use crate::pentair::packet::{IntelliChlorPacket, Packet};

const ACTION_VERSION: u8 = 0x03;
const ACTION_SET_GENERATE: u8 = 0x11;
const ACTION_SALT_STATUS: u8 = 0x12;
const ACTION_GET_VERSION: u8 = 0x14;

/// Salt readings are reported in units of 50 ppm.
const SALT_SCALE: u16 = 50;

bitflags! {
    /// Alarm bits of the salt status reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChlorinatorFlags: u8 {
        const LOW_FLOW       = 0x01;
        const LOW_SALT       = 0x02;
        const VERY_LOW_SALT  = 0x04;
        const HIGH_CURRENT   = 0x08;
        const CLEAN_CELL     = 0x10;
        const LOW_WATER_TEMP = 0x20;
        const LOW_VOLTAGE    = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChlorinatorStatus {
    pub salt_ppm: u16,
    /// Raw status byte; 0x80 on a healthy cell
    pub status: u8,
    /// Last output percentage seen on the bus
    pub generate_percent: Option<u8>,
}

impl ChlorinatorStatus {
    pub fn alarms(&self) -> ChlorinatorFlags {
        ChlorinatorFlags::from_bits_truncate(self.status)
    }
}

#[derive(Debug, Default)]
struct ChlorState {
    status: ChlorinatorStatus,
    seen: bool,
    version: Option<(u8, String)>,
}

#[derive(Debug, Default)]
pub struct IntelliChlor {
    state: Mutex<ChlorState>,
}

impl IntelliChlor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChlorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> Option<ChlorinatorStatus> {
        let state = self.lock();
        state.seen.then_some(state.status)
    }

    pub fn version(&self) -> Option<(u8, String)> {
        self.lock().version.clone()
    }

    /// Set the chlorine output. The chlorinator answers with a salt status.
    pub async fn set_generate(&self, bus: &Bus, percent: u8) -> Result<()> {
        if percent > 101 {
            return Err(GatewayError::InvalidArgument {
                details: format!("generate percent {percent} out of range"),
            });
        }
        info!("Set chlorinator output: {}%", percent);
        let packet = IntelliChlorPacket::new(INTELLICHLOR_ADDRESS, ACTION_SET_GENERATE, vec![percent]);
        bus.request(packet.into(), ACTION_SALT_STATUS, bus.write_retries()).await?;
        Ok(())
    }

    pub async fn request_version(&self, bus: &Bus) -> Result<(u8, String)> {
        let packet = IntelliChlorPacket::new(INTELLICHLOR_ADDRESS, ACTION_GET_VERSION, vec![0]);
        let reply = bus
            .request(packet.into(), ACTION_VERSION, bus.write_retries())
            .await?;
        match &reply {
            Packet::IntelliChlor(p) => decode_version(&p.data),
            Packet::Standard(_) => None,
        }
        .ok_or_else(|| GatewayError::InvalidResponse {
            details: format!("malformed chlorinator version {reply}"),
        })
    }
}

fn decode_version(data: &[u8]) -> Option<(u8, String)> {
    let (version, name) = data.split_first()?;
    let name = String::from_utf8_lossy(name).trim_end_matches(['\0', ' ']).to_string();
    Some((*version, name))
}

impl PentairDevice for IntelliChlor {
    fn address(&self) -> u8 {
        INTELLICHLOR_ADDRESS
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::IntelliChlor
    }

    fn handle_packet(&self, packet: &Packet) -> Option<PentairUpdate> {
        let Packet::IntelliChlor(p) = packet else {
            return None;
        };
        let mut state = self.lock();

        let status = match p.action {
            ACTION_SALT_STATUS => ChlorinatorStatus {
                salt_ppm: u16::from(p.byte(0)?) * SALT_SCALE,
                status: p.byte(1)?,
                ..state.status
            },
            ACTION_SET_GENERATE => ChlorinatorStatus {
                generate_percent: Some(p.byte(0)?),
                ..state.status
            },
            ACTION_VERSION => {
                let (version, name) = decode_version(&p.data)?;
                state.version = Some((version, name.clone()));
                return Some(PentairUpdate::ChlorinatorVersion {
                    address: INTELLICHLOR_ADDRESS,
                    version,
                    name,
                });
            }
            other => {
                debug!("Chlorinator action {:02X} ignored", other);
                return None;
            }
        };

        if state.seen && state.status == status {
            return None;
        }
        state.seen = true;
        state.status = status;
        Some(PentairUpdate::ChlorinatorStatus {
            address: INTELLICHLOR_ADDRESS,
            status,
        })
    }
}
