// MIT License - Copyright (c) 2026 Peter Wright
// Pentair bus devices and the state updates they publish

pub mod controller;
pub mod intellichlor;
pub mod intelliflo;

use std::fmt;

use crate::pentair::packet::Packet;

pub use controller::{
    Circuits, Controller, ControllerClock, ControllerSchedule, ControllerStatus, HeatMode, HeatStatus, HeaterFlags,
    ScheduleDays, ScheduleKind,
};
pub use intellichlor::{ChlorinatorStatus, IntelliChlor};
pub use intelliflo::{IntelliFlo, PumpStatus};

/// Default address of an EasyTouch/IntelliTouch controller.
pub const CONTROLLER_ADDRESS: u8 = 0x10;
/// Address of the IntelliChlor salt chlorinator.
pub const INTELLICHLOR_ADDRESS: u8 = 0x50;
/// IntelliFlo pumps occupy 0x60-0x6F.
pub const INTELLIFLO_FIRST_ADDRESS: u8 = 0x60;
pub const INTELLIFLO_LAST_ADDRESS: u8 = 0x6F;
/// Destination used by controllers for bus-wide broadcasts.
pub const BROADCAST_ADDRESS: u8 = 0x0F;

/// The device family behind a bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Controller,
    IntelliFlo,
    IntelliChlor,
}

impl DeviceKind {
    /// Guess the family from a bus address alone.
    pub fn from_address(address: u8) -> Option<Self> {
        match address {
            CONTROLLER_ADDRESS => Some(DeviceKind::Controller),
            INTELLICHLOR_ADDRESS => Some(DeviceKind::IntelliChlor),
            INTELLIFLO_FIRST_ADDRESS..=INTELLIFLO_LAST_ADDRESS => Some(DeviceKind::IntelliFlo),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Controller => "controller",
            DeviceKind::IntelliFlo => "intelliflo",
            DeviceKind::IntelliChlor => "intellichlor",
        };
        f.write_str(name)
    }
}

/// A state change decoded from a packet of a registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PentairUpdate {
    ControllerStatus { address: u8, status: ControllerStatus },
    HeatStatus { address: u8, heat: HeatStatus },
    Clock { address: u8, clock: ControllerClock },
    CircuitName { address: u8, circuit: u8, function: u8, name: u8 },
    SoftwareVersion { address: u8, major: u8, minor: u8 },
    Schedule { address: u8, schedule: ControllerSchedule },
    Ack { address: u8, action: u8 },
    PumpStatus { address: u8, status: PumpStatus },
    ChlorinatorStatus { address: u8, status: ChlorinatorStatus },
    ChlorinatorVersion { address: u8, version: u8, name: String },
}

impl PentairUpdate {
    pub fn address(&self) -> u8 {
        match self {
            PentairUpdate::ControllerStatus { address, .. }
            | PentairUpdate::HeatStatus { address, .. }
            | PentairUpdate::Clock { address, .. }
            | PentairUpdate::CircuitName { address, .. }
            | PentairUpdate::SoftwareVersion { address, .. }
            | PentairUpdate::Schedule { address, .. }
            | PentairUpdate::Ack { address, .. }
            | PentairUpdate::PumpStatus { address, .. }
            | PentairUpdate::ChlorinatorStatus { address, .. }
            | PentairUpdate::ChlorinatorVersion { address, .. } => *address,
        }
    }
}

/// A device registered with the bridge under its bus address.
///
/// `handle_packet` is called from the dispatcher task for every packet
/// attributed to `address()`. It must not block.
pub trait PentairDevice: Send + Sync + fmt::Debug {
    fn address(&self) -> u8;

    fn kind(&self) -> DeviceKind;

    /// Apply a packet; returns an update when it changed observable state.
    fn handle_packet(&self, packet: &Packet) -> Option<PentairUpdate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_address() {
        assert_eq!(DeviceKind::from_address(0x10), Some(DeviceKind::Controller));
        assert_eq!(DeviceKind::from_address(0x50), Some(DeviceKind::IntelliChlor));
        assert_eq!(DeviceKind::from_address(0x60), Some(DeviceKind::IntelliFlo));
        assert_eq!(DeviceKind::from_address(0x6F), Some(DeviceKind::IntelliFlo));
        assert_eq!(DeviceKind::from_address(0x22), None);
        assert_eq!(DeviceKind::IntelliFlo.to_string(), "intelliflo");
    }
}
