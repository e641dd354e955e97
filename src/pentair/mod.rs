// MIT License - Copyright (c) 2026 Peter Wright
// Pentair pool equipment on an RS-485 bus

pub mod bridge;
pub mod devices;
pub mod packet;
pub mod parser;
pub mod registry;

pub use bridge::{Bus, BusStream, PentairBridge};
pub use devices::{DeviceKind, PentairDevice, PentairUpdate};
pub use packet::{IntelliChlorPacket, Packet, PentairPacket};
pub use parser::{FramingError, PacketParser, ParseEvent, ParserState};
pub use registry::DeviceRegistry;
