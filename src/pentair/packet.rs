// MIT License - Copyright (c) 2026 Peter Wright
// Pentair RS-485 frame types: standard (A5) packets and IntelliChlor (10 02) packets

use std::fmt;

/// Idle bytes that precede every standard packet on the bus.
pub const PREAMBLE: [u8; 3] = [0xFF, 0x00, 0xFF];
/// First byte of a standard packet (and of its checksummed region).
pub const STANDARD_START: u8 = 0xA5;
/// Largest payload a standard packet may declare.
pub const MAX_PAYLOAD_LEN: usize = 128;

/// Start and end markers of an IntelliChlor frame.
pub const CHLOR_START: [u8; 2] = [0x10, 0x02];
pub const CHLOR_END: [u8; 2] = [0x10, 0x03];

/// Data length carried by an IntelliChlor frame with this action, if known.
pub fn intellichlor_data_len(action: u8) -> Option<usize> {
    match action {
        0x00 => Some(0),  // status request
        0x01 => Some(1),  // status reply
        0x03 => Some(17), // version: 1 byte + 16 character name
        0x11 => Some(1),  // set generate %
        0x12 => Some(2),  // salt level and status
        0x14 => Some(1),  // version request
        0x15 => Some(2),
        _ => None,
    }
}

/// A standard Pentair packet: `FF 00 FF A5 <ver> <dst> <src> <action> <len> <payload> <chk16>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PentairPacket {
    /// The byte after `A5`; controllers expect the value they last used
    pub version: u8,
    pub dest: u8,
    pub source: u8,
    pub action: u8,
    pub payload: Vec<u8>,
}

impl PentairPacket {
    pub fn new(version: u8, dest: u8, source: u8, action: u8, payload: Vec<u8>) -> Self {
        Self {
            version,
            dest,
            source,
            action,
            payload,
        }
    }

    /// Payload byte `index`, if present.
    pub fn byte(&self, index: usize) -> Option<u8> {
        self.payload.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Sum of every byte from `A5` through the end of the payload.
    pub fn checksum(&self) -> u16 {
        let header = [
            STANDARD_START,
            self.version,
            self.dest,
            self.source,
            self.action,
            self.payload.len() as u8,
        ];
        header
            .iter()
            .chain(self.payload.iter())
            .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
    }

    /// Wire bytes, preamble and checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREAMBLE.len() + 8 + self.payload.len());
        out.extend_from_slice(&PREAMBLE);
        out.extend_from_slice(&[
            STANDARD_START,
            self.version,
            self.dest,
            self.source,
            self.action,
            self.payload.len() as u8,
        ]);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum().to_be_bytes());
        out
    }
}

impl fmt::Display for PentairPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "A5 {:02X} {:02X} {:02X} {:02X} {:02X}",
            self.version,
            self.dest,
            self.source,
            self.action,
            self.payload.len()
        )?;
        for b in &self.payload {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

/// An IntelliChlor frame: `10 02 <dst> <action> <data> <chk8> 10 03`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntelliChlorPacket {
    pub dest: u8,
    pub action: u8,
    pub data: Vec<u8>,
}

impl IntelliChlorPacket {
    pub fn new(dest: u8, action: u8, data: Vec<u8>) -> Self {
        Self { dest, action, data }
    }

    pub fn byte(&self, index: usize) -> Option<u8> {
        self.data.get(index).copied()
    }

    /// Sum of every byte from the leading `10` through the last data byte.
    pub fn checksum(&self) -> u8 {
        [CHLOR_START[0], CHLOR_START[1], self.dest, self.action]
            .iter()
            .chain(self.data.iter())
            .fold(0u8, |sum, b| sum.wrapping_add(*b))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.data.len());
        out.extend_from_slice(&CHLOR_START);
        out.push(self.dest);
        out.push(self.action);
        out.extend_from_slice(&self.data);
        out.push(self.checksum());
        out.extend_from_slice(&CHLOR_END);
        out
    }
}

impl fmt::Display for IntelliChlorPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "10 02 {:02X} {:02X}", self.dest, self.action)?;
        for b in &self.data {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

/// Any frame seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Standard(PentairPacket),
    IntelliChlor(IntelliChlorPacket),
}

impl Packet {
    pub fn action(&self) -> u8 {
        match self {
            Packet::Standard(p) => p.action,
            Packet::IntelliChlor(p) => p.action,
        }
    }

    /// The bus address of the device this packet concerns.
    ///
    /// Standard packets report their source. IntelliChlor frames carry no
    /// source, so they are attributed to the chlorinator.
    pub fn device_address(&self) -> u8 {
        match self {
            Packet::Standard(p) => p.source,
            Packet::IntelliChlor(_) => super::devices::INTELLICHLOR_ADDRESS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Standard(p) => p.encode(),
            Packet::IntelliChlor(p) => p.encode(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Standard(p) => p.fmt(f),
            Packet::IntelliChlor(p) => p.fmt(f),
        }
    }
}

impl From<PentairPacket> for Packet {
    fn from(p: PentairPacket) -> Self {
        Packet::Standard(p)
    }
}

impl From<IntelliChlorPacket> for Packet {
    fn from(p: IntelliChlorPacket) -> Self {
        Packet::IntelliChlor(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_encoding() {
        // Status request from 0x22 to the controller
        let packet = PentairPacket::new(0x01, 0x10, 0x22, 0x02, vec![0x00]);
        assert_eq!(
            packet.encode(),
            vec![0xFF, 0x00, 0xFF, 0xA5, 0x01, 0x10, 0x22, 0x02, 0x01, 0x00, 0x00, 0xDB]
        );
        assert_eq!(packet.checksum(), 0xDB);
        assert_eq!(packet.to_string(), "A5 01 10 22 02 01 00");
    }

    #[test]
    fn test_checksum_carries_into_high_byte() {
        let packet = PentairPacket::new(0x01, 0x10, 0x22, 0x88, vec![0x55, 0x66, 0x05, 0x00]);
        let bytes = packet.encode();
        let sum: u16 = bytes[3..bytes.len() - 2].iter().map(|b| u16::from(*b)).sum();
        assert!(sum > 0xFF);
        assert_eq!(&bytes[bytes.len() - 2..], &sum.to_be_bytes());
    }

    #[test]
    fn test_intellichlor_encoding() {
        let packet = IntelliChlorPacket::new(0x50, 0x11, vec![0x32]);
        // 10 + 02 + 50 + 11 + 32 = 0xA5
        assert_eq!(
            packet.encode(),
            vec![0x10, 0x02, 0x50, 0x11, 0x32, 0xA5, 0x10, 0x03]
        );
    }

    #[test]
    fn test_intellichlor_lengths() {
        assert_eq!(intellichlor_data_len(0x00), Some(0));
        assert_eq!(intellichlor_data_len(0x03), Some(17));
        assert_eq!(intellichlor_data_len(0x12), Some(2));
        assert_eq!(intellichlor_data_len(0x7E), None);
    }

    #[test]
    fn test_device_address() {
        let standard: Packet = PentairPacket::new(0x00, 0x10, 0x60, 0x07, vec![]).into();
        assert_eq!(standard.device_address(), 0x60);
        let chlor: Packet = IntelliChlorPacket::new(0x00, 0x12, vec![0x40, 0x80]).into();
        assert_eq!(chlor.device_address(), 0x50);
        assert_eq!(chlor.action(), 0x12);
    }
}
