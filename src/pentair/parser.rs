// MIT License - Copyright (c) 2026 Peter Wright
// Incremental Pentair frame parser with one-byte resynchronization

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::FramingGuard;
use crate::error::GatewayError;
use crate::pentair::packet::{
    intellichlor_data_len, IntelliChlorPacket, Packet, PentairPacket, CHLOR_END, CHLOR_START,
    MAX_PAYLOAD_LEN, PREAMBLE, STANDARD_START,
};

/// Where the parser is within the current candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    SeekPreamble,
    ReadHeader,
    ReadPayload,
    ValidateChecksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Standard,
    IntelliChlor,
}

/// Why a candidate frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("declared payload length {0} exceeds 128")]
    BadLength(usize),
    #[error("checksum mismatch (expected {expected:04X}, got {actual:04X})")]
    BadChecksum { expected: u16, actual: u16 },
    #[error("missing 10 03 trailer")]
    BadTrailer,
    #[error("unknown IntelliChlor action {0:02X}")]
    UnknownAction(u8),
}

/// Output of the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Packet(Packet),
    /// A candidate frame was rejected and the stream resynchronized
    Resync(FramingError),
}

const STANDARD_HEADER_LEN: usize = 6; // A5 ver dst src action len
const CHLOR_HEADER_LEN: usize = 4; // 10 02 dst action

/// Byte-at-a-time state machine over the bus stream.
///
/// SEEK_PREAMBLE -> READ_HEADER -> READ_PAYLOAD -> VALIDATE_CHECKSUM -> dispatch.
/// A bad length, checksum, trailer or action drops the first byte of the
/// candidate frame and rescans the rest from SEEK_PREAMBLE, so a valid packet
/// that follows (or is embedded in) garbage is still found.
#[derive(Debug)]
pub struct PacketParser {
    input: VecDeque<u8>,
    state: ParserState,
    kind: FrameKind,
    frame: Vec<u8>,
    payload_len: usize,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            state: ParserState::SeekPreamble,
            kind: FrameKind::Standard,
            frame: Vec::with_capacity(MAX_PAYLOAD_LEN + 16),
            payload_len: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Bytes received but not yet consumed by the state machine.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    /// Push `bytes` and collect every complete event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ParseEvent> {
        self.push(bytes);
        std::iter::from_fn(|| self.next_event()).collect()
    }

    /// Advance until a packet is dispatched, a frame is rejected, or input runs out.
    pub fn next_event(&mut self) -> Option<ParseEvent> {
        loop {
            match self.state {
                ParserState::SeekPreamble => {
                    let b = self.input.pop_front()?;
                    self.frame.push(b);
                    if self.frame.len() > PREAMBLE.len() + 1 {
                        self.frame.remove(0);
                    }
                    if self.frame.len() == PREAMBLE.len() + 1
                        && self.frame[..PREAMBLE.len()] == PREAMBLE
                        && b == STANDARD_START
                    {
                        self.begin(FrameKind::Standard, &[STANDARD_START]);
                    } else if self.frame.ends_with(&CHLOR_START) {
                        self.begin(FrameKind::IntelliChlor, &CHLOR_START);
                    }
                }
                ParserState::ReadHeader => {
                    let header_len = match self.kind {
                        FrameKind::Standard => STANDARD_HEADER_LEN,
                        FrameKind::IntelliChlor => CHLOR_HEADER_LEN,
                    };
                    self.fill(header_len)?;
                    let declared = match self.kind {
                        FrameKind::Standard => {
                            let len = usize::from(self.frame[5]);
                            if len > MAX_PAYLOAD_LEN {
                                return Some(self.reject(FramingError::BadLength(len)));
                            }
                            len
                        }
                        FrameKind::IntelliChlor => {
                            let action = self.frame[3];
                            match intellichlor_data_len(action) {
                                Some(len) => len,
                                None => return Some(self.reject(FramingError::UnknownAction(action))),
                            }
                        }
                    };
                    self.payload_len = declared;
                    self.state = ParserState::ReadPayload;
                }
                ParserState::ReadPayload => {
                    let header_len = match self.kind {
                        FrameKind::Standard => STANDARD_HEADER_LEN,
                        FrameKind::IntelliChlor => CHLOR_HEADER_LEN,
                    };
                    self.fill(header_len + self.payload_len)?;
                    self.state = ParserState::ValidateChecksum;
                }
                ParserState::ValidateChecksum => {
                    return Some(match self.kind {
                        FrameKind::Standard => self.finish_standard()?,
                        FrameKind::IntelliChlor => self.finish_intellichlor()?,
                    });
                }
            }
        }
    }

    fn begin(&mut self, kind: FrameKind, start: &[u8]) {
        self.kind = kind;
        self.frame.clear();
        self.frame.extend_from_slice(start);
        self.state = ParserState::ReadHeader;
    }

    /// Move input bytes into the frame until it holds `len` bytes.
    fn fill(&mut self, len: usize) -> Option<()> {
        while self.frame.len() < len {
            let b = self.input.pop_front()?;
            self.frame.push(b);
        }
        Some(())
    }

    fn finish_standard(&mut self) -> Option<ParseEvent> {
        let body_len = STANDARD_HEADER_LEN + self.payload_len;
        self.fill(body_len + 2)?;

        let expected = self.frame[..body_len]
            .iter()
            .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)));
        let actual = u16::from_be_bytes([self.frame[body_len], self.frame[body_len + 1]]);
        if expected != actual {
            return Some(self.reject(FramingError::BadChecksum { expected, actual }));
        }

        let packet = PentairPacket::new(
            self.frame[1],
            self.frame[2],
            self.frame[3],
            self.frame[4],
            self.frame[STANDARD_HEADER_LEN..body_len].to_vec(),
        );
        self.reset();
        trace!("Packet: {}", packet);
        Some(ParseEvent::Packet(Packet::Standard(packet)))
    }

    fn finish_intellichlor(&mut self) -> Option<ParseEvent> {
        let body_len = CHLOR_HEADER_LEN + self.payload_len;
        self.fill(body_len + 1 + CHLOR_END.len())?;

        let expected = self.frame[..body_len]
            .iter()
            .fold(0u8, |sum, b| sum.wrapping_add(*b));
        let actual = self.frame[body_len];
        if expected != actual {
            return Some(self.reject(FramingError::BadChecksum {
                expected: u16::from(expected),
                actual: u16::from(actual),
            }));
        }
        if self.frame[body_len + 1..] != CHLOR_END {
            return Some(self.reject(FramingError::BadTrailer));
        }

        let packet = IntelliChlorPacket::new(
            self.frame[2],
            self.frame[3],
            self.frame[CHLOR_HEADER_LEN..body_len].to_vec(),
        );
        self.reset();
        trace!("IntelliChlor packet: {}", packet);
        Some(ParseEvent::Packet(Packet::IntelliChlor(packet)))
    }

    /// Drop the first byte of the candidate frame and rescan the rest.
    fn reject(&mut self, error: FramingError) -> ParseEvent {
        debug!("Framing error: {}; resynchronizing", error);
        for b in self.frame.drain(1..).rev() {
            self.input.push_front(b);
        }
        self.reset();
        ParseEvent::Resync(error)
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.payload_len = 0;
        self.state = ParserState::SeekPreamble;
    }
}

/// Read `reader` until it fails, forwarding each packet to `packets`.
///
/// Framing errors are absorbed by resynchronization until `guard` trips.
/// `on_failure` is invoked exactly once with the reason the loop stopped: an
/// I/O error, end of stream, the framing limit, or the consumer going away.
pub async fn run_parser<R, F>(
    mut reader: R,
    packets: mpsc::Sender<Packet>,
    mut guard: FramingGuard,
    on_failure: F,
) where
    R: AsyncRead + Unpin,
    F: FnOnce(GatewayError),
{
    let mut parser = PacketParser::new();
    let mut buf = [0u8; 512];

    let failure = 'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break GatewayError::Disconnected,
            Ok(n) => n,
            Err(e) => break GatewayError::Io(e),
        };
        parser.push(&buf[..n]);

        while let Some(event) = parser.next_event() {
            match event {
                ParseEvent::Packet(packet) => {
                    if packets.send(packet).await.is_err() {
                        break 'read GatewayError::ChannelClosed;
                    }
                }
                ParseEvent::Resync(error) => {
                    if let Err(e) = guard.record() {
                        warn!("Giving up on bus stream after framing error: {}", error);
                        break 'read e;
                    }
                }
            }
        }
    };

    debug!("Packet reader stopped: {}", failure);
    on_failure(failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn status_request() -> Vec<u8> {
        PentairPacket::new(0x01, 0x10, 0x22, 0x02, vec![0x00]).encode()
    }

    fn packets(events: &[ParseEvent]) -> Vec<Packet> {
        events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Packet(p) => Some(p.clone()),
                ParseEvent::Resync(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_parses_standard_packet() {
        let mut parser = PacketParser::new();
        let events = parser.feed(&status_request());
        assert_eq!(
            events,
            vec![ParseEvent::Packet(Packet::Standard(PentairPacket::new(
                0x01,
                0x10,
                0x22,
                0x02,
                vec![0x00]
            )))]
        );
        assert_eq!(parser.state(), ParserState::SeekPreamble);
    }

    #[test]
    fn test_parses_byte_by_byte() {
        let mut parser = PacketParser::new();
        let bytes = status_request();
        let mut events = Vec::new();
        for (i, b) in bytes.iter().enumerate() {
            events.extend(parser.feed(&[*b]));
            if i == 4 {
                assert_eq!(parser.state(), ParserState::ReadHeader);
            }
        }
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn test_state_progression() {
        let mut parser = PacketParser::new();
        let bytes = PentairPacket::new(0x01, 0x0F, 0x10, 0x05, vec![1, 2, 3]).encode();
        assert!(parser.feed(&bytes[..9]).is_empty());
        assert_eq!(parser.state(), ParserState::ReadPayload);
        assert!(parser.feed(&bytes[9..12]).is_empty());
        assert_eq!(parser.state(), ParserState::ValidateChecksum);
        assert_eq!(packets(&parser.feed(&bytes[12..])).len(), 1);
    }

    #[test]
    fn test_garbage_before_packet_is_skipped() {
        let mut parser = PacketParser::new();
        let mut bytes = vec![0x00, 0x13, 0xFF, 0xA5, 0x7E];
        bytes.extend(status_request());
        let events = parser.feed(&bytes);
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn test_bad_checksum_then_valid_packet_recovers() {
        let mut parser = PacketParser::new();
        let mut corrupt = status_request();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x55;
        let mut bytes = corrupt;
        bytes.extend(status_request());

        let events = parser.feed(&bytes);
        assert!(matches!(
            events.first(),
            Some(ParseEvent::Resync(FramingError::BadChecksum { .. }))
        ));
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn test_one_corrupted_byte_between_valid_packets() {
        let clock = PentairPacket::new(0x01, 0x0F, 0x10, 0x05, vec![14, 9, 2, 29, 4, 17, 0, 0]);
        let mut corrupt = clock.encode();
        // minute 9 -> 10
        corrupt[PREAMBLE.len() + STANDARD_HEADER_LEN + 1] = 10;

        let mut bytes = status_request();
        bytes.extend(corrupt);
        bytes.extend(clock.encode());

        let mut parser = PacketParser::new();
        let events = parser.feed(&bytes);
        assert_eq!(
            packets(&events),
            vec![
                Packet::Standard(PentairPacket::new(0x01, 0x10, 0x22, 0x02, vec![0x00])),
                Packet::Standard(clock),
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, ParseEvent::Resync(FramingError::BadChecksum { .. }))));
        assert_eq!(parser.state(), ParserState::SeekPreamble);
    }

    #[test]
    fn test_valid_packet_hidden_inside_rejected_frame() {
        // A bogus header whose declared length swallows a real packet
        let mut bytes = vec![0xFF, 0x00, 0xFF, 0xA5, 0x01, 0x10, 0x22, 0x02, 0x0C];
        bytes.extend(status_request());
        bytes.extend([0x00, 0x00]);

        let mut parser = PacketParser::new();
        let events = parser.feed(&bytes);
        assert!(events.iter().any(|e| matches!(e, ParseEvent::Resync(_))));
        assert_eq!(
            packets(&events),
            vec![Packet::Standard(PentairPacket::new(0x01, 0x10, 0x22, 0x02, vec![0x00]))]
        );
    }

    #[test]
    fn test_oversized_length_resyncs() {
        let mut bytes = vec![0xFF, 0x00, 0xFF, 0xA5, 0x01, 0x10, 0x22, 0x02, 0xC8];
        bytes.extend(status_request());
        let mut parser = PacketParser::new();
        let events = parser.feed(&bytes);
        assert_eq!(events[0], ParseEvent::Resync(FramingError::BadLength(200)));
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn test_intellichlor_frames() {
        let mut parser = PacketParser::new();
        let good = IntelliChlorPacket::new(0x00, 0x12, vec![0x40, 0x80]).encode();
        let events = parser.feed(&good);
        assert_eq!(
            packets(&events),
            vec![Packet::IntelliChlor(IntelliChlorPacket::new(0x00, 0x12, vec![0x40, 0x80]))]
        );

        let mut bad_trailer = IntelliChlorPacket::new(0x50, 0x11, vec![0x32]).encode();
        let len = bad_trailer.len();
        bad_trailer[len - 1] = 0x04;
        let events = parser.feed(&bad_trailer);
        assert_eq!(events, vec![ParseEvent::Resync(FramingError::BadTrailer)]);

        let events = parser.feed(&[0x10, 0x02, 0x50, 0x7E, 0x00]);
        assert_eq!(events, vec![ParseEvent::Resync(FramingError::UnknownAction(0x7E))]);
    }

    #[tokio::test]
    async fn test_run_parser_forwards_packets_and_reports_eof() {
        let (mut client, server) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(8);
        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(run_parser(server, tx, FramingGuard::default(), move |e| {
            let _ = fail_tx.send(e);
        }));

        use tokio::io::AsyncWriteExt;
        client.write_all(&status_request()).await.unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.action(), 0x02);

        drop(client);
        assert!(matches!(fail_rx.await.unwrap(), GatewayError::Disconnected));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_parser_trips_framing_limit() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel(8);
        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel();
        let guard = FramingGuard::new(2, Duration::from_secs(60));

        tokio::spawn(run_parser(server, tx, guard, move |e| {
            let _ = fail_tx.send(e);
        }));

        use tokio::io::AsyncWriteExt;
        let mut noise = Vec::new();
        for _ in 0..3 {
            noise.extend([0xFF, 0x00, 0xFF, 0xA5, 0x01, 0x10, 0x22, 0x02, 0xFF]);
        }
        client.write_all(&noise).await.unwrap();
        assert!(matches!(
            fail_rx.await.unwrap(),
            GatewayError::FramingLimitExceeded { limit: 2 }
        ));
    }
}
