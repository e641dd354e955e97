// MIT License - Copyright (c) 2026 Peter Wright
// Lifecycle and device events broadcast to subscribers

use std::fmt;

use crate::pentair::devices::PentairUpdate;

/// A physical connection owned by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// C-Gate command port (request/response)
    CGateCommand,
    /// C-Gate event port (unsolicited events)
    CGateEvent,
    /// C-Gate status change port
    CGateStatusChange,
    /// Pentair RS-485 bus (IP bridge or serial)
    PentairBus,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Link::CGateCommand => "cgate-command",
            Link::CGateEvent => "cgate-event",
            Link::CGateStatusChange => "cgate-status-change",
            Link::PentairBus => "pentair-bus",
        };
        f.write_str(name)
    }
}

/// All events that can be emitted by a session or bridge.
///
/// Users subscribe via `subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<GatewayEvent>`. Receivers stay valid
/// across reconnects of the underlying sockets.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Socket established (initially or after a reconnect)
    Connected { link: Link },
    /// Socket lost or closed
    Disconnected { link: Link },
    /// Supervisor gave up reconnecting
    ConnectionFailed { link: Link, reason: String },
    /// A registered Pentair device changed state
    PentairUpdate(PentairUpdate),
    /// A packet was seen from a bus address nobody registered (reported once per address)
    DiscoveryCandidate { address: u8 },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<GatewayEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<GatewayEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
