// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy shared by the C-Gate and Pentair bridges

use std::fmt;

/// Three-digit status code carried at the start of every C-Gate response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CGateStatus(pub u16);

impl CGateStatus {
    /// The status code C-Gate uses for a successfully executed command.
    pub const OK: CGateStatus = CGateStatus(200);

    /// Parse the leading status code of a response line (e.g., "200 OK." -> 200).
    pub fn from_line(line: &str) -> Option<Self> {
        let code = line.get(..3)?;
        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        code.parse().ok().map(CGateStatus)
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }

    /// 1xx/2xx/3xx codes carry data; 4xx and up are failures.
    pub fn is_success_class(&self) -> bool {
        self.0 < 400
    }

    /// Short description of the well-known C-Gate codes.
    pub fn description(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Service ready",
            300..=399 => "Object information",
            400 => "Bad object or device ID",
            401 => "Bad argument(s)",
            404 => "Not found",
            406 => "Bad syntax",
            407 => "Object not found",
            408 => "Object not ready",
            409 => "Operation failure",
            410 => "Device not present",
            500..=599 => "Internal error",
            _ => "Unknown status",
        }
    }
}

impl fmt::Display for CGateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.description())
    }
}

/// All errors that can occur in the homebus bridge library.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Socket disconnected")]
    Disconnected,

    #[error("Command timeout: {command}")]
    CommandTimeout { command: String },

    #[error("Protocol error: {response}")]
    Protocol { response: String },

    #[error("Invalid response: {details}")]
    InvalidResponse { details: String },

    #[error("Too many framing errors (exceeded limit of {limit})")]
    FramingLimitExceeded { limit: u32 },

    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    #[error("Unknown device at bus address 0x{address:02X}")]
    UnknownDevice { address: u8 },

    #[error("Invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl GatewayError {
    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Io(_)
                | GatewayError::ConnectFailed { .. }
                | GatewayError::ConnectionTimeout
                | GatewayError::NotConnected
                | GatewayError::Disconnected
                | GatewayError::CommandTimeout { .. }
                | GatewayError::FramingLimitExceeded { .. }
                | GatewayError::ChannelClosed
        )
    }

    /// Build a protocol error from the offending response line.
    pub fn protocol(response: impl Into<String>) -> Self {
        GatewayError::Protocol {
            response: response.into(),
        }
    }

    /// The status code of a protocol error, if the response carried one.
    pub fn status(&self) -> Option<CGateStatus> {
        match self {
            GatewayError::Protocol { response } => CGateStatus::from_line(response),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_line() {
        assert_eq!(CGateStatus::from_line("200 OK."), Some(CGateStatus(200)));
        assert_eq!(CGateStatus::from_line("343-//HOME/254"), Some(CGateStatus(343)));
        assert_eq!(CGateStatus::from_line("20"), None);
        assert_eq!(CGateStatus::from_line("OK 200"), None);
    }

    #[test]
    fn test_status_classes() {
        assert!(CGateStatus(200).is_ok());
        assert!(CGateStatus(300).is_success_class());
        assert!(!CGateStatus(401).is_success_class());
        assert_eq!(CGateStatus(401).to_string(), "401: Bad argument(s)");
    }

    #[test]
    fn test_protocol_error_carries_status() {
        let err = GatewayError::protocol("400 Syntax error.");
        assert_eq!(err.status(), Some(CGateStatus(400)));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Protocol error: 400 Syntax error.");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::Disconnected.is_retryable());
        assert!(GatewayError::CommandTimeout { command: "noop".into() }.is_retryable());
        assert!(GatewayError::FramingLimitExceeded { limit: 10 }.is_retryable());
        assert!(!GatewayError::InvalidAddress { address: "x".into() }.is_retryable());
    }
}
