// MIT License - Copyright (c) 2026 Peter Wright
// Connection configuration for the C-Gate session and the Pentair bridge

use std::time::Duration;

/// Reconnection policy applied by the connection supervisor.
///
/// Delays grow exponentially from `base_delay_ms`, doubling per attempt up to
/// `2^max_backoff_shift` times the base. `max_retries = None` retries for as
/// long as the owning object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_backoff_shift: u32,
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_shift: 4,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(self.max_backoff_shift);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << shift))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

/// Configuration for a C-Gate session.
#[derive(Debug, Clone)]
pub struct CGateConfig {
    /// Host running C-Gate
    pub host: String,
    /// Command port (default: 20023)
    pub command_port: u16,
    /// Event port (default: 20024)
    pub event_port: u16,
    /// Status change port (default: 20025)
    pub status_change_port: u16,
    /// Whether to open the event and status change channels
    pub enable_event_channels: bool,
    /// Bound on the TCP connect
    pub connect_timeout_ms: u64,
    /// Idle read timeout of the reader loop
    pub read_timeout_ms: u64,
    /// How long command callers wait for a complete response
    pub response_timeout_ms: u64,
    /// Interval between keep-alive pings
    pub keepalive_interval_ms: u64,
    /// How long a keep-alive ping may take before the session is severed
    pub keepalive_timeout_ms: u64,
    /// Reconnection policy for all three channels
    pub reconnect: ReconnectPolicy,
}

impl Default for CGateConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            command_port: 20023,
            event_port: 20024,
            status_change_port: 20025,
            enable_event_channels: true,
            connect_timeout_ms: 5000,
            read_timeout_ms: 1000,
            response_timeout_ms: 10000,
            keepalive_interval_ms: 10000,
            keepalive_timeout_ms: 3000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CGateConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> CGateConfigBuilder {
        CGateConfigBuilder::default()
    }

    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.host, self.command_port)
    }

    pub fn event_addr(&self) -> String {
        format!("{}:{}", self.host, self.event_port)
    }

    pub fn status_change_addr(&self) -> String {
        format!("{}:{}", self.host, self.status_change_port)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Builder for CGateConfig.
#[derive(Debug, Clone, Default)]
pub struct CGateConfigBuilder {
    config: CGateConfig,
}

impl CGateConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn command_port(mut self, port: u16) -> Self {
        self.config.command_port = port;
        self
    }

    pub fn event_port(mut self, port: u16) -> Self {
        self.config.event_port = port;
        self
    }

    pub fn status_change_port(mut self, port: u16) -> Self {
        self.config.status_change_port = port;
        self
    }

    pub fn enable_event_channels(mut self, enable: bool) -> Self {
        self.config.enable_event_channels = enable;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.response_timeout_ms = ms;
        self
    }

    pub fn keepalive_interval_ms(mut self, ms: u64) -> Self {
        self.config.keepalive_interval_ms = ms;
        self
    }

    pub fn keepalive_timeout_ms(mut self, ms: u64) -> Self {
        self.config.keepalive_timeout_ms = ms;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn build(self) -> CGateConfig {
        self.config
    }
}

/// How the Pentair RS-485 bus is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PentairTransport {
    /// Raw TCP socket of an IP-to-RS485 bridge
    Tcp { host: String, port: u16 },
    /// Local serial adapter, always 9600 8N1
    Serial { path: String },
}

impl PentairTransport {
    pub fn describe(&self) -> String {
        match self {
            PentairTransport::Tcp { host, port } => format!("{host}:{port}"),
            PentairTransport::Serial { path } => path.clone(),
        }
    }
}

/// Configuration for a Pentair bus bridge.
#[derive(Debug, Clone)]
pub struct PentairConfig {
    pub transport: PentairTransport,
    /// Bus address this bridge uses as the source of written packets
    pub source_address: u8,
    /// Bound on the TCP connect
    pub connect_timeout_ms: u64,
    /// How long a request waits for its response packet, per try
    pub response_timeout_ms: u64,
    /// Number of tries for a request expecting a response
    pub write_retries: u32,
    /// Interval of the IntelliFlo polling job
    pub pump_poll_interval_ms: u64,
    /// Whether unknown bus addresses are announced as discovery candidates
    pub discovery_enabled: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for PentairConfig {
    fn default() -> Self {
        Self {
            transport: PentairTransport::Tcp {
                host: "192.168.0.200".to_string(),
                port: 10000,
            },
            source_address: 0x22,
            connect_timeout_ms: 5000,
            response_timeout_ms: 1000,
            write_retries: 3,
            pump_poll_interval_ms: 10000,
            discovery_enabled: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl PentairConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> PentairConfigBuilder {
        PentairConfigBuilder::default()
    }
}

/// Builder for PentairConfig.
#[derive(Debug, Clone, Default)]
pub struct PentairConfigBuilder {
    config: PentairConfig,
}

impl PentairConfigBuilder {
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.transport = PentairTransport::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    pub fn serial(mut self, path: impl Into<String>) -> Self {
        self.config.transport = PentairTransport::Serial { path: path.into() };
        self
    }

    pub fn source_address(mut self, address: u8) -> Self {
        self.config.source_address = address;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.response_timeout_ms = ms;
        self
    }

    pub fn write_retries(mut self, retries: u32) -> Self {
        self.config.write_retries = retries;
        self
    }

    pub fn pump_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.pump_poll_interval_ms = ms;
        self
    }

    pub fn discovery_enabled(mut self, enabled: bool) -> Self {
        self.config.discovery_enabled = enabled;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn build(self) -> PentairConfig {
        self.config
    }
}
