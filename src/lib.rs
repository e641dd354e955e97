// MIT License - Copyright (c) 2026 Peter Wright
// Home automation bus bridges: C-Gate and Pentair
//
//! # homebus-bridge
//!
//! Client side of two home automation buses:
//!
//! - **C-Gate** (Clipsal C-Bus): a session over the command, event and status
//!   change TCP ports, with tagged command/response correlation, a cache of
//!   projects, networks, applications, groups and units, and supervised
//!   reconnects.
//! - **Pentair** pool equipment on RS-485 (IP bridge or serial adapter):
//!   packet framing with checksum resynchronization, a device registry,
//!   request/response with retries and IntelliFlo pump polling.
//!
//! ## Quick Start
//!
//! ```no_run
//! use homebus_bridge::{CGateConfig, CGateSession};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = CGateSession::new(CGateConfig::builder().host("192.168.0.10").build());
//!     session.connect().await?;
//!
//!     let mut changes = session.subscribe_status_changes();
//!     tokio::spawn(async move {
//!         while let Ok(change) = changes.recv().await {
//!             println!("{} {:?}", change.address, change.action);
//!         }
//!     });
//!
//!     let kitchen = session.resolve_group("//HOME/254/56/4").await?;
//!     session.group_ramp(&kitchen, 128, 4).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod cgate;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod pentair;

// Re-exports for convenience
pub use cgate::CGateSession;
pub use config::{CGateConfig, CGateConfigBuilder, PentairConfig, PentairConfigBuilder, PentairTransport, ReconnectPolicy};
pub use connection::ConnectionState;
pub use error::{CGateStatus, GatewayError, Result};
pub use event::{EventReceiver, GatewayEvent, Link};
pub use pentair::{PentairBridge, PentairUpdate};
