// MIT License - Copyright (c) 2026 Peter Wright
// Clipsal C-Bus access through a C-Gate server

pub mod cache;
pub mod connection;
pub mod demux;
pub mod objects;
pub mod protocol;
pub mod response;
pub mod session;

pub use cache::{CacheCategory, ObjectCache, SessionCache};
pub use objects::{Application, CGateObject, Group, Network, ObjectKind, Project, Unit};
pub use protocol::{CGateEvent, MapStyle, ObjectPath, StatusAction, StatusChange, TreeEntry};
pub use response::{Response, ResponseCursor};
pub use session::CGateSession;
