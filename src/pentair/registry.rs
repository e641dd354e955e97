// MIT License - Copyright (c) 2026 Peter Wright
// Devices registered with a bridge, keyed by bus address

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::devices::{DeviceKind, PentairDevice};

/// Address -> device map shared between the bridge API and its dispatcher.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<u8, Arc<dyn PentairDevice>>>,
    /// Unregistered addresses already reported as discovery candidates
    seen: RwLock<HashSet<u8>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device`, replacing any device at the same address.
    pub fn register(&self, device: Arc<dyn PentairDevice>) -> Option<Arc<dyn PentairDevice>> {
        let address = device.address();
        debug!("Registering {} at {:02X}", device.kind(), address);
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, device)
    }

    pub fn unregister(&self, address: u8) -> Option<Arc<dyn PentairDevice>> {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
    }

    pub fn get(&self, address: u8) -> Option<Arc<dyn PentairDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    /// Snapshot of all registered devices, ordered by address.
    pub fn devices(&self) -> Vec<Arc<dyn PentairDevice>> {
        let mut devices: Vec<_> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.address());
        devices
    }

    pub fn has_kind(&self, kind: DeviceKind) -> bool {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|d| d.kind() == kind)
    }

    /// Note a packet from an unregistered `address`. Returns true the first time only.
    pub fn mark_seen(&self, address: u8) -> bool {
        self.seen
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address)
    }
}
