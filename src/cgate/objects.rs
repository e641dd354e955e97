// MIT License - Copyright (c) 2026 Peter Wright
// C-Gate object hierarchy: project > network > application > group, network > unit

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::cgate::cache::ObjectCache;
use crate::cgate::protocol::parse_entity_id;

/// Which kind of object a [`CGateObject`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Project,
    Network,
    Application,
    Group,
    Unit,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Project => "project",
            ObjectKind::Network => "network",
            ObjectKind::Application => "application",
            ObjectKind::Group => "group",
            ObjectKind::Unit => "unit",
        };
        f.write_str(name)
    }
}

/// Behaviour shared by every object in the hierarchy.
pub trait CGateObject {
    /// Full C-Gate address, e.g. `//HOME/254/56/1`.
    fn address(&self) -> &str;

    /// Key of this object within its parent's cache.
    fn key(&self) -> String;

    /// Address of the owning project, e.g. `//HOME`.
    fn project_address(&self) -> String {
        let address = self.address();
        match address.get(2..).and_then(|rest| rest.find('/')) {
            Some(idx) => address[..idx + 2].to_string(),
            None => address.to_string(),
        }
    }

    fn kind(&self) -> ObjectKind;
}

#[derive(Debug)]
pub struct Project {
    name: String,
    address: String,
    networks: ObjectCache<u8, Network>,
}

impl Project {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: format!("//{name}"),
            networks: ObjectCache::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn networks(&self) -> &ObjectCache<u8, Network> {
        &self.networks
    }

    pub async fn network(&self, id: u8) -> Option<Arc<Network>> {
        self.networks.get(&id).await
    }

    /// Cached network for a raw id; `255` or garbage yields `None`.
    pub async fn get_or_create_network(self: &Arc<Self>, raw_id: &str) -> Option<Arc<Network>> {
        let id = parse_entity_id(raw_id)?;
        let parent = Arc::downgrade(self);
        let address = format!("{}/{}", self.address, id);
        Some(
            self.networks
                .get_or_insert_with(id, || Network::new(id, parent, address))
                .await,
        )
    }
}

impl CGateObject for Project {
    fn address(&self) -> &str {
        &self.address
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Project
    }
}

#[derive(Debug)]
pub struct Network {
    id: u8,
    address: String,
    project: Weak<Project>,
    applications: ObjectCache<u8, Application>,
    units: ObjectCache<u8, Unit>,
}

impl Network {
    fn new(id: u8, project: Weak<Project>, address: String) -> Self {
        Self {
            id,
            address,
            project,
            applications: ObjectCache::new(),
            units: ObjectCache::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// The owning project, while it is still cached.
    pub fn project(&self) -> Option<Arc<Project>> {
        self.project.upgrade()
    }

    pub fn project_name(&self) -> &str {
        self.address
            .get(2..)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default()
    }

    pub fn applications(&self) -> &ObjectCache<u8, Application> {
        &self.applications
    }

    pub fn units(&self) -> &ObjectCache<u8, Unit> {
        &self.units
    }

    pub async fn application(&self, id: u8) -> Option<Arc<Application>> {
        self.applications.get(&id).await
    }

    pub async fn unit(&self, id: u8) -> Option<Arc<Unit>> {
        self.units.get(&id).await
    }

    pub async fn get_or_create_application(self: &Arc<Self>, raw_id: &str) -> Option<Arc<Application>> {
        let id = parse_entity_id(raw_id)?;
        let parent = Arc::downgrade(self);
        let address = format!("{}/{}", self.address, id);
        Some(
            self.applications
                .get_or_insert_with(id, || Application::new(id, parent, address))
                .await,
        )
    }

    pub async fn get_or_create_unit(self: &Arc<Self>, raw_id: &str) -> Option<Arc<Unit>> {
        let id = parse_entity_id(raw_id)?;
        let parent = Arc::downgrade(self);
        let address = format!("{}/p/{}", self.address, id);
        Some(
            self.units
                .get_or_insert_with(id, || Unit::new(id, parent, address))
                .await,
        )
    }
}

impl CGateObject for Network {
    fn address(&self) -> &str {
        &self.address
    }

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Network
    }
}

#[derive(Debug)]
pub struct Application {
    id: u8,
    address: String,
    network: Weak<Network>,
    groups: ObjectCache<u8, Group>,
}

impl Application {
    fn new(id: u8, network: Weak<Network>, address: String) -> Self {
        Self {
            id,
            address,
            network,
            groups: ObjectCache::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn network(&self) -> Option<Arc<Network>> {
        self.network.upgrade()
    }

    pub fn groups(&self) -> &ObjectCache<u8, Group> {
        &self.groups
    }

    pub async fn group(&self, id: u8) -> Option<Arc<Group>> {
        self.groups.get(&id).await
    }

    pub async fn get_or_create_group(self: &Arc<Self>, raw_id: &str) -> Option<Arc<Group>> {
        let id = parse_entity_id(raw_id)?;
        let parent = Arc::downgrade(self);
        let address = format!("{}/{}", self.address, id);
        Some(
            self.groups
                .get_or_insert_with(id, || Group::new(id, parent, address))
                .await,
        )
    }
}

impl CGateObject for Application {
    fn address(&self) -> &str {
        &self.address
    }

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Application
    }
}

/// A group address within an application, e.g. one lighting circuit.
///
/// Level and name are cached from command replies and status changes.
#[derive(Debug)]
pub struct Group {
    id: u8,
    address: String,
    application: Weak<Application>,
    level: AtomicU8,
    name: Mutex<Option<String>>,
}

impl Group {
    fn new(id: u8, application: Weak<Application>, address: String) -> Self {
        Self {
            id,
            address,
            application,
            level: AtomicU8::new(0),
            name: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn application(&self) -> Option<Arc<Application>> {
        self.application.upgrade()
    }

    /// Last known level (0-255).
    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: u8) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// Cached tag name, if it has been fetched.
    pub fn name(&self) -> Option<String> {
        self.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.into());
    }
}

impl CGateObject for Group {
    fn address(&self) -> &str {
        &self.address
    }

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Group
    }
}

/// A physical C-Bus unit on a network.
#[derive(Debug)]
pub struct Unit {
    id: u8,
    address: String,
    network: Weak<Network>,
    unit_type: Mutex<String>,
}

impl Unit {
    fn new(id: u8, network: Weak<Network>, address: String) -> Self {
        Self {
            id,
            address,
            network,
            unit_type: Mutex::new(String::new()),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn network(&self) -> Option<Arc<Network>> {
        self.network.upgrade()
    }

    pub fn unit_type(&self) -> String {
        self.unit_type.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_unit_type(&self, unit_type: impl Into<String>) {
        *self.unit_type.lock().unwrap_or_else(PoisonError::into_inner) = unit_type.into();
    }
}

impl CGateObject for Unit {
    fn address(&self) -> &str {
        &self.address
    }

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Unit
    }
}
