// MIT License - Copyright (c) 2026 Peter Wright
// C-Gate session: three channels, keep-alive, object cache and the command layer

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cgate::cache::{CacheCategory, SessionCache};
use crate::cgate::connection::{CGateConnection, ChannelSettings, LineHandler};
use crate::cgate::demux::{ResponseDemux, Routed};
use crate::cgate::objects::{CGateObject, Group, Network, Project};
use crate::cgate::protocol::{
    format_command, parse_tree_line, response_to_map, CGateEvent, MapStyle, ObjectPath,
    StatusChange, TreeEntry,
};
use crate::cgate::response::Response;
use crate::config::CGateConfig;
use crate::connection::ConnectionState;
use crate::error::{GatewayError, Result};
use crate::event::{event_channel, EventReceiver, EventSender, Link};

const BROADCAST_CAPACITY: usize = 256;

/// Command port handler: routes replies to their pending commands.
pub struct CommandChannel {
    demux: ResponseDemux,
    cache: Arc<SessionCache>,
}

impl CommandChannel {
    pub fn demux(&self) -> &ResponseDemux {
        &self.demux
    }
}

impl LineHandler for CommandChannel {
    async fn handle_line(&self, line: String) {
        if let Routed::Unsolicited = self.demux.route_line(&line).await {
            debug!("C-Gate: {}", line);
        }
    }

    async fn on_disconnect(&self) {
        let interrupted = self.demux.fail_all().await;
        if interrupted > 0 {
            debug!("{} command(s) interrupted by disconnect", interrupted);
        }
        self.cache.invalidate_all().await;
    }
}

/// Event port handler.
pub struct EventChannel {
    tx: broadcast::Sender<CGateEvent>,
}

impl LineHandler for EventChannel {
    async fn handle_line(&self, line: String) {
        match CGateEvent::parse(&line) {
            Some(event) => {
                let _ = self.tx.send(event);
            }
            None => debug!("Ignoring malformed event line: {}", line),
        }
    }
}

/// Status change port handler: keeps cached group levels current.
pub struct StatusChangeChannel {
    tx: broadcast::Sender<StatusChange>,
    cache: Arc<SessionCache>,
}

impl LineHandler for StatusChangeChannel {
    async fn handle_line(&self, line: String) {
        let Some(change) = StatusChange::parse(&line) else {
            debug!("Ignoring malformed status change: {}", line);
            return;
        };
        if let (Some(level), Ok(path)) = (change.resulting_level(), ObjectPath::parse(&change.address))
            && let Some(group) = self.cache.find_group(&path).await
        {
            group.set_level(level);
        }
        let _ = self.tx.send(change);
    }
}

/// Register a command, write it, and return its (still filling) response.
async fn submit(command: &CGateConnection<CommandChannel>, text: &str) -> Result<Response> {
    let demux = command.handler().demux();
    let (id, response) = demux.register(text).await;
    if let Err(e) = command.write_line(&format_command(id, text)).await {
        demux.cancel(id).await;
        return Err(e);
    }
    Ok(response)
}

fn spawn_keepalive(
    command: Weak<CGateConnection<CommandChannel>>,
    interval: Duration,
    limit: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(command) = command.upgrade() else {
                break;
            };
            if !command.is_connected() {
                continue;
            }
            let result = match submit(&command, "noop").await {
                Ok(response) => response.handle_200(limit).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Keep-alive failed: {}", e);
                command.sever();
            }
        }
    })
}

/// A session with one C-Gate server.
///
/// Owns the command, event and status change channels, the object cache and
/// the subscriber channels. Subscriptions stay valid across reconnects.
pub struct CGateSession {
    config: CGateConfig,
    cache: Arc<SessionCache>,
    command: Arc<CGateConnection<CommandChannel>>,
    event: Option<CGateConnection<EventChannel>>,
    status_change: Option<CGateConnection<StatusChangeChannel>>,
    events_tx: broadcast::Sender<CGateEvent>,
    status_tx: broadcast::Sender<StatusChange>,
    lifecycle_tx: EventSender,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
}

impl CGateSession {
    pub fn new(config: CGateConfig) -> Self {
        let cache = Arc::new(SessionCache::new());
        let (lifecycle_tx, _) = event_channel(BROADCAST_CAPACITY);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let settings = |link: Link, addr: String| ChannelSettings {
            link,
            addr,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            reconnect: config.reconnect.clone(),
        };

        let command = Arc::new(CGateConnection::new(
            settings(Link::CGateCommand, config.command_addr()),
            Arc::new(CommandChannel {
                demux: ResponseDemux::new(),
                cache: cache.clone(),
            }),
            lifecycle_tx.clone(),
        ));

        let (event, status_change) = if config.enable_event_channels {
            (
                Some(CGateConnection::new(
                    settings(Link::CGateEvent, config.event_addr()),
                    Arc::new(EventChannel {
                        tx: events_tx.clone(),
                    }),
                    lifecycle_tx.clone(),
                )),
                Some(CGateConnection::new(
                    settings(Link::CGateStatusChange, config.status_change_addr()),
                    Arc::new(StatusChangeChannel {
                        tx: status_tx.clone(),
                        cache: cache.clone(),
                    }),
                    lifecycle_tx.clone(),
                )),
            )
        } else {
            (None, None)
        };

        Self {
            config,
            cache,
            command,
            event,
            status_change,
            events_tx,
            status_tx,
            lifecycle_tx,
            keepalive: StdMutex::new(None),
        }
    }

    /// Open every channel and start the keep-alive. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to C-Gate at {}", self.config.host);
        self.command.start().await?;
        if let Some(event) = &self.event {
            event.start().await?;
        }
        if let Some(status_change) = &self.status_change {
            status_change.start().await?;
        }

        let mut keepalive = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner);
        if keepalive.is_none() {
            *keepalive = Some(spawn_keepalive(
                Arc::downgrade(&self.command),
                Duration::from_millis(self.config.keepalive_interval_ms),
                Duration::from_millis(self.config.keepalive_timeout_ms),
            ));
        }
        Ok(())
    }

    /// Deliberately close every channel and clear the object cache.
    pub async fn close(&self) {
        info!("Closing C-Gate session");
        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = keepalive {
            handle.abort();
        }
        self.command.stop().await;
        if let Some(event) = &self.event {
            event.stop().await;
        }
        if let Some(status_change) = &self.status_change {
            status_change.stop().await;
        }
        self.cache.invalidate_all().await;
    }

    /// Whether the command channel is up.
    pub fn is_connected(&self) -> bool {
        self.command.is_connected()
    }

    pub fn command_state(&self) -> ConnectionState {
        self.command.state()
    }

    /// Force the command channel closed so the supervisor reconnects it.
    pub fn sever(&self) {
        self.command.sever();
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub async fn invalidate(&self, category: CacheCategory) {
        self.cache.invalidate(category).await;
    }

    /// Session lifecycle events (connects, disconnects, reconnect failures).
    pub fn subscribe(&self) -> EventReceiver {
        self.lifecycle_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CGateEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Send a raw command. The returned response fills as lines arrive.
    pub async fn send_command(&self, text: &str) -> Result<Response> {
        if !self.command.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        debug!("Sending command: {}", text);
        submit(&self.command, text).await
    }

    async fn command_200(&self, text: &str) -> Result<()> {
        self.send_command(text)
            .await?
            .handle_200(self.config.response_timeout())
            .await
    }

    async fn command_lines(&self, text: &str) -> Result<Vec<String>> {
        self.send_command(text)
            .await?
            .data_lines(self.config.response_timeout())
            .await
    }

    /// `project dir`: every project known to the server.
    pub async fn list_projects(&self) -> Result<Vec<Arc<Project>>> {
        let mut projects: Vec<Arc<Project>> = Vec::new();
        for line in self.command_lines("project dir").await? {
            let map = response_to_map(&line, MapStyle::Tokens);
            if let Some(name) = map.get("project")
                && let Some(project) = self.cache.get_or_create_project(name).await
                && !projects.iter().any(|p| Arc::ptr_eq(p, &project))
            {
                projects.push(project);
            }
        }
        Ok(projects)
    }

    /// Cached project by name. Does not contact C-Gate.
    pub async fn project(&self, name: &str) -> Option<Arc<Project>> {
        self.cache.project(name).await
    }

    pub async fn load_project(&self, name: &str) -> Result<()> {
        self.command_200(&format!("project load {name}")).await
    }

    pub async fn use_project(&self, name: &str) -> Result<()> {
        self.command_200(&format!("project use {name}")).await
    }

    pub async fn start_project(&self, name: &str) -> Result<()> {
        self.command_200(&format!("project start {name}")).await
    }

    pub async fn stop_project(&self, name: &str) -> Result<()> {
        self.command_200(&format!("project stop {name}")).await
    }

    /// `net list_all`: every network of every project.
    pub async fn list_networks(&self) -> Result<Vec<Arc<Network>>> {
        let mut networks = Vec::new();
        for line in self.command_lines("net list_all").await? {
            let map = response_to_map(&line, MapStyle::Tokens);
            let (Some(project), Some(network)) = (map.get("project"), map.get("network")) else {
                continue;
            };
            let Some(project) = self.cache.get_or_create_project(project).await else {
                continue;
            };
            if let Some(network) = project.get_or_create_network(network).await {
                networks.push(network);
            }
        }
        Ok(networks)
    }

    /// Current state of a network (e.g. `ok`); empty when unreported.
    pub async fn network_state(&self, network: &Network) -> Result<String> {
        let map = self
            .send_command(&format!("get {} state", network.address()))
            .await?
            .to_map(self.config.response_timeout(), MapStyle::Tokens)
            .await?;
        Ok(map.get("state").cloned().unwrap_or_default())
    }

    /// `tree //P/N`: populate the network's applications, groups and units.
    pub async fn tree(&self, network: &Arc<Network>) -> Result<Vec<TreeEntry>> {
        let project = network.project_name().to_string();
        let mut entries = Vec::new();
        for line in self.command_lines(&format!("tree {}", network.address())).await? {
            let Some(entry) = parse_tree_line(&line, &project, network.id()) else {
                continue;
            };
            match &entry {
                TreeEntry::Group {
                    application,
                    group,
                    level,
                } => {
                    let Some(app) = network.get_or_create_application(&application.to_string()).await else {
                        continue;
                    };
                    if let Some(group) = app.get_or_create_group(&group.to_string()).await
                        && let Some(level) = level
                    {
                        group.set_level(*level);
                    }
                }
                TreeEntry::Unit { unit, unit_type } => {
                    if let Some(unit) = network.get_or_create_unit(&unit.to_string()).await {
                        unit.set_unit_type(unit_type.clone());
                    }
                }
            }
            entries.push(entry);
        }
        debug!("tree {}: {} objects", network.address(), entries.len());
        Ok(entries)
    }

    /// Resolve a network address such as `//HOME/254`.
    pub async fn resolve_network(&self, address: &str) -> Result<Arc<Network>> {
        let invalid = || GatewayError::InvalidAddress {
            address: address.to_string(),
        };
        let ObjectPath::Network { project, network } = ObjectPath::parse(address)? else {
            return Err(invalid());
        };
        let project = self.cache.get_or_create_project(&project).await.ok_or_else(invalid)?;
        project
            .get_or_create_network(&network.to_string())
            .await
            .ok_or_else(invalid)
    }

    /// Resolve a group address, creating cache entries along the way.
    pub async fn resolve_group(&self, address: &str) -> Result<Arc<Group>> {
        let invalid = || GatewayError::InvalidAddress {
            address: address.to_string(),
        };
        let ObjectPath::Group {
            project,
            network,
            application,
            group,
        } = ObjectPath::parse(address)?
        else {
            return Err(invalid());
        };
        let project = self.cache.get_or_create_project(&project).await.ok_or_else(invalid)?;
        let network = project
            .get_or_create_network(&network.to_string())
            .await
            .ok_or_else(invalid)?;
        let application = network
            .get_or_create_application(&application.to_string())
            .await
            .ok_or_else(invalid)?;
        application
            .get_or_create_group(&group.to_string())
            .await
            .ok_or_else(invalid)
    }

    pub async fn group_on(&self, group: &Group) -> Result<()> {
        self.command_200(&format!("on {}", group.address())).await?;
        group.set_level(255);
        Ok(())
    }

    pub async fn group_off(&self, group: &Group) -> Result<()> {
        self.command_200(&format!("off {}", group.address())).await?;
        group.set_level(0);
        Ok(())
    }

    /// Ramp to `level` over `ramp_secs` seconds (0 = instant).
    pub async fn group_ramp(&self, group: &Group, level: u8, ramp_secs: u32) -> Result<()> {
        self.command_200(&format!("ramp {} {} {}s", group.address(), level, ramp_secs))
            .await?;
        group.set_level(level);
        Ok(())
    }

    pub async fn group_terminate_ramp(&self, group: &Group) -> Result<()> {
        self.command_200(&format!("terminateramp {}", group.address())).await
    }

    /// Current level of a group (0 when unreported); updates the cache.
    pub async fn group_level(&self, group: &Group) -> Result<u8> {
        let map = self
            .send_command(&format!("get {} level", group.address()))
            .await?
            .to_map(self.config.response_timeout(), MapStyle::Tokens)
            .await?;
        let level = map.get("level").and_then(|l| l.parse().ok()).unwrap_or(0);
        group.set_level(level);
        Ok(level)
    }

    /// Tag name of a group from the project database; empty when unset.
    pub async fn group_name(&self, group: &Group) -> Result<String> {
        let map = self
            .send_command(&format!("dbget {}/TagName", group.address()))
            .await?
            .to_map(self.config.response_timeout(), MapStyle::Database)
            .await?;
        let name = map.get("TagName").cloned().unwrap_or_default();
        group.set_name(name.clone());
        Ok(name)
    }
}

impl Drop for CGateSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_channel_routes_and_fails() {
        let cache = Arc::new(SessionCache::new());
        cache.get_or_create_project("HOME").await.unwrap();
        let channel = CommandChannel {
            demux: ResponseDemux::new(),
            cache: cache.clone(),
        };

        let (id, response) = channel.demux().register("noop").await;
        channel.handle_line(format!("[{id}] 200 OK.")).await;
        assert_eq!(response.snapshot(), vec!["200 OK."]);

        let (_, pending) = channel.demux().register("tree //HOME/254").await;
        channel.on_disconnect().await;
        assert!(pending.was_aborted());
        assert!(cache.projects().await.is_empty());
    }

    #[tokio::test]
    async fn test_status_change_updates_cached_level() {
        let cache = Arc::new(SessionCache::new());
        let group = cache
            .get_or_create_project("HOME")
            .await
            .unwrap()
            .get_or_create_network("254")
            .await
            .unwrap()
            .get_or_create_application("56")
            .await
            .unwrap()
            .get_or_create_group("1")
            .await
            .unwrap();
        let (tx, mut rx) = broadcast::channel(4);
        let channel = StatusChangeChannel { tx, cache };

        channel
            .handle_line("lighting ramp //HOME/254/56/1 128 4 #sourceunit=8".to_string())
            .await;
        assert_eq!(group.level(), 128);
        channel
            .handle_line("lighting on //HOME/254/56/1  #sourceunit=8".to_string())
            .await;
        assert_eq!(group.level(), 255);
        channel.handle_line("garbage".to_string()).await;

        assert_eq!(rx.recv().await.unwrap().level, Some(128));
        assert_eq!(rx.recv().await.unwrap().resulting_level(), Some(255));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_channel_parses_lines() {
        let (tx, mut rx) = broadcast::channel(4);
        let channel = EventChannel { tx };
        channel
            .handle_line("20260118-134501 702 Lighting group 56/1 on".to_string())
            .await;
        channel.handle_line("x".to_string()).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.code, 702);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commands_fail_fast_when_disconnected() {
        let session = CGateSession::new(CGateConfig::default());
        assert!(!session.is_connected());
        assert!(matches!(
            session.send_command("noop").await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_resolve_group_builds_hierarchy() {
        let session = CGateSession::new(CGateConfig::default());
        let group = session.resolve_group("//HOME/254/56/9").await.unwrap();
        assert_eq!(group.address(), "//HOME/254/56/9");
        assert!(session.project("HOME").await.is_some());
        assert!(matches!(
            session.resolve_group("//HOME/254").await,
            Err(GatewayError::InvalidAddress { .. })
        ));
        assert!(session.resolve_group("//HOME/255/56/9").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_network() {
        let session = CGateSession::new(CGateConfig::default());
        let network = session.resolve_network("//HOME/254").await.unwrap();
        assert_eq!(network.address(), "//HOME/254");
        assert_eq!(network.project_name(), "HOME");
        assert!(session.resolve_network("//HOME/254/56/1").await.is_err());
    }
}
