// MIT License - Copyright (c) 2026 Peter Wright
// One supervised TCP channel to C-Gate (command, event or status change port)

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::config::ReconnectPolicy;
use crate::connection::{connect_tcp, reconnect_with_backoff, ConnectionState};
use crate::error::{GatewayError, Result};
use crate::event::{EventSender, GatewayEvent, Link};

/// Receives the lines read from one channel.
///
/// The handler belongs to the connection object, not to a socket, so it keeps
/// receiving lines across reconnects.
pub trait LineHandler: Send + Sync + 'static {
    fn handle_line(&self, line: String) -> impl Future<Output = ()> + Send;

    /// Called after the socket has gone away, before any reconnect.
    fn on_disconnect(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Static settings of one channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub link: Link,
    pub addr: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

struct Inner<H> {
    settings: ChannelSettings,
    handler: Arc<H>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    /// Bumped by `sever`; the reader drops its socket when it sees a change.
    sever_tx: watch::Sender<u64>,
    events: EventSender,
    task: StdMutex<Option<JoinHandle<()>>>,
    /// Serialises `start` calls.
    starting: Mutex<()>,
}

/// A line-oriented channel that reconnects itself after an unexpected close.
pub struct CGateConnection<H: LineHandler> {
    inner: Arc<Inner<H>>,
}

impl<H: LineHandler> CGateConnection<H> {
    pub fn new(settings: ChannelSettings, handler: Arc<H>, events: EventSender) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (sever_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                settings,
                handler,
                writer: Mutex::new(None),
                state_tx,
                shutdown_tx,
                sever_tx,
                events,
                task: StdMutex::new(None),
                starting: Mutex::new(()),
            }),
        }
    }

    pub fn link(&self) -> Link {
        self.inner.settings.link
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    /// Connect unless the channel is connected or its supervisor is already
    /// reconnecting. The connect itself is bounded by the configured connect
    /// timeout; a failure leaves the channel disconnected.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.inner.starting.lock().await;
        if self.supervised() {
            return Ok(());
        }
        let link = self.inner.settings.link;
        self.inner.shutdown_tx.send_replace(false);
        self.inner.state_tx.send_replace(ConnectionState::Connecting);

        match connect_tcp(&self.inner.settings.addr, self.inner.settings.connect_timeout).await {
            Ok(stream) => {
                info!("{}: connected to {}", link, self.inner.settings.addr);
                let sever_rx = self.inner.sever_tx.subscribe();
                let reader = install(&self.inner, stream).await;
                let handle = tokio::spawn(run_reader(self.inner.clone(), reader, sever_rx));
                *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!("{}: connect failed: {}", link, e);
                self.inner.state_tx.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Whether a reader task owns the channel, connected or in backoff.
    fn supervised(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Deliberately close the channel. No reconnect follows.
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let handle = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let was_connected = self.is_connected();
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        self.inner.handler.on_disconnect().await;
        if was_connected {
            info!("{}: closed", self.inner.settings.link);
            let _ = self.inner.events.send(GatewayEvent::Disconnected {
                link: self.inner.settings.link,
            });
        }
    }

    /// Force the current socket closed; the supervisor then reconnects.
    /// A request made while no socket is up is dropped.
    pub fn sever(&self) {
        warn!("{}: severing connection", self.inner.settings.link);
        self.inner.sever_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Write one line (the terminator is appended).
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(GatewayError::NotConnected)?;
        trace!("{} <- {}", self.inner.settings.link, line.trim_end());
        let mut data = line.trim_end_matches(['\r', '\n']).to_string();
        data.push_str("\r\n");
        writer.write_all(data.as_bytes()).await.map_err(|e| {
            error!("{}: write failed: {}", self.inner.settings.link, e);
            GatewayError::Io(e)
        })
    }
}

impl<H: LineHandler> Drop for CGateConnection<H> {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
        if let Some(handle) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Install a freshly connected stream and hand back its read half.
async fn install<H: LineHandler>(inner: &Inner<H>, stream: TcpStream) -> OwnedReadHalf {
    let (reader, writer) = stream.into_split();
    *inner.writer.lock().await = Some(writer);
    inner.state_tx.send_replace(ConnectionState::Connected);
    let _ = inner.events.send(GatewayEvent::Connected {
        link: inner.settings.link,
    });
    reader
}

enum ReadOutcome {
    Shutdown,
    Lost,
}

async fn read_lines<H: LineHandler>(
    inner: &Inner<H>,
    reader: OwnedReadHalf,
    shutdown_rx: &mut watch::Receiver<bool>,
    sever_rx: &mut watch::Receiver<u64>,
) -> ReadOutcome {
    let link = inner.settings.link;
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return ReadOutcome::Shutdown;
                }
            }
            _ = sever_rx.changed() => {
                return ReadOutcome::Lost;
            }
            read = timeout(inner.settings.read_timeout, lines.next_line()) => match read {
                Ok(Ok(Some(line))) => {
                    trace!("{} -> {}", link, line);
                    inner.handler.handle_line(line).await;
                }
                Ok(Ok(None)) => {
                    debug!("{}: connection closed by peer", link);
                    return ReadOutcome::Lost;
                }
                Ok(Err(e)) => {
                    error!("{}: read error: {}", link, e);
                    return ReadOutcome::Lost;
                }
                // Idle; keep waiting
                Err(_) => {}
            },
        }
    }
}

/// Reader task: reads until the socket goes away, then supervises the reconnect
/// and carries on with the new socket.
async fn run_reader<H: LineHandler>(
    inner: Arc<Inner<H>>,
    mut reader: OwnedReadHalf,
    mut sever_rx: watch::Receiver<u64>,
) {
    let link = inner.settings.link;
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        let outcome = read_lines(&inner, reader, &mut shutdown_rx, &mut sever_rx).await;

        inner.writer.lock().await.take();
        inner.state_tx.send_replace(ConnectionState::Disconnected);
        inner.handler.on_disconnect().await;
        let _ = inner.events.send(GatewayEvent::Disconnected { link });

        if matches!(outcome, ReadOutcome::Shutdown) || *shutdown_rx.borrow() {
            return;
        }

        warn!("{}: connection lost", link);
        inner.state_tx.send_replace(ConnectionState::Connecting);
        let settings = &inner.settings;
        let reconnected = reconnect_with_backoff(link, &settings.reconnect, &mut shutdown_rx, || {
            connect_tcp(&settings.addr, settings.connect_timeout)
        })
        .await;

        match reconnected {
            Some(stream) => {
                sever_rx.mark_unchanged();
                reader = install(&inner, stream).await;
            }
            None => {
                if !*shutdown_rx.borrow() {
                    inner.state_tx.send_replace(ConnectionState::Failed);
                    let _ = inner.events.send(GatewayEvent::ConnectionFailed {
                        link,
                        reason: "reconnect attempts exhausted".to_string(),
                    });
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<String>);

    impl LineHandler for Collect {
        async fn handle_line(&self, line: String) {
            let _ = self.0.send(line);
        }
    }

    fn settings(addr: String) -> ChannelSettings {
        ChannelSettings {
            link: Link::CGateEvent,
            addr,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(50),
            reconnect: ReconnectPolicy {
                base_delay_ms: 10,
                max_backoff_shift: 0,
                max_retries: Some(50),
            },
        }
    }

    #[tokio::test]
    async fn test_lines_reach_handler_and_writes_are_terminated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events, _) = event_channel(16);
        let conn = CGateConnection::new(settings(addr), Arc::new(Collect(tx)), events);

        conn.start().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(b"first\r\nsecond\n").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");

        conn.write_line("[1] noop").await.unwrap();
        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"[1] noop\r\n");

        conn.stop().await;
        assert!(!conn.is_connected());
        assert!(matches!(conn.write_line("x").await, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events, _) = event_channel(16);
        let conn = CGateConnection::new(settings(addr), Arc::new(Collect(tx)), events);

        conn.start().await.unwrap();
        conn.start().await.unwrap();
        let _first = listener.accept().await.unwrap();
        let second = timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events, mut events_rx) = event_channel(16);
        let conn = CGateConnection::new(settings(addr), Arc::new(Collect(tx)), events);

        conn.start().await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let (mut server, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        server.write_all(b"after reconnect\n").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "after reconnect");

        let mut saw_disconnect = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, GatewayEvent::Disconnected { link: Link::CGateEvent }) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
        conn.stop().await;
    }

    struct Slow(mpsc::UnboundedSender<String>);

    impl LineHandler for Slow {
        async fn handle_line(&self, line: String) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = self.0.send(line);
        }
    }

    #[tokio::test]
    async fn test_start_during_backoff_leaves_reconnect_to_supervisor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events, _) = event_channel(16);
        let mut slow_backoff = settings(addr);
        slow_backoff.reconnect.base_delay_ms = 400;
        let conn = CGateConnection::new(slow_backoff, Arc::new(Collect(tx)), events);

        conn.start().await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let mut state = conn.state_watch();
        timeout(Duration::from_secs(2), state.wait_for(|s| *s == ConnectionState::Connecting))
            .await
            .unwrap()
            .unwrap();

        // The supervisor is sleeping; start must neither dial nor cut the backoff short
        conn.start().await.unwrap();
        conn.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        let early = timeout(Duration::from_millis(150), listener.accept()).await;
        assert!(early.is_err());

        let _second = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(2), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();
        let third = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(third.is_err());
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_sever_while_handling_a_line_is_not_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events, _) = event_channel(16);
        let conn = CGateConnection::new(settings(addr), Arc::new(Slow(tx)), events);

        conn.start().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(b"busy\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The reader is inside the handler, not waiting on the sever signal
        conn.sever();
        assert_eq!(rx.recv().await.unwrap(), "busy");
        let reconnected = timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(reconnected.is_ok());
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_sever_before_start_does_not_cut_the_next_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events, _) = event_channel(16);
        let conn = CGateConnection::new(settings(addr), Arc::new(Collect(tx)), events);

        conn.sever();
        conn.start().await.unwrap();
        let _server = listener.accept().await.unwrap();
        let again = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(again.is_err());
        assert!(conn.is_connected());
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_stop_does_not_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events, _) = event_channel(16);
        let conn = CGateConnection::new(settings(addr), Arc::new(Collect(tx)), events);

        conn.start().await.unwrap();
        let _server = listener.accept().await.unwrap();
        conn.stop().await;

        let again = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(again.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
