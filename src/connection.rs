// MIT License - Copyright (c) 2026 Peter Wright
// Connection management shared by the C-Gate channels and the Pentair bus

use std::future::Future;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::{GatewayError, Result};
use crate::event::Link;

/// Lifecycle of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The supervisor exhausted its retries
    Failed,
}

/// Open a TCP connection with a bounded connect time.
pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    debug!("Connecting to {}", addr);
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(GatewayError::ConnectFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(GatewayError::ConnectionTimeout),
    }
}

/// Repeatedly run `connect` under `policy` until it succeeds, the policy is
/// exhausted, or shutdown is requested.
///
/// Returns `None` when no connection was made. The first attempt is delayed by
/// `policy.delay_for(1)` so a freshly dropped peer is not hammered. A dropped
/// shutdown sender counts as a shutdown request.
pub async fn reconnect_with_backoff<T, F, Fut>(
    link: Link,
    policy: &ReconnectPolicy,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut connect: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if !policy.allows(attempt) {
            error!("{}: giving up after {} reconnection attempts", link, attempt - 1);
            return None;
        }

        let delay = policy.delay_for(attempt);
        info!(
            "{}: reconnecting in {:.1}s (attempt {})",
            link,
            delay.as_secs_f64(),
            attempt
        );
        let owner_gone = tokio::select! {
            _ = sleep(delay) => false,
            changed = shutdown_rx.changed() => changed.is_err(),
        };
        if owner_gone || *shutdown_rx.borrow() {
            debug!("{}: shutdown requested, abandoning reconnect", link);
            return None;
        }

        match connect().await {
            Ok(value) => {
                info!("{}: reconnected after {} attempt(s)", link, attempt);
                return Some(value);
            }
            Err(e) => warn!("{}: reconnection attempt {} failed: {}", link, attempt, e),
        }
    }
}

const FRAMING_ERROR_LIMIT: u32 = 10;
const FRAMING_RESET_WINDOW: Duration = Duration::from_secs(60);

/// Counts framing errors within a sliding window.
///
/// Individual errors are recovered by resynchronizing the stream; only a burst
/// of more than `limit` errors without a quiet minute in between is treated as
/// a broken link.
#[derive(Debug)]
pub struct FramingGuard {
    count: u32,
    last_error: Option<Instant>,
    limit: u32,
    window: Duration,
}

impl Default for FramingGuard {
    fn default() -> Self {
        Self::new(FRAMING_ERROR_LIMIT, FRAMING_RESET_WINDOW)
    }
}

impl FramingGuard {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            count: 0,
            last_error: None,
            limit,
            window,
        }
    }

    /// Record one framing error. Returns an error once the limit is exceeded.
    pub fn record(&mut self) -> Result<()> {
        if let Some(last) = self.last_error
            && last.elapsed() > self.window
        {
            self.count = 0;
        }

        self.count += 1;
        self.last_error = Some(Instant::now());

        if self.count > self.limit {
            Err(GatewayError::FramingLimitExceeded { limit: self.limit })
        } else {
            Ok(())
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_framing_guard_limit() {
        let mut guard = FramingGuard::new(3, Duration::from_secs(60));
        assert!(guard.record().is_ok());
        assert!(guard.record().is_ok());
        assert!(guard.record().is_ok());
        assert!(matches!(
            guard.record(),
            Err(GatewayError::FramingLimitExceeded { limit: 3 })
        ));
        guard.reset();
        assert_eq!(guard.count(), 0);
    }

    #[test]
    fn test_framing_guard_window_resets() {
        let mut guard = FramingGuard::new(1, Duration::from_millis(0));
        assert!(guard.record().is_ok());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(guard.record().is_ok());
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        // Bind then drop a listener to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_tcp(&addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectFailed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_bounded_retries() {
        let policy = ReconnectPolicy {
            base_delay_ms: 1,
            max_backoff_shift: 0,
            max_retries: Some(3),
        };
        let (_tx, mut rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Option<()> = reconnect_with_backoff(Link::PentairBus, &policy, &mut rx, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::ConnectionTimeout)
            }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reconnect_succeeds_eventually() {
        let policy = ReconnectPolicy {
            base_delay_ms: 1,
            max_backoff_shift: 0,
            max_retries: None,
        };
        let (_tx, mut rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = reconnect_with_backoff(Link::CGateCommand, &policy, &mut rx, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Disconnected)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_reconnect_stops_on_shutdown() {
        let policy = ReconnectPolicy {
            base_delay_ms: 60_000,
            max_backoff_shift: 0,
            max_retries: None,
        };
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            reconnect_with_backoff::<(), _, _>(Link::PentairBus, &policy, &mut rx, || async {
                Ok(())
            })
            .await
        });
        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_none());
    }
}
