// MIT License - Copyright (c) 2026 Peter Wright
// Routes tagged command-port lines to the response of the command that caused them

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cgate::protocol::{is_continuation, split_tagged};
use crate::cgate::response::Response;

/// Where an inbound line went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Appended to a pending response that expects more lines
    Partial { id: u32 },
    /// Terminal line; the response is complete and no longer pending
    Complete { id: u32 },
    /// Tagged with an id nobody is waiting for (e.g. the caller timed out)
    Orphan { id: u32 },
    /// Line without an id tag, such as the connect greeting
    Unsolicited,
}

/// Tracks in-flight commands by id and routes response lines to them.
///
/// Ids are unique among in-flight commands. A response stays pending until
/// its terminal line arrives or the connection closes.
#[derive(Debug)]
pub struct ResponseDemux {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Response>>,
}

impl Default for ResponseDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDemux {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and register an empty response for `command`.
    pub async fn register(&self, command: &str) -> (u32, Response) {
        let mut pending = self.pending.lock().await;
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !pending.contains_key(&id) {
                break id;
            }
        };
        let response = Response::new(command);
        pending.insert(id, response.clone());
        trace!("Registered command {} as [{}]", command, id);
        (id, response)
    }

    /// Drop a pending response without completing it (e.g. the write failed).
    pub async fn cancel(&self, id: u32) -> Option<Response> {
        self.pending.lock().await.remove(&id)
    }

    /// Route one line read from the command port.
    pub async fn route_line(&self, line: &str) -> Routed {
        let Some((id, text)) = split_tagged(line) else {
            debug!("Unsolicited command-port line: {}", line);
            return Routed::Unsolicited;
        };

        let mut pending = self.pending.lock().await;
        if is_continuation(text) {
            match pending.get(&id) {
                Some(response) => {
                    response.push_line(text.to_string(), false);
                    Routed::Partial { id }
                }
                None => {
                    warn!("Response line for unknown command [{}]: {}", id, text);
                    Routed::Orphan { id }
                }
            }
        } else {
            match pending.remove(&id) {
                Some(response) => {
                    response.push_line(text.to_string(), true);
                    Routed::Complete { id }
                }
                None => {
                    warn!("Response line for unknown command [{}]: {}", id, text);
                    Routed::Orphan { id }
                }
            }
        }
    }

    /// Complete every pending response with whatever it has received.
    ///
    /// Called when the connection closes so no waiter blocks forever.
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<Response> = self.pending.lock().await.drain().map(|(_, r)| r).collect();
        for response in &drained {
            debug!("Completing interrupted command: {}", response.command());
            response.abort();
        }
        drained.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::time::Duration;

    const WAIT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_ids_unique_under_concurrency() {
        let demux = Arc::new(ResponseDemux::new());
        let mut handles = Vec::new();
        for i in 0..64 {
            let demux = demux.clone();
            handles.push(tokio::spawn(async move {
                demux.register(&format!("get //HOME/254/56/{i} level")).await.0
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(demux.pending_count().await, 64);
    }

    #[tokio::test]
    async fn test_interleaved_lines_reach_their_own_response() {
        let demux = ResponseDemux::new();
        let (a, resp_a) = demux.register("tree //HOME/254").await;
        let (b, resp_b) = demux.register("noop").await;

        demux.route_line(&format!("[{a}] 343-//HOME/254/56/1")).await;
        assert_eq!(
            demux.route_line(&format!("[{b}] 200 OK.")).await,
            Routed::Complete { id: b }
        );
        demux.route_line(&format!("[{a}] 343-//HOME/254/56/2")).await;
        demux.route_line(&format!("[{a}] 344 end")).await;

        assert_eq!(
            resp_a.to_vec(WAIT).await.unwrap(),
            vec!["343-//HOME/254/56/1", "343-//HOME/254/56/2", "344 end"]
        );
        assert_eq!(resp_b.to_vec(WAIT).await.unwrap(), vec!["200 OK."]);
        assert_eq!(demux.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_terminal_line_detection() {
        let demux = ResponseDemux::new();
        let (id, resp) = demux.register("project dir").await;
        assert_eq!(id, 1);

        assert_eq!(demux.route_line("[1] 200-partial").await, Routed::Partial { id: 1 });
        assert!(!resp.is_complete());
        assert_eq!(demux.route_line("[1] 200 rest").await, Routed::Complete { id: 1 });
        assert!(resp.is_complete());
        assert_eq!(resp.snapshot(), vec!["200-partial", "200 rest"]);
    }

    #[tokio::test]
    async fn test_orphan_and_unsolicited_lines() {
        let demux = ResponseDemux::new();
        assert_eq!(demux.route_line("201 Service ready").await, Routed::Unsolicited);
        assert_eq!(demux.route_line("[99] 200 OK.").await, Routed::Orphan { id: 99 });
        assert_eq!(demux.route_line("[99] 200-more").await, Routed::Orphan { id: 99 });
    }

    #[tokio::test]
    async fn test_fail_all_completes_pending() {
        let demux = ResponseDemux::new();
        let (id, resp) = demux.register("tree //HOME/254").await;
        demux.route_line(&format!("[{id}] 343-//HOME/254/56/1")).await;
        let (_, other) = demux.register("noop").await;

        assert_eq!(demux.fail_all().await, 2);
        assert_eq!(demux.pending_count().await, 0);
        assert_eq!(resp.to_vec(WAIT).await.unwrap(), vec!["343-//HOME/254/56/1"]);
        assert!(other.to_vec(WAIT).await.unwrap().is_empty());
        assert!(other.was_aborted());
    }

    #[tokio::test]
    async fn test_cancel_removes_pending() {
        let demux = ResponseDemux::new();
        let (id, _resp) = demux.register("noop").await;
        assert!(demux.cancel(id).await.is_some());
        assert_eq!(demux.route_line(&format!("[{id}] 200 OK.")).await, Routed::Orphan { id });
    }
}
