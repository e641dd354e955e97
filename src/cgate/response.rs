// MIT License - Copyright (c) 2026 Peter Wright
// Buffered, multi-consumer response to one C-Gate command

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

use crate::cgate::protocol::{response_to_map, MapStyle};
use crate::error::{CGateStatus, GatewayError, Result};

#[derive(Debug, Default)]
struct State {
    lines: Vec<String>,
    complete: bool,
    aborted: bool,
}

#[derive(Debug)]
struct Shared {
    command: String,
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The response to one command: a growable buffer of lines plus a completion flag.
///
/// Lines are appended by the connection's reader task in network order. Any
/// number of consumers may read it, either by waiting for completion and
/// taking a snapshot, or by iterating a [`ResponseCursor`] as lines arrive.
/// Every cursor starts at the first line.
#[derive(Debug, Clone)]
pub struct Response {
    inner: Arc<Shared>,
}

impl Response {
    pub(crate) fn new(command: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                command: command.into(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Append a line; `last` marks the terminal line of the response.
    pub(crate) fn push_line(&self, line: String, last: bool) {
        {
            let mut state = self.inner.lock();
            if state.complete {
                return;
            }
            state.lines.push(line);
            state.complete = last;
        }
        self.inner.notify.notify_waiters();
    }

    /// Complete the response with whatever was received so far.
    pub(crate) fn abort(&self) {
        {
            let mut state = self.inner.lock();
            if state.complete {
                return;
            }
            state.complete = true;
            state.aborted = true;
        }
        self.inner.notify.notify_waiters();
    }

    /// The command text this response belongs to.
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    /// True when the connection closed before the terminal line arrived.
    pub fn was_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Lines received so far, without waiting.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().lines.clone()
    }

    /// A fresh cursor positioned at the first line.
    pub fn lines(&self) -> ResponseCursor {
        ResponseCursor {
            response: self.clone(),
            pos: 0,
        }
    }

    /// Wait until the terminal line has been seen (or the connection dropped).
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`Response::wait`], bounded by `limit`.
    pub async fn wait_complete(&self, limit: Duration) -> Result<()> {
        timeout(limit, self.wait())
            .await
            .map_err(|_| GatewayError::CommandTimeout {
                command: self.inner.command.clone(),
            })
    }

    /// Wait for completion and return every line.
    pub async fn to_vec(&self, limit: Duration) -> Result<Vec<String>> {
        self.wait_complete(limit).await?;
        Ok(self.snapshot())
    }

    /// Wait for completion and return the terminal line.
    pub async fn final_line(&self, limit: Duration) -> Result<String> {
        let lines = self.to_vec(limit).await?;
        if self.was_aborted() {
            return Err(GatewayError::Disconnected);
        }
        lines.into_iter().last().ok_or_else(|| GatewayError::InvalidResponse {
            details: format!("empty response to '{}'", self.inner.command),
        })
    }

    /// Succeed only when the terminal line carries status 200.
    pub async fn handle_200(&self, limit: Duration) -> Result<()> {
        let line = self.final_line(limit).await?;
        match CGateStatus::from_line(&line) {
            Some(status) if status.is_ok() => Ok(()),
            _ => Err(GatewayError::protocol(line)),
        }
    }

    /// Wait for completion, fail on an error status, and return the lines.
    pub async fn data_lines(&self, limit: Duration) -> Result<Vec<String>> {
        let lines = self.to_vec(limit).await?;
        if self.was_aborted() {
            return Err(GatewayError::Disconnected);
        }
        if let Some(last) = lines.last() {
            match CGateStatus::from_line(last) {
                Some(status) if status.is_success_class() => {}
                _ => return Err(GatewayError::protocol(last.clone())),
            }
        }
        Ok(lines)
    }

    /// Merge the key=value tokens of every line into one map.
    pub async fn to_map(&self, limit: Duration, style: MapStyle) -> Result<HashMap<String, String>> {
        let lines = self.data_lines(limit).await?;
        let mut map = HashMap::new();
        for line in &lines {
            map.extend(response_to_map(line, style));
        }
        Ok(map)
    }
}

/// An independent read position over a [`Response`].
#[derive(Debug, Clone)]
pub struct ResponseCursor {
    response: Response,
    pos: usize,
}

impl ResponseCursor {
    /// The next line, waiting for it if necessary. `None` once the response is
    /// complete and every line has been read.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            let notified = self.response.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.response.inner.lock();
                if let Some(line) = state.lines.get(self.pos) {
                    self.pos += 1;
                    return Some(line.clone());
                }
                if state.complete {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_snapshot_after_completion() {
        let resp = Response::new("project dir");
        resp.push_line("123-project=HOME".into(), false);
        assert!(!resp.is_complete());
        resp.push_line("123 project=CABIN".into(), true);
        assert!(resp.is_complete());
        assert_eq!(
            resp.to_vec(WAIT).await.unwrap(),
            vec!["123-project=HOME", "123 project=CABIN"]
        );
    }

    #[tokio::test]
    async fn test_lines_after_terminal_are_ignored() {
        let resp = Response::new("noop");
        resp.push_line("200 OK.".into(), true);
        resp.push_line("200 late".into(), true);
        assert_eq!(resp.snapshot(), vec!["200 OK."]);
    }

    #[tokio::test]
    async fn test_independent_cursors_see_all_lines() {
        let resp = Response::new("tree //HOME/254");
        resp.push_line("320-a".into(), false);

        let mut first = resp.lines();
        assert_eq!(first.next().await.as_deref(), Some("320-a"));

        resp.push_line("320 b".into(), true);
        let mut second = resp.lines();
        assert_eq!(second.next().await.as_deref(), Some("320-a"));
        assert_eq!(second.next().await.as_deref(), Some("320 b"));
        assert_eq!(second.next().await, None);

        assert_eq!(first.next().await.as_deref(), Some("320 b"));
        assert_eq!(first.next().await, None);
    }

    #[tokio::test]
    async fn test_cursor_blocks_until_line_arrives() {
        let resp = Response::new("net list_all");
        let mut cursor = resp.lines();
        let producer = resp.clone();
        let handle = tokio::spawn(async move { cursor.next().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        producer.push_line("131 network=254".into(), true);
        assert_eq!(handle.await.unwrap().as_deref(), Some("131 network=254"));
    }

    #[tokio::test]
    async fn test_to_vec_times_out() {
        let resp = Response::new("get //HOME/254/56/1 level");
        let err = resp.to_vec(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, GatewayError::CommandTimeout { command } if command == "get //HOME/254/56/1 level"));
    }

    #[tokio::test]
    async fn test_abort_releases_waiters_with_partial_lines() {
        let resp = Response::new("tree //HOME/254");
        resp.push_line("320-partial".into(), false);
        let waiter = resp.clone();
        let handle = tokio::spawn(async move { waiter.to_vec(Duration::from_secs(5)).await });

        resp.abort();
        assert_eq!(handle.await.unwrap().unwrap(), vec!["320-partial"]);
        assert!(resp.was_aborted());
        assert!(matches!(resp.handle_200(WAIT).await, Err(GatewayError::Disconnected)));
    }

    #[tokio::test]
    async fn test_handle_200_success_and_failure() {
        let ok = Response::new("on //HOME/254/56/1");
        ok.push_line("200 OK: //HOME/254/56/1".into(), true);
        assert!(ok.handle_200(WAIT).await.is_ok());

        let bad = Response::new("on //HOME/254/56/300");
        bad.push_line("400 Bad object or device ID".into(), true);
        match bad.handle_200(WAIT).await {
            Err(GatewayError::Protocol { response }) => {
                assert_eq!(response, "400 Bad object or device ID");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_data_lines_rejects_error_status() {
        let resp = Response::new("dbget //HOME/254/56/1/TagName");
        resp.push_line("401 Bad argument(s)".into(), true);
        assert!(matches!(
            resp.data_lines(WAIT).await,
            Err(GatewayError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_to_map_merges_lines() {
        let resp = Response::new("net list_all");
        resp.push_line("131-network=254 state=ok".into(), false);
        resp.push_line("131 project=HOME".into(), true);
        let map = resp.to_map(WAIT, MapStyle::Tokens).await.unwrap();
        assert_eq!(map.get("network").map(String::as_str), Some("254"));
        assert_eq!(map.get("state").map(String::as_str), Some("ok"));
        assert_eq!(map.get("project").map(String::as_str), Some("HOME"));
    }
}
