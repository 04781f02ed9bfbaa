use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;

use crate::error::{Error, Result};

/// Session-level notifications pushed by the coordination backend. Events
/// are delivered over a single channel and consumed by one task, so event
/// handling is serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
    DataChanged(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    SessionExpired,
}

/// One live session against the coordination service. Watches are
/// one-shot: after an event fires for a path, the watch must be
/// re-registered by the caller.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn watch_data(&self, path: &str) -> Result<()>;
    async fn children(&self, path: &str) -> Result<Vec<String>>;
    async fn close(&self);
}

/// Factory for coordination sessions. `connect` returns once a session
/// object exists; the handshake itself may still be in flight, and its
/// outcome arrives as a `SessionEvent`.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    async fn connect(
        &self,
        hosts: &str,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn CoordinationSession>>;
}

/// Retry bounds for the ephemeral write path.
#[derive(Debug, Clone)]
pub struct EphemeralRetry {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for EphemeralRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Owns the session to the coordination service and survives session
/// failures: mutating operations reconnect and retry with a linear
/// backoff before surfacing the last error.
pub struct ResilientConnection {
    service: Arc<dyn CoordinationService>,
    hosts: String,
    events: mpsc::Sender<SessionEvent>,
    session: RwLock<Option<Arc<dyn CoordinationSession>>>,
    state: Mutex<ConnectionState>,
    retry: EphemeralRetry,
}

impl ResilientConnection {
    pub fn new(
        service: Arc<dyn CoordinationService>,
        hosts: impl Into<String>,
        events: mpsc::Sender<SessionEvent>,
        retry: EphemeralRetry,
    ) -> Self {
        Self {
            service,
            hosts: hosts.into(),
            events,
            session: RwLock::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            retry,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// State transitions are driven by session events only, never by
    /// application logic.
    pub async fn note_event(&self, event: &SessionEvent) {
        let mut state = self.state.lock().await;
        match event {
            SessionEvent::Connected => *state = ConnectionState::Connected,
            SessionEvent::Disconnected => *state = ConnectionState::Disconnected,
            SessionEvent::Expired => *state = ConnectionState::SessionExpired,
            SessionEvent::DataChanged(_) => {}
        }
    }

    pub async fn connect(&self) -> Result<()> {
        if self.hosts.trim().is_empty() {
            return Err(Error::Session(
                "coordination host list is empty".to_owned(),
            ));
        }
        {
            let mut state = self.state.lock().await;
            *state = ConnectionState::Connecting;
        }
        let session = self.service.connect(&self.hosts, self.events.clone()).await?;
        *self.session.write().await = Some(session);
        Ok(())
    }

    /// Tears the session down and establishes a new one against the same
    /// host list.
    pub async fn reconnect(&self) -> Result<()> {
        if let Some(session) = self.session.write().await.take() {
            session.close().await;
        }
        self.connect().await
    }

    /// (Re-)registers a one-shot data watch on a path.
    pub async fn watch(&self, path: &str) -> Result<()> {
        self.session().await?.watch_data(path).await
    }

    /// Creates the ephemeral node if absent, otherwise overwrites it.
    /// Retries up to the configured bound; before each retry the session
    /// is re-established and the call sleeps for attempt-index times the
    /// base delay. The last error is surfaced after the final attempt.
    pub async fn write_ephemeral(&self, path: &str, value: &str) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                if let Err(err) = self.reconnect().await {
                    tracing::warn!(path, error = %err, "reconnect before retry failed");
                }
                let delay = self.retry.base_delay * (attempt as u32 - 1);
                tracing::warn!(path, attempt, delay_ms = delay.as_millis(), "retrying ephemeral write");
                sleep(delay).await;
            }
            match self.try_write(path, value).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(path, attempt, error = %err, "ephemeral write failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Session(format!("ephemeral write to '{path}' failed"))))
    }

    async fn try_write(&self, path: &str, value: &str) -> Result<()> {
        let session = self.session().await?;
        if session.exists(path).await? {
            session.set_data(path, value.as_bytes()).await
        } else {
            session.create_ephemeral(path, value.as_bytes()).await
        }
    }

    /// Lists the ephemeral children under a node and extracts the host
    /// identifier before the first `_` of each child name.
    pub async fn cluster_hosts(&self, path: &str) -> Result<Vec<String>> {
        let children = self.session().await?.children(path).await?;
        Ok(children
            .into_iter()
            .map(|child| match child.split_once('_') {
                Some((host, _)) => host.to_owned(),
                None => child,
            })
            .collect())
    }

    async fn session(&self) -> Result<Arc<dyn CoordinationSession>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Session("no active coordination session".to_owned()))
    }
}
