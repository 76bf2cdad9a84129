//! Connection ownership for the remote quote service.
//!
//! A [`ConnectionManager`] owns at most one live transport. Sync code borrows it for a single
//! page request and never keeps it across the rate-limit pause.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{HistoryResponse, TicksHistoryRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("connection closed by remote")]
    Closed,
    #[error("failed to send request: {0}")]
    Send(String),
    #[error("failed to receive response: {0}")]
    Receive(String),
    #[error("undecodable response frame: {0}")]
    Decode(String),
}

/// One live, ordered request/response stream.
#[async_trait]
pub trait QuoteTransport: Send {
    async fn request(
        &mut self,
        request: &TicksHistoryRequest,
    ) -> Result<HistoryResponse, ConnectionError>;

    /// Local staleness check; must not touch the network.
    fn is_alive(&self) -> bool;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: QuoteTransport;

    async fn connect(&self) -> Result<Self::Transport, ConnectionError>;

    fn describe(&self) -> String {
        "remote".to_string()
    }
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    handle: Option<C::Transport>,
    connects: u64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            handle: None,
            connects: 0,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Number of transports established over this manager's lifetime.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn has_live_handle(&self) -> bool {
        self.handle.as_ref().map(Self::is_alive).unwrap_or(false)
    }

    pub fn is_alive(handle: &C::Transport) -> bool {
        handle.is_alive()
    }

    pub async fn ensure(&mut self) -> Result<&mut C::Transport, ConnectionError> {
        match self.handle.as_ref().map(|handle| handle.is_alive()) {
            Some(true) => return self.handle.as_mut().ok_or(ConnectionError::Closed),
            Some(false) => {
                debug!(
                    component = "connection",
                    event = "connection.stale",
                    endpoint = %self.connector.describe()
                );
                if let Some(mut stale) = self.handle.take() {
                    stale.close().await;
                }
            }
            None => {}
        }

        let transport = match self.connector.connect().await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(
                    component = "connection",
                    event = "connection.failed",
                    endpoint = %self.connector.describe(),
                    error = %err
                );
                return Err(err);
            }
        };
        self.connects += 1;
        info!(
            component = "connection",
            event = "connection.open",
            endpoint = %self.connector.describe(),
            connects = self.connects
        );

        Ok(self.handle.insert(transport))
    }

    /// Drops the current handle so the next [`ensure`](Self::ensure) reconnects.
    pub async fn invalidate(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
            info!(
                component = "connection",
                event = "connection.invalidated",
                endpoint = %self.connector.describe()
            );
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
            info!(
                component = "connection",
                event = "connection.closed",
                endpoint = %self.connector.describe()
            );
        }
    }
}
