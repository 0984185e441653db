//! Uniform connect/health/close lifecycle around a single broker client.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::EventError;
use crate::retry::RetryPolicy;

/// Opens and closes one kind of broker client.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Live client handle produced by a successful connect.
    type Client: Send + Sync + 'static;

    /// Broker label used in logs and errors.
    fn broker(&self) -> String;

    /// Establish a new client.
    async fn connect(&self) -> Result<Self::Client, EventError>;

    /// Close a client. Called at most once per client.
    async fn close(&self, client: &Self::Client) -> Result<(), EventError>;

    /// Whether the client's underlying connection is still open.
    fn is_open(&self, client: &Self::Client) -> bool;
}

/// Per-channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notification emitted to the owning channel adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
}

struct Inner<T> {
    client: Option<Arc<T>>,
    state: ConnectionState,
    /// Set by `close`; a closed connection is never re-established by `reconnect`.
    closed: bool,
}

/// Owns the raw broker client for one channel.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    inner: RwLock<Inner<C::Client>>,
    /// Serialises connect, reconnect and close.
    lifecycle: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    retry: RetryPolicy,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            connector,
            inner: RwLock::new(Inner {
                client: None,
                state: ConnectionState::Disconnected,
                closed: false,
            }),
            lifecycle: Mutex::new(()),
            events,
            retry,
        }
    }

    /// Broker label of the wrapped connector.
    #[must_use]
    pub fn broker(&self) -> String {
        self.connector.broker()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// True iff connected and the underlying connection reports open.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.read();
        match (&inner.client, inner.state) {
            (Some(client), ConnectionState::Connected) => self.connector.is_open(client),
            _ => false,
        }
    }

    /// The live client, or [`EventError::NotConnected`].
    pub fn client(&self) -> Result<Arc<C::Client>, EventError> {
        let inner = self.inner.read();
        match (&inner.client, inner.state) {
            (Some(client), ConnectionState::Connected) => Ok(Arc::clone(client)),
            _ => Err(EventError::NotConnected),
        }
    }

    /// Connect once. Does not retry.
    #[instrument(skip(self, cancel), fields(broker = %self.connector.broker()))]
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.connect_locked(cancel).await
    }

    async fn connect_locked(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        if self.is_healthy() {
            return Ok(());
        }

        let stale = {
            let mut inner = self.inner.write();
            inner.state = ConnectionState::Connecting;
            inner.closed = false;
            inner.client.take()
        };
        if let Some(stale) = stale {
            if let Err(e) = self.connector.close(&stale).await {
                warn!(error = %e, "Failed to close stale connection");
            }
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EventError::Cancelled),
            result = self.connector.connect() => result,
        };

        match result {
            Ok(client) => {
                {
                    let mut inner = self.inner.write();
                    inner.client = Some(Arc::new(client));
                    inner.state = ConnectionState::Connected;
                }
                let _ = self.events.send(ConnectionEvent::Connected);
                info!("Broker connection established");
                Ok(())
            }
            Err(e) => {
                self.inner.write().state = ConnectionState::Disconnected;
                let _ = self.events.send(ConnectionEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Re-establish a dropped connection with exponential backoff.
    ///
    /// Gives up with [`EventError::RetryExhausted`] once the retry budget is
    /// spent. A connection closed through [`close`](Self::close) stays closed.
    #[instrument(skip(self, cancel), fields(broker = %self.connector.broker()))]
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        let mut failures: u32 = 0;

        loop {
            {
                let _lifecycle = self.lifecycle.lock().await;
                if self.inner.read().closed {
                    return Err(EventError::NotConnected);
                }

                match self.connect_locked(cancel).await {
                    Ok(()) => return Ok(()),
                    Err(EventError::Cancelled) => return Err(EventError::Cancelled),
                    Err(e) => {
                        failures += 1;
                        if !self.retry.allows(failures - 1) {
                            warn!(attempts = failures, error = %e, "Reconnect budget exhausted");
                            return Err(EventError::RetryExhausted {
                                broker: self.connector.broker(),
                                attempts: failures,
                                cause: e.to_string(),
                            });
                        }
                        warn!(attempt = failures, error = %e, "Reconnect attempt failed");
                    }
                }
            }

            let delay = self.retry.calculate_backoff(failures);
            tokio::select! {
                () = cancel.cancelled() => return Err(EventError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Record a transport error seen by the adapter.
    ///
    /// Marks the connection down when the client no longer reports open.
    pub fn report_failure(&self, error: &EventError) {
        let went_down = {
            let mut inner = self.inner.write();
            let open = inner
                .client
                .as_ref()
                .is_some_and(|client| self.connector.is_open(client));
            if !open && inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };

        warn!(broker = %self.connector.broker(), error = %error, "Broker transport error");
        let _ = self.events.send(ConnectionEvent::Error(error.to_string()));
        if went_down {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    /// Close the client. Safe to call repeatedly.
    #[instrument(skip(self), fields(broker = %self.connector.broker()))]
    pub async fn close(&self) -> Result<(), EventError> {
        let _lifecycle = self.lifecycle.lock().await;

        let client = {
            let mut inner = self.inner.write();
            inner.closed = true;
            inner.state = ConnectionState::Disconnected;
            inner.client.take()
        };

        let Some(client) = client else {
            return Ok(());
        };

        let result = self.connector.close(&client).await;
        let _ = self.events.send(ConnectionEvent::Disconnected);
        info!("Broker connection closed");
        result
    }
}
