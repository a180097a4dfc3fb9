//! Push subscription that feeds terminal commands from the backend into the
//! gateway.

pub mod hub;
pub mod retry;

use futures_util::{SinkExt, StreamExt};
use omnisoft_proto::TerminalRequest;
use parking_lot::Mutex;
use query_bus::QueryBus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::gateway::TerminalGateway;
use crate::receipts::RECEIPTS_TOPIC;
use crate::settings::Settings;
use hub::{HubMessage, HubStream};
use retry::{DelaySchedule, RetryContext, RetryPolicy};

pub const POSTER_EVENT: &str = "posterEvent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

/// Payload of a `posterEvent` invocation. `all_data` is the terminal
/// envelope exactly as the backend built it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub all_data: Option<Value>,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("hub handshake failed: {0}")]
    Handshake(String),
    #[error("timed out connecting to hub")]
    Timeout,
    #[error("hub closed the connection")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api_base_url: Url,
    /// Backend token. Without one the relay stays disconnected.
    pub access_token: Option<String>,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl RelayConfig {
    pub fn new(api_base_url: Url, access_token: Option<String>) -> Self {
        Self {
            api_base_url,
            access_token,
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
    ClosedByServer {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

pub struct NotificationRelay {
    config: RelayConfig,
    gateway: TerminalGateway,
    settings: Settings,
    bus: Arc<dyn QueryBus>,
    retry: Arc<dyn RetryPolicy>,
    status: watch::Sender<ConnectionStatus>,
    last_message: Mutex<Option<Notification>>,
}

impl NotificationRelay {
    pub fn new(
        config: RelayConfig,
        gateway: TerminalGateway,
        settings: Settings,
        bus: Arc<dyn QueryBus>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            config,
            gateway,
            settings,
            bus,
            retry: Arc::new(DelaySchedule::default()),
            status,
            last_message: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn last_message(&self) -> Option<Notification> {
        self.last_message.lock().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::info!(
                target: "innalok::relay",
                status = status.as_str(),
                "hub connection status changed"
            );
        }
    }

    /// Records the notification, forwards its envelope when auto-forward is
    /// on, then marks cached receipts stale. Forwarding problems are logged
    /// and never stop the invalidation.
    pub async fn handle_notification(&self, notification: Notification) {
        *self.last_message.lock() = Some(notification.clone());
        tracing::info!(
            target: "innalok::relay",
            transaction_type = notification.transaction_type.as_deref().unwrap_or("unknown"),
            "notification received"
        );

        match notification.all_data {
            Some(all_data) if self.settings.auto_forward() => self.forward(all_data).await,
            Some(_) => tracing::debug!(
                target: "innalok::relay",
                "auto-forward disabled; notification not sent to terminal"
            ),
            None => {}
        }

        self.bus.invalidate(RECEIPTS_TOPIC);
    }

    async fn forward(&self, all_data: Value) {
        let envelope: TerminalRequest = match serde_json::from_value(all_data) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    target: "innalok::relay",
                    error = %err,
                    "notification payload is not a terminal request"
                );
                return;
            }
        };
        match self
            .gateway
            .forward(&envelope, self.config.access_token.as_deref())
            .await
        {
            Ok(Some(response)) => tracing::info!(
                target: "innalok::relay",
                code = ?response.code,
                message = response.message.as_deref().unwrap_or(""),
                "notification forwarded to terminal"
            ),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                target: "innalok::relay",
                error = %err,
                "forwarding notification to terminal failed"
            ),
        }
    }

    /// Connects and relays until `shutdown` fires or reconnection gives up.
    ///
    /// Failing to connect the first time is returned as an error; failures
    /// after that go through the retry policy. A connection that is still
    /// being opened when `shutdown` fires is completed and then closed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), RelayError> {
        let Some(token) = self
            .config
            .access_token
            .clone()
            .filter(|token| !token.is_empty())
        else {
            tracing::info!(target: "innalok::relay", "not signed in; hub connection skipped");
            self.set_status(ConnectionStatus::Disconnected);
            return Ok(());
        };
        let url = hub::hub_url(&self.config.api_base_url, &token)?;

        self.set_status(ConnectionStatus::Connecting);
        let (mut stream, mut pending) =
            match hub::connect(&url, self.config.handshake_timeout).await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::error!(
                        target: "innalok::relay",
                        error = %err,
                        "hub connection failed"
                    );
                    self.set_status(ConnectionStatus::Disconnected);
                    return Err(err);
                }
            };
        if shutdown.is_cancelled() {
            close(stream).await;
            self.set_status(ConnectionStatus::Disconnected);
            return Ok(());
        }
        self.set_status(ConnectionStatus::Connected);

        loop {
            match self.pump(stream, pending, &shutdown).await {
                PumpExit::Shutdown => break,
                PumpExit::ClosedByServer {
                    error,
                    allow_reconnect: false,
                } => {
                    tracing::warn!(
                        target: "innalok::relay",
                        error = error.as_deref().unwrap_or(""),
                        "hub closed the connection"
                    );
                    break;
                }
                PumpExit::ClosedByServer { error, .. } => {
                    tracing::warn!(
                        target: "innalok::relay",
                        error = error.as_deref().unwrap_or(""),
                        "hub closed the connection; reconnecting"
                    );
                }
                PumpExit::Lost(reason) => {
                    tracing::warn!(
                        target: "innalok::relay",
                        reason = %reason,
                        "hub connection lost; reconnecting"
                    );
                }
            }

            self.set_status(ConnectionStatus::Reconnecting);
            match self.reconnect(&url, &shutdown).await {
                Some((next_stream, next_pending)) => {
                    stream = next_stream;
                    pending = next_pending;
                    self.set_status(ConnectionStatus::Connected);
                }
                None => break,
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn reconnect(
        &self,
        url: &Url,
        shutdown: &CancellationToken,
    ) -> Option<(HubStream, Vec<HubMessage>)> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let context = RetryContext {
                attempt,
                elapsed: started.elapsed(),
            };
            let Some(delay) = self.retry.next_delay(context) else {
                tracing::error!(
                    target: "innalok::relay",
                    attempts = attempt,
                    "giving up on hub reconnection"
                );
                return None;
            };
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = time::sleep(delay) => {}
            }
            attempt += 1;

            match hub::connect(url, self.config.handshake_timeout).await {
                Ok((stream, pending)) => {
                    if shutdown.is_cancelled() {
                        close(stream).await;
                        return None;
                    }
                    tracing::info!(target: "innalok::relay", attempt, "hub reconnected");
                    return Some((stream, pending));
                }
                Err(err) => tracing::warn!(
                    target: "innalok::relay",
                    attempt,
                    error = %err,
                    "hub reconnect attempt failed"
                ),
            }
        }
    }

    async fn pump(
        self: &Arc<Self>,
        stream: HubStream,
        pending: Vec<HubMessage>,
        shutdown: &CancellationToken,
    ) -> PumpExit {
        let (mut sink, mut source) = stream.split();
        for message in pending {
            if let Some(exit) = self.dispatch(message) {
                return exit;
            }
        }

        let keep_alive = self.config.keep_alive_interval;
        let server_timeout = self.config.server_timeout;
        let mut ping = time::interval_at(Instant::now() + keep_alive, keep_alive);
        let idle = time::sleep(server_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return PumpExit::Shutdown;
                }
                _ = ping.tick() => {
                    if let Err(err) = sink.send(Message::Text(hub::ping_record().into())).await {
                        return PumpExit::Lost(err.to_string());
                    }
                }
                _ = &mut idle => {
                    return PumpExit::Lost(format!(
                        "no message from server in {}s",
                        server_timeout.as_secs()
                    ));
                }
                frame = source.next() => {
                    idle.as_mut().reset(Instant::now() + server_timeout);
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for record in hub::split_records(text.as_str()) {
                                match hub::parse_message(record) {
                                    Ok(message) => {
                                        if let Some(exit) = self.dispatch(message) {
                                            return exit;
                                        }
                                    }
                                    Err(err) => tracing::warn!(
                                        target: "innalok::relay",
                                        error = %err,
                                        "dropping malformed hub record"
                                    ),
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return PumpExit::Lost("socket closed".into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: HubMessage) -> Option<PumpExit> {
        match message {
            HubMessage::Invocation { target, arguments } => {
                if !target.eq_ignore_ascii_case(POSTER_EVENT) {
                    tracing::debug!(target: "innalok::relay", hub_target = %target, "ignoring hub invocation");
                    return None;
                }
                let argument = arguments.into_iter().next()?;
                match serde_json::from_value::<Notification>(argument) {
                    Ok(notification) => {
                        // Handled off the read loop so a slow terminal cannot
                        // starve keep-alives.
                        let relay = Arc::clone(self);
                        tokio::spawn(async move {
                            relay.handle_notification(notification).await;
                        });
                    }
                    Err(err) => tracing::warn!(
                        target: "innalok::relay",
                        error = %err,
                        "malformed posterEvent payload"
                    ),
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => Some(PumpExit::ClosedByServer {
                error,
                allow_reconnect,
            }),
            HubMessage::Other(kind) => {
                tracing::trace!(target: "innalok::relay", kind, "ignoring hub message");
                None
            }
        }
    }
}

async fn close(mut stream: HubStream) {
    if let Err(err) = stream.close(None).await {
        tracing::debug!(target: "innalok::relay", error = %err, "error closing hub socket");
    }
}
