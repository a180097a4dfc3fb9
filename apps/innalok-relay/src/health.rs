//! Periodic liveness check of the active terminal.

use omnisoft_proto::TerminalResponse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::gateway::{TerminalEndpoint, TerminalGateway};
use crate::status::StatusHub;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// A terminal is considered up when it answers `code: 0` or hands back an
/// access token.
pub fn interpret(response: &TerminalResponse) -> bool {
    response.is_success() || response.token().is_some()
}

pub struct HealthMonitor {
    gateway: TerminalGateway,
    status: StatusHub,
    interval: Duration,
    checks: AtomicU64,
}

impl HealthMonitor {
    pub fn new(gateway: TerminalGateway, interval: Duration) -> Self {
        let status = gateway.registry().status().clone();
        Self {
            gateway,
            status,
            interval,
            checks: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> &StatusHub {
        &self.status
    }

    /// Checks the active device once and returns what the check saw. The
    /// shared status only takes the result if the active device did not
    /// change and no newer check started meanwhile.
    pub async fn check_health(&self) -> bool {
        let active = self.status.active();
        let Some(device) = active.device else {
            self.status.mark_offline(active.epoch);
            return false;
        };
        let Some(token) = device.token() else {
            tracing::debug!(
                target: "innalok::health",
                device_id = %device.id,
                "active device has no token; reporting offline"
            );
            self.status.mark_offline(active.epoch);
            return false;
        };

        let seq = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.status.begin_check(active.epoch, seq) {
            return false;
        }

        let online = match self
            .gateway
            .get_info(&TerminalEndpoint::from(&device), token)
            .await
        {
            Ok(response) => interpret(&response),
            Err(err) => {
                tracing::debug!(
                    target: "innalok::health",
                    device_id = %device.id,
                    error = %err,
                    "health check failed"
                );
                false
            }
        };

        if self.status.finish_check(active.epoch, seq, online) {
            tracing::trace!(
                target: "innalok::health",
                device_id = %device.id,
                online,
                "health updated"
            );
        } else {
            tracing::debug!(
                target: "innalok::health",
                device_id = %device.id,
                seq,
                "discarding stale health result"
            );
        }
        online
    }

    /// Checks on every active-device change and every `interval` until
    /// `shutdown` fires. In-flight checks are left to finish on their own.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut active = self.status.subscribe_active();
        active.borrow_and_update();
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.spawn_check();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    active.borrow_and_update();
                    ticker.reset();
                    self.spawn_check();
                }
                _ = ticker.tick() => {
                    if self.status.active().device.is_some() {
                        self.spawn_check();
                    }
                }
            }
        }
        tracing::debug!(target: "innalok::health", "health monitor stopped");
    }

    fn spawn_check(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.check_health().await;
        });
    }
}
