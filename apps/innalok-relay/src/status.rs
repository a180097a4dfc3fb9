//! Live terminal status shared between the registry, the health monitor and
//! whatever displays it.
//!
//! Two watch channels back the hub: the active device (tagged with an epoch
//! that grows on every change) and the health of that device. Health writes
//! carry the epoch and check sequence they were issued under, so a result that
//! arrives after the active device changed is dropped instead of overwriting
//! the new device's status.

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::registry::Device;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveDevice {
    pub device: Option<Device>,
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Health {
    pub online: bool,
    pub checking: bool,
    pub last_check: Option<OffsetDateTime>,
    pub epoch: u64,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PosStatus {
    pub active_device: Option<Device>,
    pub online: bool,
    pub checking: bool,
    pub last_check: Option<OffsetDateTime>,
}

impl PosStatus {
    pub fn label(&self) -> &'static str {
        if self.active_device.is_none() {
            "unknown"
        } else if self.checking {
            "checking"
        } else if self.online {
            "online"
        } else {
            "offline"
        }
    }
}

#[derive(Clone)]
pub struct StatusHub {
    active: Arc<watch::Sender<ActiveDevice>>,
    health: Arc<watch::Sender<Health>>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (active, _) = watch::channel(ActiveDevice::default());
        let (health, _) = watch::channel(Health::default());
        Self {
            active: Arc::new(active),
            health: Arc::new(health),
        }
    }

    pub fn snapshot(&self) -> PosStatus {
        let active = self.active.borrow().device.clone();
        let health = self.health.borrow();
        PosStatus {
            active_device: active,
            online: health.online,
            checking: health.checking,
            last_check: health.last_check,
        }
    }

    pub fn active(&self) -> ActiveDevice {
        self.active.borrow().clone()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<ActiveDevice> {
        self.active.subscribe()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }

    /// Replaces the active device and resets health for the new epoch.
    pub(crate) fn publish_active(&self, device: Option<Device>) -> u64 {
        let mut epoch = 0;
        self.active.send_modify(|active| {
            active.epoch += 1;
            active.device = device;
            epoch = active.epoch;
        });
        self.health.send_replace(Health {
            epoch,
            ..Health::default()
        });
        epoch
    }

    pub(crate) fn mark_offline(&self, epoch: u64) -> bool {
        self.health.send_if_modified(|health| {
            if health.epoch != epoch {
                return false;
            }
            let changed = health.online;
            health.online = false;
            changed
        })
    }

    /// Marks check `seq` as outstanding; it supersedes any earlier check.
    pub(crate) fn begin_check(&self, epoch: u64, seq: u64) -> bool {
        self.health.send_if_modified(|health| {
            if health.epoch != epoch || seq < health.seq {
                return false;
            }
            health.seq = seq;
            health.checking = true;
            true
        })
    }

    /// Applies a check result if it is still the latest check for the current
    /// epoch. Returns `false` when the result was stale and dropped.
    pub(crate) fn finish_check(&self, epoch: u64, seq: u64, online: bool) -> bool {
        self.health.send_if_modified(|health| {
            if health.epoch != epoch || health.seq != seq {
                return false;
            }
            health.online = online;
            health.checking = false;
            health.last_check = Some(OffsetDateTime::now_utc());
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceKind;

    fn device(ip: &str) -> Device {
        Device::new(None, ip, 8989, DeviceKind::Terminal)
    }

    #[test]
    fn device_change_resets_health() {
        let hub = StatusHub::new();
        let epoch = hub.publish_active(Some(device("10.0.0.5")));
        assert!(hub.begin_check(epoch, 1));
        assert!(hub.finish_check(epoch, 1, true));
        assert!(hub.snapshot().online);

        hub.publish_active(Some(device("10.0.0.6")));
        let snapshot = hub.snapshot();
        assert!(!snapshot.online);
        assert!(snapshot.last_check.is_none());
        assert_eq!(snapshot.label(), "offline");
    }

    #[test]
    fn results_from_an_old_epoch_are_dropped() {
        let hub = StatusHub::new();
        let old = hub.publish_active(Some(device("10.0.0.5")));
        assert!(hub.begin_check(old, 1));

        let new = hub.publish_active(Some(device("10.0.0.6")));
        assert_ne!(old, new);
        assert!(!hub.finish_check(old, 1, true));
        assert!(!hub.snapshot().online);
        assert!(!hub.snapshot().checking);
    }

    #[test]
    fn superseded_check_cannot_overwrite_newer_one() {
        let hub = StatusHub::new();
        let epoch = hub.publish_active(Some(device("10.0.0.5")));
        assert!(hub.begin_check(epoch, 1));
        assert!(hub.begin_check(epoch, 2));

        assert!(hub.finish_check(epoch, 2, false));
        assert!(!hub.finish_check(epoch, 1, true));
        assert!(!hub.snapshot().online);
        assert!(!hub.begin_check(epoch, 1));
    }

    #[test]
    fn no_active_device_reads_as_unknown() {
        let hub = StatusHub::new();
        assert_eq!(hub.snapshot().label(), "unknown");
    }
}
