//! Connected-device presence tracking.
//!
//! The tracker owns the device table and is its only writer. Each poll reads
//! the DHCP lease table and reconciles it: lease membership is the primary
//! online signal. Devices are never hard-deleted; they just age out of the
//! active roster once stale, so raw history stays available for diagnostics.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::probe::{self, DhcpLease};

/// Devices unseen for this long drop out of the active roster.
pub const STALE_AFTER_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
    #[serde(skip)]
    lease_expires: i64,
}

impl Device {
    fn lease_unchanged(&self, lease: &DhcpLease) -> bool {
        self.ip == lease.ip && self.hostname == lease.hostname && self.lease_expires == lease.expires
    }
}

/// Single-writer device table keyed by MAC address.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    devices: HashMap<String, Device>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        DeviceTracker::default()
    }

    /// Reconcile the table against the current lease rows.
    ///
    /// `last_seen` only advances when a device's lease row actually changed
    /// (or it newly appeared), so polling an unchanged table twice is a
    /// no-op.
    pub fn reconcile(&mut self, leases: &[DhcpLease], now: DateTime<Utc>) {
        for lease in leases {
            match self.devices.get_mut(&lease.mac) {
                Some(device) if device.online && device.lease_unchanged(lease) => {}
                Some(device) => {
                    device.ip = lease.ip;
                    device.hostname = lease.hostname.clone();
                    device.lease_expires = lease.expires;
                    device.last_seen = now;
                    device.online = true;
                }
                None => {
                    debug!(mac = %lease.mac, ip = %lease.ip, "new device");
                    self.devices.insert(
                        lease.mac.clone(),
                        Device {
                            mac: lease.mac.clone(),
                            ip: lease.ip,
                            hostname: lease.hostname.clone(),
                            first_seen: now,
                            last_seen: now,
                            online: true,
                            lease_expires: lease.expires,
                        },
                    );
                }
            }
        }

        // Lease table membership is the online signal: anything no longer
        // listed is offline immediately, but stays in storage.
        for device in self.devices.values_mut() {
            if device.online && !leases.iter().any(|l| l.mac == device.mac) {
                debug!(mac = %device.mac, "device left lease table");
                device.online = false;
            }
        }
    }

    /// Devices currently worth showing: online, or seen within the
    /// staleness window. Sorted most recently seen first.
    pub fn active_roster(&self, now: DateTime<Utc>) -> Vec<Device> {
        let cutoff = now - chrono::Duration::minutes(STALE_AFTER_MINUTES);
        let mut roster: Vec<Device> = self
            .devices
            .values()
            .filter(|d| d.online || d.last_seen >= cutoff)
            .cloned()
            .collect();
        roster.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.mac.cmp(&b.mac)));
        roster
    }

    /// Full raw history, staleness ignored.
    pub fn all_devices(&self) -> Vec<Device> {
        let mut all: Vec<Device> = self.devices.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.mac.cmp(&b.mac)));
        all
    }

    pub fn online_count(&self) -> usize {
        self.devices.values().filter(|d| d.online).count()
    }
}

/// One poll: read the lease file and reconcile.
pub async fn poll(tracker: &RwLock<DeviceTracker>, lease_file: &Path) {
    let leases = probe::read_leases(lease_file).await;
    tracker.write().await.reconcile(&leases, Utc::now());
}

/// Background polling loop for the dashboard-facing roster.
pub async fn run_poller(tracker: Arc<RwLock<DeviceTracker>>, lease_file: PathBuf, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        poll(&tracker, &lease_file).await;
    }
}
