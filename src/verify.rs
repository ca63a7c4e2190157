//! Post-apply verification.
//!
//! All daemon and interface checks run through one bounded-retry helper so
//! timeout semantics are uniform: a fixed number of attempts at a fixed
//! interval, never an open-ended wait.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::RouterError;
use crate::probe;

/// Outcome of a verification poll. Never blocks indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    TimedOut,
}

/// Retry schedule: `attempts` checks, `interval` apart.
#[derive(Debug, Clone, Copy)]
pub struct Poll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Poll {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Poll { attempts, interval }
    }

    /// Daemon-only checks: service state settles within seconds.
    pub const fn daemon() -> Self {
        Poll::new(12, Duration::from_secs(1))
    }

    /// Checks that wait on association and DHCP, which take longer.
    pub const fn uplink() -> Self {
        Poll::new(20, Duration::from_secs(1))
    }
}

/// Run `check` until it reports true or the schedule is exhausted. Probe
/// errors propagate; a false result is retried.
pub async fn poll_until<F, Fut>(
    poll: Poll,
    what: &str,
    mut check: F,
) -> Result<Verification, RouterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, RouterError>>,
{
    for attempt in 1..=poll.attempts {
        if check().await? {
            debug!(what, attempt, "verified");
            return Ok(Verification::Verified);
        }
        if attempt < poll.attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }
    debug!(what, attempts = poll.attempts, "verification timed out");
    Ok(Verification::TimedOut)
}

/// AP is up when the interface reports Master mode and hostapd is active.
pub async fn verify_ap(interface: &str) -> Result<Verification, RouterError> {
    let interface = interface.to_string();
    poll_until(Poll::daemon(), "ap", move || {
        let interface = interface.clone();
        async move {
            let mode = probe::interface_mode(&interface).await?;
            if mode.as_deref() != Some("Master") {
                return Ok(false);
            }
            probe::service_active("hostapd").await
        }
    })
    .await
}

/// Uplink is up when the interface is associated and holds a routable
/// (non-link-local) IPv4 address.
pub async fn verify_uplink(interface: &str) -> Result<Verification, RouterError> {
    let interface = interface.to_string();
    poll_until(Poll::uplink(), "uplink", move || {
        let interface = interface.clone();
        async move {
            let status = probe::uplink_status(&interface).await?;
            let has_addr = status
                .ip_address
                .is_some_and(|ip| !ip.is_link_local() && !ip.is_unspecified());
            Ok(status.connected && has_addr)
        }
    })
    .await
}

/// DHCP server is up when dnsmasq reports active.
pub async fn verify_dhcp() -> Result<Verification, RouterError> {
    poll_until(Poll::daemon(), "dhcp", || async {
        probe::service_active("dnsmasq").await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = poll_until(
            Poll::new(5, Duration::from_millis(1)),
            "test",
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, Verification::Verified);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_schedule_times_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = poll_until(
            Poll::new(4, Duration::from_millis(1)),
            "test",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, Verification::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let result = poll_until(Poll::new(3, Duration::from_millis(1)), "test", || async {
            Err(RouterError::CommandNotFound("iwconfig".to_string()))
        })
        .await;
        assert!(matches!(result, Err(RouterError::CommandNotFound(_))));
    }
}
