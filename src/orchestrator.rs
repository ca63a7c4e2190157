//! Interface state machine.
//!
//! One run per request: validate, render, back up and apply through the
//! privileged helper, verify, then commit the new baseline or roll back to
//! the backup. Each interface role carries an exclusive run-lock; a second
//! overlapping attempt on the same radio is rejected as busy rather than
//! queued, because a daemon restart mid-restart is undefined.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::apply::{Applied, Applier, ConfigKind};
use crate::command;
use crate::error::RouterError;
use crate::portal::{self, PortalDetection, PortalSession};
use crate::probe;
use crate::render;
use crate::settings::{
    ApConfig, DhcpConfig, InterfaceRole, NetworkSettings, SettingsStore, UplinkConfig, UplinkMode,
};
use crate::verify::{self, Poll, Verification};

/// Terminal status of one state-machine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Committed,
    RolledBack,
    Failed,
}

/// Outcome surfaced to the caller. Carries enough detail for an actionable
/// message; secrets were already redacted at the command layer.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub status: ApplyStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    pub finished_at: DateTime<Utc>,
}

impl ApplyResult {
    fn committed(detail: String, backup: Option<PathBuf>) -> Self {
        ApplyResult {
            status: ApplyStatus::Committed,
            detail,
            backup,
            finished_at: Utc::now(),
        }
    }

    fn rolled_back(detail: String, backup: Option<PathBuf>) -> Self {
        ApplyResult {
            status: ApplyStatus::RolledBack,
            detail,
            backup,
            finished_at: Utc::now(),
        }
    }

    fn failed(detail: String, backup: Option<PathBuf>) -> Self {
        ApplyResult {
            status: ApplyStatus::Failed,
            detail,
            backup,
            finished_at: Utc::now(),
        }
    }
}

/// Orchestrates both radios. Constructed once at process start and shared by
/// reference; no global state.
pub struct Orchestrator {
    applier: Applier,
    store: SettingsStore,
    uplink_interface: String,
    ap_interface: String,
    lease_file: PathBuf,
    uplink_lock: Mutex<()>,
    ap_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(applier: Applier, store: SettingsStore) -> Self {
        Orchestrator {
            applier,
            store,
            uplink_interface: "wlan0".to_string(),
            ap_interface: "wlan1".to_string(),
            lease_file: PathBuf::from(probe::LEASE_FILE),
            uplink_lock: Mutex::new(()),
            ap_lock: Mutex::new(()),
        }
    }

    pub fn uplink_interface(&self) -> &str {
        &self.uplink_interface
    }

    pub fn ap_interface(&self) -> &str {
        &self.ap_interface
    }

    pub fn lease_file(&self) -> &PathBuf {
        &self.lease_file
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.store
    }

    fn lock_for(&self, role: InterfaceRole) -> &Mutex<()> {
        match role {
            InterfaceRole::Uplink => &self.uplink_lock,
            InterfaceRole::AccessPoint => &self.ap_lock,
        }
    }

    fn try_lock(&self, role: InterfaceRole) -> Result<tokio::sync::MutexGuard<'_, ()>, RouterError> {
        self.lock_for(role)
            .try_lock()
            .map_err(|_| RouterError::Busy(role))
    }

    /// Role-specific post-apply condition.
    async fn verify_kind(&self, kind: ConfigKind) -> Result<Verification, RouterError> {
        match kind {
            ConfigKind::Uplink => verify::verify_uplink(&self.uplink_interface).await,
            ConfigKind::AccessPoint => verify::verify_ap(&self.ap_interface).await,
            ConfigKind::Dhcp => verify::verify_dhcp().await,
            ConfigKind::Firewall => {
                verify::poll_until(Poll::daemon(), "nat", || async { probe::nat_active().await })
                    .await
            }
            // sysctl takes effect synchronously in the helper
            ConfigKind::Sysctl => Ok(Verification::Verified),
        }
    }

    /// Apply rendered content and drive verify / rollback to a terminal
    /// state. Errors before anything durable changed come back as `Failed`
    /// with no rollback attempt.
    async fn execute(&self, kind: ConfigKind, content: &str, failure_hint: &str) -> ApplyResult {
        let applied = match self.applier.apply(kind, content).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(?kind, error = %e, "apply step failed");
                return ApplyResult::failed(format!("apply step failed: {e}"), None);
            }
        };

        match self.verify_kind(kind).await {
            Ok(Verification::Verified) => ApplyResult::committed(String::new(), applied.backup),
            Ok(Verification::TimedOut) => {
                let failure = RouterError::VerificationTimeout(failure_hint.to_string());
                self.roll_back(applied, failure.to_string()).await
            }
            Err(e) => {
                // A probe failure mid-verify leaves the daemon state unknown;
                // treat it like a verification timeout and fall back.
                self.roll_back(applied, format!("{failure_hint} ({e})")).await
            }
        }
    }

    /// Restore the pre-change backup through the same helper and re-verify.
    async fn roll_back(&self, applied: Applied, failure: String) -> ApplyResult {
        warn!(kind = ?applied.kind, %failure, "verification failed, rolling back");

        let Some(backup) = applied.backup else {
            return ApplyResult::failed(
                format!("{failure}; no previous configuration to restore"),
                None,
            );
        };

        if let Err(e) = self.applier.restore(applied.kind, &backup).await {
            error!(kind = ?applied.kind, error = %e, "rollback failed");
            let rollback = RouterError::RollbackFailure(e.to_string());
            return ApplyResult::failed(format!("{failure}; {rollback}"), Some(backup));
        }

        match self.verify_kind(applied.kind).await {
            Ok(Verification::Verified) => {
                info!(kind = ?applied.kind, "previous configuration restored");
                ApplyResult::rolled_back(
                    format!("{failure}; previous configuration restored"),
                    Some(backup),
                )
            }
            _ => {
                error!(kind = ?applied.kind, "restored configuration did not verify");
                let rollback = RouterError::RollbackFailure(
                    "restored configuration did not verify".to_string(),
                );
                ApplyResult::failed(format!("{failure}; {rollback}"), Some(backup))
            }
        }
    }

    /// Persist the committed section as the new baseline. A save failure
    /// does not undo the running config; it is reported in the detail.
    fn commit<F>(&self, mutate: F) -> Option<String>
    where
        F: FnOnce(&mut NetworkSettings),
    {
        let mut settings = match self.store.load() {
            Ok(s) => s,
            Err(e) => return Some(format!("baseline not persisted: {e}")),
        };
        mutate(&mut settings);
        match self.store.save(&settings) {
            Ok(()) => None,
            Err(e) => Some(format!("baseline not persisted: {e}")),
        }
    }

    /// Reconfigure the uplink radio and reconnect. In portal mode, the
    /// captive portal handshake runs after association; an unconfirmed login
    /// keeps the interface active and is reported in the detail rather than
    /// rolled back.
    pub async fn apply_uplink(&self, cfg: &UplinkConfig) -> Result<ApplyResult, RouterError> {
        cfg.validate()?;
        let content = render::wpa_supplicant(cfg)?;
        let _guard = self.try_lock(InterfaceRole::Uplink)?;

        info!(ssid = %cfg.ssid, mode = ?cfg.mode, "applying uplink configuration");
        let mut result = self
            .execute(
                ConfigKind::Uplink,
                &content,
                "uplink did not associate or obtain an address in time",
            )
            .await;

        if result.status != ApplyStatus::Committed {
            return Ok(result);
        }

        let mut detail = format!("uplink connected to '{}'", cfg.ssid);
        if cfg.mode == UplinkMode::Portal {
            detail.push_str(&self.portal_handshake(cfg).await);
        }
        if let Some(save_err) = self.commit(|s| s.uplink = cfg.clone()) {
            detail.push_str("; ");
            detail.push_str(&save_err);
        }
        result.detail = detail;
        Ok(result)
    }

    async fn portal_handshake(&self, cfg: &UplinkConfig) -> String {
        let session = match portal::probe_client() {
            Ok(client) => portal::detect(&client).await,
            Err(e) => return format!("; portal detection unavailable ({e})"),
        };

        match session.detection {
            PortalDetection::InternetConfirmed => "; internet access confirmed".to_string(),
            PortalDetection::NoPortal => {
                "; no captive portal detected but no internet access either".to_string()
            }
            PortalDetection::PortalDetected => {
                let url = cfg.portal_url.clone().or(session.portal_url);
                let Some(url) = url else {
                    return "; captive portal detected but its URL could not be determined"
                        .to_string();
                };
                let outcome = portal::login(
                    &url,
                    cfg.portal_username.as_deref(),
                    cfg.portal_password.as_deref(),
                )
                .await;
                format!("; captive portal at {url}: {}", outcome.message)
            }
        }
    }

    /// Reconfigure the access point and restart hostapd.
    pub async fn apply_ap(&self, cfg: &ApConfig) -> Result<ApplyResult, RouterError> {
        cfg.validate()?;
        let content = render::hostapd(cfg, &self.ap_interface)?;
        let _guard = self.try_lock(InterfaceRole::AccessPoint)?;

        info!(ssid = %cfg.ssid, channel = cfg.channel, "applying AP configuration");
        let mut result = self
            .execute(
                ConfigKind::AccessPoint,
                &content,
                "AP did not reach master mode with hostapd active in time",
            )
            .await;

        if result.status == ApplyStatus::Committed {
            let mut detail = format!("AP '{}' up on channel {}", cfg.ssid, cfg.channel);
            if let Some(save_err) = self.commit(|s| s.ap = cfg.clone()) {
                detail.push_str("; ");
                detail.push_str(&save_err);
            }
            result.detail = detail;
        }
        Ok(result)
    }

    /// Reconfigure the DHCP server and restart dnsmasq. Shares the AP
    /// run-lock: both own the same daemon set.
    pub async fn apply_dhcp(&self, cfg: &DhcpConfig) -> Result<ApplyResult, RouterError> {
        cfg.validate()?;
        let content = render::dnsmasq(cfg, &self.ap_interface)?;
        let _guard = self.try_lock(InterfaceRole::AccessPoint)?;

        info!(range_start = %cfg.range_start, range_end = %cfg.range_end, "applying DHCP configuration");
        let mut result = self
            .execute(ConfigKind::Dhcp, &content, "dnsmasq did not come back in time")
            .await;

        if result.status == ApplyStatus::Committed {
            let mut detail = format!(
                "DHCP serving {}-{} via {}",
                cfg.range_start, cfg.range_end, cfg.gateway
            );
            if let Some(save_err) = self.commit(|s| s.dhcp = cfg.clone()) {
                detail.push_str("; ");
                detail.push_str(&save_err);
            }
            result.detail = detail;
        }
        Ok(result)
    }

    /// Enable IPv4 forwarding now and persist it across reboots.
    pub async fn enable_forwarding(&self) -> Result<ApplyResult, RouterError> {
        let output = command::run("sudo", &["sysctl", "-w", "net.ipv4.ip_forward=1"]).await?;
        if !output.success() {
            return Ok(ApplyResult::failed(
                format!("sysctl refused forwarding: {}", output.diagnostic()),
                None,
            ));
        }

        let mut result = self
            .execute(
                ConfigKind::Sysctl,
                render::sysctl_forwarding(),
                "sysctl fragment install did not verify",
            )
            .await;
        if result.status == ApplyStatus::Committed {
            result.detail = "IPv4 forwarding enabled and persisted".to_string();
        }
        Ok(result)
    }

    /// Install and persist the NAT/forwarding ruleset.
    pub async fn setup_nat(&self) -> Result<ApplyResult, RouterError> {
        let content = render::nftables(&self.uplink_interface, &self.ap_interface);
        let mut result = self
            .execute(
                ConfigKind::Firewall,
                &content,
                "NAT table did not report a masquerade rule in time",
            )
            .await;
        if result.status == ApplyStatus::Committed {
            result.detail = format!(
                "NAT masquerading {} traffic out of {}",
                self.ap_interface, self.uplink_interface
            );
        }
        Ok(result)
    }

    /// Detection only; holds the uplink lock because it shares the physical
    /// interface with WPA activation.
    pub async fn detect_portal(&self) -> Result<PortalSession, RouterError> {
        let _guard = self.try_lock(InterfaceRole::Uplink)?;
        let client = portal::probe_client().map_err(|e| RouterError::Execution {
            command: "portal probe".to_string(),
            detail: e.to_string(),
        })?;
        Ok(portal::detect(&client).await)
    }

    /// Manual portal login against a known URL.
    pub async fn login_portal(
        &self,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<portal::LoginOutcome, RouterError> {
        let _guard = self.try_lock(InterfaceRole::Uplink)?;
        Ok(portal::login(url, username, password).await)
    }
}
