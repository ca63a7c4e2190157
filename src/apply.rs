//! Privileged config installation.
//!
//! Rendered content is staged into a drop location, then exactly one
//! pre-approved helper per config kind is invoked (via sudo) to move it into
//! the protected system path and restart the owning daemon. The helper table
//! is the only crossing from unprivileged to privileged execution; there is
//! deliberately no general "run privileged command" primitive.
//!
//! Before the helper runs, the current live file is copied to a timestamped
//! backup. The rollback path re-installs that backup through the same helper.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::command::{self, CommandOutput};
use crate::error::RouterError;

/// Which daemon's config an apply targets. One helper per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Uplink,
    AccessPoint,
    Dhcp,
    Sysctl,
    Firewall,
}

impl ConfigKind {
    /// The allow-listed helper for this kind. Fixed paths, auditable in one
    /// place; the sudoers policy grants exactly these.
    pub fn helper(self) -> &'static str {
        match self {
            ConfigKind::Uplink => "/usr/local/sbin/pi-router-update-uplink",
            ConfigKind::AccessPoint => "/usr/local/sbin/pi-router-update-ap",
            ConfigKind::Dhcp => "/usr/local/sbin/pi-router-update-dhcp",
            ConfigKind::Sysctl => "/usr/local/sbin/pi-router-install-sysctl",
            ConfigKind::Firewall => "/usr/local/sbin/pi-router-save-nftables",
        }
    }

    /// Live config location, relative to the filesystem root.
    fn live_rel(self) -> &'static str {
        match self {
            ConfigKind::Uplink => "etc/wpa_supplicant/wpa_supplicant-wlan0.conf",
            ConfigKind::AccessPoint => "etc/hostapd/hostapd.conf",
            ConfigKind::Dhcp => "etc/dnsmasq.d/pi-router.conf",
            ConfigKind::Sysctl => "etc/sysctl.d/99-pi-router-forwarding.conf",
            ConfigKind::Firewall => "etc/nftables.d/pi-router.nft",
        }
    }

    /// File name used for staging and backup copies.
    fn file_name(self) -> &'static str {
        match self {
            ConfigKind::Uplink => "wpa_supplicant-wlan0.conf",
            ConfigKind::AccessPoint => "hostapd.conf",
            ConfigKind::Dhcp => "dnsmasq-pi-router.conf",
            ConfigKind::Sysctl => "sysctl-forwarding.conf",
            ConfigKind::Firewall => "pi-router.nft",
        }
    }
}

/// Handle returned from a successful apply, carrying what the rollback path
/// needs.
#[derive(Debug, Clone)]
pub struct Applied {
    pub kind: ConfigKind,
    /// Backup of the previous live file, if one existed.
    pub backup: Option<PathBuf>,
}

/// Stages rendered config and drives the per-kind helpers.
#[derive(Debug, Clone)]
pub struct Applier {
    staging_dir: PathBuf,
    backup_dir: PathBuf,
    live_root: PathBuf,
    privilege_command: String,
    helper_timeout: Duration,
}

impl Applier {
    pub fn new(staging_dir: PathBuf, backup_dir: PathBuf) -> Self {
        Applier {
            staging_dir,
            backup_dir,
            live_root: PathBuf::from("/"),
            privilege_command: "sudo".to_string(),
            helper_timeout: Duration::from_secs(60),
        }
    }

    /// Standard system locations.
    pub fn system() -> Self {
        Applier::new(
            PathBuf::from("/run/pi-router/staging"),
            PathBuf::from("/var/lib/pi-router/backups"),
        )
    }

    #[cfg(test)]
    fn with_live_root(mut self, root: PathBuf) -> Self {
        self.live_root = root;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_privilege_command(mut self, command: impl Into<String>) -> Self {
        self.privilege_command = command.into();
        self
    }

    pub fn live_path(&self, kind: ConfigKind) -> PathBuf {
        self.live_root.join(kind.live_rel())
    }

    /// Write rendered content to the staging path for `kind`, mode 0600.
    fn stage(&self, kind: ConfigKind, content: &str) -> Result<PathBuf, RouterError> {
        fs::create_dir_all(&self.staging_dir)
            .map_err(|e| RouterError::ConfigIo(format!("creating staging dir: {e}")))?;
        let path = self.staging_dir.join(kind.file_name());
        fs::write(&path, content)
            .map_err(|e| RouterError::ConfigIo(format!("staging {}: {e}", path.display())))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| RouterError::ConfigIo(format!("chmod {}: {e}", path.display())))?;
        debug!(path = %path.display(), "staged config");
        Ok(path)
    }

    /// Copy the current live file to a timestamped backup. Returns `None`
    /// when there is no live file yet (first apply).
    pub fn backup(&self, kind: ConfigKind) -> Result<Option<PathBuf>, RouterError> {
        let live = self.live_path(kind);
        if !live.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| RouterError::ConfigIo(format!("creating backup dir: {e}")))?;
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let path = self
            .backup_dir
            .join(format!("{}.{stamp}.bak", kind.file_name()));
        fs::copy(&live, &path)
            .map_err(|e| RouterError::ConfigIo(format!("backing up {}: {e}", live.display())))?;
        info!(live = %live.display(), backup = %path.display(), "backed up live config");
        Ok(Some(path))
    }

    async fn run_helper(&self, kind: ConfigKind, staged: &Path) -> Result<CommandOutput, RouterError> {
        let staged = staged.to_string_lossy();
        command::run_timeout(
            &self.privilege_command,
            &[kind.helper(), staged.as_ref()],
            self.helper_timeout,
        )
        .await
    }

    /// Back up the live file, stage `content`, and invoke the helper.
    /// Success requires helper exit code zero; otherwise the helper's stderr
    /// becomes the diagnostic detail.
    pub async fn apply(&self, kind: ConfigKind, content: &str) -> Result<Applied, RouterError> {
        let backup = self.backup(kind)?;
        let staged = self.stage(kind, content)?;

        let output = self.run_helper(kind, &staged).await?;
        if !output.success() {
            return Err(RouterError::Apply {
                helper: kind.helper().to_string(),
                stderr: output.diagnostic(),
            });
        }
        info!(helper = kind.helper(), "config applied");
        Ok(Applied { kind, backup })
    }

    /// Re-install a backup through the same helper, restarting the daemon on
    /// the prior config.
    pub async fn restore(&self, kind: ConfigKind, backup: &Path) -> Result<(), RouterError> {
        let content = fs::read_to_string(backup)
            .map_err(|e| RouterError::ConfigIo(format!("reading backup {}: {e}", backup.display())))?;
        let staged = self.stage(kind, &content)?;

        let output = self.run_helper(kind, &staged).await?;
        if !output.success() {
            return Err(RouterError::Apply {
                helper: kind.helper().to_string(),
                stderr: output.diagnostic(),
            });
        }
        info!(helper = kind.helper(), backup = %backup.display(), "backup restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_applier(dir: &Path) -> Applier {
        Applier::new(dir.join("staging"), dir.join("backups"))
            .with_live_root(dir.join("live"))
    }

    fn fake_privilege(dir: &Path, script: &str) -> String {
        let path = dir.join("fake-sudo.sh");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn staging_writes_content_with_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let applier = test_applier(dir.path());

        let path = applier.stage(ConfigKind::AccessPoint, "ssid=Test\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ssid=Test\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn backup_copies_live_file_with_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let applier = test_applier(dir.path());

        let live = applier.live_path(ConfigKind::Dhcp);
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&live, "old config\n").unwrap();

        let backup = applier.backup(ConfigKind::Dhcp).unwrap().unwrap();
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old config\n");
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dnsmasq-pi-router.conf."));
        assert!(name.ends_with(".bak"));
    }

    #[test]
    fn backup_of_missing_live_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let applier = test_applier(dir.path());
        assert!(applier.backup(ConfigKind::Uplink).unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_backs_up_the_live_file_before_the_helper_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sudo = fake_privilege(dir.path(), "#!/bin/sh\nexit 0\n");
        let applier = test_applier(dir.path()).with_privilege_command(sudo);

        let live = applier.live_path(ConfigKind::Dhcp);
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&live, "old config\n").unwrap();

        let applied = applier.apply(ConfigKind::Dhcp, "new config\n").await.unwrap();
        assert_eq!(applied.kind, ConfigKind::Dhcp);
        let backup = applied.backup.unwrap();
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old config\n");
    }

    #[tokio::test]
    async fn helper_failure_surfaces_its_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sudo = fake_privilege(dir.path(), "#!/bin/sh\necho broken >&2\nexit 1\n");
        let applier = test_applier(dir.path()).with_privilege_command(sudo);

        let err = applier
            .apply(ConfigKind::AccessPoint, "ssid=Test\n")
            .await
            .unwrap_err();
        match err {
            RouterError::Apply { helper, stderr } => {
                assert_eq!(helper, ConfigKind::AccessPoint.helper());
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn each_kind_has_a_distinct_helper() {
        let kinds = [
            ConfigKind::Uplink,
            ConfigKind::AccessPoint,
            ConfigKind::Dhcp,
            ConfigKind::Sysctl,
            ConfigKind::Firewall,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.helper(), b.helper());
            }
        }
    }
}
