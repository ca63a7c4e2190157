use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::RouterError;

/// Which physical adapter and daemon set a configuration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceRole {
    Uplink,
    AccessPoint,
}

impl fmt::Display for InterfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceRole::Uplink => write!(f, "uplink"),
            InterfaceRole::AccessPoint => write!(f, "access point"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UplinkMode {
    #[default]
    Wpa,
    Portal,
}

/// Wi-Fi uplink (client-side) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    #[serde(default)]
    pub mode: UplinkMode,
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub portal_url: Option<String>,
    #[serde(default)]
    pub portal_username: Option<String>,
    #[serde(default)]
    pub portal_password: Option<String>,
    #[serde(default = "default_true")]
    pub auto_detect_portal: bool,
}

/// Access point configuration (hostapd).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_hw_mode")]
    pub hw_mode: String,
}

/// DHCP server configuration (dnsmasq). The gateway address doubles as the
/// AP interface's static address; there is deliberately no second field for
/// it, so the two can never diverge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub subnet: String,
    pub netmask: String,
    pub gateway: String,
    pub range_start: String,
    pub range_end: String,
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
}

/// The complete committed network baseline persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub uplink: UplinkConfig,
    pub ap: ApConfig,
    pub dhcp: DhcpConfig,
}

fn default_country() -> String {
    "US".to_string()
}

fn default_hw_mode() -> String {
    "g".to_string()
}

fn default_lease_time() -> String {
    "12h".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for UplinkConfig {
    fn default() -> Self {
        UplinkConfig {
            mode: UplinkMode::Wpa,
            ssid: String::new(),
            password: String::new(),
            country: default_country(),
            portal_url: None,
            portal_username: None,
            portal_password: None,
            auto_detect_portal: true,
        }
    }
}

impl Default for ApConfig {
    fn default() -> Self {
        ApConfig {
            ssid: "PiRouter-AP".to_string(),
            password: "SecurePass123".to_string(),
            channel: 6,
            country: default_country(),
            hw_mode: default_hw_mode(),
        }
    }
}

impl Default for DhcpConfig {
    fn default() -> Self {
        DhcpConfig {
            subnet: "10.42.0.0".to_string(),
            netmask: "255.255.255.0".to_string(),
            gateway: "10.42.0.1".to_string(),
            range_start: "10.42.0.50".to_string(),
            range_end: "10.42.0.200".to_string(),
            lease_time: default_lease_time(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            uplink: UplinkConfig::default(),
            ap: ApConfig::default(),
            dhcp: DhcpConfig::default(),
        }
    }
}

fn validate_country(country: &str) -> Result<(), RouterError> {
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RouterError::Validation(format!(
            "country code '{country}' must be two letters"
        )));
    }
    Ok(())
}

fn validate_psk(password: &str, what: &str) -> Result<(), RouterError> {
    if password.len() < 8 || password.len() > 63 {
        return Err(RouterError::Validation(format!(
            "{what} pre-shared key must be 8-63 characters (got {})",
            password.len()
        )));
    }
    Ok(())
}

fn parse_ipv4(value: &str, field: &str) -> Result<Ipv4Addr, RouterError> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| RouterError::Validation(format!("{field} '{value}' is not a valid IPv4 address")))
}

impl UplinkConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        validate_country(&self.country)?;
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(RouterError::Validation(
                "uplink SSID must be 1-32 characters".to_string(),
            ));
        }
        match self.mode {
            UplinkMode::Wpa => validate_psk(&self.password, "uplink")?,
            UplinkMode::Portal => {
                if self.portal_url.is_none() && !self.auto_detect_portal {
                    return Err(RouterError::Validation(
                        "portal mode requires a portal URL or auto-detect enabled".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Channels usable in the 5 GHz hardware modes.
const CHANNELS_5GHZ: &[u8] = &[36, 40, 44, 48, 149, 153, 157, 161, 165];

impl ApConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        validate_country(&self.country)?;
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(RouterError::Validation(
                "AP SSID must be 1-32 characters".to_string(),
            ));
        }
        validate_psk(&self.password, "AP")?;

        match self.hw_mode.as_str() {
            "a" | "ac" => {
                if !CHANNELS_5GHZ.contains(&self.channel) {
                    return Err(RouterError::Validation(format!(
                        "channel {} is not valid for 5 GHz hw_mode '{}'",
                        self.channel, self.hw_mode
                    )));
                }
            }
            "b" | "g" | "n" => {
                if !(1..=13).contains(&self.channel) {
                    return Err(RouterError::Validation(format!(
                        "channel {} is not valid for 2.4 GHz hw_mode '{}' (expected 1-13)",
                        self.channel, self.hw_mode
                    )));
                }
            }
            other => {
                return Err(RouterError::Validation(format!(
                    "hw_mode '{other}' must be one of a, b, g, n, ac"
                )));
            }
        }
        Ok(())
    }
}

fn in_subnet(addr: Ipv4Addr, subnet: Ipv4Addr, mask: Ipv4Addr) -> bool {
    (u32::from(addr) & u32::from(mask)) == (u32::from(subnet) & u32::from(mask))
}

impl DhcpConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        let subnet = parse_ipv4(&self.subnet, "subnet")?;
        let netmask = parse_ipv4(&self.netmask, "netmask")?;
        let gateway = parse_ipv4(&self.gateway, "gateway")?;
        let start = parse_ipv4(&self.range_start, "range_start")?;
        let end = parse_ipv4(&self.range_end, "range_end")?;

        // Netmask must be contiguous ones followed by zeros.
        let mask_bits = u32::from(netmask);
        if mask_bits == 0 || (!mask_bits).wrapping_add(1) & !mask_bits != 0 {
            return Err(RouterError::Validation(format!(
                "netmask '{}' is not a valid network mask",
                self.netmask
            )));
        }

        if !in_subnet(gateway, subnet, netmask) {
            return Err(RouterError::Validation(format!(
                "gateway {} is outside subnet {}/{}",
                gateway, subnet, netmask
            )));
        }
        for (addr, name) in [(start, "range_start"), (end, "range_end")] {
            if !in_subnet(addr, subnet, netmask) {
                return Err(RouterError::Validation(format!(
                    "{name} {addr} is outside subnet {subnet}/{netmask}"
                )));
            }
        }
        if u32::from(start) >= u32::from(end) {
            return Err(RouterError::Validation(format!(
                "DHCP range start {start} must be below range end {end}"
            )));
        }

        let body = self.lease_time.trim_end_matches(['s', 'm', 'h', 'd']);
        if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit()) {
            return Err(RouterError::Validation(format!(
                "lease time '{}' must be a number with optional s/m/h/d suffix",
                self.lease_time
            )));
        }
        Ok(())
    }
}

impl NetworkSettings {
    pub fn validate(&self) -> Result<(), RouterError> {
        self.uplink.validate()?;
        self.ap.validate()?;
        self.dhcp.validate()
    }
}

/// TOML-backed store for the committed baseline. Only the state machine
/// writes it, after a successful verify.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        SettingsStore { path }
    }

    pub fn at_default_path() -> Self {
        SettingsStore::new(settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<NetworkSettings> {
        if !self.path.exists() {
            return Ok(NetworkSettings::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings file: {}", self.path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", self.path.display()))
    }

    pub fn save(&self, settings: &NetworkSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write settings file: {}", self.path.display()))?;
        Ok(())
    }
}

/// Settings path resolution: explicit override, the system location when it
/// exists, otherwise the per-user config directory.
pub fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("PI_ROUTER_CONFIG") {
        return PathBuf::from(path);
    }
    let system = Path::new("/etc/pi-router");
    if system.is_dir() {
        return system.join("network.toml");
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pi-router")
        .join("network.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        NetworkSettings::default().validate().unwrap();
    }

    #[test]
    fn ap_password_too_short_is_rejected() {
        let cfg = ApConfig {
            password: "short77".to_string(),
            ..ApConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RouterError::Validation(_))));
    }

    #[test]
    fn channel_must_match_hw_mode() {
        let cfg = ApConfig {
            channel: 36,
            hw_mode: "g".to_string(),
            ..ApConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ApConfig {
            channel: 36,
            hw_mode: "a".to_string(),
            ..ApConfig::default()
        };
        cfg.validate().unwrap();

        let cfg = ApConfig {
            channel: 14,
            hw_mode: "g".to_string(),
            ..ApConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dhcp_range_order_is_enforced() {
        let cfg = DhcpConfig {
            range_start: "10.42.0.200".to_string(),
            range_end: "10.42.0.50".to_string(),
            ..DhcpConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RouterError::Validation(_))));
    }

    #[test]
    fn dhcp_range_must_be_inside_subnet() {
        let cfg = DhcpConfig {
            range_end: "10.43.0.200".to_string(),
            ..DhcpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dhcp_gateway_must_be_inside_subnet() {
        let cfg = DhcpConfig {
            gateway: "192.168.1.1".to_string(),
            ..DhcpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn wpa_uplink_requires_key() {
        let cfg = UplinkConfig {
            ssid: "Upstream".to_string(),
            ..UplinkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn portal_uplink_accepts_auto_detect_without_url() {
        let cfg = UplinkConfig {
            mode: UplinkMode::Portal,
            ssid: "HotelWifi".to_string(),
            auto_detect_portal: true,
            ..UplinkConfig::default()
        };
        cfg.validate().unwrap();

        let cfg = UplinkConfig {
            mode: UplinkMode::Portal,
            ssid: "HotelWifi".to_string(),
            auto_detect_portal: false,
            ..UplinkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn store_round_trips_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("network.toml"));
        let mut settings = NetworkSettings::default();
        settings.ap.ssid = "Test-AP".to_string();
        store.save(&settings).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ap.ssid, "Test-AP");
        assert_eq!(loaded.dhcp.gateway, "10.42.0.1");
    }

    #[test]
    fn missing_store_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nope.toml"));
        let loaded = store.load().unwrap();
        assert_eq!(loaded.ap.ssid, "PiRouter-AP");
    }
}
