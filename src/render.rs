//! Daemon config file rendering.
//!
//! Pure functions from typed settings to the exact text each daemon expects.
//! No I/O here; the Privileged Applier stages and installs the output. The
//! same input always renders byte-identical output.
//!
//! User-supplied strings (SSIDs, passphrases) are checked before they are
//! interpolated: control characters would break the line-oriented grammars,
//! and quotes or backslashes would break wpa_supplicant's quoted strings.

use std::fmt::Write;

use crate::error::RouterError;
use crate::settings::{ApConfig, DhcpConfig, UplinkConfig};

fn checked<'a>(value: &'a str, field: &str) -> Result<&'a str, RouterError> {
    if value.chars().any(|c| c.is_control()) {
        return Err(RouterError::Validation(format!(
            "{field} contains control characters"
        )));
    }
    Ok(value)
}

fn checked_quoted<'a>(value: &'a str, field: &str) -> Result<&'a str, RouterError> {
    let value = checked(value, field)?;
    if value.contains('"') || value.contains('\\') {
        return Err(RouterError::Validation(format!(
            "{field} must not contain quotes or backslashes"
        )));
    }
    Ok(value)
}

/// wpa_supplicant config for the uplink interface.
pub fn wpa_supplicant(cfg: &UplinkConfig) -> Result<String, RouterError> {
    let ssid = checked_quoted(&cfg.ssid, "uplink SSID")?;
    let country = checked(&cfg.country, "country code")?;

    let mut out = String::new();
    writeln!(out, "country={country}").unwrap();
    writeln!(out, "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev").unwrap();
    writeln!(out, "update_config=1").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "network={{").unwrap();
    writeln!(out, "    ssid=\"{ssid}\"").unwrap();
    if cfg.password.is_empty() {
        // Open network (portal mode without WPA).
        writeln!(out, "    key_mgmt=NONE").unwrap();
    } else {
        let psk = checked_quoted(&cfg.password, "uplink password")?;
        writeln!(out, "    psk=\"{psk}\"").unwrap();
        writeln!(out, "    key_mgmt=WPA-PSK").unwrap();
    }
    writeln!(out, "}}").unwrap();
    Ok(out)
}

/// hostapd config for the AP interface.
pub fn hostapd(cfg: &ApConfig, interface: &str) -> Result<String, RouterError> {
    let ssid = checked(&cfg.ssid, "AP SSID")?;
    let password = checked(&cfg.password, "AP password")?;
    let country = checked(&cfg.country, "country code")?;
    let hw_mode = checked(&cfg.hw_mode, "hw_mode")?;

    let mut out = String::new();
    writeln!(out, "# pi-router AP configuration").unwrap();
    writeln!(out, "interface={interface}").unwrap();
    writeln!(out, "driver=nl80211").unwrap();
    writeln!(out, "ssid={ssid}").unwrap();
    writeln!(out, "hw_mode={hw_mode}").unwrap();
    writeln!(out, "channel={}", cfg.channel).unwrap();
    writeln!(out, "country_code={country}").unwrap();
    writeln!(out, "auth_algs=1").unwrap();
    writeln!(out, "wpa=2").unwrap();
    writeln!(out, "wpa_passphrase={password}").unwrap();
    writeln!(out, "wpa_key_mgmt=WPA-PSK").unwrap();
    writeln!(out, "wpa_pairwise=CCMP").unwrap();
    writeln!(out, "rsn_pairwise=CCMP").unwrap();
    Ok(out)
}

/// dnsmasq DHCP and DNS config, bound to the AP interface.
pub fn dnsmasq(cfg: &DhcpConfig, interface: &str) -> Result<String, RouterError> {
    let range_start = checked(&cfg.range_start, "range_start")?;
    let range_end = checked(&cfg.range_end, "range_end")?;
    let netmask = checked(&cfg.netmask, "netmask")?;
    let gateway = checked(&cfg.gateway, "gateway")?;
    let lease_time = checked(&cfg.lease_time, "lease_time")?;

    let mut out = String::new();
    writeln!(out, "# pi-router DHCP and DNS configuration").unwrap();
    writeln!(out, "interface={interface}").unwrap();
    writeln!(out, "bind-interfaces").unwrap();
    writeln!(out, "except-interface=lo").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "dhcp-range={range_start},{range_end},{netmask},{lease_time}").unwrap();
    writeln!(out, "dhcp-option=3,{gateway}").unwrap();
    writeln!(out, "dhcp-option=6,8.8.8.8,8.8.4.4").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "log-dhcp").unwrap();
    writeln!(out, "cache-size=150").unwrap();
    writeln!(out, "no-resolv").unwrap();
    writeln!(out, "server=1.1.1.1").unwrap();
    writeln!(out, "server=1.0.0.1").unwrap();
    Ok(out)
}

/// nftables NAT rules: masquerade out the uplink, forward AP -> uplink.
pub fn nftables(uplink_interface: &str, ap_interface: &str) -> String {
    format!(
        r#"# pi-router NAT configuration
table nat {{
    chain postrouting {{
        type nat hook postrouting priority srcnat {{ policy accept; }}
        oifname "{uplink_interface}" masquerade
    }}
}}

table inet filter {{
    chain forward {{
        type filter hook forward priority filter {{ policy accept; }}
        iifname "{ap_interface}" oifname "{uplink_interface}" accept
        ct state established,related accept
    }}
}}
"#
    )
}

/// Persistent IPv4 forwarding sysctl fragment.
pub fn sysctl_forwarding() -> &'static str {
    "net.ipv4.ip_forward=1\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::UplinkMode;

    #[test]
    fn hostapd_rendering_is_deterministic() {
        let cfg = ApConfig {
            ssid: "Test-AP".to_string(),
            password: "longenough1".to_string(),
            channel: 6,
            country: "US".to_string(),
            hw_mode: "g".to_string(),
        };
        let first = hostapd(&cfg, "wlan1").unwrap();
        let second = hostapd(&cfg, "wlan1").unwrap();
        assert_eq!(first, second);
        assert!(first.contains("ssid=Test-AP"));
        assert!(first.contains("channel=6"));
        assert!(first.contains("wpa_passphrase=longenough1"));
    }

    #[test]
    fn newline_in_ssid_is_rejected() {
        let cfg = ApConfig {
            ssid: "evil\nwpa_passphrase=injected".to_string(),
            ..ApConfig::default()
        };
        assert!(matches!(
            hostapd(&cfg, "wlan1"),
            Err(RouterError::Validation(_))
        ));
    }

    #[test]
    fn quote_in_wpa_ssid_is_rejected() {
        let cfg = UplinkConfig {
            ssid: "bad\"ssid".to_string(),
            password: "longenough1".to_string(),
            ..UplinkConfig::default()
        };
        assert!(wpa_supplicant(&cfg).is_err());
    }

    #[test]
    fn wpa_supplicant_quotes_credentials() {
        let cfg = UplinkConfig {
            ssid: "Upstream".to_string(),
            password: "hunter2222".to_string(),
            ..UplinkConfig::default()
        };
        let out = wpa_supplicant(&cfg).unwrap();
        assert!(out.contains("ssid=\"Upstream\""));
        assert!(out.contains("psk=\"hunter2222\""));
        assert!(out.contains("key_mgmt=WPA-PSK"));
    }

    #[test]
    fn open_network_renders_key_mgmt_none() {
        let cfg = UplinkConfig {
            mode: UplinkMode::Portal,
            ssid: "HotelWifi".to_string(),
            ..UplinkConfig::default()
        };
        let out = wpa_supplicant(&cfg).unwrap();
        assert!(out.contains("key_mgmt=NONE"));
        assert!(!out.contains("psk="));
    }

    #[test]
    fn dnsmasq_contains_range_and_gateway() {
        let out = dnsmasq(&DhcpConfig::default(), "wlan1").unwrap();
        assert!(out.contains("dhcp-range=10.42.0.50,10.42.0.200,255.255.255.0,12h"));
        assert!(out.contains("dhcp-option=3,10.42.0.1"));
        assert!(out.contains("interface=wlan1"));
    }

    #[test]
    fn nftables_masquerades_uplink() {
        let out = nftables("wlan0", "wlan1");
        assert!(out.contains("oifname \"wlan0\" masquerade"));
        assert!(out.contains("iifname \"wlan1\" oifname \"wlan0\" accept"));
    }
}
