//! Read-only OS introspection.
//!
//! Wraps the fixed set of query commands (`iwconfig`, `ip`, `systemctl
//! is-active`, `nft list`) and the dnsmasq lease file. Each command's output
//! goes through a small pure parser so the parsing is unit-testable without a
//! real process behind it.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::command;
use crate::error::RouterError;

/// Default dnsmasq lease file location.
pub const LEASE_FILE: &str = "/var/lib/misc/dnsmasq.leases";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of the uplink (client) interface.
#[derive(Debug, Clone, Serialize)]
pub struct UplinkStatus {
    pub interface: String,
    pub connected: bool,
    pub ssid: Option<String>,
    pub signal_percent: Option<u8>,
    pub ip_address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

/// Snapshot of the AP interface and its daemon.
#[derive(Debug, Clone, Serialize)]
pub struct ApStatus {
    pub interface: String,
    pub running: bool,
    pub mode: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    pub clients: usize,
}

/// One row of the dnsmasq lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub expires: i64,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
}

/// Extract the ESSID from `iwconfig` output.
pub fn parse_essid(output: &str) -> Option<String> {
    let start = output.find("ESSID:\"")? + "ESSID:\"".len();
    let rest = &output[start..];
    let end = rest.find('"')?;
    let essid = &rest[..end];
    if essid.is_empty() {
        None
    } else {
        Some(essid.to_string())
    }
}

/// Extract the operating mode from `iwconfig` output (e.g. "Master",
/// "Managed").
pub fn parse_mode(output: &str) -> Option<String> {
    let start = output.find("Mode:")? + "Mode:".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    let mode = &rest[..end];
    if mode.is_empty() {
        None
    } else {
        Some(mode.to_string())
    }
}

/// Extract link quality from `iwconfig` output as a percentage.
pub fn parse_link_quality(output: &str) -> Option<u8> {
    let start = output.find("Link Quality=")? + "Link Quality=".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    let (num, den) = rest[..end].split_once('/')?;
    let num: u32 = num.parse().ok()?;
    let den: u32 = den.parse().ok()?;
    if den == 0 {
        return None;
    }
    Some((num * 100 / den).min(100) as u8)
}

/// Extract the first IPv4 address from `ip -o -4 addr show dev <if>` output.
pub fn parse_ipv4_addr(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "inet" {
            let addr = tokens.next()?;
            let addr = addr.split('/').next()?;
            return addr.parse().ok();
        }
    }
    None
}

/// Extract the default gateway for `interface` from `ip route show default`.
pub fn parse_default_gateway(output: &str, interface: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        let dev = tokens.iter().position(|t| *t == "dev").map(|i| tokens.get(i + 1));
        if dev != Some(Some(&interface)) {
            continue;
        }
        if let Some(i) = tokens.iter().position(|t| *t == "via") {
            if let Some(addr) = tokens.get(i + 1) {
                return addr.parse().ok();
            }
        }
    }
    None
}

/// Parse the dnsmasq lease file: `<expiry-epoch> <mac> <ip> <hostname> <id>`
/// per line. Malformed lines are skipped.
pub fn parse_leases(content: &str) -> Vec<DhcpLease> {
    let mut leases = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let (Ok(expires), Ok(ip)) = (parts[0].parse::<i64>(), parts[2].parse::<Ipv4Addr>()) else {
            continue;
        };
        let hostname = if parts[3] == "*" {
            "Unknown".to_string()
        } else {
            parts[3].to_string()
        };
        leases.push(DhcpLease {
            expires,
            mac: parts[1].to_ascii_lowercase(),
            ip,
            hostname,
        });
    }
    leases
}

/// Whether a systemd unit reports active. Exit code is the answer, not a
/// failure.
pub async fn service_active(unit: &str) -> Result<bool, RouterError> {
    let output = command::run_timeout("systemctl", &["is-active", unit], QUERY_TIMEOUT).await?;
    Ok(output.success())
}

/// Current iwconfig operating mode for an interface.
pub async fn interface_mode(interface: &str) -> Result<Option<String>, RouterError> {
    let output = command::run_timeout("iwconfig", &[interface], QUERY_TIMEOUT).await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(parse_mode(&output.stdout))
}

/// IPv4 address currently assigned to an interface.
pub async fn interface_ipv4(interface: &str) -> Result<Option<Ipv4Addr>, RouterError> {
    let output = command::run_timeout(
        "ip",
        &["-o", "-4", "addr", "show", "dev", interface],
        QUERY_TIMEOUT,
    )
    .await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(parse_ipv4_addr(&output.stdout))
}

/// Full uplink snapshot: association, signal, address, gateway.
pub async fn uplink_status(interface: &str) -> Result<UplinkStatus, RouterError> {
    let mut status = UplinkStatus {
        interface: interface.to_string(),
        connected: false,
        ssid: None,
        signal_percent: None,
        ip_address: None,
        gateway: None,
    };

    let output = command::run_timeout("iwconfig", &[interface], QUERY_TIMEOUT).await?;
    if output.success() {
        status.ssid = parse_essid(&output.stdout);
        status.signal_percent = parse_link_quality(&output.stdout);
        status.connected = status.ssid.is_some();
    }

    status.ip_address = interface_ipv4(interface).await?;

    let output = command::run_timeout("ip", &["route", "show", "default"], QUERY_TIMEOUT).await?;
    if output.success() {
        status.gateway = parse_default_gateway(&output.stdout, interface);
    }

    Ok(status)
}

/// Full AP snapshot: daemon state, interface mode, address, client count.
pub async fn ap_status(interface: &str, lease_file: &Path) -> Result<ApStatus, RouterError> {
    let running = service_active("hostapd").await?;
    let mode = interface_mode(interface).await?;
    let ip_address = interface_ipv4(interface).await?;
    let clients = read_leases(lease_file).await.len();

    Ok(ApStatus {
        interface: interface.to_string(),
        running,
        mode,
        ip_address,
        clients,
    })
}

/// Read and parse the dnsmasq lease file; a missing file is an empty table.
pub async fn read_leases(path: &Path) -> Vec<DhcpLease> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_leases(&content),
        Err(_) => Vec::new(),
    }
}

/// Whether the NAT table with a masquerade rule is loaded.
pub async fn nat_active() -> Result<bool, RouterError> {
    let output = command::run_timeout("nft", &["list", "table", "nat"], QUERY_TIMEOUT).await?;
    Ok(output.success() && output.stdout.contains("masquerade"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IWCONFIG_CONNECTED: &str = r#"wlan0     IEEE 802.11  ESSID:"CoffeeShop"
          Mode:Managed  Frequency:2.437 GHz  Access Point: AA:BB:CC:DD:EE:FF
          Bit Rate=72.2 Mb/s   Tx-Power=31 dBm
          Link Quality=54/70  Signal level=-56 dBm
"#;

    const IWCONFIG_AP: &str = r#"wlan1     IEEE 802.11  Mode:Master  Tx-Power=31 dBm
          Retry short limit:7   RTS thr:off   Fragment thr:off
"#;

    const IWCONFIG_DOWN: &str = r#"wlan0     IEEE 802.11  ESSID:off/any
          Mode:Managed  Access Point: Not-Associated   Tx-Power=31 dBm
"#;

    #[test]
    fn parses_essid_and_quality_when_associated() {
        assert_eq!(parse_essid(IWCONFIG_CONNECTED).as_deref(), Some("CoffeeShop"));
        assert_eq!(parse_link_quality(IWCONFIG_CONNECTED), Some(77));
        assert_eq!(parse_mode(IWCONFIG_CONNECTED).as_deref(), Some("Managed"));
    }

    #[test]
    fn master_mode_is_detected() {
        assert_eq!(parse_mode(IWCONFIG_AP).as_deref(), Some("Master"));
        assert_eq!(parse_essid(IWCONFIG_AP), None);
    }

    #[test]
    fn unassociated_interface_has_no_essid() {
        assert_eq!(parse_essid(IWCONFIG_DOWN), None);
    }

    #[test]
    fn parses_ip_addr_output() {
        let out = "3: wlan1    inet 10.42.0.1/24 brd 10.42.0.255 scope global wlan1\\       valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_ipv4_addr(out), Some(Ipv4Addr::new(10, 42, 0, 1)));
        assert_eq!(parse_ipv4_addr(""), None);
    }

    #[test]
    fn parses_default_gateway_for_matching_device() {
        let out = "default via 192.168.1.1 dev wlan0 proto dhcp metric 600\n\
                   default via 10.0.0.1 dev eth0 proto static metric 100\n";
        assert_eq!(
            parse_default_gateway(out, "wlan0"),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(
            parse_default_gateway(out, "eth0"),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(parse_default_gateway(out, "wlan1"), None);
    }

    #[test]
    fn parses_lease_table_rows() {
        let content = "1756380000 aa:bb:cc:dd:ee:ff 10.42.0.51 phone 01:aa:bb:cc:dd:ee:ff\n\
                       1756380100 11:22:33:44:55:66 10.42.0.52 * *\n\
                       garbage line\n";
        let leases = parse_leases(content);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(leases[0].hostname, "phone");
        assert_eq!(leases[1].hostname, "Unknown");
        assert_eq!(leases[1].ip, Ipv4Addr::new(10, 42, 0, 52));
    }

    #[test]
    fn lease_macs_are_normalized_to_lowercase() {
        let leases = parse_leases("1756380000 AA:BB:CC:DD:EE:FF 10.42.0.51 phone\n");
        assert_eq!(leases[0].mac, "aa:bb:cc:dd:ee:ff");
    }
}
