use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use pi_router::apply::Applier;
use pi_router::server::{self, AppState, ServerConfig};
use pi_router::{
    ApConfig, DeviceTracker, DhcpConfig, Orchestrator, SettingsStore, UplinkConfig, UplinkMode,
    devices, probe,
};

#[derive(Parser)]
#[command(name = "pi-router")]
#[command(about = "Turn a two-adapter board into a Wi-Fi router")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show uplink, AP, and NAT status
    Status,

    /// Connect the uplink interface to a network
    ApplyUplink {
        /// SSID of the upstream network
        ssid: String,

        /// WPA passphrase (omit for an open/portal network)
        #[arg(short, long)]
        password: Option<String>,

        /// Treat this as a captive-portal network
        #[arg(long)]
        portal: bool,

        /// Known portal login URL
        #[arg(long)]
        portal_url: Option<String>,

        /// Portal login username
        #[arg(long)]
        portal_username: Option<String>,

        /// Portal login password
        #[arg(long)]
        portal_password: Option<String>,

        /// Regulatory country code
        #[arg(short, long, default_value = "US")]
        country: String,
    },

    /// Reconfigure the access point
    ApplyAp {
        /// SSID to broadcast
        ssid: String,

        /// WPA2 passphrase (8-63 characters)
        #[arg(short, long)]
        password: String,

        /// Wi-Fi channel
        #[arg(long, default_value = "6")]
        channel: u8,

        /// Hardware mode (a/b/g/n/ac)
        #[arg(long, default_value = "g")]
        hw_mode: String,

        /// Regulatory country code
        #[arg(short, long, default_value = "US")]
        country: String,
    },

    /// Reconfigure the DHCP server
    ApplyDhcp {
        #[arg(long, default_value = "10.42.0.0")]
        subnet: String,

        #[arg(long, default_value = "255.255.255.0")]
        netmask: String,

        /// Gateway address; also the AP interface's static address
        #[arg(long, default_value = "10.42.0.1")]
        gateway: String,

        #[arg(long, default_value = "10.42.0.50")]
        range_start: String,

        #[arg(long, default_value = "10.42.0.200")]
        range_end: String,

        #[arg(long, default_value = "12h")]
        lease_time: String,
    },

    /// Enable and persist IPv4 forwarding
    EnableForwarding,

    /// Install and persist the NAT ruleset
    SetupNat,

    /// Probe for a captive portal on the uplink
    DetectPortal,

    /// Log in to a captive portal
    LoginPortal {
        /// Portal login page URL
        url: String,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Fetch a portal page and save it for manual inspection
    FetchPortal {
        /// Portal page URL
        url: String,

        /// Output file path
        #[arg(short, long, default_value = "portal.html")]
        output: PathBuf,
    },

    /// List connected devices
    Devices {
        /// Include stale history, not just the active roster
        #[arg(short, long)]
        all: bool,
    },

    /// Run the dashboard API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Show the committed network baseline
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    // Single construction point; everything below borrows these.
    let orchestrator = Arc::new(Orchestrator::new(
        Applier::system(),
        SettingsStore::at_default_path(),
    ));

    match cli.command {
        Commands::Status => cmd_status(&orchestrator).await,
        Commands::ApplyUplink {
            ssid,
            password,
            portal,
            portal_url,
            portal_username,
            portal_password,
            country,
        } => {
            let cfg = UplinkConfig {
                mode: if portal { UplinkMode::Portal } else { UplinkMode::Wpa },
                ssid,
                password: password.unwrap_or_default(),
                country,
                portal_url,
                portal_username,
                portal_password,
                auto_detect_portal: true,
            };
            cmd_apply(orchestrator.apply_uplink(&cfg).await)
        }
        Commands::ApplyAp {
            ssid,
            password,
            channel,
            hw_mode,
            country,
        } => {
            let cfg = ApConfig {
                ssid,
                password,
                channel,
                country,
                hw_mode,
            };
            cmd_apply(orchestrator.apply_ap(&cfg).await)
        }
        Commands::ApplyDhcp {
            subnet,
            netmask,
            gateway,
            range_start,
            range_end,
            lease_time,
        } => {
            let cfg = DhcpConfig {
                subnet,
                netmask,
                gateway,
                range_start,
                range_end,
                lease_time,
            };
            cmd_apply(orchestrator.apply_dhcp(&cfg).await)
        }
        Commands::EnableForwarding => cmd_apply(orchestrator.enable_forwarding().await),
        Commands::SetupNat => cmd_apply(orchestrator.setup_nat().await),
        Commands::DetectPortal => cmd_detect_portal(&orchestrator).await,
        Commands::LoginPortal {
            url,
            username,
            password,
        } => cmd_login_portal(&orchestrator, &url, username.as_deref(), password.as_deref()).await,
        Commands::FetchPortal { url, output } => cmd_fetch_portal(&url, &output),
        Commands::Devices { all } => cmd_devices(&orchestrator, all).await,
        Commands::Serve { port } => {
            let state = AppState {
                orchestrator,
                tracker: Arc::new(RwLock::new(DeviceTracker::new())),
            };
            server::run_server(ServerConfig { port }, state).await
        }
        Commands::ShowConfig => cmd_show_config(&orchestrator),
    }
}

async fn cmd_status(orchestrator: &Orchestrator) -> Result<()> {
    let uplink = probe::uplink_status(orchestrator.uplink_interface()).await?;
    println!("Uplink ({}):", uplink.interface);
    println!("  Connected: {}", if uplink.connected { "yes" } else { "no" });
    if let Some(ref ssid) = uplink.ssid {
        println!("  SSID:      {ssid}");
    }
    if let Some(signal) = uplink.signal_percent {
        println!("  Signal:    {signal}%");
    }
    if let Some(ip) = uplink.ip_address {
        println!("  IP:        {ip}");
    }
    if let Some(gw) = uplink.gateway {
        println!("  Gateway:   {gw}");
    }

    let ap = probe::ap_status(orchestrator.ap_interface(), orchestrator.lease_file()).await?;
    println!();
    println!("AP ({}):", ap.interface);
    println!("  Running:   {}", if ap.running { "yes" } else { "no" });
    if let Some(ref mode) = ap.mode {
        println!("  Mode:      {mode}");
    }
    if let Some(ip) = ap.ip_address {
        println!("  IP:        {ip}");
    }
    println!("  Clients:   {}", ap.clients);

    let nat = probe::nat_active().await.unwrap_or(false);
    println!();
    println!("NAT:         {}", if nat { "enabled" } else { "disabled" });

    Ok(())
}

fn cmd_apply(result: std::result::Result<pi_router::ApplyResult, pi_router::RouterError>) -> Result<()> {
    let result = result?;
    println!("{:?}: {}", result.status, result.detail);
    if let Some(ref backup) = result.backup {
        println!("Backup: {}", backup.display());
    }
    Ok(())
}

async fn cmd_detect_portal(orchestrator: &Orchestrator) -> Result<()> {
    let session = orchestrator.detect_portal().await?;
    println!("Detection: {:?}", session.detection);
    println!("Internet:  {}", if session.has_internet { "yes" } else { "no" });
    if let Some(ref url) = session.portal_url {
        println!("Portal:    {url}");
    }
    Ok(())
}

async fn cmd_login_portal(
    orchestrator: &Orchestrator,
    url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let outcome = orchestrator.login_portal(url, username, password).await?;
    println!("{}: {}", if outcome.success { "OK" } else { "Failed" }, outcome.message);
    Ok(())
}

fn cmd_fetch_portal(url: &str, output: &PathBuf) -> Result<()> {
    println!("Fetching {url} ...");
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("Failed to fetch {url}"))?;
    let content = response.into_string().context("Failed to read portal page")?;
    std::fs::write(output, &content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Saved to {}", output.display());
    Ok(())
}

async fn cmd_devices(orchestrator: &Orchestrator, all: bool) -> Result<()> {
    let tracker = RwLock::new(DeviceTracker::new());
    devices::poll(&tracker, orchestrator.lease_file()).await;
    let tracker = tracker.read().await;

    let list = if all {
        tracker.all_devices()
    } else {
        tracker.active_roster(chrono::Utc::now())
    };

    if list.is_empty() {
        println!("No devices.");
        return Ok(());
    }

    println!("{:<20} {:<16} {:<24} {}", "MAC", "IP", "HOSTNAME", "STATE");
    println!("{}", "-".repeat(70));
    for device in list {
        println!(
            "{:<20} {:<16} {:<24} {}",
            device.mac,
            device.ip,
            device.hostname,
            if device.online { "online" } else { "offline" }
        );
    }
    Ok(())
}

fn cmd_show_config(orchestrator: &Orchestrator) -> Result<()> {
    let store = orchestrator.settings();
    println!("Settings file: {}", store.path().display());
    println!();

    let settings = store.load()?;
    println!("Uplink SSID:  {}", settings.uplink.ssid);
    println!("Uplink mode:  {:?}", settings.uplink.mode);
    println!("AP SSID:      {}", settings.ap.ssid);
    println!("AP channel:   {}", settings.ap.channel);
    println!(
        "DHCP range:   {} - {}",
        settings.dhcp.range_start, settings.dhcp.range_end
    );
    println!("Gateway:      {}", settings.dhcp.gateway);
    Ok(())
}
