//! pi-router network orchestrator.
//!
//! Turns a single-board computer with two wireless adapters into a Wi-Fi
//! router: one adapter joins an existing network (the uplink), the other
//! broadcasts a new one (the AP), with NAT bridging the two. This library
//! configures, launches, verifies, and rolls back the external daemons
//! (wpa_supplicant, hostapd, dnsmasq, nftables) that do the actual work;
//! it implements none of those protocols itself.
//!
//! # Modules
//!
//! - [`command`] - External command execution with timeouts and capture
//! - [`render`] - Typed settings to daemon config file content
//! - [`apply`] - Staging, backups, and the privileged helper boundary
//! - [`probe`] - Read-only OS introspection and output parsers
//! - [`verify`] - Bounded-retry post-apply verification
//! - [`orchestrator`] - The per-interface apply state machine
//! - [`portal`] - Captive portal detection and login
//! - [`devices`] - Connected-device presence tracking
//! - [`settings`] - Typed configuration and the committed baseline
//! - [`server`] - HTTP API for the dashboard
//! - [`error`] - Error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use pi_router::{ApConfig, Orchestrator};
//! use pi_router::apply::Applier;
//! use pi_router::settings::SettingsStore;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let orchestrator = Orchestrator::new(Applier::system(), SettingsStore::at_default_path());
//! let result = orchestrator.apply_ap(&ApConfig::default()).await?;
//! println!("{:?}: {}", result.status, result.detail);
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod command;
pub mod devices;
pub mod error;
pub mod orchestrator;
pub mod portal;
pub mod probe;
pub mod render;
pub mod server;
pub mod settings;
pub mod verify;

pub use devices::{Device, DeviceTracker};
pub use error::RouterError;
pub use orchestrator::{ApplyResult, ApplyStatus, Orchestrator};
pub use portal::{LoginOutcome, PortalDetection, PortalSession};
pub use settings::{
    ApConfig, DhcpConfig, InterfaceRole, NetworkSettings, SettingsStore, UplinkConfig, UplinkMode,
};
