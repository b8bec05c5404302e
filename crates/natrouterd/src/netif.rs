//! Network interface stack collaborator.
//!
//! The stack owns the two wireless interfaces, their addressing, the
//! upstream DHCP client and the downstream DHCP server. It reports link and
//! address changes as [`NetEvent`]s on the channel handed to
//! [`NetStack::subscribe`].

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use router_common::{DownstreamConfig, EnterpriseAuth, RouterResult, UpstreamConfig};
use router_types::{InterfaceRole, IpInfo, MacAddress};
use tokio::sync::mpsc::UnboundedSender;

/// Maximum number of stations on the access point.
pub const AP_MAX_CONNECTIONS: u8 = 10;

/// Access point beacon interval in time units.
pub const AP_BEACON_INTERVAL: u16 = 100;

/// Notifications from the network stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// The upstream interface started and may now connect.
    LinkUp,
    /// The upstream association was lost.
    LinkLost {
        /// Stack-specific reason code, when reported.
        reason: Option<u16>,
    },
    /// The upstream interface acquired an address.
    IpAcquired(IpInfo),
    /// A station associated with the access point.
    PeerAssociated {
        mac: MacAddress,
        /// Association id assigned by the access point.
        aid: Option<u16>,
    },
    /// A station left the access point.
    PeerDisassociated {
        mac: MacAddress,
        aid: Option<u16>,
    },
}

impl fmt::Display for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetEvent::LinkUp => write!(f, "link-up"),
            NetEvent::LinkLost { .. } => write!(f, "link-lost"),
            NetEvent::IpAcquired(info) => write!(f, "ip-acquired({})", info.ip),
            NetEvent::PeerAssociated { mac, .. } => write!(f, "peer-associated({})", mac),
            NetEvent::PeerDisassociated { mac, .. } => write!(f, "peer-disassociated({})", mac),
        }
    }
}

/// Radio operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    /// Access point only.
    Ap,
    /// Access point and station.
    ApSta,
}

/// Access point authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApAuth {
    Open,
    /// WPA2-PSK with CCMP.
    Wpa2Psk,
}

/// Access point radio settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub password: String,
    pub auth: ApAuth,
    pub max_connections: u8,
    pub beacon_interval: u16,
}

impl AccessPointSettings {
    /// Builds the access point settings; passwords too short for WPA2 give
    /// an open network.
    pub fn from_config(config: &DownstreamConfig) -> Self {
        let auth = if config.is_secured() {
            ApAuth::Wpa2Psk
        } else {
            ApAuth::Open
        };
        Self {
            ssid: config.ssid.clone(),
            password: if auth == ApAuth::Open {
                String::new()
            } else {
                config.password.clone()
            },
            auth,
            max_connections: AP_MAX_CONNECTIONS,
            beacon_interval: AP_BEACON_INTERVAL,
        }
    }
}

/// Station credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct StationSettings {
    pub ssid: String,
    /// Personal passphrase; empty for open or enterprise networks.
    pub password: String,
    pub enterprise: Option<EnterpriseAuth>,
}

impl StationSettings {
    /// Builds station credentials; `None` when no upstream is configured.
    pub fn from_config(config: &UpstreamConfig) -> Option<Self> {
        config.is_configured().then(|| Self {
            ssid: config.ssid.clone(),
            password: config.password.clone(),
            enterprise: config.enterprise.clone(),
        })
    }
}

impl fmt::Debug for StationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationSettings")
            .field("ssid", &self.ssid)
            .field("enterprise", &self.enterprise.is_some())
            .finish_non_exhaustive()
    }
}

/// Complete radio configuration applied before the stack is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiSettings {
    pub mode: WifiMode,
    pub access_point: AccessPointSettings,
    pub station: Option<StationSettings>,
}

impl WifiSettings {
    /// Derives the radio configuration: AP+STA when an upstream SSID is
    /// configured, AP only otherwise.
    pub fn from_config(upstream: &UpstreamConfig, downstream: &DownstreamConfig) -> Self {
        let station = StationSettings::from_config(upstream);
        Self {
            mode: if station.is_some() {
                WifiMode::ApSta
            } else {
                WifiMode::Ap
            },
            access_point: AccessPointSettings::from_config(downstream),
            station,
        }
    }

    /// Radio configuration without a station.
    pub fn access_point_only(downstream: &DownstreamConfig) -> Self {
        Self {
            mode: WifiMode::Ap,
            access_point: AccessPointSettings::from_config(downstream),
            station: None,
        }
    }
}

/// The platform network stack.
#[async_trait]
pub trait NetStack: Send + Sync {
    /// Returns the factory-programmed base MAC address.
    async fn factory_mac(&self) -> RouterResult<MacAddress>;

    /// Overrides the base MAC address. Only valid before any interface is
    /// created.
    async fn set_base_mac(&self, mac: MacAddress) -> RouterResult<()>;

    /// Creates the interface for `role`.
    async fn create_interface(&self, role: InterfaceRole) -> RouterResult<()>;

    /// Assigns a static address to an interface.
    async fn set_ip_info(&self, role: InterfaceRole, info: IpInfo) -> RouterResult<()>;

    /// Stops the upstream DHCP client.
    async fn dhcp_client_stop(&self) -> RouterResult<()>;

    /// Starts the downstream DHCP server.
    async fn dhcp_server_start(&self) -> RouterResult<()>;

    /// Stops the downstream DHCP server.
    async fn dhcp_server_stop(&self) -> RouterResult<()>;

    /// Sets the DNS server advertised by the downstream DHCP server and
    /// enables the offer-DNS option. Takes effect on the next server start.
    async fn set_offered_dns(&self, dns: Ipv4Addr) -> RouterResult<()>;

    /// Returns the DNS server learned on the upstream interface, if any.
    async fn upstream_dns(&self) -> RouterResult<Option<Ipv4Addr>>;

    /// Applies the radio configuration.
    async fn configure_wifi(&self, settings: &WifiSettings) -> RouterResult<()>;

    /// Starts the radio. A [`NetEvent::LinkUp`] follows when a station
    /// interface is configured.
    async fn start(&self) -> RouterResult<()>;

    /// Asks the upstream interface to associate.
    async fn connect(&self) -> RouterResult<()>;

    /// Registers the channel that receives stack notifications.
    fn subscribe(&self, events: UnboundedSender<NetEvent>);
}
