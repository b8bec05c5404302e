//! Interface Orchestrator.
//!
//! Brings up the downstream and upstream interfaces and runs the uplink
//! state machine against [`NetEvent`]s:
//!
//! ```text
//!            bring-up (upstream configured)
//!   Down ──────────────────────────────► Connecting ◄──┐ link-up: connect
//!                                          │    │      │
//!                              ip-acquired │    │ link-lost
//!                                          ▼    ▼
//!                               Connected ──► Disconnected ── link-up/link-lost: connect
//!                                   ▲              │
//!                                   └──────────────┘ ip-acquired
//! ```
//!
//! Every address acquisition reapplies the port mappings against the new
//! address, pushes the DNS choice downstream and then sets the readiness
//! flag. Events are handled one at a time on a dedicated task.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use router_common::{RouterConfig, RouterError, RouterResult};
use router_types::{InterfaceRole, IpInfo, MacAddress};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::dns::DnsSelector;
use crate::nat::NatEngine;
use crate::netif::{NetEvent, NetStack, WifiSettings};
use crate::portmap::PortMapManager;
use crate::readiness::ReadinessFlag;

/// Upstream link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UplinkState {
    /// No upstream configured, or not yet brought up.
    #[default]
    Down,
    /// Waiting for association and an address.
    Connecting,
    /// Upstream has an address; NAT state is bound to it.
    Connected,
    /// Association lost; a reconnect is in progress.
    Disconnected,
}

impl UplinkState {
    /// Returns the state after `event`.
    ///
    /// `Down` ignores every event. Peer events and link-up never change
    /// the state.
    pub fn on_event(self, event: &NetEvent) -> Self {
        match (self, event) {
            (UplinkState::Down, _) => UplinkState::Down,
            (_, NetEvent::LinkLost { .. }) => UplinkState::Disconnected,
            (_, NetEvent::IpAcquired(_)) => UplinkState::Connected,
            (state, _) => state,
        }
    }
}

impl fmt::Display for UplinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UplinkState::Down => "down",
            UplinkState::Connecting => "connecting",
            UplinkState::Connected => "connected",
            UplinkState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Addressing and status of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub ip_info: Option<IpInfo>,
    /// Upstream association status; always false for the downstream side.
    pub connected: bool,
}

#[derive(Debug, Default)]
struct Inner {
    uplink: UplinkState,
    upstream: InterfaceState,
    downstream: InterfaceState,
    upstream_configured: bool,
    interfaces_created: bool,
    nat_enabled: bool,
    advertised_dns: Option<Ipv4Addr>,
}

/// Owns interface state and reacts to network stack events.
pub struct Orchestrator {
    stack: Arc<dyn NetStack>,
    nat: Arc<dyn NatEngine>,
    portmap: Arc<PortMapManager>,
    dns: DnsSelector,
    readiness: ReadinessFlag,
    inner: Mutex<Inner>,
}

impl Orchestrator {
    pub fn new(
        stack: Arc<dyn NetStack>,
        nat: Arc<dyn NatEngine>,
        portmap: Arc<PortMapManager>,
        dns: DnsSelector,
    ) -> Self {
        Self {
            stack,
            nat,
            portmap,
            dns,
            readiness: ReadinessFlag::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> UplinkState {
        self.inner.lock().uplink
    }

    pub fn upstream(&self) -> InterfaceState {
        self.inner.lock().upstream
    }

    pub fn downstream(&self) -> InterfaceState {
        self.inner.lock().downstream
    }

    /// DNS server currently advertised downstream.
    pub fn advertised_dns(&self) -> Option<Ipv4Addr> {
        self.inner.lock().advertised_dns
    }

    pub fn readiness(&self) -> &ReadinessFlag {
        &self.readiness
    }

    pub fn portmap(&self) -> &Arc<PortMapManager> {
        &self.portmap
    }

    /// Sets the device base MAC. Fails once interfaces exist, since they
    /// would keep their old address.
    pub async fn apply_base_mac(&self, mac: MacAddress) -> RouterResult<()> {
        if self.inner.lock().interfaces_created {
            return Err(RouterError::internal(
                "base MAC must be set before interfaces are created",
            ));
        }
        self.stack.set_base_mac(mac).await?;
        info!(mac = %mac, "Applied base MAC");
        Ok(())
    }

    /// Creates and configures both interfaces, starts the radio and enables
    /// NAT on the downstream address.
    ///
    /// Only downstream failures are errors. Any upstream failure is logged
    /// and the radio comes up as an access point alone; see
    /// [`Orchestrator::upstream_active`].
    ///
    /// Returns the handle of the event task.
    #[instrument(skip_all)]
    pub async fn bring_up(self: &Arc<Self>, config: &RouterConfig) -> RouterResult<JoinHandle<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stack.subscribe(tx);
        let events = tokio::spawn(Arc::clone(self).run_events(rx));

        let ap_info = config.downstream.ip_info;
        self.stack.create_interface(InterfaceRole::Downstream).await?;
        self.inner.lock().interfaces_created = true;
        self.stack.dhcp_server_stop().await?;
        self.stack
            .set_ip_info(InterfaceRole::Downstream, ap_info)
            .await?;
        self.stack.dhcp_server_start().await?;
        self.inner.lock().downstream.ip_info = Some(ap_info);
        info!(ap = %ap_info, ssid = %config.downstream.ssid, "Downstream interface configured");

        let with_station = if !config.upstream.is_configured() {
            info!("No upstream network configured, access point only");
            false
        } else if let Err(e) = self.prepare_upstream(config).await {
            warn!(error = %e, "Upstream interface setup failed, access point only");
            false
        } else {
            match self
                .start_radio(&WifiSettings::from_config(&config.upstream, &config.downstream))
                .await
            {
                Ok(()) => {
                    info!(ssid = %config.upstream.ssid, "Connecting upstream");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Station start failed, access point only");
                    false
                }
            }
        };

        if !with_station {
            self.start_radio(&WifiSettings::access_point_only(&config.downstream))
                .await?;
        }
        self.enable_nat(ap_info.ip).await;

        Ok(events)
    }

    /// Whether bring-up left a station running that retries the upstream.
    pub fn upstream_active(&self) -> bool {
        self.inner.lock().upstream_configured
    }

    async fn prepare_upstream(&self, config: &RouterConfig) -> RouterResult<()> {
        self.stack.create_interface(InterfaceRole::Upstream).await?;

        if let Some(static_info) = config.upstream.static_ip {
            self.stack.dhcp_client_stop().await?;
            self.stack
                .set_ip_info(InterfaceRole::Upstream, static_info)
                .await?;
            self.inner.lock().upstream.ip_info = Some(static_info);
            info!(sta = %static_info, "Static upstream address applied");
            self.portmap.reapply(static_info.ip).await;
        }
        Ok(())
    }

    /// Configures and starts the radio.
    ///
    /// The uplink is marked connecting before the start so that a link-up
    /// raised by the start itself triggers a connect.
    async fn start_radio(&self, wifi: &WifiSettings) -> RouterResult<()> {
        self.stack.configure_wifi(wifi).await?;

        let with_station = wifi.station.is_some();
        if with_station {
            let mut inner = self.inner.lock();
            inner.upstream_configured = true;
            inner.uplink = UplinkState::Connecting;
        }
        let result = self.stack.start().await;
        if result.is_err() && with_station {
            let mut inner = self.inner.lock();
            inner.upstream_configured = false;
            inner.uplink = UplinkState::Down;
        }
        result
    }

    /// Waits for the readiness flag; `false` when `timeout` expires first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.readiness.wait(timeout).await
    }

    /// Consumes stack events until the channel closes.
    pub async fn run_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<NetEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        debug!("Network event channel closed");
    }

    /// Applies one event to the state machine.
    #[instrument(skip(self, event), fields(event = %event))]
    pub async fn handle_event(&self, event: NetEvent) {
        let (previous, next, configured) = {
            let mut inner = self.inner.lock();
            let previous = inner.uplink;
            inner.uplink = previous.on_event(&event);
            (previous, inner.uplink, inner.upstream_configured)
        };
        if previous != next {
            info!(from = %previous, to = %next, "Uplink state changed");
        }

        match event {
            NetEvent::LinkUp => {
                if configured {
                    self.connect().await;
                }
            }
            NetEvent::LinkLost { reason } => {
                if !configured {
                    return;
                }
                info!(reason = ?reason, "Upstream disconnected, retrying");
                self.inner.lock().upstream.connected = false;
                self.readiness.clear();
                self.connect().await;
            }
            NetEvent::IpAcquired(info) => {
                if next != UplinkState::Connected {
                    debug!("Ignoring address without a configured upstream");
                    return;
                }
                self.on_ip_acquired(info).await;
            }
            NetEvent::PeerAssociated { mac, aid } => {
                info!(mac = %mac, aid = ?aid, "Station joined access point");
            }
            NetEvent::PeerDisassociated { mac, aid } => {
                info!(mac = %mac, aid = ?aid, "Station left access point");
            }
        }
    }

    async fn on_ip_acquired(&self, info: IpInfo) {
        self.inner.lock().upstream.ip_info = Some(info);
        info!(
            ip = %info.ip,
            netmask = %info.netmask,
            gateway = %info.gateway,
            "Upstream acquired address"
        );

        self.portmap.reapply(info.ip).await;

        let learned = match self.stack.upstream_dns().await {
            Ok(dns) => dns,
            Err(e) => {
                warn!(error = %e, "Could not read upstream DNS server");
                None
            }
        };
        match self.dns.apply(self.stack.as_ref(), learned).await {
            Ok(Some(dns)) => {
                self.inner.lock().advertised_dns = Some(dns);
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to push DNS server downstream"),
        }

        self.inner.lock().upstream.connected = true;
        self.readiness.set();
    }

    async fn connect(&self) {
        if let Err(e) = self.stack.connect().await {
            warn!(error = %e, "Upstream connect attempt failed");
        }
    }

    async fn enable_nat(&self, internal_addr: Ipv4Addr) {
        let already_enabled = std::mem::replace(&mut self.inner.lock().nat_enabled, true);
        if already_enabled {
            return;
        }
        match self.nat.enable(internal_addr).await {
            Ok(()) => info!(internal = %internal_addr, "NAT enabled"),
            Err(e) => error!(internal = %internal_addr, error = %e, "Failed to enable NAT"),
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Orchestrator")
            .field("uplink", &inner.uplink)
            .field("upstream", &inner.upstream)
            .field("downstream", &inner.downstream)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_event() -> NetEvent {
        NetEvent::IpAcquired(IpInfo::new(
            Ipv4Addr::new(192, 168, 1, 50),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 1, 1),
        ))
    }

    fn peer_event() -> NetEvent {
        NetEvent::PeerAssociated {
            mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
            aid: Some(1),
        }
    }

    #[test]
    fn test_down_ignores_events() {
        for event in [NetEvent::LinkUp, NetEvent::LinkLost { reason: None }, ip_event()] {
            assert_eq!(UplinkState::Down.on_event(&event), UplinkState::Down);
        }
    }

    #[test]
    fn test_link_up_keeps_state() {
        assert_eq!(
            UplinkState::Connecting.on_event(&NetEvent::LinkUp),
            UplinkState::Connecting
        );
        assert_eq!(
            UplinkState::Disconnected.on_event(&NetEvent::LinkUp),
            UplinkState::Disconnected
        );
    }

    #[test]
    fn test_link_lost() {
        let lost = NetEvent::LinkLost { reason: Some(201) };
        assert_eq!(UplinkState::Connecting.on_event(&lost), UplinkState::Disconnected);
        assert_eq!(UplinkState::Connected.on_event(&lost), UplinkState::Disconnected);
        assert_eq!(UplinkState::Disconnected.on_event(&lost), UplinkState::Disconnected);
    }

    #[test]
    fn test_ip_acquired() {
        assert_eq!(UplinkState::Connecting.on_event(&ip_event()), UplinkState::Connected);
        assert_eq!(UplinkState::Disconnected.on_event(&ip_event()), UplinkState::Connected);
        assert_eq!(UplinkState::Connected.on_event(&ip_event()), UplinkState::Connected);
    }

    #[test]
    fn test_peer_events_are_inert() {
        for state in [
            UplinkState::Down,
            UplinkState::Connecting,
            UplinkState::Connected,
            UplinkState::Disconnected,
        ] {
            assert_eq!(state.on_event(&peer_event()), state);
        }
    }
}
