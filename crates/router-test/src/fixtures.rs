//! Test fixtures for router scenarios
//!
//! Provides recording fakes for the network stack and NAT engine, store
//! fixtures with common parameter sets and a harness that boots a router
//! against them.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use natrouterd::netif::{NetEvent, NetStack, WifiSettings};
use natrouterd::{BootOptions, BootOutcome, NatEngine, PortMapping, Router};
use parking_lot::Mutex;
use router_common::keys;
use router_common::{MemoryStore, RouterError, RouterResult, StoreValue};
use router_types::{InterfaceRole, IpInfo, MacAddress, Protocol};
use tokio::sync::mpsc::UnboundedSender;

/// Factory MAC reported by [`RecordingNetStack`].
pub const FACTORY_MAC: MacAddress = MacAddress::new([0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01]);

/// A call made on [`RecordingNetStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    FactoryMac,
    SetBaseMac(MacAddress),
    CreateInterface(InterfaceRole),
    SetIpInfo(InterfaceRole, IpInfo),
    DhcpClientStop,
    DhcpServerStart,
    DhcpServerStop,
    SetOfferedDns(Ipv4Addr),
    UpstreamDns,
    ConfigureWifi(WifiSettings),
    Start,
    Connect,
}

#[derive(Debug, Default)]
struct FakeStackState {
    calls: Vec<StackCall>,
    events: Option<UnboundedSender<NetEvent>>,
    base_mac: Option<MacAddress>,
    station: bool,
    learned_dns: Option<Ipv4Addr>,
    offered_dns: Option<Ipv4Addr>,
    dhcp_server_running: bool,
    /// DNS option in effect since the last DHCP server start.
    advertised_dns: Option<Ipv4Addr>,
    /// Address reported after every connect attempt.
    lease: Option<IpInfo>,
    fail_connect: bool,
    fail_upstream_address: bool,
    fail_station: bool,
}

/// Network stack fake that records calls and simulates association.
///
/// `start` reports link-up when a station is configured. When a lease is
/// set, every `connect` reports that address as acquired.
#[derive(Debug)]
pub struct RecordingNetStack {
    factory_mac: MacAddress,
    state: Mutex<FakeStackState>,
}

impl Default for RecordingNetStack {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNetStack {
    pub fn new() -> Self {
        Self {
            factory_mac: FACTORY_MAC,
            state: Mutex::new(FakeStackState::default()),
        }
    }

    /// Reports `lease` as acquired after each connect.
    pub fn with_lease(self, lease: IpInfo) -> Self {
        self.set_lease(Some(lease));
        self
    }

    /// Reports `dns` as the upstream-learned DNS server.
    pub fn with_learned_dns(self, dns: Ipv4Addr) -> Self {
        self.state.lock().learned_dns = Some(dns);
        self
    }

    pub fn set_lease(&self, lease: Option<IpInfo>) {
        self.state.lock().lease = lease;
    }

    pub fn set_learned_dns(&self, dns: Option<Ipv4Addr>) {
        self.state.lock().learned_dns = dns;
    }

    /// Makes connect attempts fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Makes assigning an upstream address fail.
    pub fn set_fail_upstream_address(&self, fail: bool) {
        self.state.lock().fail_upstream_address = fail;
    }

    /// Makes radio configuration with a station fail.
    pub fn set_fail_station(&self, fail: bool) {
        self.state.lock().fail_station = fail;
    }

    /// Delivers an event as if the stack had raised it.
    pub fn emit(&self, event: NetEvent) {
        let state = self.state.lock();
        if let Some(tx) = state.events.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn calls(&self) -> Vec<StackCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &StackCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn connect_count(&self) -> usize {
        self.count(&StackCall::Connect)
    }

    /// Position of the first matching call.
    pub fn position(&self, call: &StackCall) -> Option<usize> {
        self.state.lock().calls.iter().position(|c| c == call)
    }

    pub fn base_mac(&self) -> Option<MacAddress> {
        self.state.lock().base_mac
    }

    pub fn dhcp_server_running(&self) -> bool {
        self.state.lock().dhcp_server_running
    }

    pub fn advertised_dns(&self) -> Option<Ipv4Addr> {
        self.state.lock().advertised_dns
    }

    pub fn wifi(&self) -> Option<WifiSettings> {
        self.state.lock().calls.iter().rev().find_map(|c| match c {
            StackCall::ConfigureWifi(w) => Some(w.clone()),
            _ => None,
        })
    }

    fn record(&self, call: StackCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl NetStack for RecordingNetStack {
    async fn factory_mac(&self) -> RouterResult<MacAddress> {
        self.record(StackCall::FactoryMac);
        Ok(self.factory_mac)
    }

    async fn set_base_mac(&self, mac: MacAddress) -> RouterResult<()> {
        self.record(StackCall::SetBaseMac(mac));
        self.state.lock().base_mac = Some(mac);
        Ok(())
    }

    async fn create_interface(&self, role: InterfaceRole) -> RouterResult<()> {
        self.record(StackCall::CreateInterface(role));
        Ok(())
    }

    async fn set_ip_info(&self, role: InterfaceRole, info: IpInfo) -> RouterResult<()> {
        self.record(StackCall::SetIpInfo(role, info));
        if role == InterfaceRole::Upstream && self.state.lock().fail_upstream_address {
            return Err(RouterError::interface("sta", "set_ip_info", "address rejected"));
        }
        Ok(())
    }

    async fn dhcp_client_stop(&self) -> RouterResult<()> {
        self.record(StackCall::DhcpClientStop);
        Ok(())
    }

    async fn dhcp_server_start(&self) -> RouterResult<()> {
        self.record(StackCall::DhcpServerStart);
        let mut state = self.state.lock();
        state.dhcp_server_running = true;
        state.advertised_dns = state.offered_dns;
        Ok(())
    }

    async fn dhcp_server_stop(&self) -> RouterResult<()> {
        self.record(StackCall::DhcpServerStop);
        self.state.lock().dhcp_server_running = false;
        Ok(())
    }

    async fn set_offered_dns(&self, dns: Ipv4Addr) -> RouterResult<()> {
        self.record(StackCall::SetOfferedDns(dns));
        let mut state = self.state.lock();
        if state.dhcp_server_running {
            return Err(RouterError::interface(
                "ap",
                "set_offered_dns",
                "DHCP server is running",
            ));
        }
        state.offered_dns = Some(dns);
        Ok(())
    }

    async fn upstream_dns(&self) -> RouterResult<Option<Ipv4Addr>> {
        self.record(StackCall::UpstreamDns);
        Ok(self.state.lock().learned_dns)
    }

    async fn configure_wifi(&self, settings: &WifiSettings) -> RouterResult<()> {
        self.record(StackCall::ConfigureWifi(settings.clone()));
        let mut state = self.state.lock();
        if settings.station.is_some() && state.fail_station {
            return Err(RouterError::interface("sta", "configure_wifi", "invalid credentials"));
        }
        state.station = settings.station.is_some();
        Ok(())
    }

    async fn start(&self) -> RouterResult<()> {
        self.record(StackCall::Start);
        let station = self.state.lock().station;
        if station {
            self.emit(NetEvent::LinkUp);
        }
        Ok(())
    }

    async fn connect(&self) -> RouterResult<()> {
        self.record(StackCall::Connect);
        let (fail, lease) = {
            let state = self.state.lock();
            (state.fail_connect, state.lease)
        };
        if fail {
            return Err(RouterError::interface("sta", "connect", "association refused"));
        }
        if let Some(lease) = lease {
            self.emit(NetEvent::IpAcquired(lease));
        }
        Ok(())
    }

    fn subscribe(&self, events: UnboundedSender<NetEvent>) {
        self.state.lock().events = Some(events);
    }
}

/// A call made on [`RecordingNatEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Enable(Ipv4Addr),
    Add(Ipv4Addr, PortMapping),
    Remove(Protocol, u16),
}

#[derive(Debug, Default)]
struct FakeEngineState {
    calls: Vec<EngineCall>,
    rules: BTreeMap<(Protocol, u16), (Ipv4Addr, PortMapping)>,
    reject_adds: bool,
}

/// NAT engine fake holding the installed rules in memory.
#[derive(Debug, Default)]
pub struct RecordingNatEngine {
    state: Mutex<FakeEngineState>,
}

impl RecordingNatEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every install fail with `EngineRejected`.
    pub fn set_reject_adds(&self, reject: bool) {
        self.state.lock().reject_adds = reject;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Addresses passed to `enable`.
    pub fn enable_calls(&self) -> Vec<Ipv4Addr> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Enable(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    /// Installed rules as `(public address, mapping)`, ordered by key.
    pub fn rules(&self) -> Vec<(Ipv4Addr, PortMapping)> {
        self.state.lock().rules.values().copied().collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl NatEngine for RecordingNatEngine {
    async fn enable(&self, internal_addr: Ipv4Addr) -> RouterResult<()> {
        self.state.lock().calls.push(EngineCall::Enable(internal_addr));
        Ok(())
    }

    async fn add_portmap(&self, public_addr: Ipv4Addr, mapping: &PortMapping) -> RouterResult<()> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Add(public_addr, *mapping));
        if state.reject_adds {
            return Err(RouterError::engine_rejected("add_portmap", "rejected by test"));
        }
        state.rules.insert(mapping.key(), (public_addr, *mapping));
        Ok(())
    }

    async fn remove_portmap(&self, protocol: Protocol, external_port: u16) -> RouterResult<()> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Remove(protocol, external_port));
        state.rules.remove(&(protocol, external_port));
        Ok(())
    }
}

/// Common router parameter sets
pub mod params {
    use super::*;

    /// Store holding `entries` as string parameters.
    pub fn store(entries: &[(&str, &str)]) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_strings(
            keys::PARAM_NAMESPACE,
            entries.iter().copied(),
        ))
    }

    /// Upstream configured for DHCP.
    pub fn dhcp_upstream() -> Vec<(&'static str, &'static str)> {
        vec![
            (keys::SSID, "uplink"),
            (keys::PASSWD, "uplinkpass"),
            (keys::AP_PASSWD, "appassword"),
        ]
    }

    /// Upstream configured with a static address of 192.168.1.50/24.
    pub fn static_upstream() -> Vec<(&'static str, &'static str)> {
        let mut entries = dhcp_upstream();
        entries.extend([
            (keys::STATIC_IP, "192.168.1.50"),
            (keys::SUBNET_MASK, "255.255.255.0"),
            (keys::GATEWAY_ADDR, "192.168.1.1"),
        ]);
        entries
    }

    /// Stores a raw port-mapping blob.
    pub fn with_portmap_blob(store: &MemoryStore, blob: Vec<u8>) {
        store.insert(keys::PARAM_NAMESPACE, keys::PORTMAP_TABLE, StoreValue::Blob(blob));
    }
}

/// Upstream lease `ip`/24 with gateway `.1` in the same subnet.
pub fn lease(ip: Ipv4Addr) -> IpInfo {
    let [a, b, c, _] = ip.octets();
    IpInfo::new(ip, Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(a, b, c, 1))
}

/// Collaborators for booting a router in tests.
pub struct TestRouter {
    pub store: Arc<MemoryStore>,
    pub stack: Arc<RecordingNetStack>,
    pub nat: Arc<RecordingNatEngine>,
}

impl TestRouter {
    pub fn new(store: Arc<MemoryStore>, stack: RecordingNetStack) -> Self {
        Self {
            store,
            stack: Arc::new(stack),
            nat: Arc::new(RecordingNatEngine::new()),
        }
    }

    /// Boots with the default two-second join wait.
    pub async fn boot(&self) -> RouterResult<(Router, BootOutcome)> {
        self.boot_with(BootOptions::default()).await
    }

    pub async fn boot_with(&self, options: BootOptions) -> RouterResult<(Router, BootOutcome)> {
        Router::boot(
            self.store.clone(),
            self.stack.clone(),
            self.nat.clone(),
            options,
        )
        .await
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Like [`eventually`] for async checks.
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
