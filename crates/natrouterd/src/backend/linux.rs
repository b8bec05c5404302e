//! Network stack backed by standard Linux tooling.
//!
//! - addressing: `ip`
//! - access point: `hostapd`
//! - station: `wpa_supplicant` / `wpa_cli`
//! - upstream DHCP client: `dhclient`
//! - downstream DHCP server: `dnsmasq` (DNS service disabled)
//!
//! Generated configuration and pid files live in the runtime directory.
//! A poller task watches `wpa_cli status` and the upstream address and
//! turns changes into [`NetEvent`]s. Station join/leave is not observed.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use router_common::shell::{
    self, shellquote, DHCLIENT_CMD, DNSMASQ_CMD, HOSTAPD_CMD, IP_CMD, PKILL_CMD,
    WPA_CLI_CMD, WPA_SUPPLICANT_CMD,
};
use router_common::{RouterError, RouterResult};
use router_types::{InterfaceRole, IpInfo, MacAddress};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config_file::DaemonConfig;
use crate::netif::{AccessPointSettings, ApAuth, NetEvent, NetStack, StationSettings, WifiSettings};

static INET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\binet (\d{1,3}(?:\.\d{1,3}){3})/(\d{1,2})\b").expect("Invalid regex pattern")
});

static DEFAULT_VIA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^default via (\d{1,3}(?:\.\d{1,3}){3})\b").expect("Invalid regex pattern")
});

/// Lease time handed out by the downstream DHCP server.
const DHCP_LEASE_TIME: &str = "12h";

/// Size of the downstream DHCP pool.
const DHCP_POOL_SIZE: u32 = 100;

/// How often, and how many times, a stopping `dnsmasq` is checked for exit.
const DHCP_SERVER_STOP_POLL: Duration = Duration::from_millis(50);
const DHCP_SERVER_STOP_ATTEMPTS: u32 = 40;

/// WPA passphrase length bounds; 64 hex digits is a raw PSK.
const WPA_PASSPHRASE_MIN: usize = 8;
const WPA_PASSPHRASE_MAX: usize = 63;
const WPA_RAW_PSK_LEN: usize = 64;

/// Interface names and paths used by [`LinuxNetStack`].
#[derive(Debug, Clone)]
pub struct LinuxStackSettings {
    pub upstream_if: String,
    pub downstream_if: String,
    pub run_dir: PathBuf,
    pub resolv_conf: PathBuf,
    pub poll_interval: Duration,
}

impl LinuxStackSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            upstream_if: config.interfaces.upstream.clone(),
            downstream_if: config.interfaces.downstream.clone(),
            run_dir: config.runtime.run_dir.clone(),
            resolv_conf: config.runtime.resolv_conf.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    fn ifname(&self, role: InterfaceRole) -> &str {
        match role {
            InterfaceRole::Upstream => &self.upstream_if,
            InterfaceRole::Downstream => &self.downstream_if,
        }
    }

    fn run_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(name)
    }
}

#[derive(Debug, Default)]
struct StackState {
    base_mac: Option<MacAddress>,
    downstream_ip: Option<IpInfo>,
    static_upstream: bool,
    offered_dns: Option<Ipv4Addr>,
    ap_running: bool,
    station: bool,
    events: Option<UnboundedSender<NetEvent>>,
    poller: Option<JoinHandle<()>>,
}

struct Shared {
    settings: LinuxStackSettings,
    state: Mutex<StackState>,

    /// Mock mode for testing (don't execute shell commands).
    #[cfg(test)]
    mock_mode: bool,

    /// Captured shell commands in mock mode.
    #[cfg(test)]
    captured_commands: Mutex<Vec<String>>,

    /// Liveness checks that report the process still running in mock mode.
    #[cfg(test)]
    mock_alive_checks: Mutex<u32>,
}

impl Shared {
    async fn run(&self, cmd: &str) -> RouterResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd.to_string());
            return Ok(String::new());
        }

        shell::exec_or_throw(cmd).await
    }

    /// `kill -0` on `pid`; spawn failures count as exited.
    async fn is_alive(&self, pid: u32) -> bool {
        let cmd = format!("kill -0 {} 2>/dev/null", pid);

        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd);
            let mut remaining = self.mock_alive_checks.lock();
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
            return true;
        }

        shell::exec(&cmd).await.map(|out| out.success()).unwrap_or(false)
    }

    fn emit(&self, event: NetEvent) {
        let state = self.state.lock();
        match state.events.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Network event receiver dropped");
                }
            }
            None => debug!(event = %event, "No network event subscriber"),
        }
    }
}

/// [`NetStack`] driving `ip`, `hostapd`, `wpa_supplicant`, `dhclient`
/// and `dnsmasq`.
pub struct LinuxNetStack {
    shared: Arc<Shared>,
}

impl LinuxNetStack {
    pub fn new(settings: LinuxStackSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(StackState::default()),
                #[cfg(test)]
                mock_mode: false,
                #[cfg(test)]
                captured_commands: Mutex::new(Vec::new()),
                #[cfg(test)]
                mock_alive_checks: Mutex::new(0),
            }),
        }
    }

    fn settings(&self) -> &LinuxStackSettings {
        &self.shared.settings
    }

    async fn write_run_file(
        &self,
        role: InterfaceRole,
        name: &str,
        contents: &[u8],
    ) -> RouterResult<PathBuf> {
        let path = self.settings().run_file(name);
        let io_err = |e: std::io::Error| {
            RouterError::interface(role.as_str(), "write_config", format!("{}: {}", name, e))
        };
        tokio::fs::create_dir_all(&self.settings().run_dir)
            .await
            .map_err(io_err)?;
        tokio::fs::write(&path, contents).await.map_err(io_err)?;
        debug!(path = %path.display(), "Wrote runtime file");
        Ok(path)
    }
}

impl Drop for LinuxNetStack {
    fn drop(&mut self) {
        if let Some(poller) = self.shared.state.lock().poller.take() {
            poller.abort();
        }
    }
}

#[async_trait]
impl NetStack for LinuxNetStack {
    async fn factory_mac(&self) -> RouterResult<MacAddress> {
        let ifname = &self.settings().upstream_if;
        let path = format!("/sys/class/net/{}/address", ifname);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RouterError::interface(ifname.as_str(), "factory_mac", e.to_string()))?;
        contents
            .trim()
            .parse()
            .map_err(|e: router_types::ParseError| {
                RouterError::interface(ifname.as_str(), "factory_mac", e.to_string())
            })
    }

    async fn set_base_mac(&self, mac: MacAddress) -> RouterResult<()> {
        self.shared.state.lock().base_mac = Some(mac);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_interface(&self, role: InterfaceRole) -> RouterResult<()> {
        let ifname = shellquote(self.settings().ifname(role));
        let base_mac = self.shared.state.lock().base_mac;

        let mut cmd = format!("{} link set dev {} down", IP_CMD, ifname);
        if let Some(base) = base_mac {
            let mac = interface_mac(base, role);
            cmd.push_str(&format!(" && {} link set dev {} address {}", IP_CMD, ifname, mac));
        }
        cmd.push_str(&format!(" && {} link set dev {} up", IP_CMD, ifname));

        self.shared
            .run(&cmd)
            .await
            .map_err(|e| RouterError::interface(role.as_str(), "create", e.to_string()))?;
        info!(interface = %self.settings().ifname(role), "Interface up");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_ip_info(&self, role: InterfaceRole, info: IpInfo) -> RouterResult<()> {
        let cidr = info.cidr().ok_or_else(|| {
            RouterError::interface(role.as_str(), "set_ip_info", format!("invalid netmask {}", info.netmask))
        })?;
        let ifname = shellquote(self.settings().ifname(role));

        let mut cmd = format!(
            "{ip} addr flush dev {ifname} && {ip} addr add {cidr} dev {ifname}",
            ip = IP_CMD,
            ifname = ifname,
            cidr = cidr
        );
        if role == InterfaceRole::Upstream {
            cmd.push_str(&format!(
                " && {} route replace default via {} dev {}",
                IP_CMD, info.gateway, ifname
            ));
        }

        self.shared
            .run(&cmd)
            .await
            .map_err(|e| RouterError::interface(role.as_str(), "set_ip_info", e.to_string()))?;

        if role == InterfaceRole::Downstream {
            self.shared.state.lock().downstream_ip = Some(info);
        }
        Ok(())
    }

    async fn dhcp_client_stop(&self) -> RouterResult<()> {
        self.shared.state.lock().static_upstream = true;
        let pid = self.settings().run_file("dhclient.pid");
        let cmd = format!(
            "{} -r -pf {} {} 2>/dev/null || true",
            DHCLIENT_CMD,
            quote_path(&pid),
            shellquote(&self.settings().upstream_if)
        );
        self.shared.run(&cmd).await?;
        Ok(())
    }

    async fn dhcp_server_start(&self) -> RouterResult<()> {
        let (info, dns) = {
            let state = self.shared.state.lock();
            (state.downstream_ip, state.offered_dns)
        };
        let info = info.ok_or_else(|| {
            RouterError::interface("ap", "dhcp_server_start", "no downstream address configured")
        })?;

        let conf = dnsmasq_conf(&self.settings().downstream_if, &info, dns).ok_or_else(|| {
            RouterError::interface("ap", "dhcp_server_start", format!("no address pool in {}", info))
        })?;
        let conf_path = self
            .write_run_file(InterfaceRole::Downstream, "dnsmasq.conf", conf.as_bytes())
            .await?;
        let pid = self.settings().run_file("dnsmasq.pid");

        self.shared
            .run(&format!(
                "{} --conf-file={} --pid-file={}",
                DNSMASQ_CMD,
                quote_path(&conf_path),
                quote_path(&pid)
            ))
            .await
            .map_err(|e| RouterError::interface("ap", "dhcp_server_start", e.to_string()))?;
        info!(dns = ?dns, "DHCP server started");
        Ok(())
    }

    async fn dhcp_server_stop(&self) -> RouterResult<()> {
        let pid_file = self.settings().run_file("dnsmasq.pid");
        let pid = match tokio::fs::read_to_string(&pid_file).await {
            Ok(contents) => contents.trim().parse::<u32>().ok(),
            Err(_) => None,
        };
        let Some(pid) = pid else {
            debug!("No DHCP server pid file");
            return Ok(());
        };

        self.shared
            .run(&format!("{} -F {} 2>/dev/null || true", PKILL_CMD, quote_path(&pid_file)))
            .await?;

        // dnsmasq must release the DHCP port before a new instance binds it.
        for _ in 0..DHCP_SERVER_STOP_ATTEMPTS {
            if !self.shared.is_alive(pid).await {
                debug!(pid, "DHCP server stopped");
                return Ok(());
            }
            tokio::time::sleep(DHCP_SERVER_STOP_POLL).await;
        }
        Err(RouterError::interface(
            "ap",
            "dhcp_server_stop",
            format!("dnsmasq pid {} did not exit", pid),
        ))
    }

    async fn set_offered_dns(&self, dns: Ipv4Addr) -> RouterResult<()> {
        self.shared.state.lock().offered_dns = Some(dns);
        Ok(())
    }

    async fn upstream_dns(&self) -> RouterResult<Option<Ipv4Addr>> {
        match tokio::fs::read_to_string(&self.settings().resolv_conf).await {
            Ok(contents) => Ok(parse_nameserver(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RouterError::interface("sta", "upstream_dns", e.to_string())),
        }
    }

    #[instrument(skip_all, fields(mode = ?settings.mode))]
    async fn configure_wifi(&self, settings: &WifiSettings) -> RouterResult<()> {
        let hostapd = hostapd_conf(&self.settings().downstream_if, &settings.access_point)?;
        self.write_run_file(InterfaceRole::Downstream, "hostapd.conf", hostapd.as_bytes())
            .await?;

        let Some(station) = settings.station.as_ref() else {
            self.shared.state.lock().station = false;
            return Ok(());
        };

        let ca_path = match station.enterprise.as_ref().and_then(|e| e.ca_cert.as_ref()) {
            Some(cert) => Some(
                self.write_run_file(InterfaceRole::Upstream, "ca.pem", cert)
                    .await?,
            ),
            None => None,
        };
        let conf = wpa_supplicant_conf(station, ca_path.as_deref())?;
        self.write_run_file(InterfaceRole::Upstream, "wpa_supplicant.conf", conf.as_bytes())
            .await?;
        self.shared.state.lock().station = true;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&self) -> RouterResult<()> {
        let s = self.settings();
        if !self.shared.state.lock().ap_running {
            self.shared
                .run(&format!(
                    "{} -B -P {} {}",
                    HOSTAPD_CMD,
                    quote_path(&s.run_file("hostapd.pid")),
                    quote_path(&s.run_file("hostapd.conf"))
                ))
                .await
                .map_err(|e| RouterError::interface("ap", "start", e.to_string()))?;
            self.shared.state.lock().ap_running = true;
        }

        let (station, static_upstream) = {
            let state = self.shared.state.lock();
            (state.station, state.static_upstream)
        };
        if !station {
            return Ok(());
        }

        self.shared
            .run(&format!(
                "{} -B -i {} -c {} -P {}",
                WPA_SUPPLICANT_CMD,
                shellquote(&s.upstream_if),
                quote_path(&s.run_file("wpa_supplicant.conf")),
                quote_path(&s.run_file("wpa_supplicant.pid"))
            ))
            .await
            .map_err(|e| RouterError::interface("sta", "start", e.to_string()))?;

        if !static_upstream {
            self.shared
                .run(&format!(
                    "{} -nw -pf {} {}",
                    DHCLIENT_CMD,
                    quote_path(&s.run_file("dhclient.pid")),
                    shellquote(&s.upstream_if)
                ))
                .await
                .map_err(|e| RouterError::interface("sta", "dhcp_client_start", e.to_string()))?;
        }

        #[cfg(test)]
        let spawn_poller = !self.shared.mock_mode;
        #[cfg(not(test))]
        let spawn_poller = true;
        if spawn_poller {
            let poller = tokio::spawn(poll_upstream(Arc::clone(&self.shared)));
            if let Some(old) = self.shared.state.lock().poller.replace(poller) {
                old.abort();
            }
        }

        self.shared.emit(NetEvent::LinkUp);
        Ok(())
    }

    async fn connect(&self) -> RouterResult<()> {
        let cmd = format!(
            "{} -i {} reconnect",
            WPA_CLI_CMD,
            shellquote(&self.settings().upstream_if)
        );
        self.shared
            .run(&cmd)
            .await
            .map_err(|e| RouterError::interface("sta", "connect", e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, events: UnboundedSender<NetEvent>) {
        self.shared.state.lock().events = Some(events);
    }
}

impl std::fmt::Debug for LinuxNetStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxNetStack")
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

/// What the poller last saw on the upstream interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkObservation {
    pub associated: bool,
    pub ip_info: Option<IpInfo>,
}

impl UplinkObservation {
    /// Records a new sample and returns the events it implies.
    pub fn update(&mut self, associated: bool, ip_info: Option<IpInfo>) -> Vec<NetEvent> {
        let mut events = Vec::new();

        if self.associated && !associated {
            events.push(NetEvent::LinkLost { reason: None });
            self.ip_info = None;
        }
        if associated {
            if let Some(info) = ip_info {
                if self.ip_info != Some(info) {
                    events.push(NetEvent::IpAcquired(info));
                }
            }
        }

        self.associated = associated;
        self.ip_info = if associated { ip_info } else { None };
        events
    }
}

async fn poll_upstream(shared: Arc<Shared>) {
    let ifname = shellquote(&shared.settings.upstream_if);
    let mut interval = tokio::time::interval(shared.settings.poll_interval);
    let mut observed = UplinkObservation::default();

    loop {
        interval.tick().await;

        let associated = match shell::exec(&format!("{} -i {} status", WPA_CLI_CMD, ifname)).await {
            Ok(r) if r.success() => parse_wpa_state(&r.stdout) == Some("COMPLETED"),
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "wpa_cli status failed");
                false
            }
        };

        let ip_info = if associated {
            query_upstream_address(&ifname).await
        } else {
            None
        };

        for event in observed.update(associated, ip_info) {
            shared.emit(event);
        }
    }
}

async fn query_upstream_address(ifname: &str) -> Option<IpInfo> {
    let addr = shell::exec(&format!("{} -4 -o addr show dev {}", IP_CMD, ifname))
        .await
        .ok()?;
    let (ip, prefix) = parse_inet(&addr.stdout)?;

    let gateway = match shell::exec(&format!("{} -4 route show default dev {}", IP_CMD, ifname)).await {
        Ok(r) => parse_default_gateway(&r.stdout),
        Err(_) => None,
    };
    Some(IpInfo::new(
        ip,
        prefix_to_netmask(prefix),
        gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
    ))
}

/// Derives the MAC of an interface from the base MAC: the station uses the
/// base address, the access point the base address plus one.
pub fn interface_mac(base: MacAddress, role: InterfaceRole) -> MacAddress {
    match role {
        InterfaceRole::Upstream => base,
        InterfaceRole::Downstream => base.with_last_octet(base.as_bytes()[5].wrapping_add(1)),
    }
}

/// Returns the `wpa_state` value from `wpa_cli status` output.
pub fn parse_wpa_state(status: &str) -> Option<&str> {
    status
        .lines()
        .find_map(|line| line.trim().strip_prefix("wpa_state="))
}

/// Returns the first IPv4 address and prefix length from
/// `ip -4 -o addr show` output.
pub fn parse_inet(output: &str) -> Option<(Ipv4Addr, u8)> {
    let caps = INET_RE.captures(output)?;
    let ip = caps.get(1)?.as_str().parse().ok()?;
    let prefix: u8 = caps.get(2)?.as_str().parse().ok()?;
    (prefix <= 32).then_some((ip, prefix))
}

/// Returns the gateway from `ip route show default` output.
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .find_map(|line| DEFAULT_VIA_RE.captures(line.trim()))
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}

/// Returns the first IPv4 `nameserver` in resolver file contents.
pub fn parse_nameserver(resolv_conf: &str) -> Option<Ipv4Addr> {
    resolv_conf.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("nameserver"), Some(addr)) => addr.parse().ok(),
            _ => None,
        }
    })
}

pub fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0))
}

/// Returns the downstream DHCP pool: up to [`DHCP_POOL_SIZE`] addresses
/// following the access point address, within its subnet.
pub fn dhcp_range(info: &IpInfo) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let ip = u32::from(info.ip);
    let mask = u32::from(info.netmask);
    let broadcast = (ip & mask) | !mask;

    let start = ip.checked_add(1)?;
    let last = broadcast.checked_sub(1)?;
    if start > last {
        return None;
    }
    let end = last.min(start.saturating_add(DHCP_POOL_SIZE - 1));
    Some((Ipv4Addr::from(start), Ipv4Addr::from(end)))
}

/// Renders the dnsmasq configuration for the downstream DHCP server.
pub fn dnsmasq_conf(ifname: &str, info: &IpInfo, dns: Option<Ipv4Addr>) -> Option<String> {
    let (start, end) = dhcp_range(info)?;
    let mut conf = format!(
        "interface={}\nbind-interfaces\nport=0\ndhcp-range={},{},{},{}\ndhcp-option=3,{}\n",
        conf_value(ifname),
        start,
        end,
        info.netmask,
        DHCP_LEASE_TIME,
        info.ip
    );
    if let Some(dns) = dns {
        conf.push_str(&format!("dhcp-option=6,{}\n", dns));
    }
    Some(conf)
}

/// Renders the hostapd configuration for the access point.
pub fn hostapd_conf(ifname: &str, ap: &AccessPointSettings) -> RouterResult<String> {
    let mut conf = format!(
        "interface={}\ndriver=nl80211\nssid={}\nhw_mode=g\nchannel=1\nmax_num_sta={}\nbeacon_int={}\n",
        conf_value(ifname),
        conf_value(&ap.ssid),
        ap.max_connections,
        ap.beacon_interval
    );
    if ap.auth == ApAuth::Wpa2Psk {
        conf.push_str("wpa=2\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n");
        match classify_psk(&ap.password) {
            Some(PskForm::Passphrase) => {
                conf.push_str(&format!("wpa_passphrase={}\n", ap.password))
            }
            Some(PskForm::Raw) => conf.push_str(&format!("wpa_psk={}\n", ap.password)),
            None => {
                return Err(RouterError::interface(
                    "ap",
                    "configure_wifi",
                    "access point password must be 8 to 63 printable characters or 64 hex digits",
                ))
            }
        }
    }
    Ok(conf)
}

/// Renders the wpa_supplicant configuration for the station.
///
/// Enterprise strings are written hex-encoded so no value can break out of
/// its line. A personal passphrase containing `"` is rejected.
pub fn wpa_supplicant_conf(station: &StationSettings, ca_cert: Option<&Path>) -> RouterResult<String> {
    let mut conf = String::from("ctrl_interface=/run/wpa_supplicant\nnetwork={\n");
    conf.push_str(&format!("    ssid={}\n", hex(station.ssid.as_bytes())));

    match station.enterprise.as_ref() {
        Some(ent) => {
            conf.push_str("    key_mgmt=WPA-EAP\n    eap=PEAP TTLS\n    phase2=\"auth=MSCHAPV2\"\n");
            if let Some(identity) = &ent.identity {
                conf.push_str(&format!("    anonymous_identity={}\n", hex(identity.as_bytes())));
            }
            if let Some(user) = ent.username.as_ref().or(ent.identity.as_ref()) {
                conf.push_str(&format!("    identity={}\n", hex(user.as_bytes())));
            }
            if let Some(password) = &ent.password {
                conf.push_str(&format!("    password={}\n", hex(password.as_bytes())));
            }
            if let Some(ca) = ca_cert {
                conf.push_str(&format!("    ca_cert=\"{}\"\n", ca.display()));
            }
        }
        None if station.password.is_empty() => conf.push_str("    key_mgmt=NONE\n"),
        None => match classify_psk(&station.password) {
            Some(PskForm::Passphrase) if !station.password.contains('"') => {
                conf.push_str(&format!("    psk=\"{}\"\n", station.password))
            }
            Some(PskForm::Raw) => conf.push_str(&format!("    psk={}\n", station.password)),
            _ => {
                return Err(RouterError::interface(
                    "sta",
                    "configure_wifi",
                    "upstream password must be 8 to 63 printable characters without '\"' or 64 hex digits",
                ))
            }
        },
    }

    conf.push_str("}\n");
    Ok(conf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PskForm {
    Passphrase,
    Raw,
}

fn classify_psk(password: &str) -> Option<PskForm> {
    let printable = password.bytes().all(|b| (0x20..0x7f).contains(&b));
    if password.len() == WPA_RAW_PSK_LEN && password.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(PskForm::Raw)
    } else if printable && (WPA_PASSPHRASE_MIN..=WPA_PASSPHRASE_MAX).contains(&password.len()) {
        Some(PskForm::Passphrase)
    } else {
        None
    }
}

fn conf_value(s: &str) -> String {
    s.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn quote_path(path: &Path) -> String {
    shellquote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use router_common::EnterpriseAuth;

    fn mock_stack(run_dir: &Path) -> LinuxNetStack {
        let settings = LinuxStackSettings {
            upstream_if: "wlan0".to_string(),
            downstream_if: "wlan1".to_string(),
            run_dir: run_dir.to_path_buf(),
            resolv_conf: run_dir.join("resolv.conf"),
            poll_interval: Duration::from_millis(100),
        };
        let mut stack = LinuxNetStack::new(settings);
        Arc::get_mut(&mut stack.shared).unwrap().mock_mode = true;
        stack
    }

    fn ap_info() -> IpInfo {
        IpInfo::new(
            Ipv4Addr::new(192, 168, 4, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 4, 1),
        )
    }

    #[test]
    fn test_parse_wpa_state() {
        let status = "bssid=aa:bb:cc:dd:ee:ff\nssid=home\nwpa_state=COMPLETED\nip_address=192.168.1.50\n";
        assert_eq!(parse_wpa_state(status), Some("COMPLETED"));
        assert_eq!(parse_wpa_state("wpa_state=SCANNING"), Some("SCANNING"));
        assert_eq!(parse_wpa_state("Failed to connect"), None);
    }

    #[test]
    fn test_parse_inet() {
        let out = "3: wlan0    inet 192.168.1.50/24 brd 192.168.1.255 scope global dynamic wlan0\\       valid_lft 86000sec preferred_lft 86000sec";
        assert_eq!(parse_inet(out), Some((Ipv4Addr::new(192, 168, 1, 50), 24)));
        assert_eq!(parse_inet(""), None);
    }

    #[test]
    fn test_parse_default_gateway() {
        let out = "default via 192.168.1.1 proto dhcp src 192.168.1.50 metric 600\n";
        assert_eq!(parse_default_gateway(out), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(parse_default_gateway("192.168.1.0/24 proto kernel"), None);
    }

    #[test]
    fn test_parse_nameserver() {
        let resolv = "# generated by dhclient\nsearch lan\nnameserver fe80::1\nnameserver 8.8.8.8\nnameserver 8.8.4.4\n";
        assert_eq!(parse_nameserver(resolv), Some(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(parse_nameserver("search lan\n"), None);
    }

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(8), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn test_dhcp_range() {
        assert_eq!(
            dhcp_range(&ap_info()),
            Some((Ipv4Addr::new(192, 168, 4, 2), Ipv4Addr::new(192, 168, 4, 101)))
        );

        let tail = IpInfo::new(
            Ipv4Addr::new(192, 168, 4, 250),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 4, 250),
        );
        assert_eq!(
            dhcp_range(&tail),
            Some((Ipv4Addr::new(192, 168, 4, 251), Ipv4Addr::new(192, 168, 4, 254)))
        );

        let last = IpInfo::new(
            Ipv4Addr::new(192, 168, 4, 254),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 4, 254),
        );
        assert_eq!(dhcp_range(&last), None);
    }

    #[test]
    fn test_interface_mac() {
        let base = MacAddress::new([0x24, 0x0a, 0xc4, 0, 0, 0xff]);
        assert_eq!(interface_mac(base, InterfaceRole::Upstream), base);
        assert_eq!(
            interface_mac(base, InterfaceRole::Downstream),
            MacAddress::new([0x24, 0x0a, 0xc4, 0, 0, 0x00])
        );
    }

    #[test]
    fn test_observation_events() {
        let info = ap_info();
        let mut obs = UplinkObservation::default();

        assert!(obs.update(false, None).is_empty());
        assert!(obs.update(true, None).is_empty());
        assert_eq!(obs.update(true, Some(info)), vec![NetEvent::IpAcquired(info)]);
        assert!(obs.update(true, Some(info)).is_empty());
        assert_eq!(obs.update(false, None), vec![NetEvent::LinkLost { reason: None }]);
        assert_eq!(obs.update(true, Some(info)), vec![NetEvent::IpAcquired(info)]);
    }

    #[test]
    fn test_dnsmasq_conf_offers_dns() {
        let conf = dnsmasq_conf("wlan1", &ap_info(), Some(Ipv4Addr::new(1, 1, 1, 1))).unwrap();
        assert!(conf.contains("interface=wlan1\n"));
        assert!(conf.contains("dhcp-range=192.168.4.2,192.168.4.101,255.255.255.0,12h\n"));
        assert!(conf.contains("dhcp-option=3,192.168.4.1\n"));
        assert!(conf.contains("dhcp-option=6,1.1.1.1\n"));

        let conf = dnsmasq_conf("wlan1", &ap_info(), None).unwrap();
        assert!(!conf.contains("dhcp-option=6"));
    }

    #[test]
    fn test_hostapd_conf() {
        let open = AccessPointSettings {
            ssid: "ESP32_NAT_Router".to_string(),
            password: String::new(),
            auth: ApAuth::Open,
            max_connections: 10,
            beacon_interval: 100,
        };
        let conf = hostapd_conf("wlan1", &open).unwrap();
        assert!(conf.contains("ssid=ESP32_NAT_Router\n"));
        assert!(conf.contains("max_num_sta=10\n"));
        assert!(conf.contains("beacon_int=100\n"));
        assert!(!conf.contains("wpa="));

        let secured = AccessPointSettings {
            password: "password1".to_string(),
            auth: ApAuth::Wpa2Psk,
            ..open
        };
        let conf = hostapd_conf("wlan1", &secured).unwrap();
        assert!(conf.contains("wpa=2\n"));
        assert!(conf.contains("rsn_pairwise=CCMP\n"));
        assert!(conf.contains("wpa_passphrase=password1\n"));
    }

    #[test]
    fn test_wpa_supplicant_conf_personal() {
        let station = StationSettings {
            ssid: "home".to_string(),
            password: "secret123".to_string(),
            enterprise: None,
        };
        let conf = wpa_supplicant_conf(&station, None).unwrap();
        assert!(conf.contains("ssid=686f6d65\n"));
        assert!(conf.contains("psk=\"secret123\"\n"));
    }

    #[test]
    fn test_wpa_supplicant_conf_enterprise() {
        let station = StationSettings {
            ssid: "corp".to_string(),
            password: String::new(),
            enterprise: Some(EnterpriseAuth {
                identity: Some("anon".to_string()),
                username: Some("alice".to_string()),
                password: Some("pw".to_string()),
                ca_cert: Some(b"PEM".to_vec()),
            }),
        };
        let conf = wpa_supplicant_conf(&station, Some(Path::new("/run/natrouter/ca.pem"))).unwrap();
        assert!(conf.contains("key_mgmt=WPA-EAP\n"));
        assert!(conf.contains("anonymous_identity=616e6f6e\n"));
        assert!(conf.contains("    identity=616c696365\n"));
        assert!(conf.contains("password=7077\n"));
        assert!(conf.contains("ca_cert=\"/run/natrouter/ca.pem\"\n"));
        assert!(!conf.contains("psk="));
    }

    #[test]
    fn test_hostapd_conf_passphrase_bounds() {
        let mut ap = AccessPointSettings::from_config(&router_common::DownstreamConfig::default());
        ap.auth = ApAuth::Wpa2Psk;

        ap.password = "x".repeat(63);
        assert!(hostapd_conf("wlan1", &ap).unwrap().contains("wpa_passphrase="));

        ap.password = "0123456789abcdef".repeat(4);
        let conf = hostapd_conf("wlan1", &ap).unwrap();
        assert!(conf.contains(&format!("wpa_psk={}\n", ap.password)));
        assert!(!conf.contains("wpa_passphrase"));

        ap.password = "x".repeat(64);
        assert!(hostapd_conf("wlan1", &ap).is_err());

        ap.password = "pass\nword1".to_string();
        assert!(hostapd_conf("wlan1", &ap).is_err());
    }

    #[test]
    fn test_wpa_supplicant_conf_rejects_bad_psk() {
        let mut station = StationSettings {
            ssid: "home".to_string(),
            password: "say \"hi\" now".to_string(),
            enterprise: None,
        };
        assert!(wpa_supplicant_conf(&station, None).is_err());

        station.password = "short".to_string();
        assert!(wpa_supplicant_conf(&station, None).is_err());

        station.password = "y".repeat(64);
        assert!(wpa_supplicant_conf(&station, None).is_err());

        station.password = "ABCDEF0123456789".repeat(4);
        let conf = wpa_supplicant_conf(&station, None).unwrap();
        assert!(conf.contains(&format!("    psk={}\n", station.password)));
    }

    #[test]
    fn test_wpa_supplicant_conf_enterprise_quotes_are_inert() {
        let station = StationSettings {
            ssid: "corp".to_string(),
            password: String::new(),
            enterprise: Some(EnterpriseAuth {
                identity: None,
                username: Some("bob\"\n}".to_string()),
                password: Some("p\"w".to_string()),
                ca_cert: None,
            }),
        };
        let conf = wpa_supplicant_conf(&station, None).unwrap();
        assert!(conf.contains("    identity=626f62220a7d\n"));
        assert!(conf.contains("    password=702277\n"));
        assert_eq!(conf.matches('}').count(), 1);
    }

    #[tokio::test]
    async fn test_configure_wifi_rejects_invalid_station() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        let settings = WifiSettings {
            mode: crate::netif::WifiMode::ApSta,
            access_point: AccessPointSettings::from_config(&router_common::DownstreamConfig::default()),
            station: Some(StationSettings {
                ssid: "home".to_string(),
                password: "short".to_string(),
                enterprise: None,
            }),
        };
        assert!(stack.configure_wifi(&settings).await.is_err());
        assert!(!dir.path().join("wpa_supplicant.conf").exists());
    }

    #[tokio::test]
    async fn test_dhcp_server_stop_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        std::fs::write(dir.path().join("dnsmasq.pid"), "4242\n").unwrap();
        *stack.shared.mock_alive_checks.lock() = 2;

        stack.dhcp_server_stop().await.unwrap();

        let cmds = stack.shared.captured_commands.lock();
        assert!(cmds[0].contains("pkill -F"));
        let polls: Vec<&str> = cmds[1..].iter().map(String::as_str).collect();
        assert_eq!(polls, vec!["kill -0 4242 2>/dev/null"; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_server_stop_gives_up_on_stuck_process() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        std::fs::write(dir.path().join("dnsmasq.pid"), "4242").unwrap();
        *stack.shared.mock_alive_checks.lock() = u32::MAX;

        assert!(stack.dhcp_server_stop().await.is_err());
        assert_eq!(
            stack.shared.captured_commands.lock().len() as u32,
            1 + DHCP_SERVER_STOP_ATTEMPTS
        );
    }

    #[tokio::test]
    async fn test_dhcp_server_stop_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        stack.dhcp_server_stop().await.unwrap();
        assert!(stack.shared.captured_commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_create_interface_applies_base_mac() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        stack
            .set_base_mac(MacAddress::new([0x24, 0x0a, 0xc4, 1, 2, 3]))
            .await
            .unwrap();
        stack.create_interface(InterfaceRole::Downstream).await.unwrap();

        let cmds = stack.shared.captured_commands.lock();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("link set dev \"wlan1\" address 24:0a:c4:01:02:04"));
    }

    #[tokio::test]
    async fn test_dhcp_server_start_writes_conf() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        stack
            .set_ip_info(InterfaceRole::Downstream, ap_info())
            .await
            .unwrap();
        stack
            .set_offered_dns(Ipv4Addr::new(8, 8, 8, 8))
            .await
            .unwrap();
        stack.dhcp_server_start().await.unwrap();

        let conf = std::fs::read_to_string(dir.path().join("dnsmasq.conf")).unwrap();
        assert!(conf.contains("dhcp-option=6,8.8.8.8"));
        let cmds = stack.shared.captured_commands.lock();
        assert!(cmds.last().unwrap().contains("dnsmasq --conf-file="));
    }

    #[tokio::test]
    async fn test_dhcp_server_start_requires_address() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        assert!(stack.dhcp_server_start().await.is_err());
    }

    #[tokio::test]
    async fn test_upstream_dns_from_resolv_conf() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        assert_eq!(stack.upstream_dns().await.unwrap(), None);

        std::fs::write(dir.path().join("resolv.conf"), "nameserver 9.9.9.9\n").unwrap();
        assert_eq!(
            stack.upstream_dns().await.unwrap(),
            Some(Ipv4Addr::new(9, 9, 9, 9))
        );
    }

    #[tokio::test]
    async fn test_start_emits_link_up_for_station() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        stack.subscribe(tx);

        let settings = WifiSettings {
            mode: crate::netif::WifiMode::ApSta,
            access_point: AccessPointSettings::from_config(&router_common::DownstreamConfig::default()),
            station: Some(StationSettings {
                ssid: "home".to_string(),
                password: "secret123".to_string(),
                enterprise: None,
            }),
        };
        stack.configure_wifi(&settings).await.unwrap();
        stack.start().await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), NetEvent::LinkUp);
        let cmds = stack.shared.captured_commands.lock();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains("hostapd -B"));
        assert!(cmds[1].contains("wpa_supplicant -B -i \"wlan0\""));
        assert!(cmds[2].contains("dhclient -nw"));
    }

    #[tokio::test]
    async fn test_start_access_point_only() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        stack.subscribe(tx);

        let settings = WifiSettings {
            mode: crate::netif::WifiMode::Ap,
            access_point: AccessPointSettings::from_config(&router_common::DownstreamConfig::default()),
            station: None,
        };
        stack.configure_wifi(&settings).await.unwrap();
        stack.start().await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(stack.shared.captured_commands.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_access_point_only_keeps_hostapd() {
        let dir = tempfile::tempdir().unwrap();
        let stack = mock_stack(dir.path());
        let downstream = router_common::DownstreamConfig::default();

        stack
            .configure_wifi(&WifiSettings::access_point_only(&downstream))
            .await
            .unwrap();
        stack.start().await.unwrap();
        stack
            .configure_wifi(&WifiSettings::access_point_only(&downstream))
            .await
            .unwrap();
        stack.start().await.unwrap();

        let cmds = stack.shared.captured_commands.lock();
        assert_eq!(cmds.iter().filter(|c| c.contains("hostapd -B")).count(), 1);
    }
}
