//! Persistent Store namespace and key names.
//!
//! Values under these keys are written out-of-band by a configuration
//! tool; the router only reads them, except for [`PORTMAP_TABLE`].

/// Namespace holding every router parameter.
pub const PARAM_NAMESPACE: &str = "nat_router";

/// Upstream SSID. Empty means access-point-only mode.
pub const SSID: &str = "ssid";

/// Upstream password (also the enterprise password).
pub const PASSWD: &str = "passwd";

/// Upstream static IPv4 address.
pub const STATIC_IP: &str = "static_ip";

/// Upstream static netmask.
pub const SUBNET_MASK: &str = "subnet_mask";

/// Upstream static gateway.
pub const GATEWAY_ADDR: &str = "gateway_addr";

/// Downstream SSID.
pub const AP_SSID: &str = "ap_ssid";

/// Downstream password.
pub const AP_PASSWD: &str = "ap_passwd";

/// Downstream IPv4 address.
pub const AP_IP: &str = "ap_ip";

/// Downstream netmask.
pub const NETMASK: &str = "netmask";

/// DNS server override advertised to downstream clients.
pub const CUSTOM_DNS: &str = "custom_dns";

/// MAC address policy (`random` or `aa:bb:cc:dd:ee:ff`).
pub const CUSTOM_MAC: &str = "custom_mac";

/// Enterprise authentication identity.
pub const STA_IDENTITY: &str = "sta_identity";

/// Enterprise authentication username.
pub const STA_USER: &str = "sta_user";

/// Enterprise CA certificate (blob).
pub const CA_CERT: &str = "cer";

/// Persisted port-mapping table (blob).
pub const PORTMAP_TABLE: &str = "portmap_tab";

/// Default values for router parameters.
pub mod defaults {
    /// Default downstream SSID.
    pub const AP_SSID: &str = "ESP32_NAT_Router";

    /// Class A netmask.
    pub const NETMASK_CLASS_A: &str = "255.0.0.0";

    /// Class B netmask.
    pub const NETMASK_CLASS_B: &str = "255.255.0.0";

    /// Class C netmask, the default downstream netmask.
    pub const NETMASK_CLASS_C: &str = "255.255.255.0";

    /// Downstream address used with a class A netmask.
    pub const AP_IP_CLASS_A: &str = "10.0.0.1";

    /// Downstream address used with a class B netmask.
    pub const AP_IP_CLASS_B: &str = "172.16.0.1";

    /// Downstream address used with any other netmask.
    pub const AP_IP_CLASS_C: &str = "192.168.4.1";

    /// Minimum WPA2 passphrase length; shorter means an open network.
    pub const MIN_WPA_PASSWORD_LEN: usize = 8;

    /// Literal MAC policy token requesting a randomized address.
    pub const MAC_RANDOM: &str = "random";
}
