//! Config Accessor and typed router configuration.
//!
//! The accessor opens the Persistent Store for every read and closes it
//! before returning. Absence of a key is never an error for callers of
//! [`ConfigAccessor::get_string`]; only a store that cannot be opened is
//! reported, as [`crate::RouterError::StoreUnavailable`].

use std::net::Ipv4Addr;
use std::sync::Arc;

use router_types::{parse_ipv4, IpInfo};
use tracing::{debug, info, warn};

use crate::error::RouterResult;
use crate::keys::{self, defaults};
use crate::store::{OpenMode, PersistentStore};

/// Typed, defaulting reads of router parameters.
#[derive(Clone)]
pub struct ConfigAccessor {
    store: Arc<dyn PersistentStore>,
    namespace: String,
}

impl ConfigAccessor {
    /// Creates an accessor reading from `namespace`.
    pub fn new(store: Arc<dyn PersistentStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Returns the namespace this accessor reads.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    /// Reads a string parameter, returning `default` when it is absent or
    /// unreadable.
    pub fn get_string(&self, name: &str, default: &str) -> RouterResult<String> {
        Ok(self
            .get_optional_string(name)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Reads a string parameter; `None` when absent or unreadable.
    pub fn get_optional_string(&self, name: &str) -> RouterResult<Option<String>> {
        let handle = self.store.open(&self.namespace, OpenMode::ReadOnly)?;
        match handle.get_str(name) {
            Ok(Some(value)) => {
                debug!(key = name, "Read config parameter");
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(key = name, error = %e, "Unreadable config parameter, using default");
                Ok(None)
            }
        }
    }

    /// Reads a blob parameter; `None` when absent or unreadable.
    pub fn get_blob(&self, name: &str) -> RouterResult<Option<Vec<u8>>> {
        let handle = self.store.open(&self.namespace, OpenMode::ReadOnly)?;
        match handle.get_blob(name) {
            Ok(blob) => {
                if let Some(ref b) = blob {
                    debug!(key = name, len = b.len(), "Read config blob");
                }
                Ok(blob)
            }
            Err(e) => {
                warn!(key = name, error = %e, "Unreadable config blob, ignoring");
                Ok(None)
            }
        }
    }

    /// Reads an IPv4 parameter; `None` when absent, empty or malformed.
    pub fn get_ipv4(&self, name: &str) -> RouterResult<Option<Ipv4Addr>> {
        Ok(self
            .get_optional_string(name)?
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| match parse_ipv4(&s) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(key = name, error = %e, "Ignoring malformed address parameter");
                    None
                }
            }))
    }
}

impl std::fmt::Debug for ConfigAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigAccessor")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Returns the default downstream address for a netmask string.
///
/// Class A and B netmasks get a matching private range; anything else
/// falls back to the class C default.
pub fn default_ap_ip_for_netmask(netmask: &str) -> Ipv4Addr {
    let ip = match netmask.trim() {
        defaults::NETMASK_CLASS_A => defaults::AP_IP_CLASS_A,
        defaults::NETMASK_CLASS_B => defaults::AP_IP_CLASS_B,
        _ => defaults::AP_IP_CLASS_C,
    };
    parse_ipv4(ip).unwrap_or(Ipv4Addr::new(192, 168, 4, 1))
}

/// WPA2-Enterprise credentials for the upstream network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnterpriseAuth {
    pub identity: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM bytes of the CA certificate.
    pub ca_cert: Option<Vec<u8>>,
}

/// Upstream (station) settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Empty when no upstream network is configured.
    pub ssid: String,
    /// Personal passphrase; empty when enterprise auth is used.
    pub password: String,
    /// Static addressing, when fully configured.
    pub static_ip: Option<IpInfo>,
    /// Enterprise credentials, when an identity or username is configured.
    pub enterprise: Option<EnterpriseAuth>,
}

impl UpstreamConfig {
    /// True when an upstream network is configured.
    pub fn is_configured(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Downstream (access point) settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamConfig {
    pub ssid: String,
    pub password: String,
    /// Address, netmask and gateway (the gateway is the AP address itself).
    pub ip_info: IpInfo,
}

impl DownstreamConfig {
    /// True when the password is long enough for WPA2; otherwise the
    /// access point runs open.
    pub fn is_secured(&self) -> bool {
        self.password.len() >= defaults::MIN_WPA_PASSWORD_LEN
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        let ip = default_ap_ip_for_netmask(defaults::NETMASK_CLASS_C);
        Self {
            ssid: defaults::AP_SSID.to_string(),
            password: String::new(),
            ip_info: IpInfo::new(ip, Ipv4Addr::new(255, 255, 255, 0), ip),
        }
    }
}

/// Every router parameter read at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterConfig {
    pub upstream: UpstreamConfig,
    pub downstream: DownstreamConfig,
    /// DNS server advertised to downstream clients instead of the
    /// upstream-learned one.
    pub dns_override: Option<Ipv4Addr>,
}

impl RouterConfig {
    /// Reads all parameters. Fails only when the store cannot be opened.
    pub fn load(accessor: &ConfigAccessor) -> RouterResult<Self> {
        let downstream = Self::load_downstream(accessor)?;
        let upstream = Self::load_upstream(accessor)?;
        let dns_override = accessor.get_ipv4(keys::CUSTOM_DNS)?;

        let config = Self {
            upstream,
            downstream,
            dns_override,
        };
        info!(
            upstream_ssid = %config.upstream.ssid,
            ap_ssid = %config.downstream.ssid,
            ap = %config.downstream.ip_info,
            static_upstream = config.upstream.static_ip.is_some(),
            enterprise = config.upstream.enterprise.is_some(),
            dns_override = ?config.dns_override,
            "Loaded router configuration"
        );
        Ok(config)
    }

    /// Reads all parameters, falling back to defaults when the store is
    /// unavailable.
    pub fn load_or_default(accessor: &ConfigAccessor) -> Self {
        match Self::load(accessor) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Router configuration unavailable, using defaults");
                Self::default()
            }
        }
    }

    fn load_downstream(accessor: &ConfigAccessor) -> RouterResult<DownstreamConfig> {
        let netmask_str = accessor.get_string(keys::NETMASK, defaults::NETMASK_CLASS_C)?;
        let netmask = match parse_ipv4(&netmask_str) {
            Ok(mask) if router_types::netmask_prefix_len(mask).is_some() => mask,
            _ => {
                warn!(netmask = %netmask_str, "Invalid downstream netmask, using class C");
                Ipv4Addr::new(255, 255, 255, 0)
            }
        };

        let ip = match accessor.get_ipv4(keys::AP_IP)? {
            Some(ip) => ip,
            None => default_ap_ip_for_netmask(&netmask.to_string()),
        };

        Ok(DownstreamConfig {
            ssid: accessor.get_string(keys::AP_SSID, defaults::AP_SSID)?,
            password: accessor.get_string(keys::AP_PASSWD, "")?,
            ip_info: IpInfo::new(ip, netmask, ip),
        })
    }

    fn load_upstream(accessor: &ConfigAccessor) -> RouterResult<UpstreamConfig> {
        let ssid = accessor.get_string(keys::SSID, "")?;
        let password = accessor.get_string(keys::PASSWD, "")?;

        let static_ip = if ssid.is_empty() {
            None
        } else {
            match (
                accessor.get_ipv4(keys::STATIC_IP)?,
                accessor.get_ipv4(keys::SUBNET_MASK)?,
                accessor.get_ipv4(keys::GATEWAY_ADDR)?,
            ) {
                (Some(ip), Some(netmask), Some(gateway)) => {
                    if router_types::netmask_prefix_len(netmask).is_some() {
                        Some(IpInfo::new(ip, netmask, gateway))
                    } else {
                        warn!(netmask = %netmask, "Invalid upstream netmask, using DHCP");
                        None
                    }
                }
                _ => None,
            }
        };

        let identity = accessor
            .get_optional_string(keys::STA_IDENTITY)?
            .filter(|s| !s.is_empty());
        let username = accessor
            .get_optional_string(keys::STA_USER)?
            .filter(|s| !s.is_empty());

        if identity.is_none() && username.is_none() {
            return Ok(UpstreamConfig {
                ssid,
                password,
                static_ip,
                enterprise: None,
            });
        }

        let ca_cert = accessor.get_blob(keys::CA_CERT)?.filter(|c| !c.is_empty());
        let enterprise = EnterpriseAuth {
            identity,
            username,
            password: Some(password).filter(|p| !p.is_empty()),
            ca_cert,
        };

        Ok(UpstreamConfig {
            ssid,
            password: String::new(),
            static_ip,
            enterprise: Some(enterprise),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use crate::store::{MemoryStore, StoreValue};
    use pretty_assertions::assert_eq;

    fn accessor(entries: &[(&str, &str)]) -> (Arc<MemoryStore>, ConfigAccessor) {
        let store = Arc::new(MemoryStore::with_strings(
            keys::PARAM_NAMESPACE,
            entries.iter().copied(),
        ));
        let accessor = ConfigAccessor::new(store.clone(), keys::PARAM_NAMESPACE);
        (store, accessor)
    }

    #[test]
    fn test_get_string_default_when_absent() {
        let (_, acc) = accessor(&[]);
        assert_eq!(acc.get_string("ssid", "fallback").unwrap(), "fallback");
    }

    #[test]
    fn test_get_string_present() {
        let (_, acc) = accessor(&[("ssid", "home")]);
        assert_eq!(acc.get_string("ssid", "fallback").unwrap(), "home");
    }

    #[test]
    fn test_get_string_store_unavailable() {
        let (store, acc) = accessor(&[("ssid", "home")]);
        store.set_unavailable(true);
        assert!(matches!(
            acc.get_string("ssid", ""),
            Err(RouterError::StoreUnavailable { .. })
        ));
    }

    #[test]
    fn test_get_string_wrong_type_defaults() {
        let (store, acc) = accessor(&[]);
        store.insert(keys::PARAM_NAMESPACE, "ssid", StoreValue::Blob(vec![1]));
        assert_eq!(acc.get_string("ssid", "dflt").unwrap(), "dflt");
    }

    #[test]
    fn test_get_blob() {
        let (store, acc) = accessor(&[]);
        assert_eq!(acc.get_blob("cer").unwrap(), None);
        store.insert(keys::PARAM_NAMESPACE, "cer", StoreValue::Blob(b"PEM".to_vec()));
        assert_eq!(acc.get_blob("cer").unwrap(), Some(b"PEM".to_vec()));
    }

    #[test]
    fn test_get_ipv4_malformed_is_none() {
        let (_, acc) = accessor(&[("custom_dns", "1.1.1"), ("ap_ip", "10.1.1.1")]);
        assert_eq!(acc.get_ipv4("custom_dns").unwrap(), None);
        assert_eq!(acc.get_ipv4("ap_ip").unwrap(), Some(Ipv4Addr::new(10, 1, 1, 1)));
    }

    #[test]
    fn test_default_ap_ip_for_netmask() {
        assert_eq!(default_ap_ip_for_netmask("255.0.0.0"), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(default_ap_ip_for_netmask("255.255.0.0"), Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(default_ap_ip_for_netmask("255.255.255.0"), Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(default_ap_ip_for_netmask("garbage"), Ipv4Addr::new(192, 168, 4, 1));
    }

    #[test]
    fn test_load_empty_store_defaults() {
        let (_, acc) = accessor(&[]);
        let config = RouterConfig::load(&acc).unwrap();
        assert_eq!(config, RouterConfig::default());
        assert!(!config.upstream.is_configured());
        assert!(!config.downstream.is_secured());
    }

    #[test]
    fn test_load_downstream_netmask_class() {
        let (_, acc) = accessor(&[("netmask", "255.255.0.0"), ("ap_passwd", "longenough")]);
        let config = RouterConfig::load(&acc).unwrap();
        assert_eq!(config.downstream.ip_info.ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(config.downstream.ip_info.gateway, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(config.downstream.ip_info.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert!(config.downstream.is_secured());
    }

    #[test]
    fn test_load_static_upstream_requires_ssid_and_all_fields() {
        let (_, acc) = accessor(&[
            ("static_ip", "192.168.1.50"),
            ("subnet_mask", "255.255.255.0"),
            ("gateway_addr", "192.168.1.1"),
        ]);
        assert_eq!(RouterConfig::load(&acc).unwrap().upstream.static_ip, None);

        let (_, acc) = accessor(&[
            ("ssid", "uplink"),
            ("static_ip", "192.168.1.50"),
            ("subnet_mask", "255.255.255.0"),
        ]);
        assert_eq!(RouterConfig::load(&acc).unwrap().upstream.static_ip, None);

        let (_, acc) = accessor(&[
            ("ssid", "uplink"),
            ("static_ip", "192.168.1.50"),
            ("subnet_mask", "255.255.255.0"),
            ("gateway_addr", "192.168.1.1"),
        ]);
        let info = RouterConfig::load(&acc).unwrap().upstream.static_ip.unwrap();
        assert_eq!(info.ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(info.gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_load_static_upstream_noncontiguous_mask_uses_dhcp() {
        let (_, acc) = accessor(&[
            ("ssid", "uplink"),
            ("static_ip", "192.168.1.50"),
            ("subnet_mask", "255.0.255.0"),
            ("gateway_addr", "192.168.1.1"),
        ]);
        let config = RouterConfig::load(&acc).unwrap();
        assert_eq!(config.upstream.static_ip, None);
        assert!(config.upstream.is_configured());
    }

    #[test]
    fn test_load_enterprise() {
        let (store, acc) = accessor(&[
            ("ssid", "corp"),
            ("passwd", "secret"),
            ("sta_identity", "anon"),
            ("sta_user", "alice"),
        ]);
        store.insert(keys::PARAM_NAMESPACE, "cer", StoreValue::Blob(b"CERT".to_vec()));

        let upstream = RouterConfig::load(&acc).unwrap().upstream;
        assert!(upstream.password.is_empty());
        let ent = upstream.enterprise.unwrap();
        assert_eq!(ent.identity.as_deref(), Some("anon"));
        assert_eq!(ent.username.as_deref(), Some("alice"));
        assert_eq!(ent.password.as_deref(), Some("secret"));
        assert_eq!(ent.ca_cert, Some(b"CERT".to_vec()));
    }

    #[test]
    fn test_load_dns_override() {
        let (_, acc) = accessor(&[("custom_dns", "1.1.1.1")]);
        assert_eq!(
            RouterConfig::load(&acc).unwrap().dns_override,
            Some(Ipv4Addr::new(1, 1, 1, 1))
        );
    }

    #[test]
    fn test_load_or_default_on_unavailable_store() {
        let (store, acc) = accessor(&[("ssid", "home")]);
        store.set_unavailable(true);
        assert_eq!(RouterConfig::load_or_default(&acc), RouterConfig::default());
    }
}
