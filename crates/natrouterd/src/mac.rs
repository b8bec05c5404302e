//! MAC Assignment Policy.
//!
//! The `custom_mac` parameter selects the device base MAC:
//!
//! - absent or empty: keep the factory address
//! - `random`: the factory address with the last octet drawn from `1..=254`
//! - `aa:bb:cc:dd:ee:ff`: that address; malformed strings give all zeros
//!
//! The resolved address must be applied before any interface exists; see
//! [`crate::orchestrator::Orchestrator::apply_base_mac`].

use std::fmt;

use rand::Rng;
use router_common::keys::{self, defaults};
use router_common::{ConfigAccessor, RouterResult};
use router_types::MacAddress;
use tracing::{debug, warn};

/// Configured MAC policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacPolicy {
    /// Keep the factory-programmed address.
    Factory,
    /// Randomize the last octet of the factory address.
    Random,
    /// Use this address.
    Explicit(MacAddress),
}

impl MacPolicy {
    /// Interprets a `custom_mac` value.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => MacPolicy::Factory,
            Some(defaults::MAC_RANDOM) => MacPolicy::Random,
            Some(s) => MacPolicy::Explicit(parse_mac_or_zero(s)),
        }
    }

    /// Reads the policy from the router parameters.
    pub fn from_config(accessor: &ConfigAccessor) -> RouterResult<Self> {
        let value = accessor.get_optional_string(keys::CUSTOM_MAC)?;
        Ok(Self::parse(value.as_deref()))
    }

    /// Resolves the base MAC to apply, or `None` to keep the factory one.
    pub fn resolve<R: Rng + ?Sized>(&self, factory: MacAddress, rng: &mut R) -> Option<MacAddress> {
        match self {
            MacPolicy::Factory => None,
            MacPolicy::Random => Some(randomize_last_octet(factory, rng)),
            MacPolicy::Explicit(mac) => Some(*mac),
        }
    }
}

impl fmt::Display for MacPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacPolicy::Factory => write!(f, "factory"),
            MacPolicy::Random => write!(f, "random"),
            MacPolicy::Explicit(mac) => write!(f, "{}", mac),
        }
    }
}

/// Parses six colon-separated two-digit hex groups; anything else gives
/// the all-zero address.
pub fn parse_mac_or_zero(s: &str) -> MacAddress {
    match s.parse::<MacAddress>() {
        Ok(mac) => {
            debug!(mac = %mac, "Parsed custom MAC");
            mac
        }
        Err(e) => {
            warn!(value = %s, error = %e, "Malformed custom MAC, using all zeros");
            MacAddress::ZERO
        }
    }
}

/// Replaces the last octet of `factory` with a value in `1..=254`.
pub fn randomize_last_octet<R: Rng + ?Sized>(factory: MacAddress, rng: &mut R) -> MacAddress {
    factory.with_last_octet(rng.gen_range(1..=254))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const FACTORY: MacAddress = MacAddress::new([0x24, 0x0a, 0xc4, 0x12, 0x34, 0x56]);

    #[test]
    fn test_parse_policy() {
        assert_eq!(MacPolicy::parse(None), MacPolicy::Factory);
        assert_eq!(MacPolicy::parse(Some("")), MacPolicy::Factory);
        assert_eq!(MacPolicy::parse(Some("random")), MacPolicy::Random);
        assert_eq!(
            MacPolicy::parse(Some("aa:bb:cc:dd:ee:ff")),
            MacPolicy::Explicit(MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
        );
    }

    #[test]
    fn test_explicit_mac_exact() {
        let mut rng = StdRng::seed_from_u64(1);
        let mac = MacPolicy::parse(Some("aa:bb:cc:dd:ee:ff"))
            .resolve(FACTORY, &mut rng)
            .unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_malformed_mac_is_zero() {
        for bad in ["aa:bb:cc", "aa-bb-cc-dd-ee-ff", "zz:bb:cc:dd:ee:ff", "a:b:c:d:e:f", "randomly"] {
            assert_eq!(
                MacPolicy::parse(Some(bad)),
                MacPolicy::Explicit(MacAddress::ZERO),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_random_changes_only_last_octet() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let mac = MacPolicy::Random.resolve(FACTORY, &mut rng).unwrap();
            assert_eq!(mac.as_bytes()[..5], FACTORY.as_bytes()[..5]);
            let last = mac.as_bytes()[5];
            assert!((1..=254).contains(&last), "octet {}", last);
        }
    }

    #[test]
    fn test_factory_policy_keeps_default() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(MacPolicy::Factory.resolve(FACTORY, &mut rng), None);
    }
}
