//! DNS Selector.

use std::net::Ipv4Addr;

use router_common::RouterResult;
use tracing::{info, instrument, warn};

use crate::netif::NetStack;

/// Returns the DNS server to advertise downstream: the override when
/// configured, the upstream-learned server otherwise.
pub fn select(configured_override: Option<Ipv4Addr>, upstream_learned: Ipv4Addr) -> Ipv4Addr {
    configured_override.unwrap_or(upstream_learned)
}

/// Chooses and pushes the DNS server advertised by the downstream DHCP
/// server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsSelector {
    configured_override: Option<Ipv4Addr>,
}

impl DnsSelector {
    pub fn new(configured_override: Option<Ipv4Addr>) -> Self {
        Self {
            configured_override,
        }
    }

    pub fn configured_override(&self) -> Option<Ipv4Addr> {
        self.configured_override
    }

    /// Like [`select`], but the upstream server may be unknown.
    pub fn choose(&self, upstream_learned: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        match upstream_learned {
            Some(learned) => Some(select(self.configured_override, learned)),
            None => self.configured_override,
        }
    }

    /// Recomputes the choice and pushes it to the downstream DHCP server.
    ///
    /// Returns the advertised address, or `None` when neither an override
    /// nor a learned server is known and the push was skipped.
    #[instrument(skip(self, stack))]
    pub async fn apply(
        &self,
        stack: &dyn NetStack,
        upstream_learned: Option<Ipv4Addr>,
    ) -> RouterResult<Option<Ipv4Addr>> {
        let Some(dns) = self.choose(upstream_learned) else {
            warn!("No DNS server known, downstream clients keep the previous one");
            return Ok(None);
        };
        push_dns(stack, dns).await?;
        info!(
            dns = %dns,
            source = if self.configured_override.is_some() { "override" } else { "upstream" },
            "Advertising DNS server downstream"
        );
        Ok(Some(dns))
    }
}

/// Sets the advertised DNS server on the downstream DHCP server.
///
/// The server does not accept option changes while running, so it is
/// stopped, updated and restarted. It is restarted even when the update
/// fails.
pub async fn push_dns(stack: &dyn NetStack, dns: Ipv4Addr) -> RouterResult<()> {
    stack.dhcp_server_stop().await?;
    let set = stack.set_offered_dns(dns).await;
    stack.dhcp_server_start().await?;
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOUDFLARE: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
    const GOOGLE: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    #[test]
    fn test_select_prefers_override() {
        assert_eq!(select(Some(CLOUDFLARE), GOOGLE), CLOUDFLARE);
    }

    #[test]
    fn test_select_falls_back_to_upstream() {
        assert_eq!(select(None, GOOGLE), GOOGLE);
    }

    #[test]
    fn test_choose_with_unknown_upstream() {
        assert_eq!(DnsSelector::new(Some(CLOUDFLARE)).choose(None), Some(CLOUDFLARE));
        assert_eq!(DnsSelector::new(None).choose(None), None);
        assert_eq!(DnsSelector::new(None).choose(Some(GOOGLE)), Some(GOOGLE));
    }
}
