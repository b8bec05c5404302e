//! NAT engine backed by Linux netfilter.
//!
//! Translation is a MASQUERADE rule on the upstream interface plus IPv4
//! forwarding. Each port mapping is one DNAT rule bound to the public
//! address, kept in the [`DNAT_CHAIN`] chain that `nat PREROUTING` jumps to.
//! The chain is flushed on first use, so rules left by an earlier run never
//! survive a restart. The exact rule text is kept so it can be deleted by
//! `(protocol, external_port)` alone.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use parking_lot::Mutex;
use router_common::shell::{self, shellquote, IPTABLES_CMD, SYSCTL_CMD};
use router_common::{RouterError, RouterResult};
use router_types::Protocol;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::nat::NatEngine;
use crate::portmap::PortMapping;

/// `nat` chain owning every port-mapping rule.
pub const DNAT_CHAIN: &str = "NATROUTER-DNAT";

/// Builds the MASQUERADE rule for traffic leaving `upstream_if`.
pub fn masquerade_rule(upstream_if: &str) -> String {
    format!("POSTROUTING -o {} -j MASQUERADE", shellquote(upstream_if))
}

/// Builds the DNAT rule forwarding `mapping` from `public_addr`.
pub fn dnat_rule(public_addr: Ipv4Addr, mapping: &PortMapping) -> String {
    format!(
        "{} -d {} -p {} --dport {} -j DNAT --to-destination {}:{}",
        DNAT_CHAIN,
        public_addr,
        mapping.protocol.as_str(),
        mapping.external_port,
        mapping.internal_addr,
        mapping.internal_port
    )
}

/// iptables-based [`NatEngine`].
pub struct IptablesNat {
    upstream_if: String,

    /// Installed DNAT rules by `(protocol, external_port)`.
    installed: Mutex<HashMap<(Protocol, u16), String>>,

    /// Set once [`DNAT_CHAIN`] exists, is empty and is hooked.
    chain: OnceCell<()>,

    /// Mock mode for testing (don't execute shell commands).
    #[cfg(test)]
    mock_mode: bool,

    /// Captured shell commands in mock mode.
    #[cfg(test)]
    captured_commands: Mutex<Vec<String>>,
}

impl IptablesNat {
    /// Creates an engine that masquerades behind `upstream_if`.
    pub fn new(upstream_if: impl Into<String>) -> Self {
        Self {
            upstream_if: upstream_if.into(),
            installed: Mutex::new(HashMap::new()),
            chain: OnceCell::new(),
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Mutex::new(Vec::new()),
        }
    }

    /// Number of DNAT rules currently installed.
    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }

    async fn run(&self, cmd: &str) -> RouterResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd.to_string());
            return Ok(());
        }

        shell::exec_or_throw(cmd).await.map(|_| ())
    }

    /// Creates, flushes and hooks [`DNAT_CHAIN`] the first time it is needed.
    async fn ensure_chain(&self) -> RouterResult<()> {
        self.chain
            .get_or_try_init(|| async {
                let ipt = IPTABLES_CMD;
                self.run(&format!("{ipt} -t nat -N {DNAT_CHAIN} 2>/dev/null || true"))
                    .await?;
                self.run(&format!("{ipt} -t nat -F {DNAT_CHAIN}")).await?;
                self.run(&format!(
                    "{ipt} -t nat -C PREROUTING -j {DNAT_CHAIN} 2>/dev/null || {ipt} -t nat -A PREROUTING -j {DNAT_CHAIN}"
                ))
                .await?;
                self.installed.lock().clear();
                info!(chain = DNAT_CHAIN, "Port-mapping chain reset");
                Ok::<(), RouterError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl NatEngine for IptablesNat {
    #[instrument(skip(self), fields(upstream = %self.upstream_if))]
    async fn enable(&self, internal_addr: Ipv4Addr) -> RouterResult<()> {
        self.run(&format!("{} -w net.ipv4.ip_forward=1", SYSCTL_CMD))
            .await
            .map_err(|e| RouterError::engine_rejected("enable", e.to_string()))?;

        let rule = masquerade_rule(&self.upstream_if);
        let cmd = format!(
            "{ipt} -t nat -C {rule} 2>/dev/null || {ipt} -t nat -A {rule}",
            ipt = IPTABLES_CMD,
            rule = rule
        );
        self.run(&cmd)
            .await
            .map_err(|e| RouterError::engine_rejected("enable", e.to_string()))?;
        self.ensure_chain()
            .await
            .map_err(|e| RouterError::engine_rejected("enable", e.to_string()))?;

        info!(internal = %internal_addr, "Masquerading downstream traffic");
        Ok(())
    }

    async fn add_portmap(&self, public_addr: Ipv4Addr, mapping: &PortMapping) -> RouterResult<()> {
        self.ensure_chain()
            .await
            .map_err(|e| RouterError::engine_rejected("add_portmap", e.to_string()))?;
        let rule = dnat_rule(public_addr, mapping);
        self.run(&format!("{} -t nat -A {}", IPTABLES_CMD, rule))
            .await
            .map_err(|e| RouterError::engine_rejected("add_portmap", e.to_string()))?;

        debug!(rule = %rule, "Installed DNAT rule");
        self.installed.lock().insert(mapping.key(), rule);
        Ok(())
    }

    async fn remove_portmap(&self, protocol: Protocol, external_port: u16) -> RouterResult<()> {
        let rule = self.installed.lock().get(&(protocol, external_port)).cloned();
        let Some(rule) = rule else {
            return Ok(());
        };

        self.run(&format!("{} -t nat -D {}", IPTABLES_CMD, rule))
            .await
            .map_err(|e| RouterError::engine_rejected("remove_portmap", e.to_string()))?;

        debug!(rule = %rule, "Deleted DNAT rule");
        self.installed.lock().remove(&(protocol, external_port));
        Ok(())
    }
}

impl std::fmt::Debug for IptablesNat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IptablesNat")
            .field("upstream_if", &self.upstream_if)
            .field("installed", &self.installed_count())
            .finish()
    }
}
