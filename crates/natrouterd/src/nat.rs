//! NAT engine collaborator.
//!
//! The engine translates traffic between the downstream subnet and the
//! upstream address and owns the installed port-forwarding rules. It is
//! driven by the port-mapping manager and the orchestrator; it never reads
//! the persisted table itself.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use router_common::RouterResult;
use router_types::Protocol;

use crate::portmap::PortMapping;

/// Address translation and port forwarding.
#[async_trait]
pub trait NatEngine: Send + Sync {
    /// Enables translation for traffic originating behind `internal_addr`
    /// (the downstream interface address).
    async fn enable(&self, internal_addr: Ipv4Addr) -> RouterResult<()>;

    /// Installs a forwarding rule for `mapping`, bound to `public_addr`.
    async fn add_portmap(&self, public_addr: Ipv4Addr, mapping: &PortMapping) -> RouterResult<()>;

    /// Removes the rule keyed by `(protocol, external_port)`.
    ///
    /// Removing a rule that is not installed is not an error.
    async fn remove_portmap(&self, protocol: Protocol, external_port: u16) -> RouterResult<()>;
}
