//! Common types for the NAT router control plane.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the router crates:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`IpInfo`]: IPv4 address/netmask/gateway triple of an interface
//! - [`Protocol`]: transport protocol of a port mapping
//! - [`InterfaceRole`]: upstream (station) or downstream (access point)

mod iface;
mod ip;
mod mac;
mod proto;

pub use iface::InterfaceRole;
pub use ip::{netmask_prefix_len, parse_ipv4, IpInfo};
pub use mac::MacAddress;
pub use proto::Protocol;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid netmask: {0}")]
    InvalidNetmask(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
}
