//! natrouterd - control plane of a dual-role Wi-Fi NAT router.
//!
//! The router owns one upstream (station) interface and one downstream
//! (access point) interface. This crate keeps the port-mapping table in
//! sync with the NAT engine across reconnects, selects the DNS server
//! handed to downstream clients and applies the MAC policy at boot.
//!
//! # Modules
//!
//! - [`portmap`]: fixed-capacity port-mapping table, its stored image and
//!   the NAT rules derived from it
//! - [`mac`]: MAC assignment policy
//! - [`dns`]: DNS server selection and push to the DHCP server
//! - [`orchestrator`]: interface bring-up and the uplink state machine
//! - [`boot`]: the boot sequence tying everything together
//! - [`nat`] / [`netif`]: the collaborator traits
//! - [`backend`]: Linux implementations of those traits
//! - [`config_file`]: daemon settings file

pub mod backend;
pub mod boot;
pub mod config_file;
pub mod dns;
pub mod mac;
pub mod nat;
pub mod netif;
pub mod orchestrator;
pub mod portmap;
pub mod readiness;

pub use boot::{BootOptions, BootOutcome, Router, DEFAULT_JOIN_TIMEOUT};
pub use config_file::DaemonConfig;
pub use dns::{select as select_dns, DnsSelector};
pub use mac::MacPolicy;
pub use nat::NatEngine;
pub use netif::{NetEvent, NetStack, WifiMode, WifiSettings};
pub use orchestrator::{InterfaceState, Orchestrator, UplinkState};
pub use portmap::{PortMapManager, PortMapTable, PortMapping, IP_PORTMAP_MAX};
pub use readiness::ReadinessFlag;
