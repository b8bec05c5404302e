//! Linux implementations of the network stack and NAT engine.

pub mod iptables;
pub mod linux;

pub use iptables::IptablesNat;
pub use linux::{LinuxNetStack, LinuxStackSettings};
