//! Integration test infrastructure for the NAT router control plane
//!
//! Provides:
//! - Recording fakes for the network stack and NAT engine
//! - Store fixtures for common parameter sets
//! - A harness that boots a router against the fakes
//! - Port-mapping table/store/engine consistency checks

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
