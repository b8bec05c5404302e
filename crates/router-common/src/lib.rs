//! Common infrastructure for the NAT router control plane.
//!
//! This crate provides the pieces shared by the router daemon and its
//! test fixtures:
//!
//! - [`error`]: Error taxonomy for every router operation
//! - [`store`]: The namespaced Persistent Store abstraction with in-memory
//!   and file-backed implementations
//! - [`config`]: The Config Accessor and the typed [`RouterConfig`] read
//!   from documented store keys
//! - [`shell`]: Safe shell command execution with proper quoting, used by
//!   the Linux backends
//!
//! # Architecture
//!
//! The router daemon follows this pattern:
//!
//! 1. Read parameters from the Persistent Store through the Config Accessor
//! 2. Resolve the MAC policy and apply it before any interface exists
//! 3. Load the port-mapping table from its store blob
//! 4. Bring up the downstream and upstream interfaces and react to
//!   link/IP notifications, reapplying NAT state on every new address
//!
//! # Example
//!
//! ```ignore
//! use router_common::{config::ConfigAccessor, store::MemoryStore, keys};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let accessor = ConfigAccessor::new(store, keys::PARAM_NAMESPACE);
//! let ssid = accessor.get_string(keys::SSID, "")?;
//! ```

pub mod config;
pub mod error;
pub mod keys;
pub mod shell;
pub mod store;

// Re-export commonly used items at crate root
pub use config::{
    default_ap_ip_for_netmask, ConfigAccessor, DownstreamConfig, EnterpriseAuth, RouterConfig,
    UpstreamConfig,
};
pub use error::{RouterError, RouterResult};
pub use store::{FileStore, MemoryStore, OpenMode, PersistentStore, StoreHandle, StoreValue};
