//! Interface roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two network interfaces the router owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceRole {
    /// Client interface toward the internet-facing network (STA).
    Upstream,
    /// Access-point interface serving local clients (AP).
    Downstream,
}

impl InterfaceRole {
    /// Short name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            InterfaceRole::Upstream => "sta",
            InterfaceRole::Downstream => "ap",
        }
    }
}

impl fmt::Display for InterfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
