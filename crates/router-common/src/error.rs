//! Error types for router control-plane operations.
//!
//! Every failure at this layer is local-recoverable: the router runs
//! unattended and degrades (no internet egress, no custom port mappings)
//! rather than halting. The variants below name each failure class so
//! callers can decide how far to degrade.

use std::io;
use thiserror::Error;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors that can occur during router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The Persistent Store could not be opened.
    #[error("Persistent store unavailable (namespace '{namespace}'): {message}")]
    StoreUnavailable {
        /// The namespace that was being opened.
        namespace: String,
        message: String,
    },

    /// A typed read, write or commit on an open store failed.
    #[error("Store operation failed: {operation} '{key}': {message}")]
    Store {
        /// The operation that failed (e.g., "get_str", "set_blob", "commit").
        operation: String,
        /// The key involved.
        key: String,
        message: String,
    },

    /// A stored blob does not have the expected size.
    #[error("Stored '{key}' is corrupt: expected {expected} bytes, found {actual}")]
    StoreCorrupt {
        /// The key of the blob.
        key: String,
        /// Size the current build expects.
        expected: usize,
        /// Size found in the store.
        actual: usize,
    },

    /// The port-mapping table has no free slot.
    #[error("Port-mapping table full ({capacity} entries)")]
    TableFull {
        /// Compiled table capacity.
        capacity: usize,
    },

    /// The NAT engine refused an enable/install/remove call.
    #[error("NAT engine rejected {operation}: {message}")]
    EngineRejected {
        /// The engine operation.
        operation: String,
        message: String,
    },

    /// The upstream link did not come up within the boot wait.
    #[error("Upstream connection not established within {timeout_ms}ms")]
    ConnectTimeout {
        /// The wait that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// The network interface stack refused an operation.
    #[error("Interface operation failed on {interface}: {operation}: {message}")]
    Interface {
        /// The interface (e.g., "sta", "ap").
        interface: String,
        /// The operation that failed.
        operation: String,
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        message: String,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Diagnostic output (stderr, else stdout).
        output: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RouterError {
    /// Creates a store-unavailable error.
    pub fn store_unavailable(namespace: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            namespace: namespace.into(),
            message: message.into(),
        }
    }

    /// Creates a store operation error.
    pub fn store(
        operation: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an engine-rejected error.
    pub fn engine_rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EngineRejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an interface error.
    pub fn interface(
        interface: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Interface {
            interface: interface.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouterError::StoreUnavailable { .. }
                | RouterError::EngineRejected { .. }
                | RouterError::ConnectTimeout { .. }
                | RouterError::Interface { .. }
                | RouterError::ShellCommandFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RouterError::TableFull { capacity: 32 };
        assert_eq!(err.to_string(), "Port-mapping table full (32 entries)");
    }

    #[test]
    fn test_store_corrupt_display() {
        let err = RouterError::StoreCorrupt {
            key: "portmap_tab".to_string(),
            expected: 384,
            actual: 120,
        };
        assert_eq!(
            err.to_string(),
            "Stored 'portmap_tab' is corrupt: expected 384 bytes, found 120"
        );
    }

    #[test]
    fn test_store_unavailable() {
        let err = RouterError::store_unavailable("nat_router", "flash not initialized");
        assert!(err.to_string().contains("nat_router"));
        assert!(err.to_string().contains("flash not initialized"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(RouterError::engine_rejected("add", "bad port").is_retryable());
        assert!(RouterError::ConnectTimeout { timeout_ms: 2000 }.is_retryable());
        assert!(!RouterError::TableFull { capacity: 32 }.is_retryable());
        assert!(!RouterError::internal("bug").is_retryable());
    }
}
