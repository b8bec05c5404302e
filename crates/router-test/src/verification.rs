//! Verification helpers for router scenarios
//!
//! Checks the two consistency rules of the port-mapping table: the stored
//! blob is an exact image of the in-memory table, and the engine holds
//! exactly the valid mappings bound to the current public address.

use std::net::Ipv4Addr;

use natrouterd::{PortMapManager, PortMapTable, PortMapping};
use router_common::keys;
use router_common::{MemoryStore, RouterError, StoreValue};
use thiserror::Error;

use crate::fixtures::RecordingNatEngine;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("No port-mapping table in the store")]
    TableNotStored,

    #[error("Stored port-mapping table unreadable: {0}")]
    Decode(#[from] RouterError),

    #[error("Stored table differs from memory: stored {stored:?}, memory {memory:?}")]
    TableMismatch {
        stored: Vec<PortMapping>,
        memory: Vec<PortMapping>,
    },

    #[error("Engine rules differ from table: expected {expected:?}, found {actual:?}")]
    EngineMismatch {
        expected: Vec<(Ipv4Addr, PortMapping)>,
        actual: Vec<(Ipv4Addr, PortMapping)>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Reads and decodes the stored port-mapping table.
pub fn stored_table(store: &MemoryStore) -> VerifyResult<PortMapTable> {
    match store.value(keys::PARAM_NAMESPACE, keys::PORTMAP_TABLE) {
        Some(StoreValue::Blob(blob)) => Ok(PortMapTable::decode(&blob)?),
        _ => Err(VerificationError::TableNotStored),
    }
}

/// Verifies the stored blob decodes to exactly the in-memory table,
/// slot positions included.
pub async fn assert_store_matches_table(
    store: &MemoryStore,
    manager: &PortMapManager,
) -> VerifyResult<()> {
    let stored = stored_table(store)?;
    let memory = manager.table().await;
    if stored != memory {
        return Err(VerificationError::TableMismatch {
            stored: stored.iter().copied().collect(),
            memory: memory.iter().copied().collect(),
        });
    }
    Ok(())
}

/// Verifies the engine holds every valid mapping bound to `public_addr`
/// and nothing else.
pub async fn assert_engine_matches_table(
    engine: &RecordingNatEngine,
    manager: &PortMapManager,
    public_addr: Ipv4Addr,
) -> VerifyResult<()> {
    let mut expected: Vec<_> = manager
        .mappings()
        .await
        .into_iter()
        .map(|m| (public_addr, m))
        .collect();
    expected.sort_by_key(|(_, m)| m.key());

    let actual = engine.rules();
    if expected != actual {
        return Err(VerificationError::EngineMismatch { expected, actual });
    }
    Ok(())
}
