//! Port-Mapping Table Manager.
//!
//! The table is a fixed array of [`IP_PORTMAP_MAX`] slots mirrored to the
//! Persistent Store as one blob under [`keys::PORTMAP_TABLE`]. Every
//! mutation follows the same order while holding the table lock:
//!
//! 1. update a copy of the table
//! 2. write the whole blob and commit it
//! 3. swap the copy in and update the NAT engine
//!
//! A failed write leaves both the in-memory table and the store untouched.
//! A failed engine call is logged and repaired by the next [`PortMapManager::reapply`].
//!
//! # Blob layout
//!
//! Each slot is [`SLOT_SIZE`] bytes:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | internal address, network order |
//! | 4 | 2 | external port, little endian |
//! | 6 | 2 | internal port, little endian |
//! | 8 | 1 | IP protocol number (6 or 17) |
//! | 9 | 1 | valid flag |
//! | 10 | 2 | reserved, zero |
//!
//! Free slots are written as zeros. There is no version field; a blob of
//! any other length is treated as corrupt.

use std::fmt;
use std::io::{Cursor, Read};
use std::net::Ipv4Addr;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use router_common::keys;
use router_common::{OpenMode, PersistentStore, RouterError, RouterResult};
use router_types::Protocol;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::nat::NatEngine;

/// Number of slots in the port-mapping table.
pub const IP_PORTMAP_MAX: usize = 32;

/// Serialized size of one slot.
pub const SLOT_SIZE: usize = 12;

/// Serialized size of the whole table.
pub const TABLE_BLOB_LEN: usize = IP_PORTMAP_MAX * SLOT_SIZE;

/// An inbound port forwarding rule.
///
/// `(protocol, external_port)` identifies the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub external_port: u16,
    pub internal_addr: Ipv4Addr,
    pub internal_port: u16,
}

impl PortMapping {
    pub const fn new(
        protocol: Protocol,
        external_port: u16,
        internal_addr: Ipv4Addr,
        internal_port: u16,
    ) -> Self {
        Self {
            protocol,
            external_port,
            internal_addr,
            internal_port,
        }
    }

    /// Returns the identifying `(protocol, external_port)` pair.
    pub const fn key(&self) -> (Protocol, u16) {
        (self.protocol, self.external_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{}",
            self.protocol, self.external_port, self.internal_addr, self.internal_port
        )
    }
}

/// Fixed-capacity table of port mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapTable {
    slots: [Option<PortMapping>; IP_PORTMAP_MAX],
}

impl Default for PortMapTable {
    fn default() -> Self {
        Self {
            slots: [None; IP_PORTMAP_MAX],
        }
    }
}

impl PortMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn capacity(&self) -> usize {
        IP_PORTMAP_MAX
    }

    /// Number of valid slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Returns the slot holding `(protocol, external_port)`.
    pub fn find(&self, protocol: Protocol, external_port: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(m) if m.key() == (protocol, external_port)))
    }

    /// Returns the lowest free slot index.
    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn slot(&self, index: usize) -> Option<&PortMapping> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Valid mappings in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &PortMapping> {
        self.slots.iter().flatten()
    }

    /// Stores `mapping` and returns its slot.
    ///
    /// An existing mapping with the same key is replaced in its slot;
    /// otherwise the first free slot is used.
    pub fn insert(&mut self, mapping: PortMapping) -> RouterResult<usize> {
        let index = match self.find(mapping.protocol, mapping.external_port) {
            Some(index) => index,
            None => self.first_free().ok_or(RouterError::TableFull {
                capacity: IP_PORTMAP_MAX,
            })?,
        };
        self.slots[index] = Some(mapping);
        Ok(index)
    }

    /// Frees the slot holding `(protocol, external_port)`.
    pub fn remove(&mut self, protocol: Protocol, external_port: u16) -> Option<PortMapping> {
        let index = self.find(protocol, external_port)?;
        self.slots[index].take()
    }

    /// Serializes every slot, free ones included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TABLE_BLOB_LEN);
        for slot in &self.slots {
            match slot {
                Some(m) => {
                    buf.extend_from_slice(&m.internal_addr.octets());
                    // Writes into a Vec cannot fail.
                    let _ = buf.write_u16::<LittleEndian>(m.external_port);
                    let _ = buf.write_u16::<LittleEndian>(m.internal_port);
                    buf.push(m.protocol.number());
                    buf.push(1);
                    buf.extend_from_slice(&[0, 0]);
                }
                None => buf.extend_from_slice(&[0; SLOT_SIZE]),
            }
        }
        buf
    }

    /// Parses a stored blob.
    ///
    /// Fails with [`RouterError::StoreCorrupt`] on a length mismatch and
    /// with [`RouterError::Store`] when a valid slot carries an unknown
    /// protocol or repeats a key.
    pub fn decode(bytes: &[u8]) -> RouterResult<Self> {
        if bytes.len() != TABLE_BLOB_LEN {
            return Err(RouterError::StoreCorrupt {
                key: keys::PORTMAP_TABLE.to_string(),
                expected: TABLE_BLOB_LEN,
                actual: bytes.len(),
            });
        }

        let decode_err = |e: std::io::Error| {
            RouterError::store("decode", keys::PORTMAP_TABLE, e.to_string())
        };

        let mut table = Self::default();
        let mut cursor = Cursor::new(bytes);
        for index in 0..IP_PORTMAP_MAX {
            let mut addr = [0u8; 4];
            cursor.read_exact(&mut addr).map_err(decode_err)?;
            let external_port = cursor.read_u16::<LittleEndian>().map_err(decode_err)?;
            let internal_port = cursor.read_u16::<LittleEndian>().map_err(decode_err)?;
            let proto = cursor.read_u8().map_err(decode_err)?;
            let valid = cursor.read_u8().map_err(decode_err)?;
            let _reserved = cursor.read_u16::<LittleEndian>().map_err(decode_err)?;

            if valid == 0 {
                continue;
            }

            let protocol = Protocol::from_number(proto).ok_or_else(|| {
                RouterError::store(
                    "decode",
                    keys::PORTMAP_TABLE,
                    format!("slot {} has unknown protocol {}", index, proto),
                )
            })?;
            if table.find(protocol, external_port).is_some() {
                return Err(RouterError::store(
                    "decode",
                    keys::PORTMAP_TABLE,
                    format!("slot {} repeats {} {}", index, protocol, external_port),
                ));
            }
            table.slots[index] = Some(PortMapping::new(
                protocol,
                external_port,
                Ipv4Addr::from(addr),
                internal_port,
            ));
        }
        Ok(table)
    }
}

#[derive(Debug, Default)]
struct TableState {
    table: PortMapTable,
    /// Upstream address the engine's rules are currently bound to.
    public_addr: Option<Ipv4Addr>,
}

/// Owns the port-mapping table, its stored image and the engine's rules.
///
/// All operations serialize on one lock held across the mutate, persist
/// and engine-update sequence, so a management call racing a reconnect
/// cannot interleave with [`PortMapManager::reapply`].
pub struct PortMapManager {
    store: Arc<dyn PersistentStore>,
    namespace: String,
    engine: Arc<dyn NatEngine>,
    state: Mutex<TableState>,
}

impl PortMapManager {
    /// Creates a manager with an empty table.
    pub fn new(
        store: Arc<dyn PersistentStore>,
        namespace: impl Into<String>,
        engine: Arc<dyn NatEngine>,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            engine,
            state: Mutex::new(TableState::default()),
        }
    }

    /// Loads the stored table and returns the number of valid mappings.
    ///
    /// On any failure the table is empty afterwards. A corrupt blob is also
    /// overwritten with the empty table so the stored image matches memory.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn load(&self) -> RouterResult<usize> {
        let mut state = self.state.lock().await;
        state.table = PortMapTable::default();

        let blob = {
            let handle = self.store.open(&self.namespace, OpenMode::ReadOnly)?;
            handle.get_blob(keys::PORTMAP_TABLE)
        };

        let blob = match blob {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!("No stored port-mapping table");
                return Ok(0);
            }
            Err(e) => {
                warn!(error = %e, "Unreadable port-mapping table, starting empty");
                return Err(e);
            }
        };

        match PortMapTable::decode(&blob) {
            Ok(table) => {
                let count = table.len();
                state.table = table;
                info!(mappings = count, "Loaded port-mapping table");
                Ok(count)
            }
            Err(e) => {
                error!(error = %e, "Discarding corrupt port-mapping table");
                if let Err(persist_err) = self.persist(&state.table) {
                    warn!(error = %persist_err, "Failed to overwrite corrupt port-mapping table");
                }
                Err(e)
            }
        }
    }

    /// Adds or replaces the mapping for `(protocol, external_port)`.
    ///
    /// Fails with [`RouterError::TableFull`] when no slot is free, or with
    /// the store error when the table cannot be persisted; neither failure
    /// changes any state. Engine failures are logged only.
    #[instrument(skip(self), fields(protocol = %protocol, external_port = external_port))]
    pub async fn add(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_addr: Ipv4Addr,
        internal_port: u16,
    ) -> RouterResult<()> {
        let mapping = PortMapping::new(protocol, external_port, internal_addr, internal_port);
        let mut state = self.state.lock().await;

        let mut next = state.table.clone();
        let replaced = next
            .find(protocol, external_port)
            .and_then(|index| next.slot(index).copied());
        let slot = next.insert(mapping)?;
        self.persist(&next)?;
        state.table = next;

        if replaced.is_some() {
            self.engine_remove(protocol, external_port).await;
        }
        match state.public_addr {
            Some(public_addr) => {
                self.engine_install(public_addr, &mapping).await;
            }
            None => debug!("No upstream address yet, mapping is installed on the next reapply"),
        }

        info!(slot = slot, mapping = %mapping, replaced = replaced.is_some(), "Added port mapping");
        Ok(())
    }

    /// Removes the mapping for `(protocol, external_port)`.
    ///
    /// Removing an absent mapping succeeds without touching the store or
    /// the engine.
    #[instrument(skip(self), fields(protocol = %protocol, external_port = external_port))]
    pub async fn remove(&self, protocol: Protocol, external_port: u16) -> RouterResult<()> {
        let mut state = self.state.lock().await;

        let mut next = state.table.clone();
        let Some(removed) = next.remove(protocol, external_port) else {
            debug!("No such port mapping");
            return Ok(());
        };
        self.persist(&next)?;
        state.table = next;

        self.engine_remove(protocol, external_port).await;
        info!(mapping = %removed, "Removed port mapping");
        Ok(())
    }

    /// Rebinds every valid mapping to `public_addr`.
    ///
    /// All mappings are removed from the engine first, then reinstalled
    /// bound to the new address. Returns the number installed.
    #[instrument(skip(self), fields(public_addr = %public_addr))]
    pub async fn reapply(&self, public_addr: Ipv4Addr) -> usize {
        let mut state = self.state.lock().await;
        state.public_addr = Some(public_addr);

        for mapping in state.table.iter() {
            self.engine_remove(mapping.protocol, mapping.external_port)
                .await;
        }

        let mut installed = 0;
        for mapping in state.table.iter() {
            if self.engine_install(public_addr, mapping).await {
                installed += 1;
            }
        }

        let total = state.table.len();
        if installed == total {
            info!(mappings = installed, "Reapplied port mappings");
        } else {
            warn!(
                installed = installed,
                total = total,
                "Reapplied port mappings with engine failures"
            );
        }
        installed
    }

    /// Returns the valid mappings in slot order.
    pub async fn mappings(&self) -> Vec<PortMapping> {
        self.state.lock().await.table.iter().copied().collect()
    }

    /// Returns a copy of the in-memory table.
    pub async fn table(&self) -> PortMapTable {
        self.state.lock().await.table.clone()
    }

    /// Returns the address the mappings are currently bound to.
    pub async fn public_address(&self) -> Option<Ipv4Addr> {
        self.state.lock().await.public_addr
    }

    /// Logs one line per valid mapping.
    pub async fn log_table(&self) {
        let state = self.state.lock().await;
        let public = state
            .public_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        if state.table.is_empty() {
            info!("Port-mapping table is empty");
            return;
        }
        for m in state.table.iter() {
            info!(
                "{} {}:{} -> {}:{}",
                m.protocol, public, m.external_port, m.internal_addr, m.internal_port
            );
        }
    }

    fn persist(&self, table: &PortMapTable) -> RouterResult<()> {
        let mut handle = self.store.open(&self.namespace, OpenMode::ReadWrite)?;
        handle.set_blob(keys::PORTMAP_TABLE, &table.encode())?;
        handle.commit()?;
        debug!(mappings = table.len(), "Persisted port-mapping table");
        Ok(())
    }

    async fn engine_install(&self, public_addr: Ipv4Addr, mapping: &PortMapping) -> bool {
        match self.engine.add_portmap(public_addr, mapping).await {
            Ok(()) => true,
            Err(e) => {
                warn!(mapping = %mapping, error = %e, "NAT engine rejected port mapping");
                false
            }
        }
    }

    async fn engine_remove(&self, protocol: Protocol, external_port: u16) {
        if let Err(e) = self.engine.remove_portmap(protocol, external_port).await {
            warn!(
                protocol = %protocol,
                external_port = external_port,
                error = %e,
                "NAT engine failed to remove port mapping"
            );
        }
    }
}

impl fmt::Debug for PortMapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortMapManager")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
