//! Process-wide view of the connection held on each transport.
//!
//! The registry is a projection kept up to date by
//! [`ConnectionSupervisor`](crate::ConnectionSupervisor), the only writer.
//! It has no transitions of its own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use time::OffsetDateTime;

use agrisense_types::{ConnectionHandle, ConnectionState, DeviceDescriptor, Transport};

/// Shared lookup table `Transport -> ConnectionHandle`.
///
/// Cloning yields another view of the same table.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Transport, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle registered for a transport.
    pub fn get(&self, transport: Transport) -> Option<ConnectionHandle> {
        self.read(|map| map.get(&transport).cloned())
    }

    /// Whether the transport has a `Connected` handle.
    pub fn is_connected(&self, transport: Transport) -> bool {
        self.read(|map| {
            map.get(&transport)
                .is_some_and(|h| h.state == ConnectionState::Connected)
        })
    }

    /// All registered handles, in transport order.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        let mut handles = self.read(|map| map.values().cloned().collect::<Vec<_>>());
        handles.sort_by_key(|h| h.transport);
        handles
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.read(|map| map.len())
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(
        &self,
        descriptor: &DeviceDescriptor,
        state: ConnectionState,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle {
            transport: descriptor.transport(),
            address: descriptor.address().to_string(),
            display_name: descriptor.display_name().to_string(),
            state,
            connected_at: OffsetDateTime::now_utc(),
        };
        self.write(|map| map.insert(handle.transport, handle.clone()));
        handle
    }

    pub(crate) fn set_state(&self, transport: Transport, state: ConnectionState) -> bool {
        self.write(|map| match map.get_mut(&transport) {
            Some(handle) => {
                handle.state = state;
                true
            }
            None => false,
        })
    }

    pub(crate) fn remove(&self, transport: Transport) -> Option<ConnectionHandle> {
        self.write(|map| map.remove(&transport))
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<Transport, ConnectionHandle>) -> T) -> T {
        // The table holds plain data, so a poisoned lock is still consistent.
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<Transport, ConnectionHandle>) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
