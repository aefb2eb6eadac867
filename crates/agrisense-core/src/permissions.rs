//! Platform permission gating.
//!
//! The platform dialogs that obtain permissions live outside this crate.
//! Scanners and the supervisor only ask a [`PermissionGate`] whether the
//! precondition holds and fail fast with [`Error::PermissionDenied`] when it
//! does not.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agrisense_types::Transport;

use crate::error::{Error, Result};

/// A platform permission required by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Local network access (WiFi scan and fetch).
    Network,
    /// Bluetooth scan and connect.
    Bluetooth,
    /// Location, which mobile platforms require for BLE scanning.
    Location,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Network => write!(f, "network"),
            Permission::Bluetooth => write!(f, "bluetooth"),
            Permission::Location => write!(f, "location"),
        }
    }
}

impl Permission {
    /// Permissions a transport needs before any scan or connect.
    pub fn required_for(transport: Transport) -> &'static [Permission] {
        match transport {
            Transport::Wifi => &[Permission::Network],
            Transport::Ble => &[Permission::Bluetooth, Permission::Location],
        }
    }
}

/// Answers whether a permission has been granted.
pub trait PermissionGate: Send + Sync {
    /// Whether `permission` is currently granted.
    fn is_granted(&self, permission: Permission) -> bool;

    /// Check every permission the transport needs.
    ///
    /// Returns the first missing permission as [`Error::PermissionDenied`].
    fn require(&self, transport: Transport) -> Result<()> {
        match Permission::required_for(transport)
            .iter()
            .find(|p| !self.is_granted(**p))
        {
            Some(missing) => Err(Error::PermissionDenied(*missing)),
            None => Ok(()),
        }
    }
}

/// Permission flags that can be flipped at runtime.
///
/// Cloning shares the flags, so a host application can revoke a permission
/// after handing the gate to the supervisor.
#[derive(Debug, Clone)]
pub struct Permissions {
    network: Arc<AtomicBool>,
    bluetooth: Arc<AtomicBool>,
    location: Arc<AtomicBool>,
}

impl Default for Permissions {
    fn default() -> Self {
        Self::granted()
    }
}

impl Permissions {
    /// Every permission granted.
    pub fn granted() -> Self {
        Self::new(true, true, true)
    }

    /// Every permission denied.
    pub fn denied() -> Self {
        Self::new(false, false, false)
    }

    /// Explicit flags.
    pub fn new(network: bool, bluetooth: bool, location: bool) -> Self {
        Self {
            network: Arc::new(AtomicBool::new(network)),
            bluetooth: Arc::new(AtomicBool::new(bluetooth)),
            location: Arc::new(AtomicBool::new(location)),
        }
    }

    /// Grant or revoke one permission.
    pub fn set(&self, permission: Permission, granted: bool) {
        self.flag(permission).store(granted, Ordering::SeqCst);
    }

    fn flag(&self, permission: Permission) -> &AtomicBool {
        match permission {
            Permission::Network => &self.network,
            Permission::Bluetooth => &self.bluetooth,
            Permission::Location => &self.location,
        }
    }
}

impl PermissionGate for Permissions {
    fn is_granted(&self, permission: Permission) -> bool {
        self.flag(permission).load(Ordering::SeqCst)
    }
}
