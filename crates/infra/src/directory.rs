//! Device directory port (external collaborator, read-only).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use postrelay_core::{DeviceId, GroupId, TenantId};

/// Directory lookup error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("device directory unavailable: {0}")]
    Unavailable(String),
}

/// What the queue needs to know about a device: identity, tenant
/// membership, and an optional single-group affinity restricting which
/// jobs it may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub affinity_group: Option<GroupId>,
}

/// Read-only view of the device registry owned by the device-management
/// collaborator.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// `None` when the device does not exist or belongs to another tenant.
    async fn lookup(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<Option<DeviceRecord>, DirectoryError>;
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeviceDirectory {
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
}

impl InMemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: DeviceRecord) {
        self.devices
            .write()
            .expect("directory lock poisoned")
            .insert(record.device_id, record);
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDeviceDirectory {
    async fn lookup(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<Option<DeviceRecord>, DirectoryError> {
        let devices = self
            .devices
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".to_string()))?;
        Ok(devices
            .get(&device_id)
            .filter(|d| d.tenant_id == tenant_id)
            .copied())
    }
}
