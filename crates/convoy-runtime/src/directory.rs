use crate::RuntimeError;
use convoy_schema::{Device, DeviceAuth, DeviceUuid};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Read access to the device records owned by the rest of the system.
pub trait DeviceDirectory: Send + Sync {
    fn device(&self, uuid: &DeviceUuid) -> Result<Device, RuntimeError>;

    fn device_auth(&self, uuid: &DeviceUuid) -> Result<DeviceAuth, RuntimeError>;

    /// Every enabled device, in a stable order.
    fn devices_to_watch(&self) -> Result<Vec<Device>, RuntimeError>;
}

/// In-memory directory, filled from the fleet file or by tests.
#[derive(Default)]
pub struct StaticDirectory {
    entries: RwLock<BTreeMap<DeviceUuid, (Device, DeviceAuth)>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = (Device, DeviceAuth)>) -> Self {
        let dir = Self::new();
        for (device, auth) in devices {
            dir.upsert(device, auth);
        }
        dir
    }

    pub fn upsert(&self, device: Device, auth: DeviceAuth) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(device.uuid.clone(), (device, auth));
    }

    pub fn remove(&self, uuid: &DeviceUuid) -> Option<Device> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(uuid).map(|(device, _)| device)
    }

    fn lookup<T>(
        &self,
        uuid: &DeviceUuid,
        pick: impl FnOnce(&(Device, DeviceAuth)) -> T,
    ) -> Result<T, RuntimeError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .get(uuid)
            .map(pick)
            .ok_or_else(|| RuntimeError::NotFound(format!("device {uuid}")))
    }
}

impl DeviceDirectory for StaticDirectory {
    fn device(&self, uuid: &DeviceUuid) -> Result<Device, RuntimeError> {
        self.lookup(uuid, |(device, _)| device.clone())
    }

    fn device_auth(&self, uuid: &DeviceUuid) -> Result<DeviceAuth, RuntimeError> {
        self.lookup(uuid, |(_, auth)| auth.clone())
    }

    fn devices_to_watch(&self) -> Result<Vec<Device>, RuntimeError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(entries
            .values()
            .filter(|(device, _)| device.enabled)
            .map(|(device, _)| device.clone())
            .collect())
    }
}
