use std::collections::HashMap;

use async_trait::async_trait;

use super::{DeviceRecord, Directory, DirectoryError};

/// Directory held entirely in memory, seeded from the config file
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    devices: HashMap<String, DeviceRecord>,
    persons: HashMap<String, String>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, record: DeviceRecord) -> Self {
        self.devices.insert(record.device_id.clone(), record);
        self
    }

    pub fn with_person(mut self, identity: impl Into<String>, name: impl Into<String>) -> Self {
        self.persons.insert(identity.into(), name.into());
        self
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError> {
        Ok(self.devices.get(device_id).cloned())
    }

    async fn recognition_endpoint(&self, device_id: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .devices
            .get(device_id)
            .and_then(|d| d.recognition_endpoint.clone()))
    }

    async fn person_name(&self, identity: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.persons.get(identity).cloned())
    }
}
