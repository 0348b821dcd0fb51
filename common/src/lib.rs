use serde::{Deserialize, Serialize};

/// Numeric identity the monitor hands out for every OSD.
pub type OsdId = u32;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// A block device visible to the node.
///
/// `name` is whatever the kernel called the device on this boot and may point
/// at a different disk after a reboot. `uuid` is the GPT disk GUID and is the
/// only identity that survives renames. Disks that were never partitioned by
/// the agent have no UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDisk {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl LocalDisk {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        LocalDisk {
            name: name.into(),
            size,
            uuid: None,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn size_mb(&self) -> u64 {
        self.size / BYTES_PER_MB
    }

    pub fn dev_path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// Read-only snapshot of the local hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub disks: Vec<LocalDisk>,
}

impl Inventory {
    pub fn new(disks: Vec<LocalDisk>) -> Self {
        Inventory { disks }
    }

    pub fn disk_by_name(&self, name: &str) -> Option<&LocalDisk> {
        self.disks.iter().find(|d| d.name == name)
    }

    pub fn disk_by_uuid(&self, uuid: &str) -> Option<&LocalDisk> {
        self.disks
            .iter()
            .find(|d| d.uuid.as_deref() == Some(uuid))
    }
}
