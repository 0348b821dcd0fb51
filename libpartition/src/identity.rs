use std::collections::{BTreeMap, HashMap};

use common::Inventory;
use log::{info, warn};

use crate::scheme::{PerfScheme, PerfSchemeEntry};

/// Name <-> UUID lookup built from the current inventory.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentities {
    name_to_uuid: HashMap<String, String>,
    uuid_to_name: HashMap<String, String>,
}

impl DeviceIdentities {
    /// Disks without a UUID have no durable identity and are left out.
    pub fn from_inventory(inventory: &Inventory) -> Self {
        let mut ids = DeviceIdentities::default();
        for disk in &inventory.disks {
            let Some(uuid) = disk.uuid.as_deref().filter(|u| !u.is_empty()) else {
                continue;
            };
            ids.name_to_uuid.insert(disk.name.clone(), uuid.to_string());
            ids.uuid_to_name.insert(uuid.to_string(), disk.name.clone());
        }
        ids
    }

    pub fn uuid_of(&self, name: &str) -> Option<&str> {
        self.name_to_uuid.get(name).map(String::as_str)
    }

    pub fn name_of(&self, uuid: &str) -> Option<&str> {
        self.uuid_to_name.get(uuid).map(String::as_str)
    }
}

/// A disk referenced by the scheme that is not in the inventory any more.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MissingDisk {
    pub disk_uuid: String,
    pub last_known_name: String,
}

/// Rewrite every device name in `scheme` to the current name of its disk.
///
/// Offsets, sizes and ids are untouched. Disks that cannot be found keep
/// their old name and are returned to the caller.
pub fn resolve_device_names(scheme: &mut PerfScheme, ids: &DeviceIdentities) -> Vec<MissingDisk> {
    let mut missing = BTreeMap::new();
    let mut resolve = |device: &mut String, disk_uuid: &str| match ids.name_of(disk_uuid) {
        Some(name) if name != device.as_str() => {
            info!("disk {disk_uuid} was renamed from {device} to {name}");
            *device = name.to_string();
        }
        Some(_) => {}
        None => {
            missing
                .entry(disk_uuid.to_string())
                .or_insert_with(|| device.clone());
        }
    };

    for entry in &mut scheme.entries {
        for details in entry.partitions.values_mut() {
            resolve(&mut details.device, &details.disk_uuid);
        }
    }
    if let Some(metadata) = scheme.metadata.as_mut() {
        resolve(&mut metadata.device, &metadata.disk_uuid);
    }

    let missing: Vec<MissingDisk> = missing
        .into_iter()
        .map(|(disk_uuid, last_known_name)| MissingDisk {
            disk_uuid,
            last_known_name,
        })
        .collect();
    for m in &missing {
        warn!(
            "disk {} (last seen as {}) is referenced by the partition scheme but missing",
            m.disk_uuid, m.last_known_name
        );
    }
    missing
}

/// Disks of `entry` that are absent from the inventory.
pub fn missing_disks_for_entry(entry: &PerfSchemeEntry, ids: &DeviceIdentities) -> Vec<MissingDisk> {
    let mut missing: Vec<MissingDisk> = entry
        .partitions
        .values()
        .filter(|p| ids.name_of(&p.disk_uuid).is_none())
        .map(|p| MissingDisk {
            disk_uuid: p.disk_uuid.clone(),
            last_known_name: p.device.clone(),
        })
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// Whether the disk currently named `name` already carries committed
/// partitions, either for an OSD or as the metadata device.
pub fn is_device_in_use(name: &str, ids: &DeviceIdentities, scheme: &PerfScheme) -> bool {
    let Some(uuid) = ids.uuid_of(name) else {
        return false;
    };
    let used_by_entry = scheme
        .entries
        .iter()
        .any(|e| e.partitions.values().any(|p| p.disk_uuid == uuid));
    used_by_entry
        || scheme
            .metadata
            .as_ref()
            .is_some_and(|m| m.disk_uuid == uuid)
}
