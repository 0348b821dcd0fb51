//! Desired and applied OSD assignments as kept in the configuration store.
//!
//! ```text
//! osd/desired/<node>/device/<diskUUID>/osd-id-data       "<id>"
//! osd/desired/<node>/device/<diskUUID>/osd-id-metadata   "<id>,<id>,..."
//! osd/desired/<node>/dir/<sanitized>/path                "<original path>"
//! osd/desired/<node>/dir/<sanitized>/osd-id-data         "<id>"
//! osd/applied/<node>/<id>/data-disk-uuid                 "<diskUUID>"
//! ```

use std::collections::BTreeMap;

use common::{Inventory, OsdId};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::store::{ConfigStore, StoreError};

pub const CEPH_KEY: &str = "/rk8s/services/ceph";
const OSD_KEY: &str = "osd";
const DESIRED_KEY: &str = "desired";
const APPLIED_KEY: &str = "applied";
const DEVICE_KEY: &str = "device";
const DIR_KEY: &str = "dir";
const DIR_PATH_KEY: &str = "path";
const OSD_ID_DATA_KEY: &str = "osd-id-data";
const OSD_ID_METADATA_KEY: &str = "osd-id-metadata";
const DATA_DISK_UUID_KEY: &str = "data-disk-uuid";

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed value {value:?} at {key}")]
    Parse { key: String, value: String },
}

/// A stored value that could not be parsed. Only the device or directory it
/// belongs to is affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    /// Disk UUID for devices, original path for directories.
    pub owner: String,
    pub key: String,
    pub value: String,
}

impl From<MalformedEntry> for StateError {
    fn from(entry: MalformedEntry) -> Self {
        StateError::Parse {
            key: entry.key,
            value: entry.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsdIdAssignment {
    #[default]
    Unassigned,
    Assigned(OsdId),
}

impl OsdIdAssignment {
    pub fn id(&self) -> Option<OsdId> {
        match self {
            OsdIdAssignment::Unassigned => None,
            OsdIdAssignment::Assigned(id) => Some(*id),
        }
    }

    pub fn is_unassigned(&self) -> bool {
        matches!(self, OsdIdAssignment::Unassigned)
    }
}

/// Whether a device hosts WAL/DB partitions, and for which OSDs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MetadataRole {
    #[default]
    NotMetadata,
    Serves(Vec<OsdId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceOsdIdEntry {
    pub data: OsdIdAssignment,
    pub metadata: MetadataRole,
}

impl DeviceOsdIdEntry {
    /// A device that should become a data device.
    pub fn unassigned() -> Self {
        Self::default()
    }

    /// The node's shared metadata device before it serves anyone.
    pub fn metadata_device() -> Self {
        DeviceOsdIdEntry {
            data: OsdIdAssignment::Unassigned,
            metadata: MetadataRole::Serves(Vec::new()),
        }
    }

    pub fn collocated(id: OsdId) -> Self {
        DeviceOsdIdEntry {
            data: OsdIdAssignment::Assigned(id),
            metadata: MetadataRole::Serves(vec![id]),
        }
    }

    pub fn wants_data(&self) -> bool {
        self.data.is_unassigned() && self.metadata == MetadataRole::NotMetadata
    }

    /// True for a device that carries WAL/DB partitions of other OSDs, or
    /// is configured to. A collocated device only serves its own OSD.
    pub fn is_metadata_device(&self) -> bool {
        match (&self.data, &self.metadata) {
            (_, MetadataRole::NotMetadata) => false,
            (OsdIdAssignment::Unassigned, MetadataRole::Serves(_)) => true,
            (OsdIdAssignment::Assigned(id), MetadataRole::Serves(ids)) => !ids.contains(id),
        }
    }
}

/// Desired devices keyed by their current device name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DesiredDeviceSet {
    pub entries: BTreeMap<String, DeviceOsdIdEntry>,
    /// Persisted devices whose record could not be read, by disk UUID.
    pub malformed: Vec<MalformedEntry>,
}

impl DesiredDeviceSet {
    pub fn metadata_device(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, e)| e.is_metadata_device())
            .map(|(name, _)| name.as_str())
    }
}

impl DesiredDeviceSet {
    pub fn is_malformed(&self, disk_uuid: &str) -> bool {
        self.malformed.iter().any(|m| m.owner == disk_uuid)
    }
}

/// Desired devices as persisted, keyed by disk UUID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedDevices {
    pub entries: BTreeMap<String, DeviceOsdIdEntry>,
    pub malformed: Vec<MalformedEntry>,
}

impl SavedDevices {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.malformed.is_empty()
    }
}

/// Desired directories keyed by their original path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DesiredDirSet {
    pub entries: BTreeMap<String, OsdIdAssignment>,
    pub malformed: Vec<MalformedEntry>,
}

fn desired_node_key(node: &str) -> String {
    format!("{CEPH_KEY}/{OSD_KEY}/{DESIRED_KEY}/{node}")
}

fn desired_devices_key(node: &str) -> String {
    format!("{}/{DEVICE_KEY}", desired_node_key(node))
}

fn desired_device_key(node: &str, disk_uuid: &str) -> String {
    format!("{}/{disk_uuid}", desired_devices_key(node))
}

fn desired_dirs_key(node: &str) -> String {
    format!("{}/{DIR_KEY}", desired_node_key(node))
}

fn desired_dir_key(node: &str, path: &str) -> String {
    format!("{}/{}", desired_dirs_key(node), sanitize_path(path))
}

fn applied_node_key(node: &str) -> String {
    format!("{CEPH_KEY}/{OSD_KEY}/{APPLIED_KEY}/{node}")
}

/// `/my/dir` -> `my_dir`
pub fn sanitize_path(path: &str) -> String {
    NON_ALPHANUMERIC
        .replace_all(path, "_")
        .trim_matches('_')
        .to_string()
}

fn parse_osd_id(key: &str, value: &str) -> Result<OsdId, StateError> {
    value.trim().parse().map_err(|_| StateError::Parse {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_osd_ids(key: &str, value: &str) -> Result<Vec<OsdId>, StateError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| parse_osd_id(key, v))
        .collect()
}

fn join_osd_ids(ids: &[OsdId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub async fn add_desired_device(
    store: &dyn ConfigStore,
    node: &str,
    disk_uuid: &str,
    id: OsdId,
) -> Result<(), StateError> {
    let key = format!("{}/{OSD_ID_DATA_KEY}", desired_device_key(node, disk_uuid));
    store.set(&key, &id.to_string()).await?;
    Ok(())
}

pub async fn set_desired_metadata(
    store: &dyn ConfigStore,
    node: &str,
    disk_uuid: &str,
    ids: &[OsdId],
) -> Result<(), StateError> {
    let key = format!(
        "{}/{OSD_ID_METADATA_KEY}",
        desired_device_key(node, disk_uuid)
    );
    store.set(&key, &join_osd_ids(ids)).await?;
    Ok(())
}

pub async fn remove_desired_device(
    store: &dyn ConfigStore,
    node: &str,
    disk_uuid: &str,
) -> Result<(), StateError> {
    store.delete(&desired_device_key(node, disk_uuid)).await?;
    Ok(())
}

async fn load_device_entry(
    store: &dyn ConfigStore,
    device_key: &str,
) -> Result<DeviceOsdIdEntry, StateError> {
    let data_key = format!("{device_key}/{OSD_ID_DATA_KEY}");
    let data = match store.get(&data_key).await? {
        Some(v) if !v.trim().is_empty() => OsdIdAssignment::Assigned(parse_osd_id(&data_key, &v)?),
        _ => OsdIdAssignment::Unassigned,
    };

    let metadata_key = format!("{device_key}/{OSD_ID_METADATA_KEY}");
    let metadata = match store.get(&metadata_key).await? {
        Some(v) => MetadataRole::Serves(parse_osd_ids(&metadata_key, &v)?),
        None => MetadataRole::NotMetadata,
    };

    Ok(DeviceOsdIdEntry { data, metadata })
}

/// Desired devices as persisted, keyed by disk UUID. A device whose record
/// does not parse is set aside in `malformed`; store errors are returned.
pub async fn load_saved_devices(
    store: &dyn ConfigStore,
    node: &str,
) -> Result<SavedDevices, StateError> {
    let mut saved = SavedDevices::default();
    for disk_uuid in store.child_dirs(&desired_devices_key(node)).await? {
        let device_key = desired_device_key(node, &disk_uuid);
        match load_device_entry(store, &device_key).await {
            Ok(entry) => {
                saved.entries.insert(disk_uuid, entry);
            }
            Err(StateError::Parse { key, value }) => {
                warn!(disk_uuid, key, value, "skipping malformed desired device");
                saved.malformed.push(MalformedEntry {
                    owner: disk_uuid,
                    key,
                    value,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(saved)
}

/// Build this pass's desired device set.
///
/// Persisted entries are translated to current names; disks that are gone
/// from the inventory are left out. Configured names not seen yet are added
/// as new data devices, and the configured metadata device as an empty
/// metadata device; a former data device configured that way is marked as
/// serving nobody yet. A configured name whose persisted record is malformed is
/// left out so it is never mistaken for a blank disk.
pub async fn load_desired_devices(
    store: &dyn ConfigStore,
    node: &str,
    inventory: &Inventory,
    devices: &[String],
    metadata_device: Option<&str>,
) -> Result<DesiredDeviceSet, StateError> {
    let saved = load_saved_devices(store, node).await?;
    let mut desired = DesiredDeviceSet {
        entries: BTreeMap::new(),
        malformed: saved.malformed,
    };

    for (disk_uuid, entry) in saved.entries {
        match inventory.disk_by_uuid(&disk_uuid) {
            Some(disk) => {
                desired.entries.insert(disk.name.clone(), entry);
            }
            None => debug!(disk_uuid, "desired disk is not in the inventory"),
        }
    }

    let is_malformed = |name: &str| {
        inventory
            .disk_by_name(name)
            .and_then(|disk| disk.uuid.as_deref())
            .is_some_and(|uuid| desired.is_malformed(uuid))
    };
    let configured: Vec<&String> = devices
        .iter()
        .filter(|d| !d.is_empty() && !is_malformed(d.as_str()))
        .collect();
    let metadata_device = metadata_device.filter(|d| !d.is_empty() && !is_malformed(*d));

    for name in configured {
        desired
            .entries
            .entry(name.clone())
            .or_insert_with(DeviceOsdIdEntry::unassigned);
    }
    if let Some(name) = metadata_device {
        let entry = desired
            .entries
            .entry(name.to_string())
            .or_insert_with(DeviceOsdIdEntry::metadata_device);
        if entry.metadata == MetadataRole::NotMetadata {
            entry.metadata = MetadataRole::Serves(Vec::new());
        }
    }

    Ok(desired)
}

/// Add `path` as a desired directory. An existing assignment is kept.
pub async fn add_desired_dir(
    store: &dyn ConfigStore,
    path: &str,
    node: &str,
) -> Result<(), StateError> {
    let key = format!("{}/{DIR_PATH_KEY}", desired_dir_key(node, path));
    store.set(&key, path).await?;
    Ok(())
}

pub async fn set_desired_dir_osd(
    store: &dyn ConfigStore,
    node: &str,
    path: &str,
    id: OsdId,
) -> Result<(), StateError> {
    let dir_key = desired_dir_key(node, path);
    store
        .set(&format!("{dir_key}/{DIR_PATH_KEY}"), path)
        .await?;
    store
        .set(&format!("{dir_key}/{OSD_ID_DATA_KEY}"), &id.to_string())
        .await?;
    Ok(())
}

pub async fn load_desired_dirs(
    store: &dyn ConfigStore,
    node: &str,
) -> Result<DesiredDirSet, StateError> {
    let mut dirs = DesiredDirSet::default();
    let dirs_key = desired_dirs_key(node);
    for name in store.child_dirs(&dirs_key).await? {
        let dir_key = format!("{dirs_key}/{name}");
        let Some(path) = store.get(&format!("{dir_key}/{DIR_PATH_KEY}")).await? else {
            debug!(dir = name, "desired dir has no path, skipping");
            continue;
        };
        let id_key = format!("{dir_key}/{OSD_ID_DATA_KEY}");
        let assignment = match store.get(&id_key).await? {
            Some(v) if !v.trim().is_empty() => match parse_osd_id(&id_key, &v) {
                Ok(id) => OsdIdAssignment::Assigned(id),
                Err(_) => {
                    warn!(path, key = id_key, value = v, "skipping malformed desired dir");
                    dirs.malformed.push(MalformedEntry {
                        owner: path,
                        key: id_key,
                        value: v,
                    });
                    continue;
                }
            },
            _ => OsdIdAssignment::Unassigned,
        };
        dirs.entries.insert(path, assignment);
    }
    Ok(dirs)
}

/// OSD id -> data disk UUID of everything recorded as running on `node`.
pub async fn get_applied_osds(
    node: &str,
    store: &dyn ConfigStore,
) -> Result<BTreeMap<OsdId, String>, StateError> {
    let mut applied = BTreeMap::new();
    let node_key = applied_node_key(node);
    for id in store.child_dirs(&node_key).await? {
        let id_key = format!("{node_key}/{id}");
        let osd_id = parse_osd_id(&id_key, &id)?;
        let disk_uuid = store
            .get(&format!("{id_key}/{DATA_DISK_UUID_KEY}"))
            .await?
            .unwrap_or_default();
        applied.insert(osd_id, disk_uuid);
    }
    Ok(applied)
}

pub async fn mark_osd_applied(
    store: &dyn ConfigStore,
    node: &str,
    id: OsdId,
    data_disk_uuid: &str,
) -> Result<(), StateError> {
    let key = format!("{}/{id}/{DATA_DISK_UUID_KEY}", applied_node_key(node));
    store.set(&key, data_disk_uuid).await?;
    info!(osd = id, node, "osd marked as applied");
    Ok(())
}

pub async fn remove_applied_osd(
    store: &dyn ConfigStore,
    node: &str,
    id: OsdId,
) -> Result<(), StateError> {
    store
        .delete(&format!("{}/{id}", applied_node_key(node)))
        .await?;
    Ok(())
}
