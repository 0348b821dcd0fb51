//! Turning the desired device set into a partition scheme for this pass.

use std::collections::BTreeSet;

use common::OsdId;
use libpartition::{
    BluestoreConfig, DeviceIdentities, MetadataDeviceInfo, MissingDisk, PerfScheme,
    PerfSchemeEntry, SchemeError, is_device_in_use, resolve_device_names,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::mon::{MonConnection, MonError};
use crate::state::{DesiredDeviceSet, MetadataRole, OsdIdAssignment};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error("only one metadata device per node is supported, desired: {0:?}")]
    MultipleMetadataDevices(Vec<String>),
    #[error("metadata device {desired} differs from committed metadata device {committed}")]
    ConflictingMetadataDevice { desired: String, committed: String },
    #[error("metadata device {device} holds the data of osd.{id}")]
    MetadataDeviceHoldsData { device: String, id: OsdId },
}

impl PlanError {
    /// The metadata device(s) a conflict is about.
    pub fn metadata_device(&self) -> Option<String> {
        match self {
            PlanError::Scheme(_) => None,
            PlanError::MultipleMetadataDevices(names) => Some(names.join(",")),
            PlanError::ConflictingMetadataDevice { desired, .. } => Some(desired.clone()),
            PlanError::MetadataDeviceHoldsData { device, .. } => Some(device.clone()),
        }
    }
}

/// Scheme for one pass plus what the planner learned on the way.
#[derive(Debug, Default)]
pub struct SchemePlan {
    pub scheme: PerfScheme,
    /// Entries that were added in this pass and still need partitioning.
    pub new_entries: BTreeSet<OsdId>,
    /// Metadata partitions that already existed before this pass.
    pub committed_metadata_partitions: usize,
    pub missing: Vec<MissingDisk>,
    /// Devices that could not get an OSD id.
    pub failed: Vec<(String, MonError)>,
    /// Why the desired metadata device cannot be used in this pass.
    pub metadata_conflict: Option<PlanError>,
    /// New data devices left waiting on the unusable metadata device.
    pub blocked: Vec<String>,
}

impl SchemePlan {
    pub fn is_new(&self, id: OsdId) -> bool {
        self.new_entries.contains(&id)
    }

    /// Whether the metadata device needs new partitions in this pass.
    pub fn has_new_metadata_partitions(&self) -> bool {
        self.scheme
            .metadata
            .as_ref()
            .is_some_and(|m| m.partitions.len() > self.committed_metadata_partitions)
    }
}

/// The single metadata device new entries may use.
fn usable_metadata_device(
    candidates: Vec<String>,
    ids: &DeviceIdentities,
    scheme: &PerfScheme,
) -> Result<Option<String>, PlanError> {
    if candidates.len() > 1 {
        return Err(PlanError::MultipleMetadataDevices(candidates));
    }
    let Some(desired) = candidates.into_iter().next() else {
        return Ok(None);
    };
    let uuid = ids.uuid_of(&desired);
    if let Some(committed) = &scheme.metadata {
        if uuid != Some(committed.disk_uuid.as_str()) {
            return Err(PlanError::ConflictingMetadataDevice {
                desired,
                committed: committed.device.clone(),
            });
        }
    }
    let Some(uuid) = uuid else {
        return Ok(Some(desired));
    };
    if let Some(entry) = scheme.entries.iter().find(|e| e.data_disk_uuid() == Some(uuid)) {
        return Err(PlanError::MetadataDeviceHoldsData {
            device: desired,
            id: entry.id,
        });
    }
    Ok(Some(desired))
}

/// Plan the partition scheme for `devices`.
///
/// Devices already committed keep their entries. Every other data device gets
/// an id from the monitor and is laid out collocated, or distributed when a
/// metadata device is desired. `devices` is updated with the new assignments.
///
/// When the desired metadata device cannot be used, committed entries are
/// still planned and the new data devices are returned in `blocked`.
pub async fn plan_partition_scheme(
    ctx: &Context,
    conn: &dyn MonConnection,
    devices: &mut DesiredDeviceSet,
    config: &BluestoreConfig,
) -> Result<SchemePlan, PlanError> {
    let mut scheme = PerfScheme::load(&ctx.config_dir)?;
    let ids = DeviceIdentities::from_inventory(&ctx.inventory);
    let missing = resolve_device_names(&mut scheme, &ids);
    let committed_metadata_partitions = scheme.metadata.as_ref().map_or(0, |m| m.partitions.len());

    let metadata_devices: Vec<String> = devices
        .entries
        .iter()
        .filter(|(_, e)| e.is_metadata_device())
        .map(|(name, _)| name.clone())
        .collect();
    let (metadata_device, metadata_conflict) =
        match usable_metadata_device(metadata_devices, &ids, &scheme) {
            Ok(device) => (device, None),
            Err(e) => {
                warn!("metadata device is unusable, new data devices wait: {e}");
                (None, Some(e))
            }
        };

    let wanted: Vec<String> = devices
        .entries
        .iter()
        .filter(|(name, e)| e.wants_data() && !is_device_in_use(name, &ids, &scheme))
        .map(|(name, _)| name.clone())
        .collect();

    let mut new_entries = BTreeSet::new();
    let mut failed = Vec::new();
    let mut blocked = Vec::new();
    for name in wanted {
        if metadata_conflict.is_some() {
            blocked.push(name);
            continue;
        }
        let osd_uuid = Uuid::new_v4();
        let id = match conn.create_osd(osd_uuid).await {
            Ok(id) => id,
            Err(e) => {
                warn!(device = name, "failed to get an osd id: {e}");
                failed.push((name, e));
                continue;
            }
        };

        let mut entry = PerfSchemeEntry::new(id, osd_uuid);
        match &metadata_device {
            Some(metadata_name) => {
                let metadata = scheme
                    .metadata
                    .get_or_insert_with(|| MetadataDeviceInfo::new(metadata_name.clone()));
                entry.populate_distributed(&name, metadata, config);
                if let Some(device) = devices.entries.get_mut(&name) {
                    device.data = OsdIdAssignment::Assigned(id);
                }
                if let Some(MetadataRole::Serves(consumers)) = devices
                    .entries
                    .get_mut(metadata_name)
                    .map(|e| &mut e.metadata)
                {
                    consumers.push(id);
                }
                info!(device = name, osd = id, metadata = metadata_name, "planned distributed osd");
            }
            None => {
                entry.populate_collocated(&name, config);
                if let Some(device) = devices.entries.get_mut(&name) {
                    device.data = OsdIdAssignment::Assigned(id);
                    device.metadata = MetadataRole::Serves(vec![id]);
                }
                info!(device = name, osd = id, "planned collocated osd");
            }
        }
        new_entries.insert(id);
        scheme.entries.push(entry);
    }

    Ok(SchemePlan {
        scheme,
        new_entries,
        committed_metadata_partitions,
        missing,
        failed,
        metadata_conflict,
        blocked,
    })
}

/// Partition scheme for `devices`, see [`plan_partition_scheme`].
pub async fn get_partition_perf_scheme(
    ctx: &Context,
    conn: &dyn MonConnection,
    devices: &mut DesiredDeviceSet,
    config: &BluestoreConfig,
) -> Result<PerfScheme, PlanError> {
    Ok(plan_partition_scheme(ctx, conn, devices, config)
        .await?
        .scheme)
}
