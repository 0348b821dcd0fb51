//! Argument builders for `sgdisk`.

use common::OsdId;
use uuid::Uuid;

use crate::scheme::{MetadataDeviceInfo, PartitionKind, PartitionSize, PerfSchemeEntry};

pub const SGDISK: &str = "sgdisk";

/// One partition to create, numbered in GPT slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub number: u32,
    pub osd_id: OsdId,
    pub kind: PartitionKind,
    pub partition_uuid: Uuid,
    pub size: PartitionSize,
    pub offset_mb: u64,
}

impl PartitionSpec {
    pub fn gpt_name(&self) -> String {
        format!("RKOSD{}-{}", self.osd_id, self.kind.label())
    }
}

pub fn zap_args(dev_path: &str) -> Vec<String> {
    vec!["--zap-all".to_string(), dev_path.to_string()]
}

pub fn clear_args(dev_path: &str) -> Vec<String> {
    vec![
        "--clear".to_string(),
        "--mbrtogpt".to_string(),
        dev_path.to_string(),
    ]
}

/// Three arguments per partition, then the optional disk GUID, then the
/// device path last.
pub fn create_args(dev_path: &str, specs: &[PartitionSpec], disk_guid: Option<&str>) -> Vec<String> {
    let mut args = Vec::with_capacity(specs.len() * 3 + 2);
    for spec in specs {
        let n = spec.number;
        match spec.size {
            PartitionSize::Fixed(mb) => {
                args.push(format!("--new={n}:{}M:+{mb}M", spec.offset_mb));
            }
            PartitionSize::Remaining => args.push(format!("--largest-new={n}")),
        }
        args.push(format!("--change-name={n}:{}", spec.gpt_name()));
        args.push(format!("--partition-guid={n}:{}", spec.partition_uuid));
    }
    if let Some(guid) = disk_guid {
        args.push(format!("--disk-guid={guid}"));
    }
    args.push(dev_path.to_string());
    args
}

/// Partitions of `entry` that live on the disk `disk_uuid`, ordered by offset.
pub fn data_device_specs(entry: &PerfSchemeEntry, disk_uuid: &str) -> Vec<PartitionSpec> {
    let mut on_disk: Vec<_> = entry
        .partitions
        .iter()
        .filter(|(_, p)| p.disk_uuid == disk_uuid)
        .collect();
    on_disk.sort_by_key(|(_, p)| p.offset_mb);

    on_disk
        .into_iter()
        .enumerate()
        .map(|(i, (kind, p))| PartitionSpec {
            number: i as u32 + 1,
            osd_id: entry.id,
            kind: *kind,
            partition_uuid: p.partition_uuid,
            size: p.size,
            offset_mb: p.offset_mb,
        })
        .collect()
}

/// Metadata partitions starting at slot `first` (0-based). Slots before it
/// already exist on the device.
pub fn metadata_device_specs(metadata: &MetadataDeviceInfo, first: usize) -> Vec<PartitionSpec> {
    metadata
        .partitions
        .iter()
        .enumerate()
        .skip(first)
        .map(|(i, p)| PartitionSpec {
            number: i as u32 + 1,
            osd_id: p.osd_id,
            kind: p.kind,
            partition_uuid: p.partition_uuid,
            size: PartitionSize::Fixed(p.size_mb),
            offset_mb: p.offset_mb,
        })
        .collect()
}
