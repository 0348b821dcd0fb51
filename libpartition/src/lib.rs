//! Partition planning for OSD devices.
//!
//! A [`PerfScheme`] describes where every OSD's block, WAL and DB partitions
//! live. It is persisted next to the agent's local config so that later runs
//! can tell which disks were already partitioned, even when the kernel
//! renamed them in between.

pub mod identity;
pub mod scheme;
pub mod sgdisk;

pub use identity::{
    DeviceIdentities, MissingDisk, is_device_in_use, missing_disks_for_entry, resolve_device_names,
};
pub use scheme::{
    BluestoreConfig, DB_DEFAULT_SIZE_MB, MetadataDeviceInfo, MetadataPartition, PartitionDetails,
    PartitionKind, PartitionSize, PerfScheme, PerfSchemeEntry, START_OFFSET_MB, SchemeError,
    WAL_DEFAULT_SIZE_MB,
};
