use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use common::OsdId;
use log::{debug, info};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const WAL_DEFAULT_SIZE_MB: u64 = 576;
pub const DB_DEFAULT_SIZE_MB: u64 = 20480;
/// First usable MB of a disk, everything before it is left for the GPT header.
pub const START_OFFSET_MB: u64 = 1;

const SCHEME_FILE: &str = "partition-scheme.json";
const SCHEME_LOCK_FILE: &str = "partition-scheme.lock";

#[derive(Debug, thiserror::Error)]
pub enum SchemeError {
    #[error("failed to access partition scheme {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse partition scheme {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to lock partition scheme: {0}")]
    Lock(nix::errno::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Wal,
    Db,
    Block,
}

impl PartitionKind {
    /// Upper-case label used in GPT partition names.
    pub fn label(&self) -> &'static str {
        match self {
            PartitionKind::Wal => "WAL",
            PartitionKind::Db => "DB",
            PartitionKind::Block => "BLOCK",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionKind::Wal => "wal",
            PartitionKind::Db => "db",
            PartitionKind::Block => "block",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSize {
    Fixed(u64),
    /// Whatever is left on the disk after the partition's offset.
    Remaining,
}

impl PartitionSize {
    pub fn mb(&self) -> Option<u64> {
        match self {
            PartitionSize::Fixed(mb) => Some(*mb),
            PartitionSize::Remaining => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDetails {
    pub device: String,
    pub disk_uuid: String,
    pub partition_uuid: Uuid,
    pub size: PartitionSize,
    pub offset_mb: u64,
}

impl PartitionDetails {
    /// Stable path of the partition, independent of the device name.
    pub fn by_partuuid_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/disk/by-partuuid/{}", self.partition_uuid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluestoreConfig {
    #[serde(default = "default_wal_size_mb")]
    pub wal_size_mb: u64,
    #[serde(default = "default_database_size_mb")]
    pub database_size_mb: u64,
}

fn default_wal_size_mb() -> u64 {
    WAL_DEFAULT_SIZE_MB
}

fn default_database_size_mb() -> u64 {
    DB_DEFAULT_SIZE_MB
}

impl Default for BluestoreConfig {
    fn default() -> Self {
        BluestoreConfig {
            wal_size_mb: WAL_DEFAULT_SIZE_MB,
            database_size_mb: DB_DEFAULT_SIZE_MB,
        }
    }
}

/// All partitions belonging to one OSD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfSchemeEntry {
    pub id: OsdId,
    pub osd_uuid: Uuid,
    pub partitions: BTreeMap<PartitionKind, PartitionDetails>,
}

impl PerfSchemeEntry {
    pub fn new(id: OsdId, osd_uuid: Uuid) -> Self {
        PerfSchemeEntry {
            id,
            osd_uuid,
            partitions: BTreeMap::new(),
        }
    }

    pub fn partition(&self, kind: PartitionKind) -> Option<&PartitionDetails> {
        self.partitions.get(&kind)
    }

    pub fn block(&self) -> Option<&PartitionDetails> {
        self.partition(PartitionKind::Block)
    }

    /// UUID of the disk holding the OSD's data.
    pub fn data_disk_uuid(&self) -> Option<&str> {
        self.block().map(|p| p.disk_uuid.as_str())
    }

    pub fn disk_uuids(&self) -> BTreeSet<&str> {
        self.partitions
            .values()
            .map(|p| p.disk_uuid.as_str())
            .collect()
    }

    pub fn is_collocated(&self) -> bool {
        self.disk_uuids().len() == 1
    }

    /// Lay out WAL, DB and block on `device`, in that order, under a fresh
    /// disk UUID. The block partition takes the rest of the disk.
    pub fn populate_collocated(&mut self, device: &str, config: &BluestoreConfig) {
        let disk_uuid = Uuid::new_v4().to_string();
        let mut offset = START_OFFSET_MB;

        for (kind, size) in [
            (PartitionKind::Wal, PartitionSize::Fixed(config.wal_size_mb)),
            (PartitionKind::Db, PartitionSize::Fixed(config.database_size_mb)),
            (PartitionKind::Block, PartitionSize::Remaining),
        ] {
            self.partitions.insert(
                kind,
                PartitionDetails {
                    device: device.to_string(),
                    disk_uuid: disk_uuid.clone(),
                    partition_uuid: Uuid::new_v4(),
                    size,
                    offset_mb: offset,
                },
            );
            offset += size.mb().unwrap_or(0);
        }
        debug!("osd {} collocated on {device} (disk {disk_uuid})", self.id);
    }

    /// Put the block partition on `device` and append WAL and DB to the
    /// shared metadata device.
    pub fn populate_distributed(
        &mut self,
        device: &str,
        metadata: &mut MetadataDeviceInfo,
        config: &BluestoreConfig,
    ) {
        self.partitions.insert(
            PartitionKind::Block,
            PartitionDetails {
                device: device.to_string(),
                disk_uuid: Uuid::new_v4().to_string(),
                partition_uuid: Uuid::new_v4(),
                size: PartitionSize::Remaining,
                offset_mb: START_OFFSET_MB,
            },
        );

        for (kind, size_mb) in [
            (PartitionKind::Wal, config.wal_size_mb),
            (PartitionKind::Db, config.database_size_mb),
        ] {
            let details = metadata.append(self.id, self.osd_uuid, kind, size_mb);
            self.partitions.insert(kind, details);
        }
        debug!(
            "osd {} data on {device}, metadata on {}",
            self.id, metadata.device
        );
    }
}

/// One WAL or DB partition on the shared metadata device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPartition {
    pub osd_id: OsdId,
    pub osd_uuid: Uuid,
    pub kind: PartitionKind,
    pub partition_uuid: Uuid,
    pub size_mb: u64,
    pub offset_mb: u64,
}

impl MetadataPartition {
    pub fn end_mb(&self) -> u64 {
        self.offset_mb + self.size_mb
    }
}

/// The device holding WAL and DB partitions for OSDs whose data lives
/// elsewhere. Partitions are only ever appended, freed space is not reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDeviceInfo {
    pub device: String,
    pub disk_uuid: String,
    pub partitions: Vec<MetadataPartition>,
}

impl MetadataDeviceInfo {
    pub fn new(device: impl Into<String>) -> Self {
        MetadataDeviceInfo {
            device: device.into(),
            disk_uuid: Uuid::new_v4().to_string(),
            partitions: Vec::new(),
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.partitions
            .last()
            .map(|p| p.end_mb())
            .unwrap_or(START_OFFSET_MB)
    }

    /// OSDs with at least one partition on this device, in placement order.
    pub fn consumers(&self) -> Vec<OsdId> {
        let mut ids = Vec::new();
        for p in &self.partitions {
            if !ids.contains(&p.osd_id) {
                ids.push(p.osd_id);
            }
        }
        ids
    }

    fn append(
        &mut self,
        osd_id: OsdId,
        osd_uuid: Uuid,
        kind: PartitionKind,
        size_mb: u64,
    ) -> PartitionDetails {
        let partition = MetadataPartition {
            osd_id,
            osd_uuid,
            kind,
            partition_uuid: Uuid::new_v4(),
            size_mb,
            offset_mb: self.next_offset(),
        };
        let details = PartitionDetails {
            device: self.device.clone(),
            disk_uuid: self.disk_uuid.clone(),
            partition_uuid: partition.partition_uuid,
            size: PartitionSize::Fixed(size_mb),
            offset_mb: partition.offset_mb,
        };
        self.partitions.push(partition);
        details
    }
}

/// The full local layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfScheme {
    pub entries: Vec<PerfSchemeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDeviceInfo>,
}

impl PerfScheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, id: OsdId) -> Option<&PerfSchemeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Replace the entry with the same id or append it.
    pub fn upsert_entry(&mut self, entry: PerfSchemeEntry) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn scheme_path(config_dir: &Path) -> PathBuf {
        config_dir.join(SCHEME_FILE)
    }

    /// Load the committed scheme. A missing file is an empty scheme.
    pub fn load(config_dir: &Path) -> Result<Self, SchemeError> {
        let path = Self::scheme_path(config_dir);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no partition scheme at {path:?}, starting empty");
                return Ok(PerfScheme::new());
            }
            Err(source) => return Err(SchemeError::Io { path, source }),
        };
        serde_json::from_slice(&data).map_err(|source| SchemeError::Parse { path, source })
    }

    /// Persist the scheme. The file is replaced atomically while holding an
    /// exclusive lock on the config dir's scheme lock file.
    pub fn save(&self, config_dir: &Path) -> Result<(), SchemeError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(config_dir)
            .map_err(|source| SchemeError::Io {
                path: config_dir.to_path_buf(),
                source,
            })?;
        let _lock = lock_scheme(config_dir)?;

        let path = Self::scheme_path(config_dir);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)?;
        let io_err = |source| SchemeError::Io {
            path: tmp.clone(),
            source,
        };
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(io_err)?;
        f.write_all(&data).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(|source| SchemeError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            "saved partition scheme with {} entries to {path:?}",
            self.entries.len()
        );
        Ok(())
    }
}

fn lock_scheme(config_dir: &Path) -> Result<Flock<File>, SchemeError> {
    let lock_path = config_dir.join(SCHEME_LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&lock_path)
        .map_err(|source| SchemeError::Io {
            path: lock_path,
            source,
        })?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, e)| SchemeError::Lock(e))
}
