//! Ceph config and keyring files written for the CLI and for each OSD.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use common::OsdId;
use libpartition::{PartitionKind, PerfSchemeEntry};
use uuid::Uuid;

use crate::mon::ClusterInfo;

pub const KEYRING_FILE: &str = "keyring";

/// Backing store of one OSD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStore {
    Bluestore {
        block: PathBuf,
        wal: Option<PathBuf>,
        db: Option<PathBuf>,
    },
    Filestore,
}

impl ObjectStore {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectStore::Bluestore { .. } => "bluestore",
            ObjectStore::Filestore => "filestore",
        }
    }
}

/// Where an OSD keeps its data and how its store is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdLayout {
    pub id: OsdId,
    pub osd_uuid: Uuid,
    pub data_dir: PathBuf,
    pub store: ObjectStore,
}

impl OsdLayout {
    /// Device OSDs keep their data dir under the agent's config dir.
    pub fn for_device(config_dir: &Path, entry: &PerfSchemeEntry) -> Option<Self> {
        let block = entry.block()?.by_partuuid_path();
        Some(OsdLayout {
            id: entry.id,
            osd_uuid: entry.osd_uuid,
            data_dir: config_dir.join(format!("osd{}", entry.id)),
            store: ObjectStore::Bluestore {
                block,
                wal: entry
                    .partition(PartitionKind::Wal)
                    .map(|p| p.by_partuuid_path()),
                db: entry
                    .partition(PartitionKind::Db)
                    .map(|p| p.by_partuuid_path()),
            },
        })
    }

    pub fn for_dir(dir: &Path, id: OsdId, osd_uuid: Uuid) -> Self {
        OsdLayout {
            id,
            osd_uuid,
            data_dir: dir.join(format!("osd{id}")),
            store: ObjectStore::Filestore,
        }
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.data_dir.join(KEYRING_FILE)
    }

    pub fn config_path(&self, cluster_name: &str) -> PathBuf {
        config_file_path(&self.data_dir, cluster_name)
    }

    pub fn entity(&self) -> String {
        format!("osd.{}", self.id)
    }
}

pub fn config_file_path(dir: &Path, cluster_name: &str) -> PathBuf {
    dir.join(format!("{cluster_name}.config"))
}

fn write_global(out: &mut String, cluster: &ClusterInfo) {
    let members: Vec<&str> = cluster.monitors.values().map(|m| m.id.as_str()).collect();
    let _ = writeln!(out, "[global]");
    let _ = writeln!(out, "fsid = {}", cluster.fsid);
    let _ = writeln!(out, "mon initial members = {}", members.join(" "));
    let _ = writeln!(out, "mon host = {}", cluster.mon_hosts());
    let _ = writeln!(out, "auth cluster required = cephx");
    let _ = writeln!(out, "auth service required = cephx");
    let _ = writeln!(out, "auth client required = cephx");
}

/// Config used by the agent's own CLI calls.
pub fn render_client_config(cluster: &ClusterInfo, keyring: &Path) -> String {
    let mut out = String::new();
    write_global(&mut out, cluster);
    let _ = writeln!(out);
    let _ = writeln!(out, "[client.admin]");
    let _ = writeln!(out, "keyring = {}", keyring.display());
    out
}

pub fn render_osd_config(cluster: &ClusterInfo, layout: &OsdLayout, location: Option<&str>) -> String {
    let mut out = String::new();
    write_global(&mut out, cluster);
    let _ = writeln!(out);
    let _ = writeln!(out, "[{}]", layout.entity());
    let _ = writeln!(out, "osd data = {}", layout.data_dir.display());
    let _ = writeln!(out, "keyring = {}", layout.keyring_path().display());
    let _ = writeln!(out, "osd objectstore = {}", layout.store.name());
    if let ObjectStore::Bluestore { block, wal, db } = &layout.store {
        let _ = writeln!(out, "bluestore block path = {}", block.display());
        if let Some(wal) = wal {
            let _ = writeln!(out, "bluestore block wal path = {}", wal.display());
        }
        if let Some(db) = db {
            let _ = writeln!(out, "bluestore block db path = {}", db.display());
        }
    }
    if let Some(location) = location {
        let _ = writeln!(out, "crush location = {location}");
    }
    out
}

pub fn render_keyring(entity: &str, secret: &str) -> String {
    format!("[{entity}]\n\tkey = {secret}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mon::MonitorEndpoint;
    use libpartition::BluestoreConfig;
    use std::collections::BTreeMap;

    fn cluster() -> ClusterInfo {
        let mut monitors = BTreeMap::new();
        monitors.insert(
            "node1".to_string(),
            MonitorEndpoint {
                id: "mon0".to_string(),
                address: "10.0.0.1".to_string(),
                port: 6789,
            },
        );
        ClusterInfo {
            fsid: "f1d".to_string(),
            name: "rkcluster".to_string(),
            monitor_secret: "monsecret".to_string(),
            admin_secret: "adminsecret".to_string(),
            monitors,
        }
    }

    #[test]
    fn test_device_osd_config() {
        let mut entry = PerfSchemeEntry::new(3, Uuid::new_v4());
        entry.populate_collocated("sdb", &BluestoreConfig::default());
        let layout = OsdLayout::for_device(Path::new("/var/lib/rkosd"), &entry).unwrap();

        assert_eq!(layout.data_dir, PathBuf::from("/var/lib/rkosd/osd3"));
        assert_eq!(
            layout.config_path("rkcluster"),
            PathBuf::from("/var/lib/rkosd/osd3/rkcluster.config")
        );

        let conf = render_osd_config(&cluster(), &layout, Some("root=default host=node1"));
        assert!(conf.contains("fsid = f1d"));
        assert!(conf.contains("mon host = 10.0.0.1:6789"));
        assert!(conf.contains("[osd.3]"));
        assert!(conf.contains("osd objectstore = bluestore"));
        let wal = entry.partition(PartitionKind::Wal).unwrap();
        assert!(conf.contains(&format!(
            "bluestore block wal path = /dev/disk/by-partuuid/{}",
            wal.partition_uuid
        )));
        assert!(conf.contains("crush location = root=default host=node1"));
    }

    #[test]
    fn test_dir_osd_config() {
        let layout = OsdLayout::for_dir(Path::new("/data"), 7, Uuid::new_v4());
        assert_eq!(layout.keyring_path(), PathBuf::from("/data/osd7/keyring"));
        let conf = render_osd_config(&cluster(), &layout, None);
        assert!(conf.contains("osd objectstore = filestore"));
        assert!(!conf.contains("bluestore block path"));
        assert!(!conf.contains("crush location"));
    }

    #[test]
    fn test_keyring() {
        assert_eq!(
            render_keyring("client.admin", "abc"),
            "[client.admin]\n\tkey = abc\n"
        );
    }
}
