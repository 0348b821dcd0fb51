//! Partitioning, formatting and recording of individual OSDs.

use std::fs;
use std::path::{Path, PathBuf};

use common::OsdId;
use libpartition::sgdisk::{
    SGDISK, clear_args, create_args, data_device_specs, metadata_device_specs, zap_args,
};
use libpartition::{MetadataDeviceInfo, MissingDisk, PerfScheme, PerfSchemeEntry, SchemeError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::OsdSettings;
use crate::cephconf::{OsdLayout, render_osd_config};
use crate::context::Context;
use crate::exec::ExecError;
use crate::inventory::device_filesystem;
use crate::mon::{ClusterInfo, MonConnection, MonError};
use crate::scheme::SchemePlan;
use crate::state::{
    StateError, add_desired_device, mark_osd_applied, set_desired_dir_osd, set_desired_metadata,
};

const OSD_CAPS: &[(&str, &str)] = &[("osd", "allow *"), ("mon", "allow profile osd")];
const BYTES_PER_TIB: f64 = (1u64 << 40) as f64;
const MIN_CRUSH_WEIGHT: f64 = 0.0001;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("device {0} is not in the node inventory")]
    DeviceNotFound(String),
    #[error("device {device} already has a {fstype} filesystem, set force_format to reuse it")]
    DeviceInUse { device: String, fstype: String },
    #[error("osd {id} is missing disks: {}", format_missing(.disks))]
    MissingDisks { id: OsdId, disks: Vec<MissingDisk> },
    #[error("metadata device {device} is not usable: {reason}")]
    MetadataDevice { device: String, reason: String },
    #[error("no osd id for {device}: {source}")]
    NoOsdId {
        device: String,
        #[source]
        source: MonError,
    },
    #[error("osd {0} has no block partition")]
    NoBlockPartition(OsdId),
    #[error("mkfs left no keyring at {0}")]
    KeyringMissing(PathBuf),
    #[error("provisioning task aborted: {0}")]
    Aborted(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Mon(#[from] MonError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
}

fn format_missing(disks: &[MissingDisk]) -> String {
    disks
        .iter()
        .map(|d| format!("{} (last seen as {})", d.disk_uuid, d.last_known_name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// CRUSH weight is the capacity in TiB.
pub fn crush_weight(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_TIB).max(MIN_CRUSH_WEIGHT)
}

/// Capacity of the filesystem holding `path`.
pub fn dir_capacity(path: &Path) -> Result<u64, ProvisionError> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| ProvisionError::Io {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
}

pub struct Provisioner<'a> {
    pub ctx: &'a Context,
    pub conn: &'a dyn MonConnection,
    pub cluster: &'a ClusterInfo,
    pub settings: &'a OsdSettings,
    pub scheme_lock: &'a Mutex<()>,
}

impl Provisioner<'_> {
    async fn sgdisk(&self, name: &str, args: Vec<String>) -> Result<(), ProvisionError> {
        self.ctx
            .executor
            .execute_command(name, SGDISK, &args)
            .await?;
        Ok(())
    }

    async fn check_device_available(&self, dev_path: &str) -> Result<(), ProvisionError> {
        if self.settings.force_format {
            return Ok(());
        }
        match device_filesystem(self.ctx.executor.as_ref(), dev_path).await? {
            Some(fstype) => Err(ProvisionError::DeviceInUse {
                device: dev_path.to_string(),
                fstype,
            }),
            None => Ok(()),
        }
    }

    async fn wipe(&self, dev_path: &str) -> Result<(), ProvisionError> {
        self.sgdisk(&format!("zap {dev_path}"), zap_args(dev_path))
            .await?;
        self.sgdisk(&format!("clear {dev_path}"), clear_args(dev_path))
            .await
    }

    /// Load, update and save the committed scheme under the scheme lock.
    async fn commit(&self, update: impl FnOnce(&mut PerfScheme) + Send) -> Result<(), ProvisionError> {
        let _guard = self.scheme_lock.lock().await;
        let mut scheme = PerfScheme::load(&self.ctx.config_dir)?;
        update(&mut scheme);
        scheme.save(&self.ctx.config_dir)?;
        Ok(())
    }

    /// Create this pass's new partitions on the shared metadata device.
    ///
    /// The device is only wiped when it carries no committed partitions yet.
    /// The descriptor is committed right away so later passes keep appending
    /// after it even if some of its consumers fail.
    pub async fn prepare_metadata_device(&self, plan: &SchemePlan) -> Result<(), ProvisionError> {
        let Some(metadata) = plan.scheme.metadata.as_ref() else {
            return Ok(());
        };
        if !plan.has_new_metadata_partitions() {
            return Ok(());
        }
        let dev_path = format!("/dev/{}", metadata.device);
        let fresh = plan.committed_metadata_partitions == 0;
        if fresh {
            self.check_device_available(&dev_path).await?;
            self.wipe(&dev_path).await?;
        }

        let specs = metadata_device_specs(metadata, plan.committed_metadata_partitions);
        let disk_guid = fresh.then_some(metadata.disk_uuid.as_str());
        self.sgdisk(
            &format!("partition {dev_path}"),
            create_args(&dev_path, &specs, disk_guid),
        )
        .await?;
        info!(
            device = metadata.device,
            partitions = specs.len(),
            "metadata device partitioned"
        );

        let committed: MetadataDeviceInfo = metadata.clone();
        self.commit(move |scheme| scheme.metadata = Some(committed))
            .await
    }

    /// Wipe and partition the data device of a new entry, then commit it.
    pub async fn partition_device(&self, entry: &PerfSchemeEntry) -> Result<(), ProvisionError> {
        let block = entry
            .block()
            .ok_or(ProvisionError::NoBlockPartition(entry.id))?;
        let dev_path = format!("/dev/{}", block.device);

        self.check_device_available(&dev_path).await?;
        self.wipe(&dev_path).await?;
        let specs = data_device_specs(entry, &block.disk_uuid);
        self.sgdisk(
            &format!("partition {dev_path}"),
            create_args(&dev_path, &specs, Some(&block.disk_uuid)),
        )
        .await?;
        info!(osd = entry.id, device = block.device, "data device partitioned");

        let committed = entry.clone();
        self.commit(move |scheme| scheme.upsert_entry(committed))
            .await
    }

    /// Format the OSD unless its keyring already exists. Returns whether a
    /// format happened.
    pub async fn format_osd(&self, layout: &OsdLayout) -> Result<bool, ProvisionError> {
        let keyring = layout.keyring_path();
        if keyring.exists() {
            info!(osd = layout.id, "osd already formatted, keyring found");
            return Ok(false);
        }
        self.write_osd_config(layout)?;

        let conf = layout.config_path(&self.cluster.name);
        let args: Vec<String> = vec![
            "--mkfs".to_string(),
            "--mkkey".to_string(),
            "--cluster".to_string(),
            self.cluster.name.clone(),
            "--id".to_string(),
            layout.id.to_string(),
            "--osd-uuid".to_string(),
            layout.osd_uuid.to_string(),
            "--osd-data".to_string(),
            layout.data_dir.display().to_string(),
            "--conf".to_string(),
            conf.display().to_string(),
            "--keyring".to_string(),
            keyring.display().to_string(),
        ];
        self.ctx
            .executor
            .execute_command(
                &format!("mkfs osd{}", layout.id),
                &self.settings.osd_binary,
                &args,
            )
            .await?;

        if !keyring.exists() {
            return Err(ProvisionError::KeyringMissing(keyring));
        }
        self.conn
            .auth_add(&layout.entity(), &keyring, OSD_CAPS)
            .await?;
        info!(osd = layout.id, store = layout.store.name(), "osd formatted");
        Ok(true)
    }

    /// Write `<osd dir>/<cluster>.config`, creating the data dir if needed.
    pub fn write_osd_config(&self, layout: &OsdLayout) -> Result<PathBuf, ProvisionError> {
        fs::create_dir_all(&layout.data_dir).map_err(|source| ProvisionError::Io {
            path: layout.data_dir.clone(),
            source,
        })?;
        let path = layout.config_path(&self.cluster.name);
        let content = render_osd_config(self.cluster, layout, self.settings.location.as_deref());
        fs::write(&path, content).map_err(|source| ProvisionError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Place the OSD when a CRUSH location is configured.
    pub async fn place_in_crush(&self, id: OsdId, weight: f64) -> Result<(), ProvisionError> {
        let Some(location) = self.settings.location.as_deref() else {
            return Ok(());
        };
        self.conn
            .crush_create_or_move(id, weight, location)
            .await?;
        Ok(())
    }

    pub fn daemon_args(&self, layout: &OsdLayout) -> Vec<String> {
        vec![
            "--foreground".to_string(),
            "--cluster".to_string(),
            self.cluster.name.clone(),
            "--id".to_string(),
            layout.id.to_string(),
            "--osd-data".to_string(),
            layout.data_dir.display().to_string(),
            "--conf".to_string(),
            layout.config_path(&self.cluster.name).display().to_string(),
            "--keyring".to_string(),
            layout.keyring_path().display().to_string(),
        ]
    }

    /// Record a device OSD as desired and applied. Failures are returned for
    /// reporting, recording carries on past them.
    pub async fn record_device(
        &self,
        entry: &PerfSchemeEntry,
        metadata: Option<&MetadataDeviceInfo>,
    ) -> Vec<ProvisionError> {
        let store = self.ctx.store.as_ref();
        let node = self.ctx.node_id.as_str();
        let mut errors = Vec::new();
        let Some(data_uuid) = entry.data_disk_uuid() else {
            errors.push(ProvisionError::NoBlockPartition(entry.id));
            return errors;
        };

        if let Err(e) = add_desired_device(store, node, data_uuid, entry.id).await {
            errors.push(e.into());
        }
        let metadata_record = if entry.is_collocated() {
            Some((data_uuid, vec![entry.id]))
        } else {
            metadata.map(|m| (m.disk_uuid.as_str(), m.consumers()))
        };
        if let Some((disk_uuid, ids)) = metadata_record {
            if let Err(e) = set_desired_metadata(store, node, disk_uuid, &ids).await {
                errors.push(e.into());
            }
        }
        if let Err(e) = mark_osd_applied(store, node, entry.id, data_uuid).await {
            errors.push(e.into());
        }
        for e in &errors {
            warn!(osd = entry.id, "failed to record osd: {e}");
        }
        errors
    }

    /// Directory OSDs have no data disk and are applied with an empty UUID.
    pub async fn record_dir(&self, path: &str, id: OsdId) -> Vec<ProvisionError> {
        let store = self.ctx.store.as_ref();
        let node = self.ctx.node_id.as_str();
        let mut errors = Vec::new();
        if let Err(e) = set_desired_dir_osd(store, node, path, id).await {
            errors.push(e.into());
        }
        if let Err(e) = mark_osd_applied(store, node, id, "").await {
            errors.push(e.into());
        }
        for e in &errors {
            warn!(osd = id, dir = path, "failed to record osd: {e}");
        }
        errors
    }
}
