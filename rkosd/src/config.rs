use anyhow::{Context, Result};
use libpartition::BluestoreConfig;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::OsdSettings;
use crate::proc::RestartPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // name of this node in the desired/applied trees
    pub node_id: String,
    // local state: partition scheme, ceph configs, directory osd data
    pub config_dir: PathBuf,
    #[serde(default)]
    pub devices: Vec<String>,
    // directory backed osds, in addition to devices
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default)]
    pub metadata_device: Option<String>,
    #[serde(default)]
    pub force_format: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default)]
    pub bluestore: BluestoreConfig,
    #[serde(default = "default_osd_binary")]
    pub osd_binary: String,
    #[serde(default = "default_ceph_binary")]
    pub ceph_binary: String,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    // Xline endpoints
    pub xline_config: XlineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_osd_binary() -> String {
    "ceph-osd".to_string()
}

fn default_ceph_binary() -> String {
    "ceph".to_string()
}

fn default_max_restarts() -> u32 {
    5
}

impl Config {
    pub fn osd_settings(&self) -> OsdSettings {
        OsdSettings {
            devices: self.devices.clone(),
            directories: self.directories.clone(),
            metadata_device: self.metadata_device.clone(),
            force_format: self.force_format,
            location: self.location.clone(),
            bluestore: self.bluestore,
            osd_binary: self.osd_binary.clone(),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            ..RestartPolicy::default()
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
