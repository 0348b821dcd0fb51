//! Local disk discovery through `lsblk`.

use common::{Inventory, LocalDisk};
use serde::Deserialize;
use tracing::debug;

use crate::exec::{ExecError, Executor};

const LSBLK: &str = "lsblk";

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("failed to parse lsblk output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid size {0:?} for a block device")]
    Size(String),
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

// older lsblk prints sizes as strings even with --bytes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    size: LsblkSize,
    #[serde(rename = "type")]
    kind: String,
    ptuuid: Option<String>,
}

pub fn lsblk_args() -> Vec<String> {
    ["--json", "--bytes", "--nodeps", "--output", "NAME,SIZE,TYPE,PTUUID"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Only whole disks are kept; partitions, loop and rom devices are skipped.
pub fn parse_lsblk(output: &str) -> Result<Inventory, InventoryError> {
    let parsed: LsblkOutput = serde_json::from_str(output)?;
    let mut disks = Vec::new();
    for dev in parsed.blockdevices {
        if dev.kind != "disk" {
            debug!(name = dev.name, kind = dev.kind, "skipping block device");
            continue;
        }
        let size = match dev.size {
            LsblkSize::Number(n) => n,
            LsblkSize::Text(s) => s.trim().parse().map_err(|_| InventoryError::Size(s))?,
        };
        let mut disk = LocalDisk::new(dev.name, size);
        if let Some(uuid) = dev.ptuuid.filter(|u| !u.is_empty()) {
            disk = disk.with_uuid(uuid);
        }
        disks.push(disk);
    }
    Ok(Inventory::new(disks))
}

pub async fn discover_inventory(executor: &dyn Executor) -> Result<Inventory, InventoryError> {
    let output = executor
        .execute_command_with_output("discover disks", LSBLK, &lsblk_args())
        .await?;
    parse_lsblk(&output)
}

/// Filesystem signature on `dev_path`, if any.
pub async fn device_filesystem(
    executor: &dyn Executor,
    dev_path: &str,
) -> Result<Option<String>, ExecError> {
    let args: Vec<String> = [
        dev_path,
        "--bytes",
        "--nodeps",
        "--noheadings",
        "--output",
        "FSTYPE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let output = executor
        .execute_command_with_output(&format!("check {dev_path}"), LSBLK, &args)
        .await?;
    let fstype = output.trim();
    Ok((!fstype.is_empty()).then(|| fstype.to_string()))
}
