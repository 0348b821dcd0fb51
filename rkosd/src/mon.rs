//! Talking to the cluster monitor.
//!
//! The agent only needs three monitor commands: allocate an OSD id, register
//! an OSD key and place an OSD in the CRUSH map. [`CliConnection`] issues
//! them through the `ceph` CLI.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use common::OsdId;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cephconf::{config_file_path, render_client_config, render_keyring};
use crate::context::Context;
use crate::exec::{ExecError, Executor};
use crate::state::CEPH_KEY;
use crate::store::{ConfigStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MonError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cluster info has no {0}")]
    MissingClusterInfo(String),
    #[error("malformed cluster info value {value:?} at {key}")]
    BadClusterInfo { key: String, value: String },
    #[error("unexpected reply to `{command}`: {reply}")]
    BadReply { command: String, reply: String },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("monitor rejected `{command}`: {reason}")]
    Rejected { command: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEndpoint {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl MonitorEndpoint {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub fsid: String,
    pub name: String,
    pub monitor_secret: String,
    pub admin_secret: String,
    /// Keyed by the node each monitor runs on.
    pub monitors: BTreeMap<String, MonitorEndpoint>,
}

impl ClusterInfo {
    pub fn mon_hosts(&self) -> String {
        self.monitors
            .values()
            .map(MonitorEndpoint::endpoint)
            .collect::<Vec<_>>()
            .join(",")
    }
}

async fn required(store: &dyn ConfigStore, key: &str) -> Result<String, MonError> {
    match store.get(key).await? {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MonError::MissingClusterInfo(key.to_string())),
    }
}

pub async fn load_cluster_info(store: &dyn ConfigStore) -> Result<ClusterInfo, MonError> {
    let fsid = required(store, &format!("{CEPH_KEY}/fsid")).await?;
    let name = required(store, &format!("{CEPH_KEY}/name")).await?;
    let admin_secret = required(store, &format!("{CEPH_KEY}/_secrets/admin")).await?;
    let monitor_secret = required(store, &format!("{CEPH_KEY}/_secrets/monitor")).await?;

    let mut monitors = BTreeMap::new();
    let desired_key = format!("{CEPH_KEY}/monitor/desired");
    for node in store.child_dirs(&desired_key).await? {
        let node_key = format!("{desired_key}/{node}");
        let id = required(store, &format!("{node_key}/id")).await?;
        let address = required(store, &format!("{node_key}/ipaddress")).await?;
        let port_key = format!("{node_key}/port");
        let port_value = required(store, &port_key).await?;
        let port = port_value
            .trim()
            .parse()
            .map_err(|_| MonError::BadClusterInfo {
                key: port_key,
                value: port_value.clone(),
            })?;
        monitors.insert(node, MonitorEndpoint { id, address, port });
    }
    if monitors.is_empty() {
        return Err(MonError::MissingClusterInfo(desired_key));
    }

    Ok(ClusterInfo {
        fsid,
        name,
        monitor_secret,
        admin_secret,
        monitors,
    })
}

#[async_trait]
pub trait MonConnection: Send + Sync {
    /// Allocate an OSD id bound to `osd_uuid`. Repeating the call with the
    /// same UUID returns the same id.
    async fn create_osd(&self, osd_uuid: Uuid) -> Result<OsdId, MonError>;

    /// Register the key in `keyring` for `entity` with the given caps.
    async fn auth_add(
        &self,
        entity: &str,
        keyring: &Path,
        caps: &[(&str, &str)],
    ) -> Result<(), MonError>;

    /// `location` is a space separated list of `type=name` pairs.
    async fn crush_create_or_move(
        &self,
        id: OsdId,
        weight: f64,
        location: &str,
    ) -> Result<(), MonError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        ctx: &Context,
        cluster: &ClusterInfo,
    ) -> Result<Arc<dyn MonConnection>, MonError>;
}

/// Pull the OSD id out of an `osd create` reply, either `{"osdid": 3}` or a
/// bare number. The monitor may send the id as a float.
pub fn parse_osd_create_reply(reply: &str) -> Option<OsdId> {
    let value: Value = serde_json::from_str(reply.trim()).ok()?;
    let id = match &value {
        Value::Object(map) => map.get("osdid")?,
        other => other,
    };
    let id = id.as_f64()?;
    if id < 0.0 || id.fract() != 0.0 || id > OsdId::MAX as f64 {
        return None;
    }
    Some(id as OsdId)
}

/// Monitor access through the `ceph` command line tool.
pub struct CliConnection {
    executor: Arc<dyn Executor>,
    binary: String,
    cluster_name: String,
    config_path: PathBuf,
    keyring_path: PathBuf,
}

impl CliConnection {
    fn base_args(&self) -> Vec<String> {
        vec![
            "--cluster".to_string(),
            self.cluster_name.clone(),
            "--conf".to_string(),
            self.config_path.display().to_string(),
            "--name".to_string(),
            "client.admin".to_string(),
            "--keyring".to_string(),
            self.keyring_path.display().to_string(),
            "--format".to_string(),
            "json".to_string(),
        ]
    }

    async fn command(&self, name: &str, args: &[String]) -> Result<String, MonError> {
        let mut full = self.base_args();
        full.extend_from_slice(args);
        let reply = self
            .executor
            .execute_command_with_output(name, &self.binary, &full)
            .await?;
        debug!(name, reply = reply.trim(), "monitor replied");
        Ok(reply)
    }
}

#[async_trait]
impl MonConnection for CliConnection {
    async fn create_osd(&self, osd_uuid: Uuid) -> Result<OsdId, MonError> {
        let args = vec!["osd".to_string(), "create".to_string(), osd_uuid.to_string()];
        let reply = self.command("osd create", &args).await?;
        let id = parse_osd_create_reply(&reply).ok_or_else(|| MonError::BadReply {
            command: "osd create".to_string(),
            reply: reply.trim().to_string(),
        })?;
        info!(osd = id, %osd_uuid, "allocated osd id");
        Ok(id)
    }

    async fn auth_add(
        &self,
        entity: &str,
        keyring: &Path,
        caps: &[(&str, &str)],
    ) -> Result<(), MonError> {
        let mut args = vec!["auth".to_string(), "add".to_string(), entity.to_string()];
        for (service, cap) in caps {
            args.push(service.to_string());
            args.push(cap.to_string());
        }
        args.push("-i".to_string());
        args.push(keyring.display().to_string());
        self.command("auth add", &args).await?;
        Ok(())
    }

    async fn crush_create_or_move(
        &self,
        id: OsdId,
        weight: f64,
        location: &str,
    ) -> Result<(), MonError> {
        let mut args = vec![
            "osd".to_string(),
            "crush".to_string(),
            "create-or-move".to_string(),
            format!("osd.{id}"),
            format!("{weight:.4}"),
        ];
        args.extend(location.split_whitespace().map(str::to_string));
        self.command("osd crush create-or-move", &args).await?;
        Ok(())
    }
}

/// Writes the admin keyring and a client config under the config dir, then
/// hands out [`CliConnection`]s.
pub struct CliConnectionFactory {
    binary: String,
}

impl CliConnectionFactory {
    pub fn new(binary: impl Into<String>) -> Self {
        CliConnectionFactory {
            binary: binary.into(),
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), MonError> {
    let io_err = |source| MonError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, content).map_err(io_err)
}

#[async_trait]
impl ConnectionFactory for CliConnectionFactory {
    async fn connect(
        &self,
        ctx: &Context,
        cluster: &ClusterInfo,
    ) -> Result<Arc<dyn MonConnection>, MonError> {
        let keyring_path = ctx.config_dir.join("client.admin.keyring");
        write_file(
            &keyring_path,
            &render_keyring("client.admin", &cluster.admin_secret),
        )?;
        let config_path = config_file_path(&ctx.config_dir, &cluster.name);
        write_file(&config_path, &render_client_config(cluster, &keyring_path))?;

        Ok(Arc::new(CliConnection {
            executor: ctx.executor.clone(),
            binary: self.binary.clone(),
            cluster_name: cluster.name.clone(),
            config_path,
            keyring_path,
        }))
    }
}
