#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Inventory, OsdId};
use rkosd::exec::{ExecError, Executor, ProcessHandle};
use rkosd::mon::{ClusterInfo, ConnectionFactory, MonConnection, MonError};
use rkosd::proc::{ProcManager, RestartPolicy};
use rkosd::state::CEPH_KEY;
use rkosd::{ConfigStore, Context, MemStore, StoreError};
use tokio::sync::{Semaphore, oneshot};
use uuid::Uuid;

pub const NODE: &str = "node1";
pub const GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
}

impl Recorded {
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(String::as_str)
    }
}

/// Records every command. `ceph-osd --mkfs` writes a keyring into the osd
/// data dir like the real tool does.
pub struct MockExecutor {
    pub commands: Mutex<Vec<Recorded>>,
    pub outputs: Mutex<Vec<Recorded>>,
    pub starts: Mutex<Vec<Recorded>>,
    /// Reply to `lsblk --json`.
    pub lsblk: Mutex<String>,
    /// Device path -> filesystem reported by lsblk.
    pub filesystems: Mutex<HashMap<String, String>>,
    /// Commands whose args contain this string fail.
    pub fail_when: Mutex<Option<String>>,
    pub hold_mkfs: AtomicBool,
    pub gate: Semaphore,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(MockExecutor {
            commands: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            lsblk: Mutex::new("{}".to_string()),
            filesystems: Mutex::new(HashMap::new()),
            fail_when: Mutex::new(None),
            hold_mkfs: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn commands(&self) -> Vec<Recorded> {
        self.commands.lock().unwrap().clone()
    }

    pub fn sgdisk(&self) -> Vec<Recorded> {
        self.commands()
            .into_iter()
            .filter(|c| c.command == "sgdisk")
            .collect()
    }

    pub fn sgdisk_on(&self, dev: &str) -> Vec<Recorded> {
        self.sgdisk()
            .into_iter()
            .filter(|c| c.args.last().map(String::as_str) == Some(dev))
            .collect()
    }

    pub fn mkfs(&self) -> Vec<Recorded> {
        self.commands()
            .into_iter()
            .filter(|c| c.has_arg("--mkfs"))
            .collect()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn set_filesystem(&self, dev: &str, fstype: &str) {
        self.filesystems
            .lock()
            .unwrap()
            .insert(dev.to_string(), fstype.to_string());
    }

    pub fn set_lsblk(&self, json: &str) {
        *self.lsblk.lock().unwrap() = json.to_string();
    }

    pub fn fail_when(&self, needle: &str) {
        *self.fail_when.lock().unwrap() = Some(needle.to_string());
    }

    fn should_fail(&self, args: &[String]) -> bool {
        let needle = self.fail_when.lock().unwrap().clone();
        needle.is_some_and(|n| args.iter().any(|a| a.contains(&n)))
    }

    fn record(list: &Mutex<Vec<Recorded>>, name: &str, command: &str, args: &[String]) -> Recorded {
        let rec = Recorded {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
        };
        list.lock().unwrap().push(rec.clone());
        rec
    }
}

fn failed(name: &str, command: &str) -> ExecError {
    ExecError::Failed {
        name: name.to_string(),
        command: command.to_string(),
        code: Some(1),
        stderr: "mock failure".to_string(),
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute_command(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<(), ExecError> {
        let rec = Self::record(&self.commands, name, command, args);
        if rec.has_arg("--mkfs") && self.hold_mkfs.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
        }
        if self.should_fail(args) {
            return Err(failed(name, command));
        }
        if rec.has_arg("--mkfs") {
            let data = PathBuf::from(rec.arg_after("--osd-data").unwrap());
            std::fs::create_dir_all(&data).unwrap();
            std::fs::write(data.join("keyring"), "[osd]\n\tkey = mock\n").unwrap();
        }
        Ok(())
    }

    async fn execute_command_with_output(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, ExecError> {
        Self::record(&self.outputs, name, command, args);
        if self.should_fail(args) {
            return Err(failed(name, command));
        }
        if args.first().map(String::as_str) == Some("--json") {
            return Ok(self.lsblk.lock().unwrap().clone());
        }
        let fs = args
            .first()
            .and_then(|dev| self.filesystems.lock().unwrap().get(dev).cloned())
            .unwrap_or_default();
        Ok(format!("{fs}\n"))
    }

    async fn start_execute_command(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, ExecError> {
        Self::record(&self.starts, name, command, args);
        let (tx, rx) = oneshot::channel();
        Ok(Box::new(MockProcess {
            stop_tx: Some(tx),
            stop_rx: rx,
        }))
    }
}

/// Runs until terminated.
struct MockProcess {
    stop_tx: Option<oneshot::Sender<()>>,
    stop_rx: oneshot::Receiver<()>,
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(1000)
    }

    fn terminate(&mut self) -> Result<(), ExecError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecError> {
        let _ = (&mut self.stop_rx).await;
        Ok(None)
    }

    async fn kill(&mut self) -> Result<(), ExecError> {
        self.terminate()
    }
}

/// Hands out sequential ids and records every call.
pub struct MockMon {
    next_id: AtomicU32,
    pub created: Mutex<Vec<Uuid>>,
    pub auth: Mutex<Vec<String>>,
    pub crush: Mutex<Vec<(OsdId, String)>>,
    pub fail_create: AtomicBool,
}

impl MockMon {
    pub fn new(first_id: OsdId) -> Arc<Self> {
        Arc::new(MockMon {
            next_id: AtomicU32::new(first_id),
            created: Mutex::new(Vec::new()),
            auth: Mutex::new(Vec::new()),
            crush: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl MonConnection for MockMon {
    async fn create_osd(&self, osd_uuid: Uuid) -> Result<OsdId, MonError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MonError::Rejected {
                command: "osd create".to_string(),
                reason: "mock".to_string(),
            });
        }
        self.created.lock().unwrap().push(osd_uuid);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn auth_add(
        &self,
        entity: &str,
        keyring: &Path,
        _caps: &[(&str, &str)],
    ) -> Result<(), MonError> {
        assert!(keyring.exists(), "keyring {keyring:?} must exist before auth add");
        self.auth.lock().unwrap().push(entity.to_string());
        Ok(())
    }

    async fn crush_create_or_move(
        &self,
        id: OsdId,
        _weight: f64,
        location: &str,
    ) -> Result<(), MonError> {
        self.crush.lock().unwrap().push((id, location.to_string()));
        Ok(())
    }
}

pub struct MockFactory {
    pub mon: Arc<MockMon>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        _ctx: &Context,
        _cluster: &ClusterInfo,
    ) -> Result<Arc<dyn MonConnection>, MonError> {
        Ok(self.mon.clone())
    }
}

/// Delegates to a [`MemStore`] but fails every write or delete of a key
/// containing `fail_on`.
pub struct FailingStore {
    pub inner: MemStore,
    pub fail_on: String,
}

impl FailingStore {
    pub fn new(inner: MemStore, fail_on: &str) -> Self {
        FailingStore {
            inner,
            fail_on: fail_on.to_string(),
        }
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if key.contains(&self.fail_on) {
            return Err(etcd_client::Error::InvalidArgs(format!("mock failure at {key}")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn child_dirs(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        self.inner.child_dirs(key).await
    }
}

pub async fn seed_cluster(store: &MemStore) {
    store.set(&format!("{CEPH_KEY}/fsid"), "f1d").await.unwrap();
    store.set(&format!("{CEPH_KEY}/name"), "rkcluster").await.unwrap();
    store
        .set(&format!("{CEPH_KEY}/_secrets/admin"), "adminsecret")
        .await
        .unwrap();
    store
        .set(&format!("{CEPH_KEY}/_secrets/monitor"), "monsecret")
        .await
        .unwrap();
    let mon = format!("{CEPH_KEY}/monitor/desired/node1");
    store.set(&format!("{mon}/id"), "mon0").await.unwrap();
    store.set(&format!("{mon}/ipaddress"), "10.0.0.1").await.unwrap();
    store.set(&format!("{mon}/port"), "6789").await.unwrap();
}

pub fn fast_policy() -> RestartPolicy {
    RestartPolicy {
        max_restarts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        stop_grace: Duration::from_millis(100),
    }
}

pub fn context(
    dir: &Path,
    store: &MemStore,
    executor: &Arc<MockExecutor>,
    inventory: Inventory,
) -> Arc<Context> {
    context_with_store(dir, Arc::new(store.clone()), executor, inventory)
}

pub fn context_with_store(
    dir: &Path,
    store: Arc<dyn ConfigStore>,
    executor: &Arc<MockExecutor>,
    inventory: Inventory,
) -> Arc<Context> {
    let executor: Arc<dyn Executor> = executor.clone();
    Arc::new(
        Context::new(
            NODE,
            dir,
            store,
            executor.clone(),
            ProcManager::new(executor, fast_policy()),
        )
        .with_inventory(inventory),
    )
}
