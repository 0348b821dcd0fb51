//! The OSD agent: one reconciliation pass turns desired state into running,
//! supervised OSD daemons on this node.
//!
//! A pass is planned sequentially (cluster info, undesired OSDs, desired
//! devices and directories, partition scheme, shared metadata device) and then
//! fans out into one task per OSD. The unit that finishes last fires the
//! pass's [`Completion`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use common::OsdId;
use libpartition::{
    BluestoreConfig, DeviceIdentities, MetadataDeviceInfo, PerfSchemeEntry,
    missing_disks_for_entry,
};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cephconf::OsdLayout;
use crate::context::Context;
use crate::exec::ExecError;
use crate::mon::{ClusterInfo, ConnectionFactory, MonConnection, MonError, load_cluster_info};
use crate::proc::MonitoredProc;
use crate::provision::{ProvisionError, Provisioner, crush_weight, dir_capacity};
use crate::scheme::{PlanError, plan_partition_scheme};
use crate::state::{
    DesiredDeviceSet, OsdIdAssignment, StateError, add_desired_dir, get_applied_osds,
    load_desired_devices, load_desired_dirs, load_saved_devices, remove_applied_osd,
    set_desired_dir_osd,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("a reconciliation pass is still running with {0} units in flight")]
    PassInProgress(usize),
    #[error("failed to stop osd {id}: {source}")]
    Stop {
        id: OsdId,
        #[source]
        source: ExecError,
    },
    #[error(transparent)]
    Mon(#[from] MonError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Node-level OSD settings taken from the agent config.
#[derive(Debug, Clone)]
pub struct OsdSettings {
    pub devices: Vec<String>,
    pub directories: Vec<String>,
    pub metadata_device: Option<String>,
    pub force_format: bool,
    pub location: Option<String>,
    pub bluestore: BluestoreConfig,
    pub osd_binary: String,
}

impl Default for OsdSettings {
    fn default() -> Self {
        OsdSettings {
            devices: Vec::new(),
            directories: Vec::new(),
            metadata_device: None,
            force_format: false,
            location: None,
            bluestore: BluestoreConfig::default(),
            osd_binary: "ceph-osd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdState {
    Unconfigured,
    Provisioning,
    Running,
    Stopping,
    Removed,
}

impl OsdState {
    pub fn can_transition_to(self, next: OsdState) -> bool {
        use OsdState::*;
        matches!(
            (self, next),
            (Unconfigured, Provisioning)
                | (Provisioning, Running)
                | (Running, Stopping)
                | (Stopping, Removed)
        )
    }
}

impl fmt::Display for OsdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OsdState::Unconfigured => "unconfigured",
            OsdState::Provisioning => "provisioning",
            OsdState::Running => "running",
            OsdState::Stopping => "stopping",
            OsdState::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitTarget {
    Device(String),
    Dir(String),
    /// An applied OSD that is no longer desired.
    Orphan(OsdId),
}

impl fmt::Display for UnitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitTarget::Device(name) => write!(f, "device {name}"),
            UnitTarget::Dir(path) => write!(f, "dir {path}"),
            UnitTarget::Orphan(id) => write!(f, "orphan osd.{id}"),
        }
    }
}

/// Outcome of one device or directory in a pass.
#[derive(Debug)]
pub struct EntryReport {
    pub target: UnitTarget,
    pub osd_id: Option<OsdId>,
    pub state: OsdState,
    pub error: Option<ProvisionError>,
    /// Non-fatal problems, e.g. a record or CRUSH update that failed.
    pub warnings: Vec<ProvisionError>,
}

impl EntryReport {
    fn new(target: UnitTarget, osd_id: Option<OsdId>) -> Self {
        EntryReport {
            target,
            osd_id,
            state: OsdState::Unconfigured,
            error: None,
            warnings: Vec::new(),
        }
    }

    fn failed(target: UnitTarget, osd_id: Option<OsdId>, error: ProvisionError) -> Self {
        let mut report = EntryReport::new(target, osd_id);
        report.error = Some(error);
        report
    }

    fn advance(&mut self, next: OsdState) {
        if !self.state.can_transition_to(next) {
            warn!(unit = %self.target, from = %self.state, to = %next, "invalid osd state transition");
            return;
        }
        debug!(unit = %self.target, osd = ?self.osd_id, from = %self.state, to = %next, "osd state");
        self.state = next;
    }

    fn fail(mut self, error: ProvisionError) -> Self {
        error!(unit = %self.target, osd = ?self.osd_id, state = %self.state, "osd unit failed: {error}");
        self.error = Some(error);
        self
    }

    pub fn is_running(&self) -> bool {
        self.error.is_none() && self.state == OsdState::Running
    }
}

#[derive(Debug, Default)]
pub struct ConvergenceReport {
    pub entries: Vec<EntryReport>,
}

impl ConvergenceReport {
    pub fn entry(&self, target: &UnitTarget) -> Option<&EntryReport> {
        self.entries.iter().find(|e| &e.target == target)
    }

    pub fn failed(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries.iter().filter(|e| e.error.is_some())
    }

    pub fn running_ids(&self) -> Vec<OsdId> {
        let mut ids: Vec<OsdId> = self
            .entries
            .iter()
            .filter(|e| e.is_running())
            .filter_map(|e| e.osd_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_converged(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Fires once every unit of a pass has finished.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<ConvergenceReport>,
}

impl Completion {
    pub async fn wait(self) -> ConvergenceReport {
        self.rx.await.unwrap_or_default()
    }
}

enum Unit {
    Device {
        entry: PerfSchemeEntry,
        is_new: bool,
    },
    Dir {
        path: String,
        assignment: OsdIdAssignment,
    },
}

impl Unit {
    fn target(&self) -> (UnitTarget, Option<OsdId>) {
        match self {
            Unit::Device { entry, .. } => (
                UnitTarget::Device(entry.block().map(|b| b.device.clone()).unwrap_or_default()),
                Some(entry.id),
            ),
            Unit::Dir { path, assignment } => (UnitTarget::Dir(path.clone()), assignment.id()),
        }
    }
}

/// Read-only inputs shared by the units of one pass.
struct PassShared {
    conn: Arc<dyn MonConnection>,
    cluster: ClusterInfo,
    metadata: Option<MetadataDeviceInfo>,
    metadata_error: Option<String>,
}

struct PassPlan {
    units: Vec<Unit>,
    reports: Vec<EntryReport>,
    shared: Arc<PassShared>,
}

struct PassProgress {
    reports: Mutex<Vec<EntryReport>>,
    done: Mutex<Option<oneshot::Sender<ConvergenceReport>>>,
}

impl PassProgress {
    async fn finish(&self) {
        let mut entries = std::mem::take(&mut *self.reports.lock().await);
        entries.sort_by(|a, b| a.target.cmp(&b.target));
        let failed = entries.iter().filter(|e| e.error.is_some()).count();
        info!(entries = entries.len(), failed, "reconciliation pass finished");
        if let Some(tx) = self.done.lock().await.take() {
            // nobody waiting is fine
            let _ = tx.send(ConvergenceReport { entries });
        }
    }
}

pub struct Agent {
    factory: Arc<dyn ConnectionFactory>,
    settings: OsdSettings,
    osd_procs: Mutex<HashMap<OsdId, MonitoredProc>>,
    in_flight: Mutex<usize>,
    scheme_lock: Mutex<()>,
}

impl Agent {
    pub fn new(factory: Arc<dyn ConnectionFactory>, settings: OsdSettings) -> Self {
        Agent {
            factory,
            settings,
            osd_procs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(0),
            scheme_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &OsdSettings {
        &self.settings
    }

    /// Ids of the OSD processes currently supervised by this agent.
    pub async fn running_osds(&self) -> Vec<OsdId> {
        let mut ids: Vec<OsdId> = self.osd_procs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn in_flight(&self) -> usize {
        *self.in_flight.lock().await
    }

    /// Register configured directories. Without any configured device or
    /// directory, and nothing saved from earlier runs, the config dir itself
    /// becomes a directory OSD.
    pub async fn initialize(&self, ctx: &Context) -> Result<(), AgentError> {
        let store = ctx.store.as_ref();
        for dir in self.settings.directories.iter().filter(|d| !d.is_empty()) {
            add_desired_dir(store, dir, &ctx.node_id).await?;
        }

        let no_config = self.settings.devices.iter().all(String::is_empty)
            && self.settings.directories.iter().all(String::is_empty)
            && self.settings.metadata_device.is_none();
        if no_config && load_saved_devices(store, &ctx.node_id).await?.is_empty() {
            let dir = ctx.config_dir.display().to_string();
            info!(dir, "no devices configured, using the config dir for a directory osd");
            add_desired_dir(store, &dir, &ctx.node_id).await?;
        }
        Ok(())
    }

    pub async fn load_desired_devices(&self, ctx: &Context) -> Result<DesiredDeviceSet, AgentError> {
        Ok(load_desired_devices(
            ctx.store.as_ref(),
            &ctx.node_id,
            &ctx.inventory,
            &self.settings.devices,
            self.settings.metadata_device.as_deref(),
        )
        .await?)
    }

    /// Start a reconciliation pass.
    ///
    /// Returns once the pass is planned and its units are running; the
    /// returned [`Completion`] fires when the last unit finishes. Fails
    /// when the previous pass is still in flight.
    pub async fn configure_local_service(
        self: &Arc<Self>,
        ctx: Arc<Context>,
    ) -> Result<Completion, AgentError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if *in_flight > 0 {
                return Err(AgentError::PassInProgress(*in_flight));
            }
            // held while planning so a second pass cannot start meanwhile
            *in_flight = 1;
        }

        let PassPlan {
            units,
            reports,
            shared,
        } = match self.plan_pass(&ctx).await {
            Ok(plan) => plan,
            Err(e) => {
                *self.in_flight.lock().await = 0;
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        let progress = Arc::new(PassProgress {
            reports: Mutex::new(reports),
            done: Mutex::new(Some(tx)),
        });

        let total = units.len();
        *self.in_flight.lock().await = total;
        if total == 0 {
            progress.finish().await;
            return Ok(Completion { rx });
        }

        info!(units = total, "configuring local osds");
        for unit in units {
            let agent = self.clone();
            let ctx = ctx.clone();
            let shared = shared.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                let (target, osd_id) = unit.target();
                let report = match tokio::spawn(agent.clone().run_unit(ctx, shared, unit)).await {
                    Ok(report) => report,
                    Err(e) => EntryReport::failed(
                        target,
                        osd_id,
                        ProvisionError::Aborted(e.to_string()),
                    ),
                };
                progress.reports.lock().await.push(report);

                let remaining = {
                    let mut in_flight = agent.in_flight.lock().await;
                    *in_flight = in_flight.saturating_sub(1);
                    *in_flight
                };
                if remaining == 0 {
                    progress.finish().await;
                }
            });
        }
        Ok(Completion { rx })
    }

    async fn plan_pass(&self, ctx: &Context) -> Result<PassPlan, AgentError> {
        let store = ctx.store.as_ref();
        let cluster = load_cluster_info(store).await?;
        let conn = self.factory.connect(ctx, &cluster).await?;

        let mut reports = match self.stop_undesired_devices(ctx).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("failed to stop undesired osds: {e}");
                Vec::new()
            }
        };

        let mut devices = self.load_desired_devices(ctx).await?;
        let mut dirs = load_desired_dirs(store, &ctx.node_id).await?;
        let saved = load_saved_devices(store, &ctx.node_id).await?.entries;

        for malformed in std::mem::take(&mut devices.malformed) {
            let device = ctx
                .inventory
                .disk_by_uuid(&malformed.owner)
                .map_or_else(|| malformed.owner.clone(), |d| d.name.clone());
            reports.push(EntryReport::failed(
                UnitTarget::Device(device),
                None,
                ProvisionError::State(malformed.into()),
            ));
        }
        for malformed in std::mem::take(&mut dirs.malformed) {
            reports.push(EntryReport::failed(
                UnitTarget::Dir(malformed.owner.clone()),
                None,
                ProvisionError::State(malformed.into()),
            ));
        }

        devices.entries.retain(|name, _| {
            if ctx.inventory.disk_by_name(name).is_some() {
                return true;
            }
            warn!(device = name, "desired device is not in the inventory");
            reports.push(EntryReport::failed(
                UnitTarget::Device(name.clone()),
                None,
                ProvisionError::DeviceNotFound(name.clone()),
            ));
            false
        });

        let mut plan =
            plan_partition_scheme(ctx, conn.as_ref(), &mut devices, &self.settings.bluestore)
                .await?;
        for (device, source) in std::mem::take(&mut plan.failed) {
            reports.push(EntryReport::failed(
                UnitTarget::Device(device.clone()),
                None,
                ProvisionError::NoOsdId { device, source },
            ));
        }
        if let Some(conflict) = &plan.metadata_conflict {
            let metadata = conflict.metadata_device().unwrap_or_default();
            for device in std::mem::take(&mut plan.blocked) {
                reports.push(EntryReport::failed(
                    UnitTarget::Device(device),
                    None,
                    ProvisionError::MetadataDevice {
                        device: metadata.clone(),
                        reason: conflict.to_string(),
                    },
                ));
            }
        }

        let provisioner = Provisioner {
            ctx,
            conn: conn.as_ref(),
            cluster: &cluster,
            settings: &self.settings,
            scheme_lock: &self.scheme_lock,
        };
        let metadata_error = match provisioner.prepare_metadata_device(&plan).await {
            Ok(()) => None,
            Err(e) => {
                error!("failed to prepare the metadata device: {e}");
                Some(e.to_string())
            }
        };

        let ids = DeviceIdentities::from_inventory(&ctx.inventory);
        let mut units = Vec::new();
        for entry in &plan.scheme.entries {
            if plan.is_new(entry.id) {
                units.push(Unit::Device {
                    entry: entry.clone(),
                    is_new: true,
                });
                continue;
            }

            let device = entry.block().map(|b| b.device.clone()).unwrap_or_default();
            let desired_by_uuid = entry
                .data_disk_uuid()
                .and_then(|uuid| saved.get(uuid))
                .is_some_and(|e| e.data.id() == Some(entry.id));
            let desired = desired_by_uuid || devices.entries.contains_key(&device);
            if !desired {
                debug!(osd = entry.id, device, "committed osd is not desired");
                continue;
            }

            let missing = missing_disks_for_entry(entry, &ids);
            if !missing.is_empty() {
                warn!(osd = entry.id, device, "skipping osd with missing disks");
                reports.push(EntryReport::failed(
                    UnitTarget::Device(device),
                    Some(entry.id),
                    ProvisionError::MissingDisks {
                        id: entry.id,
                        disks: missing,
                    },
                ));
                continue;
            }
            units.push(Unit::Device {
                entry: entry.clone(),
                is_new: false,
            });
        }
        for (path, assignment) in dirs.entries {
            units.push(Unit::Dir { path, assignment });
        }

        Ok(PassPlan {
            units,
            reports,
            shared: Arc::new(PassShared {
                conn,
                cluster,
                metadata: plan.scheme.metadata.clone(),
                metadata_error,
            }),
        })
    }

    async fn run_unit(
        self: Arc<Self>,
        ctx: Arc<Context>,
        shared: Arc<PassShared>,
        unit: Unit,
    ) -> EntryReport {
        match unit {
            Unit::Device { entry, is_new } => {
                self.configure_device(&ctx, &shared, entry, is_new)
                    .await
            }
            Unit::Dir { path, assignment } => {
                self.configure_dir(&ctx, &shared, path, assignment)
                    .await
            }
        }
    }

    fn provisioner<'a>(&'a self, ctx: &'a Context, shared: &'a PassShared) -> Provisioner<'a> {
        Provisioner {
            ctx,
            conn: shared.conn.as_ref(),
            cluster: &shared.cluster,
            settings: &self.settings,
            scheme_lock: &self.scheme_lock,
        }
    }

    async fn configure_device(
        &self,
        ctx: &Context,
        shared: &PassShared,
        entry: PerfSchemeEntry,
        is_new: bool,
    ) -> EntryReport {
        let device = entry.block().map(|b| b.device.clone()).unwrap_or_default();
        let mut report = EntryReport::new(UnitTarget::Device(device.clone()), Some(entry.id));
        if self.is_running(entry.id).await {
            debug!(osd = entry.id, device, "osd already running");
            report.state = OsdState::Running;
            return report;
        }
        report.advance(OsdState::Provisioning);

        let provisioner = self.provisioner(ctx, shared);
        let layout = match prepare_device(&provisioner, shared, &entry, is_new).await {
            Ok(layout) => layout,
            Err(e) => return report.fail(e),
        };

        let weight = ctx
            .inventory
            .disk_by_name(&device)
            .map_or(crush_weight(0), |d| crush_weight(d.size));
        if let Err(e) = provisioner.place_in_crush(entry.id, weight).await {
            warn!(osd = entry.id, "failed to update crush location: {e}");
            report.warnings.push(e);
        }

        if let Err(e) = self.start_osd(ctx, &provisioner, &layout).await {
            return report.fail(e);
        }
        let record_errors = provisioner
            .record_device(&entry, shared.metadata.as_ref())
            .await;
        report.warnings.extend(record_errors);
        report.advance(OsdState::Running);
        report
    }

    async fn configure_dir(
        &self,
        ctx: &Context,
        shared: &PassShared,
        path: String,
        assignment: OsdIdAssignment,
    ) -> EntryReport {
        let mut report = EntryReport::new(UnitTarget::Dir(path.clone()), assignment.id());
        let (id, osd_uuid) = match assignment {
            OsdIdAssignment::Assigned(id) => (id, Uuid::new_v4()),
            OsdIdAssignment::Unassigned => {
                let osd_uuid = Uuid::new_v4();
                let id = match shared.conn.create_osd(osd_uuid).await {
                    Ok(id) => id,
                    Err(source) => {
                        return report.fail(ProvisionError::NoOsdId {
                            device: path,
                            source,
                        });
                    }
                };
                report.osd_id = Some(id);
                if let Err(e) =
                    set_desired_dir_osd(ctx.store.as_ref(), &ctx.node_id, &path, id).await
                {
                    return report.fail(e.into());
                }
                info!(osd = id, dir = path, "assigned osd id to directory");
                (id, osd_uuid)
            }
        };

        if self.is_running(id).await {
            debug!(osd = id, dir = path, "osd already running");
            report.state = OsdState::Running;
            return report;
        }
        report.advance(OsdState::Provisioning);

        let provisioner = self.provisioner(ctx, shared);
        let layout = OsdLayout::for_dir(Path::new(&path), id, osd_uuid);
        if let Err(e) = provisioner.format_osd(&layout).await {
            return report.fail(e);
        }

        let weight = match dir_capacity(Path::new(&path)) {
            Ok(bytes) => crush_weight(bytes),
            Err(e) => {
                report.warnings.push(e);
                crush_weight(0)
            }
        };
        if let Err(e) = provisioner.place_in_crush(id, weight).await {
            warn!(osd = id, "failed to update crush location: {e}");
            report.warnings.push(e);
        }

        if let Err(e) = self.start_osd(ctx, &provisioner, &layout).await {
            return report.fail(e);
        }
        let record_errors = provisioner.record_dir(&path, id).await;
        report.warnings.extend(record_errors);
        report.advance(OsdState::Running);
        report
    }

    /// Whether `id` has a live supervised process. A handle whose supervisor
    /// gave up is dropped from the table.
    async fn is_running(&self, id: OsdId) -> bool {
        let stale = {
            let mut procs = self.osd_procs.lock().await;
            let finished = match procs.get(&id) {
                Some(proc) => proc.is_finished(),
                None => return false,
            };
            if !finished {
                return true;
            }
            procs.remove(&id)
        };
        if let Some(proc) = stale {
            info!(osd = id, "osd process is gone, starting it again");
            if let Err(e) = proc.stop().await {
                debug!(osd = id, "stale osd handle: {e}");
            }
        }
        false
    }

    async fn start_osd(
        &self,
        ctx: &Context,
        provisioner: &Provisioner<'_>,
        layout: &OsdLayout,
    ) -> Result<(), ProvisionError> {
        let proc = ctx
            .proc_man
            .start(
                &format!("osd{}", layout.id),
                &self.settings.osd_binary,
                provisioner.daemon_args(layout),
            )
            .await?;
        let previous = self.osd_procs.lock().await.insert(layout.id, proc);
        if let Some(previous) = previous {
            warn!(osd = layout.id, "replacing an existing osd process handle");
            if let Err(e) = previous.stop().await {
                warn!(osd = layout.id, "failed to stop replaced osd process: {e}");
            }
        }
        info!(osd = layout.id, "osd started");
        Ok(())
    }

    /// Stop every OSD that is applied on this node but no longer desired.
    ///
    /// Each orphan is stopped and its applied record removed, with one report
    /// per orphan. An OSD that may belong to a malformed desired record is
    /// left alone.
    pub async fn stop_undesired_devices(
        &self,
        ctx: &Context,
    ) -> Result<Vec<EntryReport>, AgentError> {
        let store = ctx.store.as_ref();
        let desired = self.load_desired_devices(ctx).await?;
        let dirs = load_desired_dirs(store, &ctx.node_id).await?;
        let applied = get_applied_osds(&ctx.node_id, store).await?;

        let mut wanted: HashSet<OsdId> = desired
            .entries
            .values()
            .filter_map(|e| e.data.id())
            .collect();
        wanted.extend(dirs.entries.values().filter_map(|a| a.id()));

        let mut reports = Vec::new();
        for (id, disk_uuid) in applied {
            if wanted.contains(&id) {
                continue;
            }
            let unreadable = if disk_uuid.is_empty() {
                !dirs.malformed.is_empty()
            } else {
                desired.is_malformed(&disk_uuid)
            };
            if unreadable {
                warn!(osd = id, disk_uuid, "desired record is malformed, leaving osd alone");
                continue;
            }
            info!(osd = id, disk_uuid, "osd is applied but not desired, stopping it");
            reports.push(self.stop_osd(ctx, id).await);
        }
        Ok(reports)
    }

    async fn stop_osd(&self, ctx: &Context, id: OsdId) -> EntryReport {
        let mut report = EntryReport::new(UnitTarget::Orphan(id), Some(id));
        // applied means it was started at some point
        report.state = OsdState::Running;
        report.advance(OsdState::Stopping);

        let proc = self.osd_procs.lock().await.remove(&id);
        if let Some(proc) = proc {
            if let Err(e) = proc.stop().await {
                return report.fail(e.into());
            }
        }
        if let Err(e) = remove_applied_osd(ctx.store.as_ref(), &ctx.node_id, id).await {
            return report.fail(e.into());
        }
        report.advance(OsdState::Removed);
        report
    }

    /// Stop every supervised OSD process.
    pub async fn destroy_local_service(&self) -> Result<(), AgentError> {
        let procs: Vec<(OsdId, MonitoredProc)> = self.osd_procs.lock().await.drain().collect();
        let mut last_err = None;
        for (id, proc) in procs {
            info!(osd = id, "stopping osd");
            if let Err(source) = proc.stop().await {
                error!(osd = id, "failed to stop osd: {source}");
                last_err = Some(AgentError::Stop { id, source });
            }
        }
        last_err.map_or(Ok(()), Err)
    }
}

async fn prepare_device(
    provisioner: &Provisioner<'_>,
    shared: &PassShared,
    entry: &PerfSchemeEntry,
    is_new: bool,
) -> Result<OsdLayout, ProvisionError> {
    if is_new {
        if !entry.is_collocated() {
            if let (Some(reason), Some(metadata)) = (&shared.metadata_error, &shared.metadata) {
                return Err(ProvisionError::MetadataDevice {
                    device: metadata.device.clone(),
                    reason: reason.clone(),
                });
            }
        }
        provisioner.partition_device(entry).await?;
    }
    let layout = OsdLayout::for_device(&provisioner.ctx.config_dir, entry)
        .ok_or(ProvisionError::NoBlockPartition(entry.id))?;
    provisioner.format_osd(&layout).await?;
    Ok(layout)
}
