use std::path::PathBuf;
use std::sync::Arc;

use common::Inventory;

use crate::exec::Executor;
use crate::proc::ProcManager;
use crate::store::ConfigStore;

/// Everything a reconciliation pass needs from the node it runs on.
#[derive(Clone)]
pub struct Context {
    pub node_id: String,
    pub config_dir: PathBuf,
    pub store: Arc<dyn ConfigStore>,
    pub executor: Arc<dyn Executor>,
    pub proc_man: ProcManager,
    /// Snapshot taken at the start of the pass.
    pub inventory: Inventory,
}

impl Context {
    pub fn new(
        node_id: impl Into<String>,
        config_dir: impl Into<PathBuf>,
        store: Arc<dyn ConfigStore>,
        executor: Arc<dyn Executor>,
        proc_man: ProcManager,
    ) -> Self {
        Context {
            node_id: node_id.into(),
            config_dir: config_dir.into(),
            store,
            executor,
            proc_man,
            inventory: Inventory::default(),
        }
    }

    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = inventory;
        self
    }
}
