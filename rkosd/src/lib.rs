//! rkosd: per-node OSD agent for rk8s storage nodes.
//!
//! The agent reads the node's desired OSD assignments from Xline, lays out
//! partitions on local disks, formats OSDs and keeps their daemons running.

pub mod agent;
pub mod cephconf;
pub mod cli;
pub mod config;
pub mod context;
pub mod daemon;
pub mod exec;
pub mod inventory;
pub mod mon;
pub mod proc;
pub mod provision;
pub mod scheme;
pub mod state;
pub mod store;

pub use agent::{
    Agent, AgentError, Completion, ConvergenceReport, EntryReport, OsdSettings, OsdState,
    UnitTarget,
};
pub use context::Context;
pub use store::{ConfigStore, MemStore, StoreError, XlineStore};
