//! Fixtures: externally managed groups of processes providing the database
//! endpoint under test.
//!
//! The root fixture is the sharded cluster ([`cluster::ShardedClusterFixture`]):
//! one config-server replica set, one or more shard replica sets, and one or
//! more router processes. Lifecycle is strictly
//! `not-initialized -> set-up -> ready -> stopping -> torn-down`; illegal
//! transitions are harness bugs and fail with an internal error.

use std::path::PathBuf;
use std::sync::Arc;

pub mod client;
pub mod cluster;
pub mod ports;
pub mod replset;
pub mod router;

pub use client::{AuthOptions, ClusterClient, ShellClient};
pub use cluster::{ShardedClusterConfig, ShardedClusterFixture};
pub use ports::PortAllocator;
pub use shoal_process::StopMode as TeardownMode;

use shoal_core::Result;

/// One fixture process, for logging and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub log_name: String,
}

/// A sub-fixture that by itself exposes a complete database endpoint.
///
/// For a sharded cluster the independent clusters are each shard replica set
/// plus the config server; per-cluster hooks run once against each.
pub trait ClusterEndpoint {
    /// Comma-joined `host:port` list, prefixed with the replica-set name
    /// where one exists.
    fn internal_connection_string(&self) -> Result<String>;

    /// `mongodb://` URL for driver clients.
    fn driver_connection_url(&self) -> Result<String>;

    fn node_info(&self) -> Vec<NodeInfo>;
}

/// Lifecycle contract shared by the cluster fixture and its children.
///
/// Only the controlling thread may call lifecycle methods; hooks running
/// concurrently with a test interact with the fixture solely through the
/// connection string and client obtained after `await_ready`.
pub trait Fixture: ClusterEndpoint {
    /// not-initialized -> set-up. Creates and starts child fixtures.
    fn setup(&mut self) -> Result<()>;

    /// set-up -> ready. Blocks until every child reports ready.
    fn await_ready(&mut self) -> Result<()>;

    /// ready -> stopping -> torn-down. Aggregates partial failures.
    fn teardown(&mut self, mode: TeardownMode) -> Result<()>;

    /// Logical AND over every owned process.
    fn is_running(&mut self) -> bool;

    /// The endpoints per-cluster hooks run against.
    fn independent_clusters(&self) -> Vec<&dyn ClusterEndpoint>;

    /// Root of the on-disk data directories, for the archive sink.
    fn path_for_archival(&self) -> Option<PathBuf>;

    /// The management client authenticated with the fixture's credentials.
    fn client(&self) -> Arc<dyn ClusterClient>;
}

/// Fixture lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotInitialized,
    SetUp,
    Ready,
    Stopping,
    TornDown,
}
