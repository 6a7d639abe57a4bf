//! The sharded-cluster fixture: a config-server replica set, one or more
//! shard replica sets, and one or more mongos routers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Map, Value};

use shoal_core::{Error, Result};

use crate::client::{command_ok, AuthOptions, ClusterClient};
use crate::ports::PortAllocator;
use crate::replset::{ReplSetConfig, ReplicaSetFixture};
use crate::router::{RouterConfig, RouterFixture};
use crate::{ClusterEndpoint, Fixture, LifecycleState, NodeInfo, TeardownMode};

/// Suite-facing configuration, deserialized from the suite's
/// `fixture.options` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardedClusterConfig {
    #[serde(default = "default_one")]
    pub num_shards: usize,
    #[serde(default = "default_one")]
    pub num_rs_nodes_per_shard: usize,
    #[serde(default = "default_one")]
    pub num_config_nodes: usize,
    #[serde(default = "default_one")]
    pub num_mongos: usize,
    #[serde(default = "default_true")]
    pub enable_balancer: bool,
    #[serde(default = "default_true")]
    pub enable_autosplit: bool,
    /// Databases to enable sharding on once the cluster is assembled.
    #[serde(default)]
    pub enable_sharding: Vec<String>,
    #[serde(default = "default_mongod")]
    pub mongod_executable: PathBuf,
    #[serde(default = "default_mongos")]
    pub mongos_executable: PathBuf,
    /// Extra mongod arguments applied to every data-bearing node.
    #[serde(default)]
    pub mongod_options: Vec<String>,
    /// Extra mongod arguments for config-server nodes only.
    #[serde(default)]
    pub configsvr_options: Vec<String>,
    /// Extra mongod arguments for shard nodes only.
    #[serde(default)]
    pub shard_options: Vec<String>,
    /// Extra mongos arguments, passed through verbatim.
    #[serde(default)]
    pub mongos_options: Vec<String>,
    /// Credentials for the management client.
    #[serde(default)]
    pub auth_options: Option<AuthOptions>,
    /// mongos `--setParameter` overrides.
    #[serde(default)]
    pub mongos_set_parameters: Map<String, Value>,
    /// One binary-version tag per data-bearing shard node, in shard-major
    /// order. Length must be `num_shards * num_rs_nodes_per_shard`.
    #[serde(default)]
    pub mixed_bin_versions: Option<Vec<String>>,
    #[serde(default = "default_dbpath_prefix")]
    pub dbpath_prefix: PathBuf,
    #[serde(default)]
    pub preserve_dbpath: bool,
    #[serde(default = "default_await_ready_timeout_secs")]
    pub await_ready_timeout_secs: u64,
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_mongod() -> PathBuf {
    PathBuf::from("mongod")
}

fn default_mongos() -> PathBuf {
    PathBuf::from("mongos")
}

fn default_dbpath_prefix() -> PathBuf {
    PathBuf::from("data")
}

fn default_await_ready_timeout_secs() -> u64 {
    60
}

impl ShardedClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 {
            return Err(Error::config("num_shards must be at least 1"));
        }
        if self.num_rs_nodes_per_shard == 0 {
            return Err(Error::config("num_rs_nodes_per_shard must be at least 1"));
        }
        if self.num_config_nodes == 0 {
            return Err(Error::config("num_config_nodes must be at least 1"));
        }
        if self.num_mongos == 0 {
            return Err(Error::config("num_mongos must be at least 1"));
        }
        if let Some(versions) = &self.mixed_bin_versions {
            let expected = self.num_shards * self.num_rs_nodes_per_shard;
            if versions.len() != expected {
                return Err(Error::config(format!(
                    "mixed_bin_versions has {} entries; {} shards with {} nodes each need {}",
                    versions.len(),
                    self.num_shards,
                    self.num_rs_nodes_per_shard,
                    expected
                )));
            }
        }
        Ok(())
    }

    fn await_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.await_ready_timeout_secs)
    }
}

pub struct ShardedClusterFixture {
    config: ShardedClusterConfig,
    state: LifecycleState,
    configsvr: Option<ReplicaSetFixture>,
    shards: Vec<ReplicaSetFixture>,
    routers: Vec<RouterFixture>,
    allocator: Arc<PortAllocator>,
    client: Arc<dyn ClusterClient>,
}

impl ShardedClusterFixture {
    pub fn new(
        config: ShardedClusterConfig,
        allocator: Arc<PortAllocator>,
        client: Arc<dyn ClusterClient>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: LifecycleState::NotInitialized,
            configsvr: None,
            shards: Vec::new(),
            routers: Vec::new(),
            allocator,
            client,
        })
    }

    fn mongod_options_with(&self, extra: &[String]) -> Vec<String> {
        let mut options = self.config.mongod_options.clone();
        options.extend(extra.iter().cloned());
        options
    }

    fn configsvr_config(&self) -> ReplSetConfig {
        ReplSetConfig {
            name: "config-rs".to_string(),
            num_nodes: self.config.num_config_nodes,
            configsvr: true,
            shardsvr: false,
            mongod_executable: self.config.mongod_executable.clone(),
            mongod_options: self.mongod_options_with(&self.config.configsvr_options),
            bin_versions: None,
            dbpath_prefix: self.config.dbpath_prefix.clone(),
            preserve_dbpath: self.config.preserve_dbpath,
            await_ready_timeout: self.config.await_ready_timeout(),
        }
    }

    fn shard_config(&self, index: usize) -> ReplSetConfig {
        let bin_versions = self.config.mixed_bin_versions.as_ref().map(|versions| {
            let per_shard = self.config.num_rs_nodes_per_shard;
            versions[index * per_shard..(index + 1) * per_shard].to_vec()
        });
        ReplSetConfig {
            name: format!("shard-rs{index}"),
            num_nodes: self.config.num_rs_nodes_per_shard,
            configsvr: false,
            shardsvr: true,
            mongod_executable: self.config.mongod_executable.clone(),
            mongod_options: self.mongod_options_with(&self.config.shard_options),
            bin_versions,
            dbpath_prefix: self.config.dbpath_prefix.clone(),
            preserve_dbpath: self.config.preserve_dbpath,
            await_ready_timeout: self.config.await_ready_timeout(),
        }
    }

    fn router_config(&self, index: usize, configdb: String) -> RouterConfig {
        RouterConfig {
            name: format!("s{index}"),
            mongos_executable: self.config.mongos_executable.clone(),
            configdb,
            mongos_options: self.config.mongos_options.clone(),
            set_parameters: self.config.mongos_set_parameters.clone(),
            await_ready_timeout: self.config.await_ready_timeout(),
        }
    }

    fn configsvr_mut(&mut self) -> Result<&mut ReplicaSetFixture> {
        self.configsvr
            .as_mut()
            .ok_or_else(|| Error::internal("config server accessed before setup()"))
    }

    fn router_target(&self) -> Result<String> {
        self.routers
            .first()
            .ok_or_else(|| Error::internal("router accessed before await_ready()"))?
            .target()
    }

    fn run_on_router(&self, db: &str, command: Value) -> Result<Value> {
        let target = self.router_target()?;
        let response = self.client.run_command(&target, db, &command)?;
        if !command_ok(&response) {
            return Err(Error::server_failure(format!(
                "command {command} against {target} failed: {response}"
            )));
        }
        Ok(response)
    }

    fn stop_balancer(&self) -> Result<()> {
        self.run_on_router("admin", json!({"balancerStop": 1, "maxTimeMS": 60000}))?;
        Ok(())
    }

    fn disable_autosplit(&self) -> Result<()> {
        self.run_on_router(
            "config",
            json!({
                "update": "settings",
                "updates": [{
                    "q": {"_id": "autosplit"},
                    "u": {"$set": {"enabled": false}},
                    "upsert": true,
                }],
                "writeConcern": {"w": "majority"},
            }),
        )?;
        Ok(())
    }

    fn add_shards(&self) -> Result<()> {
        for shard in &self.shards {
            let connection_string = shard.internal_connection_string()?;
            self.run_on_router(
                "admin",
                json!({"addShard": connection_string, "name": shard.name()}),
            )?;
        }
        Ok(())
    }

    fn enable_sharding(&self) -> Result<()> {
        for db in &self.config.enable_sharding {
            self.run_on_router("admin", json!({"enableSharding": db}))?;
        }
        Ok(())
    }
}

impl ClusterEndpoint for ShardedClusterFixture {
    fn internal_connection_string(&self) -> Result<String> {
        if self.routers.is_empty() {
            return Err(Error::internal(
                "internal_connection_string called before routers are up",
            ));
        }
        let targets: Result<Vec<String>> =
            self.routers.iter().map(RouterFixture::target).collect();
        Ok(targets?.join(","))
    }

    fn driver_connection_url(&self) -> Result<String> {
        Ok(format!("mongodb://{}", self.internal_connection_string()?))
    }

    fn node_info(&self) -> Vec<NodeInfo> {
        let mut info = Vec::new();
        if let Some(configsvr) = &self.configsvr {
            info.extend(configsvr.node_info());
        }
        for shard in &self.shards {
            info.extend(shard.node_info());
        }
        for router in &self.routers {
            info.extend(router.node_info());
        }
        info
    }
}

impl Fixture for ShardedClusterFixture {
    fn setup(&mut self) -> Result<()> {
        // A torn-down cluster may be set up again (restart after archival).
        if !matches!(
            self.state,
            LifecycleState::NotInitialized | LifecycleState::TornDown
        ) {
            return Err(Error::internal(format!(
                "setup() called on sharded cluster in state {:?}",
                self.state
            )));
        }
        self.configsvr = None;
        self.shards.clear();
        self.routers.clear();

        let mut configsvr = ReplicaSetFixture::new(
            self.configsvr_config(),
            Arc::clone(&self.allocator),
            Arc::clone(&self.client),
        )?;
        configsvr.setup()?;
        self.configsvr = Some(configsvr);

        for index in 0..self.config.num_shards {
            let mut shard = ReplicaSetFixture::new(
                self.shard_config(index),
                Arc::clone(&self.allocator),
                Arc::clone(&self.client),
            )?;
            shard.setup()?;
            self.shards.push(shard);
        }

        self.state = LifecycleState::SetUp;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<()> {
        if self.state != LifecycleState::SetUp {
            return Err(Error::internal(format!(
                "await_ready() called on sharded cluster in state {:?}",
                self.state
            )));
        }

        self.configsvr_mut()?.await_ready()?;
        for shard in &mut self.shards {
            shard.await_ready()?;
        }

        // Routers only start once the config server can serve them.
        let configdb = self
            .configsvr
            .as_ref()
            .ok_or_else(|| Error::internal("config server missing after setup()"))?
            .internal_connection_string()?;
        for index in 0..self.config.num_mongos {
            let mut router = RouterFixture::new(
                self.router_config(index, configdb.clone()),
                Arc::clone(&self.allocator),
                Arc::clone(&self.client),
            );
            router.setup()?;
            router.await_ready()?;
            self.routers.push(router);
        }

        if !self.config.enable_balancer {
            self.stop_balancer()?;
        }
        if !self.config.enable_autosplit {
            self.disable_autosplit()?;
        }

        self.add_shards()?;
        self.configsvr_mut()?.await_last_op_committed()?;
        self.enable_sharding()?;

        // Every data-bearing node must answer a ping before the cluster
        // counts as ready.
        let deadline = Instant::now() + self.config.await_ready_timeout();
        self.configsvr_mut()?.await_all_nodes(deadline)?;
        for shard in &mut self.shards {
            shard.await_all_nodes(deadline)?;
        }

        if let Some(configsvr) = &self.configsvr {
            configsvr.refresh_logical_session_cache()?;
        }
        for shard in &self.shards {
            shard.refresh_logical_session_cache()?;
        }

        self.state = LifecycleState::Ready;
        tracing::info!(
            target: "shoal::fixture",
            shards = self.shards.len(),
            routers = self.routers.len(),
            "sharded cluster ready"
        );
        Ok(())
    }

    fn teardown(&mut self, mode: TeardownMode) -> Result<()> {
        if self.state == LifecycleState::NotInitialized || self.state == LifecycleState::TornDown {
            return Ok(());
        }

        // A balancer round mid-shutdown can wedge a graceful stop.
        if self.state == LifecycleState::Ready
            && self.config.enable_balancer
            && mode == TeardownMode::Graceful
        {
            if let Err(err) = self.stop_balancer() {
                tracing::warn!(
                    target: "shoal::fixture",
                    error = %err,
                    "failed to stop the balancer before teardown"
                );
            }
        }
        self.state = LifecycleState::Stopping;

        let mut failures = Vec::new();
        for router in &mut self.routers {
            if let Err(err) = router.teardown(mode) {
                failures.push(err.to_string());
            }
        }
        for shard in &mut self.shards {
            if let Err(err) = shard.teardown(mode) {
                failures.push(err.to_string());
            }
        }
        if let Some(configsvr) = &mut self.configsvr {
            if let Err(err) = configsvr.teardown(mode) {
                failures.push(err.to_string());
            }
        }

        self.state = LifecycleState::TornDown;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::server_failure(format!(
                "sharded cluster teardown failed: {}",
                failures.join("; ")
            )))
        }
    }

    fn is_running(&mut self) -> bool {
        if self.state != LifecycleState::Ready {
            return false;
        }
        let configsvr_ok = self
            .configsvr
            .as_mut()
            .map_or(false, ReplicaSetFixture::is_running);
        configsvr_ok
            && self.shards.iter_mut().all(ReplicaSetFixture::is_running)
            && self.routers.iter_mut().all(RouterFixture::is_running)
    }

    fn independent_clusters(&self) -> Vec<&dyn ClusterEndpoint> {
        let mut clusters: Vec<&dyn ClusterEndpoint> = self
            .shards
            .iter()
            .map(|shard| shard as &dyn ClusterEndpoint)
            .collect();
        if let Some(configsvr) = &self.configsvr {
            clusters.push(configsvr as &dyn ClusterEndpoint);
        }
        clusters
    }

    fn path_for_archival(&self) -> Option<PathBuf> {
        Some(self.config.dbpath_prefix.clone())
    }

    fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.client)
    }
}
