//! Replica-set subfixture, used for the config server and for each shard.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use shoal_core::{Error, Result};
use shoal_process::ManagedProcess;

use crate::client::{command_error_code, command_ok, ClusterClient, WRITE_CONCERN_FAILED};
use crate::ports::PortAllocator;
use crate::{ClusterEndpoint, Fixture, LifecycleState, NodeInfo, TeardownMode};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ReplSetConfig {
    /// Replica-set name, also used as the logical fixture name.
    pub name: String,
    /// Number of nodes; must be positive.
    pub num_nodes: usize,
    /// Start nodes with `--configsvr`.
    pub configsvr: bool,
    /// Start nodes with `--shardsvr`.
    pub shardsvr: bool,
    pub mongod_executable: PathBuf,
    /// Extra command-line arguments from the suite's opaque options.
    pub mongod_options: Vec<String>,
    /// Optional per-node binary-version tags. When set, node `i` runs the
    /// executable named `{mongod_executable}-{tag}`.
    pub bin_versions: Option<Vec<String>>,
    pub dbpath_prefix: PathBuf,
    pub preserve_dbpath: bool,
    pub await_ready_timeout: Duration,
}

struct Node {
    process: ManagedProcess,
    port: u16,
    name: String,
    dbpath: PathBuf,
}

pub struct ReplicaSetFixture {
    config: ReplSetConfig,
    state: LifecycleState,
    nodes: Vec<Node>,
    allocator: Arc<PortAllocator>,
    client: Arc<dyn ClusterClient>,
}

impl ReplicaSetFixture {
    pub fn new(
        config: ReplSetConfig,
        allocator: Arc<PortAllocator>,
        client: Arc<dyn ClusterClient>,
    ) -> Result<Self> {
        if config.num_nodes == 0 {
            return Err(Error::config(format!(
                "replica set {} must have at least one node",
                config.name
            )));
        }
        if let Some(versions) = &config.bin_versions {
            if versions.len() != config.num_nodes {
                return Err(Error::config(format!(
                    "replica set {}: {} binary-version tags for {} nodes",
                    config.name,
                    versions.len(),
                    config.num_nodes
                )));
            }
        }
        Ok(Self {
            config,
            state: LifecycleState::NotInitialized,
            nodes: Vec::new(),
            allocator,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// `host:port` of the member treated as primary (member 0 carries the
    /// highest election priority).
    pub fn primary_target(&self) -> Result<String> {
        let node = self
            .nodes
            .first()
            .ok_or_else(|| Error::internal("primary_target called before setup()"))?;
        Ok(format!("localhost:{}", node.port))
    }

    fn executable_for(&self, index: usize) -> PathBuf {
        match self
            .config
            .bin_versions
            .as_ref()
            .and_then(|versions| versions.get(index))
        {
            Some(tag) => {
                let mut name = self.config.mongod_executable.as_os_str().to_os_string();
                name.push(format!("-{tag}"));
                PathBuf::from(name)
            }
            None => self.config.mongod_executable.clone(),
        }
    }

    fn node_args(&self, port: u16, dbpath: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "--replSet".to_string(),
            self.config.name.clone(),
            "--port".to_string(),
            port.to_string(),
            "--dbpath".to_string(),
            dbpath.to_string_lossy().into_owned(),
            "--setParameter".to_string(),
            "enableTestCommands=1".to_string(),
        ];
        if self.config.configsvr {
            args.push("--configsvr".to_string());
        }
        if self.config.shardsvr {
            args.push("--shardsvr".to_string());
        }
        args.extend(self.config.mongod_options.iter().cloned());
        args
    }

    fn await_node_ready(&mut self, index: usize, deadline: Instant) -> Result<()> {
        let port = self.nodes[index].port;
        let target = format!("localhost:{port}");
        loop {
            if let Some(status) = self.nodes[index].process.poll_exit()? {
                let code = status.code().unwrap_or(-1);
                return Err(Error::server_failure(format!(
                    "mongod on port {port} process ended unexpectedly with exit code {code}"
                )));
            }
            if let Ok(response) = self.client.run_admin_command(&target, &json!({"ping": 1})) {
                if command_ok(&response) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::server_failure(format!(
                    "Failed to connect to mongod on port {port}"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn initiate(&self, deadline: Instant) -> Result<()> {
        let members: Vec<Value> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                json!({
                    "_id": index,
                    "host": format!("localhost:{}", node.port),
                    // Member 0 wins elections so the primary is predictable.
                    "priority": if index == 0 { 2 } else { 1 },
                })
            })
            .collect();
        let initiate = json!({
            "replSetInitiate": {
                "_id": self.config.name,
                "configsvr": self.config.configsvr,
                "members": members,
            }
        });

        let target = self.primary_target()?;
        let response = self.client.run_admin_command(&target, &initiate)?;
        if !command_ok(&response) {
            return Err(Error::server_failure(format!(
                "replSetInitiate on {} failed: {response}",
                self.config.name
            )));
        }

        // Wait for member 0 to win the election.
        loop {
            if let Ok(status) = self
                .client
                .run_admin_command(&target, &json!({"replSetGetStatus": 1}))
            {
                if command_ok(&status)
                    && status.get("myState").and_then(Value::as_i64) == Some(1)
                {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::server_failure(format!(
                    "replica set {} did not elect a primary",
                    self.config.name
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Block until the last config write is committed on a majority.
    pub fn await_last_op_committed(&self) -> Result<()> {
        let target = self.primary_target()?;
        let deadline = Instant::now() + self.config.await_ready_timeout;
        loop {
            let status = self
                .client
                .run_admin_command(&target, &json!({"replSetGetStatus": 1}))?;
            if command_ok(&status) && applied_is_durable(&status) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::server_failure(format!(
                    "replica set {} did not commit its last operation",
                    self.config.name
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Refresh the logical-session cache on the primary, tolerating a
    /// write-concern failure by awaiting commit explicitly.
    pub fn refresh_logical_session_cache(&self) -> Result<()> {
        let target = self.primary_target()?;
        let response = self
            .client
            .run_admin_command(&target, &json!({"refreshLogicalSessionCacheNow": 1}))?;
        if command_ok(&response) {
            return Ok(());
        }
        if command_error_code(&response) == Some(WRITE_CONCERN_FAILED) {
            tracing::info!(
                target: "shoal::fixture",
                replset = %self.config.name,
                "session cache refresh hit a write-concern failure; awaiting commit instead"
            );
            return self.await_last_op_committed();
        }
        Err(Error::server_failure(format!(
            "refreshLogicalSessionCacheNow on {} failed: {response}",
            self.config.name
        )))
    }

    /// Poll every data-bearing node with a ping until it responds.
    pub fn await_all_nodes(&mut self, deadline: Instant) -> Result<()> {
        for index in 0..self.nodes.len() {
            self.await_node_ready(index, deadline)?;
        }
        Ok(())
    }
}

fn applied_is_durable(status: &Value) -> bool {
    let optimes = status.get("optimes");
    match (
        optimes.and_then(|o| o.get("appliedOpTime")),
        optimes.and_then(|o| o.get("durableOpTime")),
    ) {
        (Some(applied), Some(durable)) => applied == durable,
        // Older servers don't report optimes; a successful status is enough.
        _ => true,
    }
}

impl ClusterEndpoint for ReplicaSetFixture {
    fn internal_connection_string(&self) -> Result<String> {
        if self.nodes.is_empty() {
            return Err(Error::internal(
                "internal_connection_string called before setup()",
            ));
        }
        let hosts: Vec<String> = self
            .nodes
            .iter()
            .map(|node| format!("localhost:{}", node.port))
            .collect();
        Ok(format!("{}/{}", self.config.name, hosts.join(",")))
    }

    fn driver_connection_url(&self) -> Result<String> {
        if self.nodes.is_empty() {
            return Err(Error::internal(
                "driver_connection_url called before setup()",
            ));
        }
        let hosts: Vec<String> = self
            .nodes
            .iter()
            .map(|node| format!("localhost:{}", node.port))
            .collect();
        Ok(format!(
            "mongodb://{}/?replicaSet={}",
            hosts.join(","),
            self.config.name
        ))
    }

    fn node_info(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .map(|node| NodeInfo {
                name: node.name.clone(),
                pid: node.process.pid(),
                port: node.port,
                log_name: format!("{}:{}", self.config.name, node.name),
            })
            .collect()
    }
}

impl Fixture for ReplicaSetFixture {
    fn setup(&mut self) -> Result<()> {
        // A torn-down fixture may be set up again (restart after archival).
        if !matches!(
            self.state,
            LifecycleState::NotInitialized | LifecycleState::TornDown
        ) {
            return Err(Error::internal(format!(
                "setup() called on replica set {} in state {:?}",
                self.config.name, self.state
            )));
        }
        self.nodes.clear();

        for index in 0..self.config.num_nodes {
            let port = self.allocator.next_port();
            let name = format!("node{index}");
            let dbpath = self
                .config
                .dbpath_prefix
                .join(&self.config.name)
                .join(&name);
            fs::create_dir_all(&dbpath)?;

            let args = self.node_args(port, &dbpath);
            let process = ManagedProcess::spawn(
                format!("{}:{}", self.config.name, name),
                &self.executable_for(index),
                &args,
                &[],
            )?;
            self.nodes.push(Node {
                process,
                port,
                name,
                dbpath,
            });
        }

        self.state = LifecycleState::SetUp;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<()> {
        if self.state != LifecycleState::SetUp {
            return Err(Error::internal(format!(
                "await_ready() called on replica set {} in state {:?}",
                self.config.name, self.state
            )));
        }

        let deadline = Instant::now() + self.config.await_ready_timeout;
        self.await_all_nodes(deadline)?;
        self.initiate(deadline)?;
        self.state = LifecycleState::Ready;
        tracing::info!(
            target: "shoal::fixture",
            replset = %self.config.name,
            nodes = self.nodes.len(),
            "replica set ready"
        );
        Ok(())
    }

    fn teardown(&mut self, mode: TeardownMode) -> Result<()> {
        if self.state == LifecycleState::NotInitialized || self.state == LifecycleState::TornDown {
            return Ok(());
        }
        self.state = LifecycleState::Stopping;

        let mut failures = Vec::new();
        // Secondaries first so the primary doesn't step down mid-shutdown.
        for node in self.nodes.iter_mut().rev() {
            match node.process.stop(mode) {
                Ok(status) if ManagedProcess::exit_ok_for(status, mode) => {}
                Ok(status) => failures.push(format!(
                    "{} on port {} exited with {status} after {mode:?} stop",
                    node.name, node.port
                )),
                Err(err) => failures.push(format!(
                    "{} on port {} failed to stop: {err}",
                    node.name, node.port
                )),
            }
        }

        if !self.config.preserve_dbpath {
            for node in &self.nodes {
                let _ = fs::remove_dir_all(&node.dbpath);
            }
        }

        self.state = LifecycleState::TornDown;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::server_failure(format!(
                "replica set {} teardown failed: {}",
                self.config.name,
                failures.join("; ")
            )))
        }
    }

    fn is_running(&mut self) -> bool {
        self.state == LifecycleState::Ready
            && self.nodes.iter_mut().all(|node| node.process.is_running())
    }

    fn independent_clusters(&self) -> Vec<&dyn ClusterEndpoint> {
        vec![self]
    }

    fn path_for_archival(&self) -> Option<PathBuf> {
        Some(self.config.dbpath_prefix.join(&self.config.name))
    }

    fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.client)
    }
}
