//! Router (mongos) subfixture.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use shoal_core::{Error, Result};
use shoal_process::ManagedProcess;

use crate::client::{command_ok, ClusterClient};
use crate::ports::PortAllocator;
use crate::{ClusterEndpoint, Fixture, LifecycleState, NodeInfo, TeardownMode};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Logical name, e.g. `s0`.
    pub name: String,
    pub mongos_executable: PathBuf,
    /// Config-server connection string (`csrs/host:port,...`).
    pub configdb: String,
    /// Extra command-line arguments from the suite's opaque options.
    pub mongos_options: Vec<String>,
    /// Suite-level `--setParameter` overrides, merged over the defaults.
    pub set_parameters: Map<String, Value>,
    pub await_ready_timeout: Duration,
}

/// `--setParameter` values every router starts with. Suite overrides win.
fn default_set_parameters() -> Map<String, Value> {
    let defaults = json!({
        "enableTestCommands": 1,
        "testingDiagnosticsEnabled": true,
        "logComponentVerbosity": {"transaction": 3},
    });
    match defaults {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

pub struct RouterFixture {
    config: RouterConfig,
    state: LifecycleState,
    process: Option<ManagedProcess>,
    port: u16,
    allocator: Arc<PortAllocator>,
    client: Arc<dyn ClusterClient>,
}

impl RouterFixture {
    pub fn new(
        config: RouterConfig,
        allocator: Arc<PortAllocator>,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            config,
            state: LifecycleState::NotInitialized,
            process: None,
            port: 0,
            allocator,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target(&self) -> Result<String> {
        if self.process.is_none() {
            return Err(Error::internal("target() called before setup()"));
        }
        Ok(format!("localhost:{}", self.port))
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.port.to_string(),
            "--configdb".to_string(),
            self.config.configdb.clone(),
        ];

        let mut params = default_set_parameters();
        for (key, value) in &self.config.set_parameters {
            params.insert(key.clone(), value.clone());
        }
        for (key, value) in &params {
            args.push("--setParameter".to_string());
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.push(format!("{key}={rendered}"));
        }

        args.extend(self.config.mongos_options.iter().cloned());
        args
    }
}

impl ClusterEndpoint for RouterFixture {
    fn internal_connection_string(&self) -> Result<String> {
        self.target()
    }

    fn driver_connection_url(&self) -> Result<String> {
        Ok(format!("mongodb://{}", self.target()?))
    }

    fn node_info(&self) -> Vec<NodeInfo> {
        match &self.process {
            Some(process) => vec![NodeInfo {
                name: self.config.name.clone(),
                pid: process.pid(),
                port: self.port,
                log_name: format!("mongos:{}", self.config.name),
            }],
            None => Vec::new(),
        }
    }
}

impl Fixture for RouterFixture {
    fn setup(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            LifecycleState::NotInitialized | LifecycleState::TornDown
        ) {
            return Err(Error::internal(format!(
                "setup() called on router {} in state {:?}",
                self.config.name, self.state
            )));
        }
        self.process = None;

        self.port = self.allocator.next_port();
        let args = self.args();
        let process = ManagedProcess::spawn(
            format!("mongos:{}", self.config.name),
            &self.config.mongos_executable,
            &args,
            &[],
        )?;
        self.process = Some(process);
        self.state = LifecycleState::SetUp;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<()> {
        if self.state != LifecycleState::SetUp {
            return Err(Error::internal(format!(
                "await_ready() called on router {} in state {:?}",
                self.config.name, self.state
            )));
        }

        let port = self.port;
        let target = format!("localhost:{port}");
        let deadline = Instant::now() + self.config.await_ready_timeout;
        loop {
            let process = self
                .process
                .as_mut()
                .ok_or_else(|| Error::internal("router process missing after setup()"))?;
            if let Some(status) = process.poll_exit()? {
                let code = status.code().unwrap_or(-1);
                return Err(Error::server_failure(format!(
                    "mongos on port {port} process ended unexpectedly with exit code {code}"
                )));
            }
            if let Ok(response) = self.client.run_admin_command(&target, &json!({"ping": 1})) {
                if command_ok(&response) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::server_failure(format!(
                    "Failed to connect to mongos on port {port}"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.state = LifecycleState::Ready;
        tracing::info!(
            target: "shoal::fixture",
            router = %self.config.name,
            port,
            "mongos ready"
        );
        Ok(())
    }

    fn teardown(&mut self, mode: TeardownMode) -> Result<()> {
        if self.state == LifecycleState::NotInitialized || self.state == LifecycleState::TornDown {
            return Ok(());
        }
        self.state = LifecycleState::Stopping;

        let result = match self.process.as_mut() {
            Some(process) => match process.stop(mode) {
                Ok(status) if ManagedProcess::exit_ok_for(status, mode) => Ok(()),
                Ok(status) => Err(Error::server_failure(format!(
                    "mongos {} on port {} exited with {status} after {mode:?} stop",
                    self.config.name, self.port
                ))),
                Err(err) => Err(Error::server_failure(format!(
                    "mongos {} on port {} failed to stop: {err}",
                    self.config.name, self.port
                ))),
            },
            None => Ok(()),
        };

        self.state = LifecycleState::TornDown;
        result
    }

    fn is_running(&mut self) -> bool {
        self.state == LifecycleState::Ready
            && self
                .process
                .as_mut()
                .map_or(false, |process| process.is_running())
    }

    fn independent_clusters(&self) -> Vec<&dyn ClusterEndpoint> {
        // A router is stateless; it is never a data-consistency target.
        Vec::new()
    }

    fn path_for_archival(&self) -> Option<PathBuf> {
        None
    }

    fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverClient;

    impl ClusterClient for NeverClient {
        fn run_command(&self, _target: &str, _db: &str, _command: &Value) -> Result<Value> {
            Err(Error::server_failure("unreachable"))
        }
    }

    fn config(executable: &str) -> RouterConfig {
        RouterConfig {
            name: "s0".to_string(),
            mongos_executable: PathBuf::from(executable),
            configdb: "csrs/localhost:20000".to_string(),
            mongos_options: Vec::new(),
            set_parameters: Map::new(),
            await_ready_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn suite_parameters_override_the_defaults() {
        let mut cfg = config("mongos");
        cfg.set_parameters.insert(
            "enableTestCommands".to_string(),
            Value::Number(0.into()),
        );
        let allocator = Arc::new(PortAllocator::new(20000));
        let mut router = RouterFixture::new(cfg, allocator, Arc::new(NeverClient));
        router.port = 20000;
        let args = router.args();
        let rendered = args.join(" ");
        assert!(rendered.contains("enableTestCommands=0"));
        assert!(!rendered.contains("enableTestCommands=1"));
        assert!(rendered.contains("testingDiagnosticsEnabled=true"));
    }

    /// A shell script standing in for mongos. It ignores the router's
    /// arguments and just runs `body`.
    #[cfg(unix)]
    fn fake_mongos(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake_mongos.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_during_await_ready_is_a_server_failure() {
        // The stand-in exits immediately, so await_ready must report the
        // unexpected exit rather than time out.
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config("mongos");
        cfg.mongos_executable = fake_mongos(tmp.path(), "exit 7");
        let allocator = Arc::new(PortAllocator::new(20000));
        let mut router = RouterFixture::new(cfg, allocator, Arc::new(NeverClient));

        router.setup().unwrap();
        // Give the child a moment to exit.
        std::thread::sleep(Duration::from_millis(200));
        let err = router.await_ready().err().unwrap();
        let message = err.to_string();
        assert!(
            message.contains("process ended unexpectedly with exit code 7"),
            "unexpected message: {message}"
        );
        // The process is already dead with a non-signal status, which a Kill
        // teardown reports as a failed stop.
        assert!(router.teardown(TeardownMode::Kill).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn unreachable_router_times_out_with_a_connect_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config("mongos");
        // Sleep longer than the await timeout so the process stays alive.
        cfg.mongos_executable = fake_mongos(tmp.path(), "sleep 30");
        cfg.await_ready_timeout = Duration::from_millis(300);
        let allocator = Arc::new(PortAllocator::new(20000));
        let mut router = RouterFixture::new(cfg, allocator, Arc::new(NeverClient));

        router.setup().unwrap();
        let port = router.port();
        let err = router.await_ready().err().unwrap();
        match err {
            Error::ServerFailure(message) => {
                assert_eq!(message, format!("Failed to connect to mongos on port {port}"));
            }
            other => panic!("unexpected error: {other}"),
        }
        router.teardown(TeardownMode::Kill).unwrap();
    }
}
