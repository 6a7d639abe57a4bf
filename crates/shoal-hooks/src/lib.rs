//! Hooks: probes that run alongside the primary tests.
//!
//! A hook may implement any subset of the four lifecycle events; the default
//! methods are no-ops, so each hook overrides only what it needs. Background
//! hooks additionally synthesize a [`ContinuousDynamicTestCase`] per test,
//! which a [`BackgroundJob`] drives on its own worker thread.

use std::path::PathBuf;
use std::sync::Arc;

use shoal_core::Result;
use shoal_fixture::ClusterClient;
use shoal_testing::{ConnectionInfo, ReportSink};

pub mod background;
pub mod catalog;
pub mod dynamic;
pub mod js_hook;
pub mod registry;

pub use background::BackgroundJob;
pub use dynamic::{ContinuousDynamicTestCase, DynamicTestCase};
pub use js_hook::{
    BackgroundJsHook, DataConsistencyHook, JsHook, PerClusterDataConsistencyHook,
};
pub use registry::create_hook;

/// One independent cluster of the fixture (a shard or the config server),
/// as seen by per-cluster hooks.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub name: String,
    pub connection: ConnectionInfo,
}

/// Everything a hook may touch. Captured by the executor after the fixture
/// reports ready; hooks never hold the fixture itself.
#[derive(Clone)]
pub struct HookContext {
    /// Cluster-level endpoint (router addresses for a sharded cluster).
    pub connection: ConnectionInfo,
    /// Endpoints per-cluster hooks fan out over.
    pub clusters: Vec<ClusterInfo>,
    /// Management client for admin commands.
    pub client: Arc<dyn ClusterClient>,
    /// Database shell used by script-backed hooks.
    pub shell: PathBuf,
}

/// First `host:port` of a connection string, with any replica-set prefix
/// stripped. Admin commands target a single endpoint.
pub fn primary_target(connection_string: &str) -> &str {
    let hosts = connection_string
        .rsplit('/')
        .next()
        .unwrap_or(connection_string);
    hosts.split(',').next().unwrap_or(hosts)
}

/// Lifecycle events a hook can observe. All default to no-ops.
///
/// The executor calls hooks in registration order; an `Err` from a
/// synchronous event is handled per the error's category (a test failure is
/// recorded, a server failure stops the suite).
pub trait Hook: Send {
    /// The registered class name.
    fn name(&self) -> &str;

    /// Background hooks run a dynamic case concurrently with each test.
    fn is_background(&self) -> bool {
        false
    }

    fn before_suite(&mut self, _ctx: &HookContext, _report: &mut dyn ReportSink) -> Result<()> {
        Ok(())
    }

    fn before_test(
        &mut self,
        _test_name: &str,
        _ctx: &HookContext,
        _report: &mut dyn ReportSink,
    ) -> Result<()> {
        Ok(())
    }

    fn after_test(
        &mut self,
        _test_name: &str,
        _ctx: &HookContext,
        _report: &mut dyn ReportSink,
    ) -> Result<()> {
        Ok(())
    }

    fn after_suite(
        &mut self,
        _ctx: &HookContext,
        _report: &mut dyn ReportSink,
        _suite_failed: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// The concurrent case to run while `test_name` executes, or `None` when
    /// this hook (or this particular test) has none.
    fn background_case(
        &self,
        _test_name: &str,
        _ctx: &HookContext,
    ) -> Result<Option<ContinuousDynamicTestCase>> {
        Ok(None)
    }
}
