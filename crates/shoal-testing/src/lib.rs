//! Test-case abstraction and run reports.
//!
//! A [`TestCase`] is anything the executor can point at a fixture and run; the
//! shipped implementation drives a JS file through the database shell. Hooks
//! synthesize additional cases at runtime, so the trait stays object-safe and
//! `Send`.

use std::time::Duration;

use shoal_core::{Error, Result};

pub mod js;
pub mod program;
pub mod report;

pub use js::JsTestCase;
pub use program::ProgramTestCase;
pub use report::{Report, ReportEntry, ReportSink};

/// Endpoint details a test case needs to reach the fixture, captured once
/// the fixture is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Comma-joined `host:port` list (router addresses for a sharded
    /// cluster).
    pub connection_string: String,
    /// `mongodb://` URL for driver clients.
    pub driver_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    /// The harness could not produce a verdict (timeout, lost process).
    Errored,
}

/// The result of one test-case run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub status: TestStatus,
    /// Process exit code, where the case ran an external process.
    pub return_code: Option<i32>,
    pub duration: Duration,
    /// Short human-readable detail for failures.
    pub message: Option<String>,
}

impl TestOutcome {
    pub fn passed(duration: Duration) -> Self {
        Self {
            status: TestStatus::Passed,
            return_code: Some(0),
            duration,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Passed
    }

    /// Convert a failing outcome into the error the hook framework
    /// propagates; a passing outcome maps to `Ok`.
    pub fn into_result(self, display_name: &str) -> Result<()> {
        match self.status {
            TestStatus::Passed => Ok(()),
            TestStatus::Failed => Err(Error::test_failure(format!(
                "{display_name} failed: {}",
                self.message.as_deref().unwrap_or("non-zero exit")
            ))),
            TestStatus::Errored => Err(Error::internal(format!(
                "{display_name} errored: {}",
                self.message.as_deref().unwrap_or("no verdict")
            ))),
        }
    }
}

/// A runnable test case.
///
/// `configure` is called exactly once, after the fixture reports ready and
/// before the first `run`. A case may be run more than once (background hooks
/// loop their embedded case), so `run` takes `&mut self` rather than `self`.
pub trait TestCase: Send {
    /// Name shown in logs and the report.
    fn display_name(&self) -> &str;

    /// Wire the case to the fixture endpoint.
    fn configure(&mut self, connection: &ConnectionInfo) -> Result<()>;

    /// Execute once. Script-level failure is a `Failed` outcome, not an
    /// `Err`; `Err` is reserved for harness-level problems.
    fn run(&mut self) -> Result<TestOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_result_maps_status_to_error_category() {
        let pass = TestOutcome::passed(Duration::from_secs(1));
        assert!(pass.into_result("case").is_ok());

        let fail = TestOutcome {
            status: TestStatus::Failed,
            return_code: Some(1),
            duration: Duration::from_secs(1),
            message: Some("assertion tripped".to_string()),
        };
        let err = fail.into_result("case").unwrap_err();
        assert!(matches!(err, Error::TestFailure(_)));
        assert!(err.to_string().contains("assertion tripped"));

        let lost = TestOutcome {
            status: TestStatus::Errored,
            return_code: None,
            duration: Duration::ZERO,
            message: None,
        };
        assert!(matches!(
            lost.into_result("case").unwrap_err(),
            Error::Internal(_)
        ));
    }
}
