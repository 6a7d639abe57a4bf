//! Test case backed by a standalone executable (C++ unit and integration
//! tests, the db-test binary).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use shoal_core::Result;
use shoal_process::{run_command, RunOptions};

use crate::{ConnectionInfo, TestCase, TestOutcome, TestStatus};

pub struct ProgramTestCase {
    display_name: String,
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
    /// Pass the fixture's connection string as `--connectionString`.
    wants_connection: bool,
    connection: Option<ConnectionInfo>,
}

impl ProgramTestCase {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let display_name = program.to_string_lossy().into_owned();
        Self {
            display_name,
            program,
            args: Vec::new(),
            timeout: None,
            wants_connection: false,
            connection: None,
        }
    }

    /// Override the default program-path display name (db-test cases are
    /// named after the selected test, not the shared binary).
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_connection_argument(mut self) -> Self {
        self.wants_connection = true;
        self
    }
}

impl TestCase for ProgramTestCase {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn configure(&mut self, connection: &ConnectionInfo) -> Result<()> {
        self.connection = Some(connection.clone());
        Ok(())
    }

    fn run(&mut self) -> Result<TestOutcome> {
        let mut args = self.args.clone();
        if self.wants_connection {
            if let Some(connection) = &self.connection {
                args.push("--connectionString".to_string());
                args.push(connection.connection_string.clone());
            }
        }

        let opts = RunOptions {
            timeout: self.timeout,
            ..RunOptions::default()
        };
        let start = Instant::now();
        let result = run_command(&self.program, &args, opts)?;
        let duration = start.elapsed();

        if result.timed_out {
            return Ok(TestOutcome {
                status: TestStatus::Errored,
                return_code: result.status.code(),
                duration,
                message: Some(format!(
                    "{} timed out after {duration:?}",
                    self.display_name
                )),
            });
        }
        if result.status.success() {
            return Ok(TestOutcome::passed(duration));
        }
        Ok(TestOutcome {
            status: TestStatus::Failed,
            return_code: result.status.code(),
            duration,
            message: Some(format!("exited with status {}", result.status)),
        })
    }
}
