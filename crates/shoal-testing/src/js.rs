//! JS-scripted test case, run through the database shell.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use shoal_core::{Error, Result};
use shoal_process::{run_command, RunOptions};

use crate::{ConnectionInfo, TestCase, TestOutcome, TestStatus};

pub struct JsTestCase {
    display_name: String,
    js_file: PathBuf,
    shell: PathBuf,
    /// Extra shell arguments from the suite (e.g. `--readMode`).
    shell_options: Vec<String>,
    /// Serialized into the global `TestData` object before the script runs.
    test_data: Map<String, Value>,
    timeout: Option<Duration>,
    connection: Option<ConnectionInfo>,
}

impl JsTestCase {
    pub fn new(js_file: impl Into<PathBuf>, shell: impl Into<PathBuf>) -> Self {
        let js_file = js_file.into();
        let display_name = js_file.to_string_lossy().into_owned();
        Self {
            display_name,
            js_file,
            shell: shell.into(),
            shell_options: Vec::new(),
            test_data: Map::new(),
            timeout: None,
            connection: None,
        }
    }

    /// Override the default file-path display name (multi-JS groups name
    /// themselves after the group, not the driver script).
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_shell_options(mut self, options: Vec<String>) -> Self {
        self.shell_options = options;
        self
    }

    pub fn with_test_data(mut self, test_data: Map<String, Value>) -> Self {
        self.test_data = test_data;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn js_file(&self) -> &std::path::Path {
        &self.js_file
    }

    fn args(&self, connection: &ConnectionInfo) -> Vec<String> {
        let mut args = vec!["--quiet".to_string()];
        args.extend(self.shell_options.iter().cloned());
        if !self.test_data.is_empty() {
            args.push("--eval".to_string());
            args.push(format!(
                "TestData = {}",
                Value::Object(self.test_data.clone())
            ));
        }
        args.push(connection.driver_url.clone());
        args.push(self.js_file.to_string_lossy().into_owned());
        args
    }
}

impl TestCase for JsTestCase {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn configure(&mut self, connection: &ConnectionInfo) -> Result<()> {
        if self.connection.is_some() {
            return Err(Error::internal(format!(
                "{} configured twice",
                self.display_name
            )));
        }
        self.connection = Some(connection.clone());
        Ok(())
    }

    fn run(&mut self) -> Result<TestOutcome> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| Error::internal(format!("{} run before configure", self.display_name)))?
            .clone();

        let args = self.args(&connection);
        let opts = RunOptions {
            timeout: self.timeout,
            ..RunOptions::default()
        };

        let start = Instant::now();
        let result = run_command(&self.shell, &args, opts)?;
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
            tracing::debug!(
                target: "shoal::testing",
                test = %self.display_name,
                ?duration,
                "test passed"
            );
            return Ok(TestOutcome::passed(duration));
        }

        let tail = last_lines(&result.output.stderr, 5);
        Ok(TestOutcome {
            status: TestStatus::Failed,
            return_code: result.status.code(),
            duration,
            message: Some(if tail.is_empty() {
                format!("shell exited with status {}", result.status)
            } else {
                tail
            }),
        })
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
