//! The admin-command seam between fixtures, hooks, and the cluster.
//!
//! Fixtures never speak the wire protocol themselves; they drive commands
//! through a [`ClusterClient`]. The production implementation shells out to
//! the database shell binary; tests substitute a scripted fake.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use shoal_core::{Error, Result};
use shoal_process::{run_command, RunOptions};

/// "write concern failed" server error code; tolerated by the session-cache
/// refresh path.
pub const WRITE_CONCERN_FAILED: i64 = 64;

/// Credentials used to authenticate the management client.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthOptions {
    pub username: String,
    pub password: String,
    #[serde(default = "default_auth_db")]
    pub auth_db: String,
    #[serde(default)]
    pub mechanism: Option<String>,
}

fn default_auth_db() -> String {
    "admin".to_string()
}

pub trait ClusterClient: Send + Sync {
    /// Run `command` against database `db` on `host:port`, returning the
    /// server's response document.
    ///
    /// A transport-level failure (unreachable endpoint, shell error) is an
    /// `Err`; a command the server rejected comes back as an `Ok` response
    /// with `ok: 0` so callers can inspect the error code.
    fn run_command(&self, target: &str, db: &str, command: &Value) -> Result<Value>;

    fn run_admin_command(&self, target: &str, command: &Value) -> Result<Value> {
        self.run_command(target, "admin", command)
    }
}

/// True when a response document reports success.
pub fn command_ok(response: &Value) -> bool {
    matches!(response.get("ok").and_then(Value::as_f64), Some(ok) if ok == 1.0)
}

/// The numeric error code of a failed response, if any.
pub fn command_error_code(response: &Value) -> Option<i64> {
    response.get("code").and_then(Value::as_i64)
}

/// Shell-backed client: runs each command through the database shell with
/// `--eval`, serializing the response as JSON on stdout.
pub struct ShellClient {
    shell: PathBuf,
    auth: Option<AuthOptions>,
    timeout: Duration,
}

impl ShellClient {
    pub fn new(shell: impl Into<PathBuf>, auth: Option<AuthOptions>) -> Self {
        Self {
            shell: shell.into(),
            auth,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn shell_path(&self) -> &Path {
        &self.shell
    }

    fn auth_args(&self) -> Vec<String> {
        let Some(auth) = &self.auth else {
            return Vec::new();
        };
        let mut args = vec![
            "-u".to_string(),
            auth.username.clone(),
            "-p".to_string(),
            auth.password.clone(),
            "--authenticationDatabase".to_string(),
            auth.auth_db.clone(),
        ];
        if let Some(mechanism) = &auth.mechanism {
            args.push("--authenticationMechanism".to_string());
            args.push(mechanism.clone());
        }
        args
    }
}

impl ClusterClient for ShellClient {
    fn run_command(&self, target: &str, db: &str, command: &Value) -> Result<Value> {
        let eval = format!(
            "print(JSON.stringify(db.getSiblingDB({db:?}).runCommand({command})))"
        );
        let mut args = vec!["--quiet".to_string()];
        args.extend(self.auth_args());
        args.push(format!("mongodb://{target}"));
        args.push("--eval".to_string());
        args.push(eval);

        let opts = RunOptions {
            timeout: Some(self.timeout),
            ..RunOptions::default()
        };
        let result = run_command(&self.shell, &args, opts)?;
        if !result.status.success() {
            return Err(Error::server_failure(format!(
                "shell command against {target} failed (exit status {}): {}",
                result.status,
                result.output.stderr.trim()
            )));
        }

        // The response document is the last non-empty stdout line; the shell
        // may print connection banners before it even with --quiet.
        let line = result
            .output
            .stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| {
                Error::server_failure(format!("shell against {target} produced no output"))
            })?;
        serde_json::from_str(line).map_err(|err| {
            Error::server_failure(format!(
                "shell against {target} produced unparseable output: {err}"
            ))
        })
    }
}
