//! Process-spawning primitives for the harness.
//!
//! Two shapes of child process exist here:
//!
//! - **Run-to-completion commands** ([`run_command`]): test binaries invoked
//!   for enumeration, shell probes, and scripted test cases. Database
//!   servers can be extremely chatty, so stdout/stderr capture is bounded to
//!   keep memory use predictable, and a wall-clock timeout kills the whole
//!   process tree.
//! - **Managed children** ([`ManagedProcess`]): long-lived fixture processes
//!   (replica-set nodes, routers) that are started once and stopped with an
//!   explicit [`StopMode`]. Their output is streamed to `tracing` line by
//!   line rather than captured.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured stdout/stderr from a command, truncated to a maximum size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when either stream had more bytes than were captured.
    pub truncated: bool,
}

/// Options controlling run-to-completion command execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Kill the process tree if it hasn't exited after this duration.
    pub timeout: Option<Duration>,
    /// Maximum bytes to capture *per stream* (stdout and stderr).
    pub max_bytes: usize,
    /// How long to wait after a graceful termination signal before
    /// force-killing the process tree.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            // 16MiB per stream keeps memory bounded while still capturing
            // enough context for diagnostics.
            max_bytes: 16 * 1024 * 1024,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// A full command invocation (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Quoting is kept simple; this is debugging output, not a
        // round-trippable shell snippet.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Result of running a command with bounded output capture.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub output: BoundedOutput,
    pub timed_out: bool,
}

/// Run a command, capturing at most `opts.max_bytes` bytes per stream.
///
/// Always returns the process `ExitStatus`. When the timeout is reached the
/// process tree is killed and `timed_out` is set.
pub fn run_command(
    program: &Path,
    args: &[String],
    opts: RunOptions,
) -> io::Result<CommandResult> {
    let spec = CommandSpec::new(program, args);
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let mut child = cmd.spawn()?;

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };

    let max_bytes = opts.max_bytes;
    let stdout_handle = thread::spawn(move || read_bounded(stdout, max_bytes));
    let stderr_handle = thread::spawn(move || read_bounded(stderr, max_bytes));

    let start = Instant::now();
    let mut timed_out = false;

    let status = if let Some(timeout) = opts.timeout {
        let poll = Duration::from_millis(50);
        loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= timeout {
                timed_out = true;
                break terminate_process_tree(&mut child, opts.kill_grace)?;
            }
            thread::sleep(poll.min(timeout.saturating_sub(start.elapsed())));
        }
    } else {
        child.wait()?
    };

    let (stdout_bytes, stdout_truncated) = join_reader(stdout_handle, "stdout")??;
    let (stderr_bytes, stderr_truncated) = join_reader(stderr_handle, "stderr")??;

    Ok(CommandResult {
        status,
        output: BoundedOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
        },
        timed_out,
    })
}

/// How a managed child process is asked to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM; the server runs its clean shutdown path.
    Graceful,
    /// SIGKILL; no shutdown path, on-disk state is left as-is.
    Kill,
    /// SIGABRT; like kill but the server dumps core for diagnostics.
    ///
    /// On platforms without SIGABRT delivery this degrades to [`StopMode::Kill`].
    Abort,
}

/// A long-lived child process owned by a fixture.
///
/// Only the controlling thread may start or stop it. Stdout and stderr are
/// drained by detached reader threads that forward each line to `tracing`
/// under the process's logical name.
pub struct ManagedProcess {
    spec: CommandSpec,
    name: String,
    child: Child,
    exited: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Spawn `program args` with stdout/stderr streamed to the log under
    /// `name`.
    pub fn spawn(
        name: impl Into<String>,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> io::Result<Self> {
        let name = name.into();
        let spec = CommandSpec::new(program, args);
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }
        isolate_process_group(&mut cmd);

        tracing::debug!(target: "shoal::process", name = %name, command = %spec, "spawning");
        let mut child = cmd.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            stream_to_log(stdout, name.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            stream_to_log(stderr, name.clone(), "stderr");
        }

        Ok(Self {
            spec,
            name,
            child,
            exited: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &CommandSpec {
        &self.spec
    }

    /// Non-blocking exit probe. `None` while the process is still running.
    pub fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exited {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.exited = status;
        }
        Ok(status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.poll_exit(), Ok(None))
    }

    /// Deliver the stop signal for `mode` and wait for the process to exit.
    pub fn stop(&mut self, mode: StopMode) -> io::Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }

        send_stop_signal(&mut self.child, mode)?;
        let status = self.child.wait()?;
        self.exited = Some(status);
        Ok(status)
    }

    /// Whether `status` is the expected result of stopping with `mode`.
    ///
    /// Exit code 0 is always acceptable (the process may have finished its
    /// shutdown before the signal landed); otherwise the process must have
    /// died from exactly the signal that was sent.
    pub fn exit_ok_for(status: ExitStatus, mode: StopMode) -> bool {
        if status.code() == Some(0) {
            return true;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            let expected = match mode {
                StopMode::Graceful => libc::SIGTERM,
                StopMode::Kill => libc::SIGKILL,
                StopMode::Abort => libc::SIGABRT,
            };
            return status.signal() == Some(expected);
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            false
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.exited.is_none() && self.child.try_wait().ok().flatten().is_none() {
            tracing::warn!(
                target: "shoal::process",
                name = %self.name,
                "managed process dropped while running; killing"
            );
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn send_stop_signal(child: &mut Child, mode: StopMode) -> io::Result<()> {
    #[cfg(unix)]
    {
        let signal = match mode {
            StopMode::Graceful => libc::SIGTERM,
            StopMode::Kill => libc::SIGKILL,
            StopMode::Abort => libc::SIGABRT,
        };
        let pid = child.id() as i32;
        // Negative pid targets the process group set up in `pre_exec`.
        let rc = unsafe { libc::kill(-pid, signal) };
        if rc != 0 {
            // The group may already be gone; fall back to the direct pid.
            let rc = unsafe { libc::kill(pid, signal) };
            if rc != 0 && child.try_wait()?.is_none() {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        // No signal delivery; `abort` degrades to `kill`.
        let _ = mode;
        child.kill()
    }
}

fn isolate_process_group(cmd: &mut Command) {
    // Put the child into its own process group on Unix so stop/timeout can
    // take down the whole tree (servers fork helpers that would otherwise
    // keep pipes open).
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This runs after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}

fn stream_to_log(reader: impl Read + Send + 'static, name: String, stream: &'static str) {
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    tracing::info!(target: "shoal::process", name = %name, stream, "{line}")
                }
                Err(_) => break,
            }
        }
    });
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> io::Result<io::Result<(Vec<u8>, bool)>> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{stream} reader thread panicked")))
}

fn read_bounded(mut reader: impl Read, max_bytes: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        if out.len() < max_bytes {
            let remaining = max_bytes - out.len();
            let to_store = remaining.min(n);
            out.extend_from_slice(&buf[..to_store]);
            if to_store < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((out, truncated))
}
