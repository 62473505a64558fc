//! External command execution with a hard timeout.
//!
//! Every detector, parser, and git call goes through [`run_tool`] so that a
//! hung tool turns into a `ToolTimeout` error instead of hanging the run.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::services::detection::ProbeError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Resolve a tool path: explicit option, then environment variable, then the
/// bare executable name looked up on `PATH`.
pub fn resolve_tool(explicit: Option<&str>, env_var: &str, default: &str) -> PathBuf {
    explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(env_var).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Render a command line for logs and error messages.
pub fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().to_string()];
    parts.extend(command.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Run `command` to completion, capturing output, killing it after `timeout`.
///
/// Any exit status is returned as data; callers decide which statuses are
/// acceptable for their tool.
pub fn run_tool(command: &mut Command, timeout: Duration) -> Result<ToolOutput, ProbeError> {
    let rendered = describe(command);
    debug!(command = %rendered, "running external tool");

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProbeError::ToolSpawn {
            tool: command.get_program().to_string_lossy().to_string(),
            source,
        })?;

    // Drain pipes on helper threads so a chatty tool cannot block on a full pipe.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let status = match wait_with_deadline(&mut child, timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(command = %rendered, seconds = timeout.as_secs(), "tool timed out; killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProbeError::ToolTimeout { command: rendered, seconds: timeout.as_secs() });
        }
        Err(source) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProbeError::ToolSpawn { tool: rendered, source });
        }
    };

    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();
    debug!(command = %rendered, code = ?status.code(), "tool finished");

    Ok(ToolOutput { code: status.code(), stdout, stderr })
}

/// Like [`run_tool`], but any non-zero exit is a `ToolFailed` error.
pub fn run_tool_checked(command: &mut Command, timeout: Duration) -> Result<String, ProbeError> {
    let rendered = describe(command);
    let output = run_tool(command, timeout)?;
    if !output.success() {
        return Err(failed(&rendered, &output));
    }
    Ok(output.stdout)
}

pub(crate) fn failed(command: &str, output: &ToolOutput) -> ProbeError {
    ProbeError::ToolFailed {
        command: command.to_string(),
        status: output.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
        stderr: output.stderr.trim().to_string(),
    }
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
