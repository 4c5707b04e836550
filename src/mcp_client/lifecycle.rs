//! Server process lifecycle management.
//!
//! Spawns the server as a child process with piped stdin/stdout/stderr,
//! drains its stderr into the log, and kills it on shutdown.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::background::ShutdownSignal;
use super::errors::McpError;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Longest stderr line kept in the log.
const MAX_STDERR_LINE_CHARS: usize = 2000;

// ─── ChildProcess ────────────────────────────────────────────────────────────

/// A spawned server process and whatever pipe ends have not been taken yet.
pub struct ChildProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
}

impl ChildProcess {
    /// Server name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        if self.exit_status.is_some() {
            None
        } else {
            self.pid
        }
    }

    /// Take ownership of the three pipe ends.
    ///
    /// stdin and stdout are required; stderr is optional.
    pub fn take_stdio(
        &mut self,
    ) -> Result<(ChildStdin, ChildStdout, Option<ChildStderr>), McpError> {
        let stdin = self.child.stdin.take().ok_or(McpError::SpawnFailed {
            name: self.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = self.child.stdout.take().ok_or(McpError::SpawnFailed {
            name: self.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        Ok((stdin, stdout, self.child.stderr.take()))
    }

    /// Check if the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(_) => false, // Unknown state, treat as dead
        }
    }

    /// Kill the process and wait until the OS reports it gone.
    ///
    /// Idempotent: a process that already exited returns its recorded status.
    pub async fn terminate(&mut self) -> Result<ExitStatus, McpError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(server = %self.name, %status, "server already exited");
            self.exit_status = Some(status);
            return Ok(status);
        }

        if let Err(e) = self.child.start_kill() {
            // The process may have exited between try_wait and the signal.
            tracing::debug!(server = %self.name, error = %e, "kill signal not delivered");
        }

        let status = self.child.wait().await.map_err(|e| McpError::TerminateFailed {
            name: self.name.clone(),
            reason: format!("{e}"),
        })?;

        tracing::info!(server = %self.name, pid = ?self.pid, %status, "server process exited");
        self.exit_status = Some(status);
        Ok(status)
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a server process with all three stdio streams piped.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_server(name: &str, config: &ServerConfig) -> Result<ChildProcess, McpError> {
    let mut cmd = build_command(name, config);

    let child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: match e.kind() {
            std::io::ErrorKind::NotFound => {
                format!("executable '{}' not found", config.command)
            }
            std::io::ErrorKind::PermissionDenied => {
                format!("permission denied for '{}'", config.command)
            }
            _ => format!("{e}"),
        },
    })?;

    let pid = child.id();
    tracing::info!(
        server = name,
        pid = ?pid,
        command = %config.display_command(),
        "spawned server process"
    );

    Ok(ChildProcess {
        name: name.to_string(),
        child,
        pid,
        exit_status: None,
    })
}

fn build_command(name: &str, config: &ServerConfig) -> Command {
    let mut config = config.clone();
    resolve_venv(name, &mut config);

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        #[allow(unused_imports)]
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Rewrite `command` to the venv's interpreter and inject venv env vars.
///
/// Left untouched when the venv binary does not exist.
fn resolve_venv(name: &str, config: &mut ServerConfig) {
    let Some(venv) = config.venv.as_deref() else {
        return;
    };

    let base_dir = config
        .cwd
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let abs_venv = if Path::new(venv).is_absolute() {
        PathBuf::from(venv)
    } else {
        base_dir.join(venv)
    };
    // Windows venvs use Scripts\ instead of bin/
    let venv_bin = if cfg!(target_os = "windows") {
        abs_venv.join("Scripts")
    } else {
        abs_venv.join("bin")
    };
    let venv_command = venv_bin.join(&config.command);

    if !venv_command.exists() {
        tracing::warn!(
            server = name,
            venv = %abs_venv.display(),
            "venv command not found, using command as configured"
        );
        return;
    }

    config.command = venv_command.to_string_lossy().into_owned();
    config.env.insert(
        "VIRTUAL_ENV".to_string(),
        abs_venv.to_string_lossy().into_owned(),
    );
    let system_path = std::env::var("PATH").unwrap_or_default();
    let separator = if cfg!(target_os = "windows") { ";" } else { ":" };
    config.env.insert(
        "PATH".to_string(),
        format!("{}{separator}{system_path}", venv_bin.to_string_lossy()),
    );
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

/// Forward the server's stderr into the log until EOF or shutdown.
///
/// stderr is never parsed; it only needs draining so the child cannot block
/// on a full pipe.
pub async fn drain_stderr(name: String, stderr: ChildStderr, mut shutdown: ShutdownSignal) {
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    tracing::debug!(server = %name, line = %truncate_line(&line), "server stderr");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %name, error = %e, "stderr read failed");
                    break;
                }
            },
        }
    }
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_STDERR_LINE_CHARS {
        return line.to_string();
    }
    let mut end = MAX_STDERR_LINE_CHARS;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &line[..end])
}

// ─── Tests ───────────────────────────────────────────────────────────────────
