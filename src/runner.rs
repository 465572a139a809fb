//! Subprocess capability shared by every external collaborator.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DevxError, ProcessErrorDetails};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0 && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn in_dir(cwd: &Path) -> Self {
        Self {
            cwd: Some(cwd.to_path_buf()),
            ..Self::default()
        }
    }
}

pub trait ToolRunner {
    /// Runs to completion with captured output.
    fn run(&self, program: &str, args: &[String], opts: &RunOptions) -> io::Result<CommandOutput>;

    /// Starts a process that outlives us; returns its pid.
    fn spawn_detached(&self, program: &str, args: &[String], cwd: &Path) -> io::Result<u32>;

    /// Runs with the terminal attached (stdin/stdout/stderr inherited).
    fn run_attached(&self, program: &str, args: &[String]) -> io::Result<i32>;

    fn on_path(&self, program: &str) -> bool;
}

pub struct SystemRunner;

const TIMEOUT_POLL: Duration = Duration::from_millis(25);
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or(if status.success() { 0 } else { 1 })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Signals the child's whole process group; timed commands are started as
/// group leaders so shell grandchildren are reached too.
#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    // SAFETY: kill(2) on the group of a child we spawned and have not reaped.
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), signal);
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
}

#[cfg(not(unix))]
fn send_terminate(child: &Child) {
    let _ = child;
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) {
    let _ = child.kill();
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<(i32, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((exit_code(status), false));
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(TIMEOUT_POLL);
    }
    tracing::warn!(pid = child.id(), "process timed out; sending SIGTERM");
    send_terminate(child);
    let grace = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < grace {
        if let Some(status) = child.try_wait()? {
            return Ok((exit_code(status), true));
        }
        thread::sleep(TIMEOUT_POLL);
    }
    send_kill(child);
    let status = child.wait()?;
    Ok((exit_code(status), true))
}

impl ToolRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], opts: &RunOptions) -> io::Result<CommandOutput> {
        tracing::debug!(command = %render_command(program, args), "running");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        let Some(timeout) = opts.timeout else {
            let output = cmd.output()?;
            return Ok(CommandOutput {
                status_code: exit_code(output.status),
                stdout: output.stdout,
                stderr: output.stderr,
                timed_out: false,
            });
        };

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let (status_code, timed_out) = wait_with_deadline(&mut child, timeout)?;
        Ok(CommandOutput {
            status_code,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            timed_out,
        })
    }

    fn spawn_detached(&self, program: &str, args: &[String], cwd: &Path) -> io::Result<u32> {
        tracing::debug!(command = %render_command(program, args), "spawning detached");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();
        // Reap in the background so a short-lived editor wrapper never
        // lingers as a zombie while we are still running.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }

    fn run_attached(&self, program: &str, args: &[String]) -> io::Result<i32> {
        tracing::debug!(command = %render_command(program, args), "running attached");
        let status = Command::new(program).args(args).status()?;
        Ok(exit_code(status))
    }

    fn on_path(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

pub fn spawn_error(program: &str, args: &[String], err: &io::Error) -> DevxError {
    let command = render_command(program, args);
    if err.kind() == io::ErrorKind::NotFound {
        return DevxError::ExternalUnavailable(format!(
            "`{program}` was not found on PATH (while running `{command}`); run `devx check` for install hints"
        ));
    }
    DevxError::Process {
        message: format!("failed to run `{command}`: {err}"),
        details: ProcessErrorDetails {
            error_code: "process_spawn_failed".to_string(),
            hint: None,
            command: Some(command),
            raw_stderr: None,
        },
    }
}

/// Non-zero exit as an error carrying the captured stderr.
pub fn command_failed(
    program: &str,
    args: &[String],
    output: &CommandOutput,
    error_code: &str,
    hint: Option<String>,
) -> DevxError {
    let command = render_command(program, args);
    let stderr = output.stderr_text();
    let mut message = if output.timed_out {
        format!("`{command}` timed out")
    } else {
        format!(
            "command failed with status {} while running `{command}`",
            output.status_code
        )
    };
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(ref hint) = hint {
        message = format!("{message}\nHint: {hint}");
    }
    DevxError::Process {
        message,
        details: ProcessErrorDetails {
            error_code: error_code.to_string(),
            hint,
            command: Some(command),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
        },
    }
}
