//! Editor, tmux and cleanup-command supervision.
//!
//! Launched processes are detached and never owned: the only handle kept is
//! the editor pid, used for liveness probes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::{DevxError, Result};
use crate::naming::tmux_session_name;
use crate::runner::{command_failed, spawn_error, RunOptions, ToolRunner};

pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Editor command from config, then `$VISUAL`, then `$EDITOR`, split on
/// whitespace so `code -n` works.
pub fn resolve_editor<F>(configured: &str, lookup: F) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = Some(configured.to_string())
        .filter(|s| !s.trim().is_empty())
        .or_else(|| lookup("VISUAL").filter(|s| !s.trim().is_empty()))
        .or_else(|| lookup("EDITOR").filter(|s| !s.trim().is_empty()))?;
    let parts: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    (!parts.is_empty()).then_some(parts)
}

#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 only performs the permission and existence checks.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_is_alive(pid: u32) -> bool {
    pid != 0
}

pub struct Editor<'a> {
    runner: &'a dyn ToolRunner,
    command: Option<Vec<String>>,
}

impl<'a> Editor<'a> {
    pub fn new(runner: &'a dyn ToolRunner, command: Option<Vec<String>>) -> Self {
        Self { runner, command }
    }

    /// Opens `workspace` detached. Returns 0 when no editor is configured.
    pub fn launch(&self, workspace: &Path) -> Result<u32> {
        let Some((program, rest)) = self.command.as_ref().and_then(|c| c.split_first()) else {
            return Ok(0);
        };
        let mut args = rest.to_vec();
        args.push(workspace.display().to_string());
        let pid = self
            .runner
            .spawn_detached(program, &args, workspace)
            .map_err(|err| spawn_error(program, &args, &err))?;
        tracing::info!(pid, editor = %program, "launched editor");
        Ok(pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxSession {
    pub name: String,
    pub attached: bool,
}

pub fn parse_session_list(output: &str) -> Vec<TmuxSession> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let attached = parts
                .next()
                .map(|v| v.trim().parse::<u32>().unwrap_or(0) > 0)
                .unwrap_or(false);
            Some(TmuxSession {
                name: name.to_string(),
                attached,
            })
        })
        .collect()
}

/// Window names declared in a tmuxp layout.
fn layout_window_names(layout: &Path) -> BTreeSet<String> {
    let Ok(content) = fs::read_to_string(layout) else {
        return BTreeSet::new();
    };
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(&content) else {
        return BTreeSet::new();
    };
    doc.get("windows")
        .and_then(|w| w.as_sequence())
        .map(|windows| {
            windows
                .iter()
                .filter_map(|w| w.get("window_name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct Tmux<'a> {
    runner: &'a dyn ToolRunner,
    inside_tmux: bool,
    settle: Duration,
}

impl<'a> Tmux<'a> {
    pub fn new(runner: &'a dyn ToolRunner, inside_tmux: bool, settle: Duration) -> Self {
        Self {
            runner,
            inside_tmux,
            settle,
        }
    }

    fn target(name: &str) -> String {
        format!("={}", tmux_session_name(name))
    }

    fn tmux(&self, args: &[String]) -> Result<crate::runner::CommandOutput> {
        self.runner
            .run("tmux", args, &RunOptions::default())
            .map_err(|err| spawn_error("tmux", args, &err))
    }

    pub fn installed(&self) -> bool {
        self.runner.on_path("tmux")
    }

    pub fn require_launcher(&self) -> Result<()> {
        for tool in ["tmux", "tmuxp"] {
            if !self.runner.on_path(tool) {
                return Err(DevxError::ExternalUnavailable(format!(
                    "{tool} is not installed; run `devx check` for install hints"
                )));
            }
        }
        Ok(())
    }

    pub fn has_session(&self, name: &str) -> bool {
        let args = vec!["has-session".to_string(), "-t".to_string(), Self::target(name)];
        self.tmux(&args).map(|o| o.success()).unwrap_or(false)
    }

    pub fn kill_session(&self, name: &str) -> bool {
        let args = vec!["kill-session".to_string(), "-t".to_string(), Self::target(name)];
        self.tmux(&args).map(|o| o.success()).unwrap_or(false)
    }

    /// Loads the layout detached, replacing any stale session of the same
    /// name, then drops a leftover scratch window 0.
    pub fn load(&self, name: &str, layout: &Path) -> Result<()> {
        self.require_launcher()?;
        if self.has_session(name) {
            tracing::info!(session = name, "killing stale tmux session");
            self.kill_session(name);
        }
        let args = vec!["load".to_string(), "-d".to_string(), layout.display().to_string()];
        let output = self
            .runner
            .run("tmuxp", &args, &RunOptions::default())
            .map_err(|err| spawn_error("tmuxp", &args, &err))?;
        if !output.success() {
            return Err(command_failed(
                "tmuxp",
                &args,
                &output,
                "tmuxp_load_failed",
                Some(format!("check the layout in {}", layout.display())),
            ));
        }
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        self.drop_scratch_window(name, layout);
        Ok(())
    }

    fn drop_scratch_window(&self, name: &str, layout: &Path) {
        let list = vec![
            "list-windows".to_string(),
            "-t".to_string(),
            Self::target(name),
            "-F".to_string(),
            "#{window_index}\t#{window_name}".to_string(),
        ];
        let Ok(output) = self.tmux(&list) else {
            return;
        };
        let windows: Vec<(String, String)> = output
            .stdout_text()
            .lines()
            .filter_map(|line| {
                let (index, window) = line.split_once('\t')?;
                Some((index.trim().to_string(), window.trim().to_string()))
            })
            .collect();
        if windows.len() < 2 {
            return;
        }
        let declared = layout_window_names(layout);
        if let Some((_, window)) = windows.iter().find(|(index, _)| index == "0") {
            if declared.contains(window) {
                return;
            }
            let kill = vec![
                "kill-window".to_string(),
                "-t".to_string(),
                format!("{}:0", Self::target(name)),
            ];
            let _ = self.tmux(&kill);
        }
    }

    /// Attaches the terminal, or switches the client when already inside tmux.
    pub fn attach(&self, name: &str) -> Result<()> {
        if !self.has_session(name) {
            return Err(DevxError::NotFound(format!(
                "tmux session '{}' not found",
                tmux_session_name(name)
            )));
        }
        let verb = if self.inside_tmux {
            "switch-client"
        } else {
            "attach-session"
        };
        let args = vec![verb.to_string(), "-t".to_string(), Self::target(name)];
        let code = self
            .runner
            .run_attached("tmux", &args)
            .map_err(|err| spawn_error("tmux", &args, &err))?;
        if code != 0 {
            return Err(DevxError::Process {
                message: format!("tmux {verb} exited with status {code}"),
                details: crate::error::ProcessErrorDetails {
                    error_code: "tmux_attach_failed".to_string(),
                    hint: None,
                    command: Some(crate::runner::render_command("tmux", &args)),
                    raw_stderr: None,
                },
            });
        }
        Ok(())
    }

    pub fn launch(&self, name: &str, layout: &Path) -> Result<()> {
        self.load(name, layout)?;
        self.attach(name)
    }

    /// Running sessions; an absent server counts as none.
    pub fn list(&self) -> Result<Vec<TmuxSession>> {
        if !self.installed() {
            return Ok(Vec::new());
        }
        let args = vec![
            "list-sessions".to_string(),
            "-F".to_string(),
            "#{session_name}\t#{session_attached}".to_string(),
        ];
        let output = self.tmux(&args)?;
        if !output.success() {
            let stderr = output.stderr_text().to_lowercase();
            if stderr.contains("no server running")
                || stderr.contains("no sessions")
                || stderr.contains("error connecting")
            {
                return Ok(Vec::new());
            }
            return Err(command_failed("tmux", &args, &output, "tmux_list_failed", None));
        }
        Ok(parse_session_list(&output.stdout_text()))
    }

    /// Name of the session this client is attached to, if any.
    pub fn current_session(&self) -> Option<String> {
        if !self.inside_tmux {
            return None;
        }
        let args = vec![
            "display-message".to_string(),
            "-p".to_string(),
            "#S".to_string(),
        ];
        let output = self.tmux(&args).ok()?;
        let name = output.stdout_text().trim().to_string();
        (output.success() && !name.is_empty()).then_some(name)
    }
}

/// Runs the configured cleanup command through `sh -c` in the workspace.
/// Returns a warning for non-zero exit, timeout or spawn failure.
pub fn run_cleanup(
    runner: &dyn ToolRunner,
    command: &str,
    workspace: &Path,
    env: BTreeMap<String, String>,
    timeout: Duration,
) -> Option<String> {
    if command.trim().is_empty() {
        return None;
    }
    let cwd = if workspace.is_dir() {
        workspace.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    let args = vec!["-c".to_string(), command.to_string()];
    let opts = RunOptions {
        cwd: Some(cwd),
        env,
        timeout: Some(timeout),
    };
    tracing::info!(command, "running cleanup command");
    match runner.run("sh", &args, &opts) {
        Ok(output) if output.timed_out => Some(format!(
            "cleanup command timed out after {}s",
            timeout.as_secs()
        )),
        Ok(output) if !output.success() => {
            let stderr = output.stderr_text();
            Some(if stderr.is_empty() {
                format!("cleanup command exited with status {}", output.status_code)
            } else {
                format!(
                    "cleanup command exited with status {}: {stderr}",
                    output.status_code
                )
            })
        }
        Ok(_) => None,
        Err(err) => Some(format!("failed to run cleanup command: {err}")),
    }
}
