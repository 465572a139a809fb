//! `devx check`: probes the external tools devx drives.

use serde::Serialize;

use crate::config::Config;
use crate::runner::{RunOptions, ToolRunner};
use crate::supervisor::resolve_editor;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolCheck {
    pub id: String,
    pub ok: bool,
    pub required: bool,
    pub message: String,
    pub remediation: String,
}

fn tool_check(
    id: &str,
    ok: bool,
    required: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
) -> ToolCheck {
    ToolCheck {
        id: id.to_string(),
        ok,
        required,
        message: message.into(),
        remediation: remediation.into(),
    }
}

fn version_line(runner: &dyn ToolRunner, program: &str, flag: &str) -> Option<String> {
    let output = runner
        .run(program, &[flag.to_string()], &RunOptions::default())
        .ok()?;
    if !output.success() {
        return None;
    }
    output
        .stdout_text()
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

fn probe(
    runner: &dyn ToolRunner,
    id: &str,
    required: bool,
    version_flag: &str,
    purpose: &str,
    remediation: &str,
) -> ToolCheck {
    if !runner.on_path(id) {
        return tool_check(
            id,
            false,
            required,
            format!("{id} is not installed or not in PATH ({purpose})"),
            remediation,
        );
    }
    let message = match version_line(runner, id, version_flag) {
        Some(version) => format!("{version} ({purpose})"),
        None => format!("{id} found ({purpose})"),
    };
    tool_check(id, true, required, message, remediation)
}

pub fn collect_checks(
    runner: &dyn ToolRunner,
    cfg: &Config,
    env_lookup: fn(&str) -> Option<String>,
) -> Vec<ToolCheck> {
    let mut checks = vec![
        probe(
            runner,
            "git",
            true,
            "--version",
            "workspaces",
            "Install git (https://git-scm.com/downloads) and rerun `devx check`.",
        ),
        probe(
            runner,
            "tmux",
            false,
            "-V",
            "terminal sessions",
            "Install tmux, e.g. `brew install tmux` or `apt install tmux`.",
        ),
        probe(
            runner,
            "tmuxp",
            false,
            "--version",
            "session layouts",
            "Install tmuxp, e.g. `pipx install tmuxp` or `brew install tmuxp`.",
        ),
        probe(
            runner,
            "direnv",
            false,
            "version",
            "loads .envrc",
            "Install direnv (https://direnv.net) and hook it into your shell.",
        ),
    ];
    if cfg.disable_caddy {
        checks.push(tool_check(
            "caddy",
            true,
            false,
            "caddy integration disabled (disable_caddy: true)",
            "",
        ));
    } else {
        checks.push(probe(
            runner,
            "caddy",
            false,
            "version",
            "*.localhost routes",
            "Install caddy (https://caddyserver.com/docs/install) or set disable_caddy: true.",
        ));
    }

    let editor = resolve_editor(&cfg.editor, env_lookup);
    let editor_check = match editor.as_ref().and_then(|cmd| cmd.first()) {
        Some(program) if runner.on_path(program) => tool_check(
            "editor",
            true,
            false,
            format!("{program} (from config, $VISUAL or $EDITOR)"),
            "",
        ),
        Some(program) => tool_check(
            "editor",
            false,
            false,
            format!("editor '{program}' is not in PATH"),
            "Fix `editor` in config.yaml or $VISUAL/$EDITOR.",
        ),
        None => tool_check(
            "editor",
            false,
            false,
            "no editor configured",
            "Set `editor` in config.yaml (e.g. `devx config set editor code`) or export $VISUAL.",
        ),
    };
    checks.push(editor_check);
    checks
}

/// Only required tools decide the exit status.
pub fn checks_passed(checks: &[ToolCheck]) -> bool {
    checks.iter().all(|check| check.ok || !check.required)
}
