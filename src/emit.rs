//! Per-workspace artifacts: `.envrc` and the tmuxp layout.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{context, Environment};

use crate::error::Result;
use crate::naming::{host_env_var, host_url, port_env_var, tmux_session_name};
use crate::paths::{write_atomic_text_file, StateFile, StorageLocator, PROJECT_DIR_NAME};
use crate::runner::{RunOptions, ToolRunner};

pub const ENVRC_FILE: &str = ".envrc";
pub const LAYOUT_FILE: &str = ".tmuxp.yaml";
pub const DEFAULT_LAYOUT_TEMPLATE: &str = include_str!("../config/session.yaml.tmpl");

/// Everything the emitters need to know about one session.
#[derive(Debug, Clone)]
pub struct SessionView<'a> {
    pub name: &'a str,
    pub path: &'a Path,
    pub ports: &'a BTreeMap<String, u16>,
    /// service -> hostname (`<label>.localhost`)
    pub routes: &'a BTreeMap<String, String>,
    pub host_scheme: &'a str,
}

pub fn render_envrc(view: &SessionView<'_>) -> String {
    let mut out = String::new();
    for (service, port) in view.ports {
        let _ = writeln!(out, "export {}={port}", port_env_var(service));
    }
    if !view.routes.is_empty() {
        out.push_str("\n# HTTP hostnames\n");
        for (service, hostname) in view.routes {
            let _ = writeln!(
                out,
                "export {}={}",
                host_env_var(service),
                host_url(view.host_scheme, hostname)
            );
        }
    }
    let _ = writeln!(out, "\nexport SESSION_NAME={}", view.name);
    out
}

/// Writes `.envrc` and runs `direnv allow` when direnv is installed.
/// Returns a warning if direnv refused.
pub fn write_envrc(runner: &dyn ToolRunner, view: &SessionView<'_>) -> Result<Option<String>> {
    let path = view.path.join(ENVRC_FILE);
    write_atomic_text_file(&path, &render_envrc(view), None)?;
    tracing::debug!(path = %path.display(), "wrote envrc");
    Ok(Direnv::new(runner).allow(view.path))
}

pub struct Direnv<'a> {
    runner: &'a dyn ToolRunner,
}

impl<'a> Direnv<'a> {
    pub fn new(runner: &'a dyn ToolRunner) -> Self {
        Self { runner }
    }

    pub fn allow(&self, dir: &Path) -> Option<String> {
        if !self.runner.on_path("direnv") {
            return None;
        }
        let args = vec!["allow".to_string(), ".".to_string()];
        match self.runner.run("direnv", &args, &RunOptions::in_dir(dir)) {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!("direnv allow failed: {}", output.stderr_text())),
            Err(err) => Some(format!("direnv allow failed: {err}")),
        }
    }
}

/// Project override, then the locator's copy, then the bundled default.
pub fn resolve_layout_template(
    locator: &StorageLocator,
    project_root: Option<&Path>,
) -> Result<(String, Option<PathBuf>)> {
    let project_candidate = project_root.map(|root| {
        root.join(PROJECT_DIR_NAME)
            .join(StateFile::LayoutTemplate.file_name())
    });
    let found = project_candidate
        .filter(|path| path.is_file())
        .or_else(|| locator.existing(StateFile::LayoutTemplate));
    match found {
        Some(path) => Ok((fs::read_to_string(&path)?, Some(path))),
        None => Ok((DEFAULT_LAYOUT_TEMPLATE.to_string(), None)),
    }
}

fn layout_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_function("port_var", |service: String| port_env_var(&service));
    env.add_function("host_var", |service: String| host_env_var(&service));
    env
}

pub fn render_layout(template: &str, view: &SessionView<'_>) -> Result<String> {
    let env = layout_environment();
    let rendered = env.render_str(
        template,
        context! {
            Name => view.name,
            TmuxName => tmux_session_name(view.name),
            Path => view.path.display().to_string(),
            Ports => view.ports,
            Routes => view.routes,
            Scheme => view.host_scheme,
        },
    )?;
    Ok(rendered)
}

pub fn write_layout(template: &str, view: &SessionView<'_>) -> Result<PathBuf> {
    let path = view.path.join(LAYOUT_FILE);
    let rendered = render_layout(template, view)?;
    write_atomic_text_file(&path, &rendered, None)?;
    tracing::debug!(path = %path.display(), "wrote tmuxp layout");
    Ok(path)
}
