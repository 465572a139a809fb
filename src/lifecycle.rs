//! Session verbs: create, attach, remove, flag, list.
//!
//! Create runs its side effects in a fixed order: worktree, bootstrap
//! files, store record, routes, `.envrc`/layout, editor, tmux. Everything
//! after the record is best effort and reported as warnings.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::caddy::{session_hostnames, PublishOutcome, RouteSync};
use crate::config::{ensure_distinct_services, load_config, validate_service_name, Config};
use crate::context::Context;
use crate::emit::{resolve_layout_template, write_envrc, write_layout, SessionView, LAYOUT_FILE};
use crate::error::{DevxError, Result};
use crate::naming::{host_env_var, host_url, port_env_var, tmux_session_name, validate_session_name};
use crate::paths::{normalize_relative_path, path_is_within, StateFile, StorageLocator};
use crate::ports::{allocate_ports, validate_port_overrides, PortProbe};
use crate::projects::{Project, Registry};
use crate::store::{SessionRecord, SessionStore};
use crate::supervisor::{process_is_alive, run_cleanup, CLEANUP_TIMEOUT};
use crate::worktree::WORKTREES_DIR;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub project: Option<String>,
    pub port_overrides: BTreeMap<String, u32>,
    pub no_tmux: bool,
    pub no_editor: bool,
    pub detach: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    pub no_tmux: bool,
    pub no_editor: bool,
}

/// Result of a verb plus anything the user should hear about.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report<T> {
    pub result: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl<T> Report<T> {
    fn new(result: T) -> Self {
        Self {
            result,
            warnings: Vec::new(),
            hints: Vec::new(),
        }
    }

    fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub alias: Option<String>,
    pub root: PathBuf,
    pub project: Option<Project>,
}

/// Explicit alias, else the innermost registered project around the cwd,
/// else the cwd itself when it is a repository root.
pub fn resolve_project(ctx: &Context, selector: Option<&str>) -> Result<ResolvedProject> {
    let registry = Registry::open(&ctx.locator);
    if let Some(alias) = selector {
        let project = registry.get(alias)?;
        return Ok(ResolvedProject {
            alias: Some(alias.to_string()),
            root: project.path.clone(),
            project: Some(project),
        });
    }
    if let Some((alias, project)) = registry.find_containing(&ctx.cwd)? {
        tracing::debug!(%alias, "using registered project containing the working directory");
        return Ok(ResolvedProject {
            alias: Some(alias),
            root: project.path.clone(),
            project: Some(project),
        });
    }
    if !ctx.runner.on_path("git") {
        return Err(DevxError::ExternalUnavailable(
            "git is not installed; run `devx check` for install hints".to_string(),
        ));
    }
    if !ctx.git().is_repository_root(&ctx.cwd) {
        return Err(DevxError::Validation(format!(
            "{} is not the root of a git repository; run devx from the repository root or pass --project <alias>",
            ctx.cwd.display()
        )));
    }
    Ok(ResolvedProject {
        alias: None,
        root: fs::canonicalize(&ctx.cwd)?,
        project: None,
    })
}

/// Config as seen from `project_root`: its `.devx/config.yaml` applies even
/// when the command runs elsewhere.
pub fn project_config(ctx: &Context, project_root: &Path) -> Result<Config> {
    let locator = StorageLocator::discover(project_root, ctx.locator.global_dir().to_path_buf());
    if locator.project_dir() == ctx.locator.project_dir() {
        return Ok(ctx.config.clone());
    }
    load_config(&locator)
}

/// Honors explicit ports, allocating the rest with those values excluded.
/// Overridden services missing from `services` are added.
pub fn assign_ports(
    probe: &dyn PortProbe,
    services: &[String],
    overrides: &BTreeMap<String, u32>,
) -> Result<BTreeMap<String, u16>> {
    for service in overrides.keys() {
        validate_service_name(service)?;
    }
    ensure_distinct_services(overrides.keys())?;
    for service in overrides.keys() {
        let clash = services.iter().find(|configured| {
            *configured != service
                && ensure_distinct_services([*configured, service]).is_err()
        });
        if let Some(configured) = clash {
            return Err(DevxError::Validation(format!(
                "port override '{service}' collides with configured service '{configured}'; use --port {configured}=<port>"
            )));
        }
    }
    let fixed = validate_port_overrides(overrides)?;
    let taken: BTreeSet<u16> = fixed.values().copied().collect();
    let remaining: Vec<String> = services
        .iter()
        .filter(|service| !fixed.contains_key(*service))
        .cloned()
        .collect();
    let mut ports = allocate_ports(probe, &remaining, &taken)?;
    ports.extend(fixed);
    Ok(ports)
}

/// Bootstrap entries resolved against the project root.
pub fn bootstrap_sources(entries: &[String]) -> Result<Vec<PathBuf>> {
    entries
        .iter()
        .map(|entry| {
            normalize_relative_path(entry)
                .map_err(|reason| DevxError::Validation(format!("bootstrap file: {reason}")))
        })
        .collect()
}

fn copy_file(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}

/// Copies files (and whole directories) into the workspace, keeping their
/// relative paths. Returns warnings for anything that could not be copied.
pub fn copy_bootstrap(project_root: &Path, workspace: &Path, relative: &[PathBuf]) -> Vec<String> {
    let mut warnings = Vec::new();
    for rel in relative {
        let source = project_root.join(rel);
        if !source.exists() {
            warnings.push(format!(
                "bootstrap file {} not found in {}",
                rel.display(),
                project_root.display()
            ));
            continue;
        }
        if source.is_dir() {
            for entry in WalkDir::new(&source).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warnings.push(format!("bootstrap copy of {}: {err}", rel.display()));
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(inner) = entry.path().strip_prefix(project_root) else {
                    continue;
                };
                if let Err(err) = copy_file(entry.path(), &workspace.join(inner)) {
                    warnings.push(format!("bootstrap copy of {}: {err}", inner.display()));
                }
            }
        } else if let Err(err) = copy_file(&source, &workspace.join(rel)) {
            warnings.push(format!("bootstrap copy of {}: {err}", rel.display()));
        }
        tracing::debug!(path = %rel.display(), "bootstrapped");
    }
    warnings
}

fn route_sync<'a>(ctx: &'a Context, config: &Config) -> RouteSync<'a> {
    RouteSync::new(
        ctx.runner.as_ref(),
        ctx.locator.global(StateFile::CaddyConfig),
        config.caddy_admin_listen(),
        config.disable_caddy,
    )
}

fn emit_files(
    ctx: &Context,
    config: &Config,
    record: &SessionRecord,
    report: &mut Report<impl Sized>,
) -> Result<PathBuf> {
    let view = SessionView {
        name: &record.name,
        path: &record.path,
        ports: &record.ports,
        routes: &record.routes,
        host_scheme: &config.host_scheme,
    };
    if let Some(warning) = write_envrc(ctx.runner.as_ref(), &view)? {
        report.warn(warning);
    }
    let (template, source) = resolve_layout_template(&ctx.locator, Some(&record.project_path))?;
    if let Some(source) = source {
        tracing::debug!(template = %source.display(), "using custom layout template");
    }
    write_layout(&template, &view)
}

fn launch_tmux(ctx: &Context, name: &str, layout: &Path, report: &mut Report<impl Sized>) {
    let tmux = ctx.tmux();
    if ctx.inside_tmux {
        match tmux.load(name, layout) {
            Ok(()) => report.hints.push(format!(
                "already inside tmux; switch with `tmux switch-client -t {}`",
                tmux_session_name(name)
            )),
            Err(err) => report.warn(format!("tmux session not started: {err}")),
        }
        return;
    }
    if let Err(err) = tmux.launch(name, layout) {
        report.warn(format!("tmux session not started: {err}"));
        report.hints.push(format!(
            "start it later with `tmuxp load {}`",
            layout.display()
        ));
    }
}

fn launch_editor(ctx: &Context, store: &SessionStore<'_>, record: &mut SessionRecord, report: &mut Report<impl Sized>) {
    match ctx.editor().launch(&record.path) {
        Ok(0) => tracing::debug!("no editor configured"),
        Ok(pid) => match store.update(&record.name, |r, _| r.editor_pid = pid) {
            Ok(updated) => *record = updated,
            Err(err) => report.warn(format!("failed to record editor pid: {err}")),
        },
        Err(err) => report.warn(format!("editor not started: {err}")),
    }
}

pub fn create(ctx: &Context, name: &str, opts: &CreateOptions) -> Result<Report<SessionRecord>> {
    validate_session_name(name)?;
    let project = resolve_project(ctx, opts.project.as_deref())?;
    let config = project_config(ctx, &project.root)?;
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let existing = store.find(name)?;
    if existing.is_some() && !opts.detach {
        return Err(DevxError::Validation(format!(
            "session '{name}' already exists"
        )));
    }
    let bootstrap = bootstrap_sources(&config.bootstrap_files)?;
    let ports = assign_ports(ctx.ports.as_ref(), &config.ports, &opts.port_overrides)?;
    tracing::info!(session = name, ?ports, "allocated ports");

    let mut report = Report::new(());
    if let Some(registered) = project.project.as_ref().filter(|p| p.auto_pull) {
        let git = ctx.git();
        let branch = Some(registered.default_branch.clone())
            .filter(|b| !b.is_empty())
            .or_else(|| git.current_branch(&project.root));
        if let Some(branch) = branch {
            if let Err(err) = git.pull(&project.root, &branch) {
                report.warn(format!("pull of '{branch}' skipped: {err}"));
            }
        }
    }

    let workspace = ctx.git().create(&project.root, name, opts.detach)?;
    report.warnings.extend(copy_bootstrap(&project.root, &workspace, &bootstrap));

    let mut record = SessionRecord::new(
        name,
        project.alias.clone(),
        project.root.clone(),
        workspace,
        ports,
        ctx.clock.now(),
    );
    if let Some(previous) = existing {
        tracing::info!(session = name, "replacing existing session record");
        record.extra = previous.extra;
        store.remove(name)?;
    }
    store.add(record.clone())?;

    let sync = route_sync(ctx, &config);
    if !sync.disabled() {
        let sessions = store.list()?;
        match sync.publish(&sessions) {
            Ok(outcome) => {
                if let Some(warning) = outcome.warning {
                    report.warn(warning);
                }
                if outcome.reloaded {
                    let routes = session_hostnames(&record);
                    record = store.update(name, |r, _| r.routes = routes)?;
                }
            }
            Err(err) => report.warn(format!("route publication failed: {err}")),
        }
    }

    let layout = emit_files(ctx, &config, &record, &mut report)?;

    if !opts.no_editor {
        launch_editor(ctx, &store, &mut record, &mut report);
    }
    if !opts.no_tmux {
        launch_tmux(ctx, name, &layout, &mut report);
    }

    tracing::info!(session = name, path = %record.path.display(), "session created");
    Ok(Report {
        result: record,
        warnings: report.warnings,
        hints: report.hints,
    })
}

/// `SESSION_NAME`, `WORKTREE_PATH`, `SESSION_BRANCH` plus every port and
/// host variable of the session.
pub fn cleanup_env(record: &SessionRecord, host_scheme: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("SESSION_NAME".to_string(), record.name.clone()),
        ("WORKTREE_PATH".to_string(), record.path.display().to_string()),
        ("SESSION_BRANCH".to_string(), record.branch.clone()),
    ]);
    for (service, port) in &record.ports {
        env.insert(port_env_var(service), port.to_string());
    }
    for (service, hostname) in &record.routes {
        env.insert(host_env_var(service), host_url(host_scheme, hostname));
    }
    env
}

pub fn remove(ctx: &Context, name: &str) -> Result<Report<SessionRecord>> {
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let mut record = store.get(name)?;
    let config = project_config(ctx, &record.project_path).unwrap_or_else(|err| {
        tracing::warn!(%err, "falling back to the current config");
        ctx.config.clone()
    });
    let mut report = Report::new(());

    if record.editor_pid != 0 {
        match store.update(name, |r, _| r.editor_pid = 0) {
            Ok(updated) => record = updated,
            Err(err) => report.warn(format!("failed to clear editor pid: {err}")),
        }
    }

    let tmux = ctx.tmux();
    if tmux.installed() && tmux.has_session(name) && !tmux.kill_session(name) {
        report.warn(format!(
            "failed to kill tmux session '{}'",
            tmux_session_name(name)
        ));
    }

    let sync = route_sync(ctx, &config);
    if !sync.disabled() {
        match store.list() {
            Ok(sessions) => {
                let remaining = sessions.iter().filter(|s| s.name != name);
                match sync.publish(remaining) {
                    Ok(outcome) => {
                        if let Some(warning) = outcome.warning {
                            report.warn(warning);
                        }
                    }
                    Err(err) => report.warn(format!("route publication failed: {err}")),
                }
            }
            Err(err) => report.warn(format!("route publication skipped: {err}")),
        }
    }

    if let Some(warning) = run_cleanup(
        ctx.runner.as_ref(),
        &config.cleanup_command,
        &record.path,
        cleanup_env(&record, &config.host_scheme),
        CLEANUP_TIMEOUT,
    ) {
        report.warn(warning);
    }

    if let Some(warning) = ctx.git().remove(&record.project_path, &record.path) {
        report.warn(warning);
    }
    prune_empty_parents(&record.project_path, &record.path);

    let removed = store.remove(name)?;
    tracing::info!(session = name, "session removed");
    Ok(Report {
        result: removed,
        warnings: report.warnings,
        hints: report.hints,
    })
}

/// Removes empty directories from the workspace's parent up to and including
/// `.worktrees/`.
fn prune_empty_parents(project_root: &Path, workspace: &Path) {
    let top = project_root.join(WORKTREES_DIR);
    let mut dir = workspace.parent();
    while let Some(current) = dir {
        if !current.starts_with(&top) {
            break;
        }
        let empty = fs::read_dir(current).is_ok_and(|mut entries| entries.next().is_none());
        if !empty || fs::remove_dir(current).is_err() {
            break;
        }
        if current == top {
            break;
        }
        dir = current.parent();
    }
}

/// Removes every session. Individual failures are collected as warnings.
pub fn clear(ctx: &Context) -> Result<Report<Vec<String>>> {
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let mut report = Report::new(Vec::new());
    for record in store.list()? {
        match remove(ctx, &record.name) {
            Ok(removed) => {
                report.warnings.extend(removed.warnings);
                report.result.push(record.name);
            }
            Err(err) => report.warn(format!("failed to remove '{}': {err}", record.name)),
        }
    }
    Ok(report)
}

/// Writes the desired route set for every session and, once caddy has
/// reloaded it, records the hostnames on each record.
pub fn republish_routes(ctx: &Context) -> Result<Report<PublishOutcome>> {
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let sessions = store.list()?;
    let sync = route_sync(ctx, &ctx.config);
    if sync.disabled() {
        return Err(DevxError::Validation(
            "caddy integration is disabled (disable_caddy: true)".to_string(),
        ));
    }
    let outcome = sync.publish(&sessions)?;
    let mut report = Report::new(PublishOutcome::default());
    if let Some(ref warning) = outcome.warning {
        report.warn(warning.clone());
    }
    if outcome.reloaded {
        for record in &sessions {
            let routes = session_hostnames(record);
            if routes != record.routes {
                store.update(&record.name, |r, _| r.routes = routes)?;
            }
        }
    }
    report.result = outcome;
    Ok(report)
}

pub fn attach(ctx: &Context, name: &str, opts: AttachOptions) -> Result<Report<SessionRecord>> {
    validate_session_name(name)?;
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let record = store.get(name)?;
    if !record.path.is_dir() {
        return Err(DevxError::NotFound(format!(
            "workspace for session '{name}' is missing at {}; remove it with `devx session rm {name}`",
            record.path.display()
        )));
    }
    let mut report = Report::new(());
    let mut record = store.record_attach(name)?;

    if !opts.no_editor && !process_is_alive(record.editor_pid) {
        launch_editor(ctx, &store, &mut record, &mut report);
    }

    if !opts.no_tmux {
        let tmux = ctx.tmux();
        if !tmux.installed() {
            report.warn("tmux is not installed; skipping terminal attach");
        } else if tmux.has_session(name) {
            if let Err(err) = tmux.attach(name) {
                report.warn(format!("tmux attach failed: {err}"));
            }
        } else {
            let config = project_config(ctx, &record.project_path)?;
            let mut layout = record.path.join(LAYOUT_FILE);
            if !layout.is_file() {
                layout = emit_files(ctx, &config, &record, &mut report)?;
            }
            launch_tmux(ctx, name, &layout, &mut report);
        }
    }

    Ok(Report {
        result: record,
        warnings: report.warnings,
        hints: report.hints,
    })
}

/// Best-effort guess at the session the caller is working in.
pub fn current_session(ctx: &Context, sessions: &[SessionRecord]) -> Option<String> {
    if let Some(record) = sessions
        .iter()
        .filter(|r| path_is_within(&ctx.cwd, &r.path))
        .max_by_key(|r| r.path.components().count())
    {
        return Some(record.name.clone());
    }
    let tmux_name = ctx.tmux().current_session()?;
    sessions
        .iter()
        .find(|r| tmux_session_name(&r.name) == tmux_name)
        .map(|r| r.name.clone())
}

pub fn flag(ctx: &Context, name: &str, reason: &str, force: bool) -> Result<SessionRecord> {
    validate_session_name(name)?;
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let sessions = store.list()?;
    if !sessions.iter().any(|r| r.name == name) {
        return Err(crate::store::session_not_found(name));
    }
    if !force && current_session(ctx, &sessions).as_deref() == Some(name) {
        return Err(DevxError::Validation(format!(
            "refusing to flag '{name}': it is the current session (pass --force to flag anyway)"
        )));
    }
    store.set_attention(name, reason)
}

pub fn clear_flag(ctx: &Context, name: &str) -> Result<SessionRecord> {
    validate_session_name(name)?;
    SessionStore::open(&ctx.locator, ctx.clock.as_ref()).clear_attention(name)
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub tmux_live: bool,
    pub editor_live: bool,
    pub workspace_missing: bool,
}

impl SessionStatus {
    /// `T` tmux, `E` editor, `!` attention, `?` workspace missing.
    pub fn flags(&self) -> String {
        let mut flags = String::new();
        if self.tmux_live {
            flags.push('T');
        }
        if self.editor_live {
            flags.push('E');
        }
        if self.record.attention_flag {
            flags.push('!');
        }
        if self.workspace_missing {
            flags.push('?');
        }
        flags
    }
}

pub fn list(ctx: &Context) -> Result<Vec<SessionStatus>> {
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let records = store.list()?;
    let live: BTreeSet<String> = match ctx.tmux().list() {
        Ok(sessions) => sessions.into_iter().map(|s| s.name).collect(),
        Err(err) => {
            tracing::warn!(%err, "could not list tmux sessions");
            BTreeSet::new()
        }
    };
    Ok(records
        .into_iter()
        .map(|record| SessionStatus {
            tmux_live: live.contains(&tmux_session_name(&record.name)),
            editor_live: process_is_alive(record.editor_pid),
            workspace_missing: !record.path.is_dir(),
            record,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{test_context, SequentialProbe};
    use crate::runner::testing::{fail, ok, FakeRunner};
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        repo: PathBuf,
        global: PathBuf,
        runner: Rc<FakeRunner>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let repo = dir.path().join("repo");
            let global = dir.path().join("global");
            fs::create_dir_all(&repo).unwrap();
            let repo = fs::canonicalize(repo).unwrap();
            let runner = Rc::new(FakeRunner::with_tools(&["git"]));
            runner.respond(
                "git",
                "--show-toplevel",
                ok(&format!("{}\n", repo.display())),
            );
            // Branches never exist up front.
            runner.respond("git", "show-ref", fail(1, ""));
            Self {
                _dir: dir,
                repo,
                global,
                runner,
            }
        }

        fn ctx(&self) -> Context {
            test_context(&self.repo, &self.global, self.runner.clone())
        }

        fn ctx_in(&self, cwd: &Path) -> Context {
            let mut ctx = self.ctx();
            ctx.cwd = cwd.to_path_buf();
            ctx
        }

        fn store_path(&self) -> PathBuf {
            self.global.join("sessions.json")
        }
    }

    fn quiet() -> CreateOptions {
        CreateOptions {
            no_tmux: true,
            no_editor: true,
            ..CreateOptions::default()
        }
    }

    #[test]
    fn create_writes_worktree_envrc_and_record() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let report = create(&ctx, "feat-foo", &quiet()).unwrap();
        let record = report.result;

        assert_eq!(record.branch, "feat-foo");
        assert_eq!(record.path, fx.repo.join(".worktrees").join("feat-foo"));
        assert!(record.path.is_absolute());
        assert_ne!(record.ports["ui"], record.ports["api"]);
        assert!(record.routes.is_empty());

        let envrc = fs::read_to_string(record.path.join(".envrc")).unwrap();
        assert!(envrc.contains(&format!("export UI_PORT={}", record.ports["ui"])));
        assert!(envrc.contains(&format!("export API_PORT={}", record.ports["api"])));
        assert!(envrc.contains("export SESSION_NAME=feat-foo"));
        assert!(record.path.join(".tmuxp.yaml").is_file());

        let lines = fx.runner.lines();
        let add = lines.iter().position(|l| l.contains("worktree add -b feat-foo")).unwrap();
        assert!(add > 0);
        assert!(fx.store_path().is_file());
    }

    #[test]
    fn duplicate_create_fails_without_touching_store() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        create(&ctx, "feat-bar", &quiet()).unwrap();
        let before = fs::read_to_string(fx.store_path()).unwrap();
        let err = create(&ctx, "feat-bar", &quiet()).unwrap_err();
        assert_eq!(err.to_string(), "session 'feat-bar' already exists");
        assert_eq!(fs::read_to_string(fx.store_path()).unwrap(), before);
    }

    #[test]
    fn detach_replaces_existing_record() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let first = create(&ctx, "feat", &quiet()).unwrap().result;
        let opts = CreateOptions {
            detach: true,
            ..quiet()
        };
        let second = create(&ctx, "feat", &opts).unwrap().result;
        assert_ne!(first.ports, second.ports);
        let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn invalid_name_is_rejected_before_any_side_effect() {
        let fx = Fixture::new();
        let err = create(&fx.ctx(), "bad..name", &quiet()).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(fx.runner.calls.borrow().is_empty());
    }

    #[test]
    fn worktree_failure_leaves_store_untouched() {
        let fx = Fixture::new();
        fx.runner
            .respond("git", "worktree add", fail(128, "fatal: invalid reference"));
        let err = create(&fx.ctx(), "feat", &quiet()).unwrap_err();
        assert!(err.to_string().contains("invalid reference"));
        assert!(!fx.store_path().exists());
    }

    #[test]
    fn port_overrides_are_kept_and_excluded_from_allocation() {
        let probe = SequentialProbe(Cell::new(3000));
        let overrides = BTreeMap::from([("ui".to_string(), 3000u32), ("db".to_string(), 5432)]);
        let services = vec!["ui".to_string(), "api".to_string()];
        let ports = assign_ports(&probe, &services, &overrides).unwrap();
        assert_eq!(ports["ui"], 3000);
        assert_eq!(ports["db"], 5432);
        assert_eq!(ports["api"], 3001);

        let bad = BTreeMap::from([("ui".to_string(), 80u32)]);
        assert!(assign_ports(&probe, &services, &bad).is_err());
        let bad_name = BTreeMap::from([("u i".to_string(), 3000u32)]);
        assert!(assign_ports(&probe, &services, &bad_name).is_err());
    }

    #[test]
    fn overrides_colliding_with_configured_services_are_rejected() {
        let probe = SequentialProbe(Cell::new(3000));
        let services = vec!["ui".to_string(), "web-api".to_string()];

        let shouty = BTreeMap::from([("UI".to_string(), 3000u32)]);
        let err = assign_ports(&probe, &services, &shouty).unwrap_err();
        assert!(err.to_string().contains("configured service 'ui'"), "{err}");

        let underscored = BTreeMap::from([("web_api".to_string(), 3001u32)]);
        assert!(assign_ports(&probe, &services, &underscored).is_err());

        let twins = BTreeMap::from([("db-a".to_string(), 5432u32), ("db_a".to_string(), 5433)]);
        assert!(assign_ports(&probe, &services, &twins).is_err());

        let exact = BTreeMap::from([("web-api".to_string(), 3001u32)]);
        assert_eq!(assign_ports(&probe, &services, &exact).unwrap()["web-api"], 3001);
    }

    #[test]
    fn bootstrap_files_are_copied_and_missing_ones_warned() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repo");
        let workspace = dir.path().join("ws");
        fs::create_dir_all(root.join("config").join("local")).unwrap();
        fs::write(root.join(".env.local"), "SECRET=1").unwrap();
        fs::write(root.join("config").join("local").join("dev.json"), "{}").unwrap();

        let sources = bootstrap_sources(&[
            ".env.local".to_string(),
            "config".to_string(),
            "missing.txt".to_string(),
        ])
        .unwrap();
        let warnings = copy_bootstrap(&root, &workspace, &sources);
        assert_eq!(fs::read_to_string(workspace.join(".env.local")).unwrap(), "SECRET=1");
        assert!(workspace.join("config").join("local").join("dev.json").is_file());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("missing.txt"));

        assert!(bootstrap_sources(&["../outside".to_string()]).is_err());
        assert!(bootstrap_sources(&["/etc/hosts".to_string()]).is_err());
    }

    #[test]
    fn create_then_remove_restores_store_and_workspace() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let record = create(&ctx, "feat", &quiet()).unwrap().result;
        assert!(record.path.is_dir());

        remove(&ctx, "feat").unwrap();
        let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
        assert!(store.list().unwrap().is_empty());
        assert!(!record.path.exists());
        assert!(!fx.repo.join(".worktrees").exists());
        assert!(fx
            .runner
            .lines()
            .iter()
            .any(|l| l.contains("worktree remove --force")));
    }

    #[test]
    fn remove_of_slash_name_prunes_empty_parents() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let login = create(&ctx, "feature/login", &quiet()).unwrap().result;
        let signup = create(&ctx, "feature/signup", &quiet()).unwrap().result;
        assert_eq!(login.path, fx.repo.join(".worktrees/feature/login"));

        remove(&ctx, "feature/login").unwrap();
        assert!(!login.path.exists());
        assert!(signup.path.is_dir());

        remove(&ctx, "feature/signup").unwrap();
        assert!(!fx.repo.join(".worktrees/feature").exists());
        assert!(!fx.repo.join(".worktrees").exists());
        assert!(fx.repo.is_dir());
    }

    fn register_auto_pull(fx: &Fixture, ctx: &Context, default_branch: &str) {
        let project = Project {
            name: "web".to_string(),
            path: fx.repo.clone(),
            description: String::new(),
            default_branch: default_branch.to_string(),
            auto_pull: true,
        };
        Registry::open(&ctx.locator)
            .add(&ctx.git(), "web", project)
            .unwrap();
    }

    #[test]
    fn auto_pull_fast_forwards_the_default_branch_before_create() {
        let fx = Fixture::new();
        fx.runner
            .respond("git", "--abbrev-ref HEAD", ok("main\n"));
        let ctx = fx.ctx();
        register_auto_pull(&fx, &ctx, "main");

        let report = create(&ctx, "feat", &quiet()).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.result.project_alias.as_deref(), Some("web"));

        let lines = fx.runner.lines();
        let fetch = lines
            .iter()
            .position(|l| l.ends_with("fetch --quiet origin"))
            .unwrap();
        let pull = lines
            .iter()
            .position(|l| l.ends_with("pull --ff-only --quiet origin main"))
            .unwrap();
        let add = lines.iter().position(|l| l.contains("worktree add")).unwrap();
        assert!(fetch < pull && pull < add);
    }

    #[test]
    fn auto_pull_falls_back_to_current_branch_and_only_warns() {
        let fx = Fixture::new();
        fx.runner
            .respond("git", "--abbrev-ref HEAD", ok("develop\n"));
        fx.runner.respond(
            "git",
            "pull --ff-only",
            fail(1, "fatal: unable to access remote"),
        );
        let ctx = fx.ctx();
        register_auto_pull(&fx, &ctx, "");

        let report = create(&ctx, "feat", &quiet()).unwrap();
        assert!(fx
            .runner
            .lines()
            .iter()
            .any(|l| l.ends_with("pull --ff-only --quiet origin develop")));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("pull of 'develop' skipped"));
        assert!(report.result.path.is_dir());
    }

    #[test]
    fn remove_unknown_session_is_not_found() {
        let fx = Fixture::new();
        let err = remove(&fx.ctx(), "ghost").unwrap_err();
        assert_eq!(err.to_string(), "session 'ghost' not found");
        assert!(!fx.store_path().exists());
    }

    #[test]
    fn remove_runs_cleanup_with_session_env() {
        let fx = Fixture::new();
        let mut ctx = fx.ctx();
        ctx.config.cleanup_command = "docker compose down".to_string();
        let record = create(&ctx, "feat", &quiet()).unwrap().result;
        remove(&ctx, "feat").unwrap();
        let call = fx.runner.calls_to("sh").pop().unwrap();
        assert_eq!(call.args[1], "docker compose down");
        assert_eq!(call.env["SESSION_NAME"], "feat");
        assert_eq!(call.env["SESSION_BRANCH"], "feat");
        assert_eq!(call.env["UI_PORT"], record.ports["ui"].to_string());
        assert_eq!(call.env["WORKTREE_PATH"], record.path.display().to_string());
    }

    #[test]
    fn attach_clears_flag_and_advances_last_attached() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        create(&ctx, "s1", &quiet()).unwrap();
        flag(&ctx, "s1", "needs review", false).unwrap();

        let opts = AttachOptions {
            no_tmux: true,
            no_editor: true,
        };
        let first = attach(&ctx, "s1", opts).unwrap().result;
        assert!(!first.attention_flag);
        assert_eq!(first.attention_reason, "");
        let second = attach(&ctx, "s1", opts).unwrap().result;
        assert!(second.last_attached > first.last_attached);
    }

    #[test]
    fn attach_relaunches_editor_and_tmux() {
        let fx = Fixture::new();
        let mut ctx = fx.ctx();
        create(&ctx, "s1", &quiet()).unwrap();
        ctx.config.editor = "code".to_string();
        let tools = Rc::new(FakeRunner::with_tools(&["git", "tmux", "tmuxp"]));
        tools.respond("tmux", "has-session", fail(1, "can't find session"));
        ctx.runner = Box::new(crate::context::testing::SharedRunner(tools.clone()));

        let report = attach(&ctx, "s1", AttachOptions::default()).unwrap();
        assert!(report.result.editor_pid > 0);
        let lines = tools.lines();
        assert!(lines.iter().any(|l| l.starts_with("code ")));
        assert!(lines.iter().any(|l| l.starts_with("tmuxp load -d")));
    }

    #[test]
    fn missing_tmux_on_attach_is_a_warning() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        create(&ctx, "s1", &quiet()).unwrap();
        let report = attach(
            &ctx,
            "s1",
            AttachOptions {
                no_tmux: false,
                no_editor: true,
            },
        )
        .unwrap();
        assert!(report.warnings[0].contains("tmux is not installed"));
    }

    #[test]
    fn flag_refuses_current_session_unless_forced() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let record = create(&ctx, "s1", &quiet()).unwrap().result;
        let inside = fx.ctx_in(&record.path.join("src"));
        fs::create_dir_all(record.path.join("src")).unwrap();

        let err = flag(&inside, "s1", "x", false).unwrap_err();
        assert!(err.to_string().contains("current session"));
        assert!(flag(&inside, "s1", "x", true).unwrap().attention_flag);
        assert!(flag(&ctx, "s2", "x", false).unwrap_err().to_string().contains("not found"));

        let cleared = clear_flag(&ctx, "s1").unwrap();
        assert!(!cleared.attention_flag);
        assert_eq!(cleared.attention_time, None);
    }

    #[test]
    fn current_session_matches_tmux_names() {
        let fx = Fixture::new();
        let mut ctx = fx.ctx();
        let record = create(&ctx, "feat.v2", &quiet()).unwrap().result;
        ctx.inside_tmux = true;
        fx.runner.respond("tmux", "display-message", ok("feat_v2\n"));
        assert_eq!(current_session(&ctx, &[record]), Some("feat.v2".to_string()));
    }

    #[test]
    fn list_reports_status_flags() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let record = create(&ctx, "s1", &quiet()).unwrap().result;
        flag(&ctx, "s1", "x", true).unwrap();
        fs::remove_dir_all(&record.path).unwrap();
        let statuses = list(&ctx).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].flags(), "!?");
    }

    #[test]
    fn clear_removes_everything() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        create(&ctx, "a", &quiet()).unwrap();
        create(&ctx, "b", &quiet()).unwrap();
        let report = clear(&ctx).unwrap();
        assert_eq!(report.result, vec!["a".to_string(), "b".to_string()]);
        assert!(list(&ctx).unwrap().is_empty());
    }

    #[test]
    fn routes_are_recorded_after_successful_reload() {
        let fx = Fixture::new();
        let mut ctx = fx.ctx();
        ctx.config.disable_caddy = false;
        let tools = Rc::new(FakeRunner::with_tools(&["git", "caddy"]));
        tools.respond("git", "--show-toplevel", ok(&format!("{}\n", fx.repo.display())));
        tools.respond("git", "show-ref", fail(1, ""));
        ctx.runner = Box::new(crate::context::testing::SharedRunner(tools.clone()));

        let record = create(&ctx, "feat", &quiet()).unwrap().result;
        assert_eq!(record.routes["ui"], "feat-ui.localhost");
        let envrc = fs::read_to_string(record.path.join(".envrc")).unwrap();
        assert!(envrc.contains("export UI_HOST=http://feat-ui.localhost"));
        let caddy = fs::read_to_string(fx.global.join("caddy-config.json")).unwrap();
        assert!(caddy.contains("sess-feat-ui"));

        remove(&ctx, "feat").unwrap();
        let caddy = fs::read_to_string(fx.global.join("caddy-config.json")).unwrap();
        assert!(!caddy.contains("sess-feat-ui"));
    }

    #[test]
    fn republish_backfills_routes() {
        let fx = Fixture::new();
        let mut ctx = fx.ctx();
        create(&ctx, "feat", &quiet()).unwrap();
        assert!(republish_routes(&ctx).is_err());

        ctx.config.disable_caddy = false;
        let tools = Rc::new(FakeRunner::with_tools(&["git", "caddy"]));
        ctx.runner = Box::new(crate::context::testing::SharedRunner(tools.clone()));
        let report = republish_routes(&ctx).unwrap();
        assert!(report.result.reloaded);
        assert_eq!(tools.calls_to("caddy").len(), 1);
        let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
        assert_eq!(store.get("feat").unwrap().routes["api"], "feat-api.localhost");
    }

    #[test]
    fn unreachable_caddy_leaves_routes_empty() {
        let fx = Fixture::new();
        let mut ctx = fx.ctx();
        ctx.config.disable_caddy = false;
        let report = create(&ctx, "feat", &quiet()).unwrap();
        assert!(report.result.routes.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("caddy is not installed")));
        assert!(fx.global.join("caddy-config.json").is_file());
    }
}
