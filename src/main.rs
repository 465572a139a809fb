mod caddy;
mod config;
mod context;
mod doctor;
mod emit;
mod error;
mod lifecycle;
mod naming;
mod paths;
mod ports;
mod projects;
mod runner;
mod store;
mod supervisor;
mod tui;
mod worktree;

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::caddy::{check_health, desired_routes, CaddyClient, HttpAdmin};
use crate::config::{get_key, init_config, project_config_path, set_key};
use crate::context::Context;
use crate::doctor::{checks_passed, collect_checks};
use crate::error::{DevxError, ProcessErrorDetails, Result};
use crate::lifecycle::{AttachOptions, CreateOptions, Report, SessionStatus};
use crate::paths::{display_path_with_home, StateFile};
use crate::ports::parse_port_assignment;
use crate::projects::{Project, Registry};
use crate::store::SessionStore;

const LOG_ENV: &str = "DEVX_LOG";
const DEFAULT_FLAG_REASON: &str = "needs attention";

#[derive(Parser, Debug)]
#[command(name = "devx", version, about = "Isolated local development sessions")]
struct Cli {
    /// Print machine-readable JSON envelopes.
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    Caddy {
        #[command(subcommand)]
        command: CaddyCommand,
    },
    /// Probe the external tools devx drives.
    Check,
    Version {
        #[arg(long, value_parser = ["text", "json"], default_value = "text")]
        output: String,
        #[arg(long, default_value_t = false)]
        detailed: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    Create {
        name: String,
        #[arg(long)]
        project: Option<String>,
        /// Port for the `ui` service.
        #[arg(long = "fe-port")]
        fe_port: Option<u32>,
        /// Port for the `api` service.
        #[arg(long = "api-port")]
        api_port: Option<u32>,
        /// Explicit port, repeatable.
        #[arg(long = "port", value_name = "SERVICE=PORT")]
        port: Vec<String>,
        #[arg(long, default_value_t = false)]
        no_tmux: bool,
        #[arg(long, default_value_t = false)]
        no_editor: bool,
        /// Recreate the workspace if its directory holds another checkout.
        #[arg(long, default_value_t = false)]
        detach: bool,
    },
    Attach {
        name: String,
        #[arg(long, default_value_t = false)]
        no_tmux: bool,
        #[arg(long, default_value_t = false)]
        no_editor: bool,
    },
    Rm {
        name: String,
        #[arg(long, short = 'f', default_value_t = false)]
        force: bool,
    },
    List,
    Flag {
        name: String,
        reason: Option<String>,
        #[arg(long, default_value_t = false)]
        clear: bool,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Clear {
        #[arg(long, short = 'f', default_value_t = false)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    View,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
    Init {
        /// Write `.devx/config.yaml` in the current project instead of the
        /// global config.
        #[arg(long, default_value_t = false)]
        project: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Add {
        path: PathBuf,
        #[arg(long)]
        alias: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "default-branch")]
        default_branch: Option<String>,
        #[arg(long, default_value_t = false)]
        auto_pull: bool,
    },
    List,
    Rm {
        alias: String,
    },
}

#[derive(Subcommand, Debug)]
enum CaddyCommand {
    Check {
        /// Re-publish the desired routes.
        #[arg(long, default_value_t = false)]
        fix: bool,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

impl<T: Serialize> JsonResult<T> {
    fn success(result: T, warnings: Vec<String>) -> Self {
        Self {
            ok: true,
            result: Some(result),
            warnings,
            error: None,
            error_kind: None,
            error_details: None,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = cli.json;

    let result = Context::from_process(json_mode).and_then(|ctx| match cli.command {
        None => tui::run(&ctx),
        Some(Commands::Session { command }) => handle_session(&ctx, command),
        Some(Commands::Config { command }) => handle_config(&ctx, command),
        Some(Commands::Project { command }) => handle_project(&ctx, command),
        Some(Commands::Caddy { command }) => handle_caddy(&ctx, command),
        Some(Commands::Check) => handle_check(&ctx),
        Some(Commands::Version { output, detailed }) => handle_version(&ctx, &output, detailed),
    });

    if let Err(err) = result {
        if json_mode {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                warnings: Vec::new(),
                error: Some(err.to_string()),
                error_kind: Some(err.kind().to_string()),
                error_details: err.process_details().cloned(),
            };
            if print_json(&payload).is_err() {
                eprintln!("{err}");
            }
        } else {
            eprintln!("{} {err}", style("error:").red().bold());
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "info" } else { "error" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("{} {warning}", style("warning:").yellow().bold());
    }
}

/// JSON envelope under `--json`, otherwise `text` plus warnings and hints.
fn finish<T: Serialize>(ctx: &Context, report: Report<T>, text: impl FnOnce(&T)) -> Result<()> {
    if ctx.json {
        return print_json(&JsonResult::success(report.result, report.warnings));
    }
    text(&report.result);
    print_warnings(&report.warnings);
    for hint in &report.hints {
        println!("{}", style(format!("hint: {hint}")).dim());
    }
    Ok(())
}

fn plain<T>(result: T) -> Report<T> {
    Report {
        result,
        warnings: Vec::new(),
        hints: Vec::new(),
    }
}

fn confirm(prompt: String) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn port_overrides(
    fe_port: Option<u32>,
    api_port: Option<u32>,
    assignments: &[String],
) -> Result<BTreeMap<String, u32>> {
    let mut overrides = BTreeMap::new();
    if let Some(port) = fe_port {
        overrides.insert("ui".to_string(), port);
    }
    if let Some(port) = api_port {
        overrides.insert("api".to_string(), port);
    }
    for raw in assignments {
        let (service, port) = parse_port_assignment(raw)?;
        if overrides.insert(service.clone(), port).is_some() {
            return Err(DevxError::Validation(format!(
                "port for service '{service}' given more than once"
            )));
        }
    }
    Ok(overrides)
}

fn handle_session(ctx: &Context, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::Create {
            name,
            project,
            fe_port,
            api_port,
            port,
            no_tmux,
            no_editor,
            detach,
        } => {
            let opts = CreateOptions {
                project,
                port_overrides: port_overrides(fe_port, api_port, &port)?,
                no_tmux,
                no_editor,
                detach,
            };
            let report = lifecycle::create(ctx, &name, &opts)?;
            finish(ctx, report, |record| {
                println!(
                    "{} session '{}' at {}",
                    style("created").green().bold(),
                    record.name,
                    record.path.display()
                );
                for (service, port) in &record.ports {
                    match record.routes.get(service) {
                        Some(host) => println!("  {service}: {port} ({host})"),
                        None => println!("  {service}: {port}"),
                    }
                }
            })
        }
        SessionCommand::Attach {
            name,
            no_tmux,
            no_editor,
        } => {
            let report = lifecycle::attach(ctx, &name, AttachOptions { no_tmux, no_editor })?;
            finish(ctx, report, |record| {
                println!("attached to session '{}'", record.name);
            })
        }
        SessionCommand::Rm { name, force } => {
            let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
            let record = store.get(&name)?;
            if !force
                && !confirm(format!(
                    "Remove session '{name}' and its worktree at {}?",
                    record.path.display()
                ))?
            {
                return Err(DevxError::Validation("aborted".to_string()));
            }
            let report = lifecycle::remove(ctx, &name)?;
            finish(ctx, report, |record| {
                println!("{} session '{}'", style("removed").green().bold(), record.name);
            })
        }
        SessionCommand::List => {
            let sessions = lifecycle::list(ctx)?;
            finish(ctx, plain(sessions), |sessions| print_session_table(sessions))
        }
        SessionCommand::Flag {
            name,
            reason,
            clear,
            force,
        } => {
            let record = if clear {
                lifecycle::clear_flag(ctx, &name)?
            } else {
                let reason = reason.unwrap_or_else(|| DEFAULT_FLAG_REASON.to_string());
                lifecycle::flag(ctx, &name, &reason, force)?
            };
            finish(ctx, plain(record), |record| {
                if record.attention_flag {
                    println!("flagged '{}': {}", record.name, record.attention_reason);
                } else {
                    println!("cleared flag on '{}'", record.name);
                }
            })
        }
        SessionCommand::Clear { force } => {
            let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
            let count = store.list()?.len();
            if count > 0 && !force && !confirm(format!("Remove all {count} sessions?"))? {
                return Err(DevxError::Validation("aborted".to_string()));
            }
            let report = lifecycle::clear(ctx)?;
            finish(ctx, report, |removed| {
                println!("removed {} session(s)", removed.len());
            })
        }
    }
}

fn print_session_table(sessions: &[SessionStatus]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    let rows: Vec<[String; 5]> = sessions
        .iter()
        .map(|status| {
            let record = &status.record;
            [
                record.name.clone(),
                record.branch.clone(),
                record
                    .ports
                    .iter()
                    .map(|(service, port)| format!("{service}:{port}"))
                    .collect::<Vec<_>>()
                    .join(","),
                record.routes.values().cloned().collect::<Vec<_>>().join(","),
                status.flags(),
            ]
        })
        .collect();
    let header = ["NAME", "BRANCH", "PORTS", "HOSTNAMES", "FLAGS"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let line = |cells: [&str; 5]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("{}", style(line(header)).bold());
    for row in &rows {
        println!("{}", line(row.each_ref().map(String::as_str)));
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::View => {
            if ctx.json {
                return print_json(&JsonResult::success(&ctx.config, Vec::new()));
            }
            print!("{}", serde_yaml::to_string(&ctx.config)?);
            Ok(())
        }
        ConfigCommand::Get { key } => {
            let value = get_key(&ctx.config, &key)?;
            if ctx.json {
                return print_json(&JsonResult::success(
                    json!({ "key": key, "value": value }),
                    Vec::new(),
                ));
            }
            match value {
                serde_yaml::Value::String(text) => println!("{text}"),
                other => print!("{}", serde_yaml::to_string(&other)?),
            }
            Ok(())
        }
        ConfigCommand::Set { key, value } => {
            let path = match ctx.locator.project_dir() {
                Some(dir) => dir.join(StateFile::Config.file_name()),
                None => ctx.locator.global(StateFile::Config),
            };
            let cfg = set_key(&ctx.locator, &path, &key, &value)?;
            let effective = get_key(&cfg, &key)?;
            finish(ctx, plain(json!({ "path": path, "key": key, "value": effective })), |_| {
                println!("set {key} in {}", path.display());
            })
        }
        ConfigCommand::Init { project } => {
            let path = if project {
                let root = lifecycle::resolve_project(ctx, None)
                    .map(|resolved| resolved.root)
                    .unwrap_or_else(|_| ctx.cwd.clone());
                project_config_path(&root)
            } else {
                ctx.locator.global(StateFile::Config)
            };
            let created = init_config(&path)?;
            finish(ctx, plain(json!({ "path": path, "created": created })), |_| {
                if created {
                    println!("wrote {}", path.display());
                } else {
                    println!("{} already exists", path.display());
                }
            })
        }
    }
}

fn handle_project(ctx: &Context, command: ProjectCommand) -> Result<()> {
    let registry = Registry::open(&ctx.locator);
    match command {
        ProjectCommand::Add {
            path,
            alias,
            name,
            description,
            default_branch,
            auto_pull,
        } => {
            let path = if path.is_absolute() {
                path
            } else {
                ctx.cwd.join(path)
            };
            let project = Project {
                name: name.unwrap_or_default(),
                path,
                description: description.unwrap_or_default(),
                default_branch: default_branch.unwrap_or_default(),
                auto_pull,
            };
            let added = registry.add(&ctx.git(), &alias, project)?;
            finish(ctx, plain(json!({ "alias": alias, "project": added })), |_| {
                println!("registered project '{alias}' at {}", added.path.display());
            })
        }
        ProjectCommand::List => {
            let projects: BTreeMap<String, Project> = registry.list()?.into_iter().collect();
            finish(ctx, plain(projects), |projects| {
                if projects.is_empty() {
                    println!("No projects registered.");
                }
                let home = dirs::home_dir();
                for (alias, project) in projects {
                    let mut line = format!(
                        "{alias}  {}",
                        display_path_with_home(&project.path, home.as_deref())
                    );
                    if !project.description.is_empty() {
                        line.push_str(&format!("  {}", project.description));
                    }
                    if project.auto_pull {
                        line.push_str("  [auto-pull]");
                    }
                    println!("{line}");
                }
            })
        }
        ProjectCommand::Rm { alias } => {
            let removed = registry.remove(&alias)?;
            finish(ctx, plain(json!({ "alias": alias, "project": removed })), |_| {
                println!("removed project '{alias}'");
            })
        }
    }
}

fn handle_caddy(ctx: &Context, command: CaddyCommand) -> Result<()> {
    let CaddyCommand::Check { fix } = command;
    if ctx.config.disable_caddy {
        return finish(ctx, plain(json!({ "disabled": true })), |_| {
            println!("caddy integration is disabled (disable_caddy: true)");
        });
    }
    let sessions = SessionStore::open(&ctx.locator, ctx.clock.as_ref()).list()?;
    let desired = desired_routes(&sessions);
    let admin_url = ctx.config.caddy_admin_url();
    let admin = HttpAdmin::new(&admin_url)?;
    let client = CaddyClient::new(&admin);
    let health = check_health(&client, &desired)?;

    let mut warnings = Vec::new();
    let mut republished = None;
    if fix {
        let report = lifecycle::republish_routes(ctx)?;
        warnings = report.warnings;
        republished = Some(report.result);
    }
    let healthy = health.healthy();
    let report = Report {
        result: json!({ "health": health, "healthy": healthy, "republished": republished }),
        warnings,
        hints: if healthy || fix {
            Vec::new()
        } else {
            vec!["run `devx caddy check --fix` to re-publish routes".to_string()]
        },
    };
    finish(ctx, report, |_| {
        if health.reachable {
            println!(
                "[ok] caddy admin reachable at {admin_url} (server {})",
                health.server.as_deref().unwrap_or("?")
            );
        } else {
            println!("[fail] caddy admin unreachable at {admin_url}");
        }
        println!(
            "routes: {}/{} present",
            health.routes_existing, health.routes_needed
        );
        for id in &health.missing {
            println!("  missing: {id}");
        }
        if let Some(outcome) = &republished {
            if let Some(path) = &outcome.written {
                println!("wrote {}", path.display());
            }
            if outcome.reloaded {
                println!("caddy reloaded");
            }
        }
    })
}

fn handle_check(ctx: &Context) -> Result<()> {
    let checks = collect_checks(ctx.runner.as_ref(), &ctx.config, ctx.env_lookup);
    let ok = checks_passed(&checks);
    let missing_required: Vec<&str> = checks
        .iter()
        .filter(|check| !check.ok && check.required)
        .map(|check| check.id.as_str())
        .collect();

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            warnings: Vec::new(),
            error: (!ok).then(|| format!("required tools missing: {}", missing_required.join(", "))),
            error_kind: (!ok).then(|| "external_unavailable".to_string()),
            error_details: None,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok {
            style("[ok]").green()
        } else {
            style("[missing]").yellow()
        };
        println!("{state} {} - {}", check.id, check.message);
        if !check.ok && !check.remediation.is_empty() {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(DevxError::ExternalUnavailable(format!(
        "required tools missing: {}",
        missing_required.join(", ")
    )))
}

fn handle_version(ctx: &Context, output: &str, detailed: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let store = SessionStore::open(&ctx.locator, ctx.clock.as_ref());
    let mut info = json!({ "name": "devx", "version": version });
    if detailed {
        info["os"] = json!(env::consts::OS);
        info["arch"] = json!(env::consts::ARCH);
        info["global_dir"] = json!(ctx.locator.global_dir());
        info["project_dir"] = json!(ctx.locator.project_dir());
        info["sessions_file"] = json!(store.path());
        info["config_file"] = json!(ctx.locator.existing(StateFile::Config));
    }
    if ctx.json || output == "json" {
        if ctx.json {
            return print_json(&JsonResult::success(info, Vec::new()));
        }
        return print_json(&info);
    }
    println!("devx {version}");
    if detailed {
        let home = dirs::home_dir();
        println!("target: {}/{}", env::consts::OS, env::consts::ARCH);
        println!(
            "global dir: {}",
            display_path_with_home(ctx.locator.global_dir(), home.as_deref())
        );
        match ctx.locator.project_dir() {
            Some(dir) => println!(
                "project dir: {}",
                display_path_with_home(dir, home.as_deref())
            ),
            None => println!("project dir: (none)"),
        }
        println!(
            "sessions: {}",
            display_path_with_home(store.path(), home.as_deref())
        );
    }
    Ok(())
}
