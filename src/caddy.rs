//! Caddy route synchronisation.
//!
//! The desired configuration is a pure function of the session store. It is
//! written to disk and handed to `caddy reload`; the admin API is only read
//! (health checks and server discovery).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DevxError, Result};
use crate::naming::{build_hostname, build_route_id};
use crate::paths::write_atomic_text_file;
use crate::runner::{spawn_error, RunOptions, ToolRunner};
use crate::store::SessionRecord;

pub const SERVER_NAME: &str = "devx";
pub const HTTP_LISTEN: &str = ":80";
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub dial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub handler: String,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMatch {
    #[serde(default)]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "match")]
    pub matchers: Vec<HostMatch>,
    pub handle: Vec<Handler>,
    pub terminal: bool,
}

impl Route {
    pub fn reverse_proxy(id: String, hostname: String, port: u16) -> Self {
        Self {
            id,
            matchers: vec![HostMatch {
                host: vec![hostname],
            }],
            handle: vec![Handler {
                handler: "reverse_proxy".to_string(),
                upstreams: vec![Upstream {
                    dial: format!("localhost:{port}"),
                }],
            }],
            terminal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Server {
    pub listen: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpApp {
    pub servers: BTreeMap<String, Server>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Apps {
    pub http: HttpApp,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaddyConfig {
    pub admin: AdminConfig,
    pub apps: Apps,
}

/// service -> hostname for every service that yields a DNS label.
pub fn session_hostnames(record: &SessionRecord) -> BTreeMap<String, String> {
    record
        .ports
        .keys()
        .filter_map(|service| {
            let hostname = build_hostname(&record.name, service, record.project_alias.as_deref());
            (!hostname.is_empty()).then(|| (service.clone(), hostname))
        })
        .collect()
}

/// Routes for `sessions`, ordered by session name then service name.
pub fn desired_routes<'r, I>(sessions: I) -> Vec<Route>
where
    I: IntoIterator<Item = &'r SessionRecord>,
{
    let mut sorted: Vec<&SessionRecord> = sessions.into_iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut routes = Vec::new();
    for record in sorted {
        let alias = record.project_alias.as_deref();
        for (service, port) in &record.ports {
            let hostname = build_hostname(&record.name, service, alias);
            if hostname.is_empty() {
                continue;
            }
            routes.push(Route::reverse_proxy(
                build_route_id(&record.name, service, alias),
                hostname,
                *port,
            ));
        }
    }
    routes
}

pub fn build_config(routes: Vec<Route>, admin_listen: &str) -> CaddyConfig {
    let server = Server {
        listen: vec![HTTP_LISTEN.to_string()],
        routes,
    };
    CaddyConfig {
        admin: AdminConfig {
            listen: admin_listen.to_string(),
        },
        apps: Apps {
            http: HttpApp {
                servers: BTreeMap::from([(SERVER_NAME.to_string(), server)]),
            },
        },
    }
}

pub fn render_config(config: &CaddyConfig) -> Result<String> {
    Ok(format!("{}\n", serde_json::to_string_pretty(config)?))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    /// Config file written, `None` when integration is disabled.
    pub written: Option<PathBuf>,
    pub reloaded: bool,
    pub warning: Option<String>,
}

pub struct RouteSync<'a> {
    runner: &'a dyn ToolRunner,
    config_path: PathBuf,
    admin_listen: String,
    disabled: bool,
}

impl<'a> RouteSync<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        config_path: PathBuf,
        admin_listen: String,
        disabled: bool,
    ) -> Self {
        Self {
            runner,
            config_path,
            admin_listen,
            disabled,
        }
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Writes the full desired configuration and asks caddy to reload it.
    /// A failed reload is reported as a warning; the file on disk stays
    /// authoritative for the next caddy start.
    pub fn publish<'r, I>(&self, sessions: I) -> Result<PublishOutcome>
    where
        I: IntoIterator<Item = &'r SessionRecord>,
    {
        if self.disabled {
            tracing::debug!("caddy integration disabled; skipping publication");
            return Ok(PublishOutcome::default());
        }
        let routes = desired_routes(sessions);
        let count = routes.len();
        let rendered = render_config(&build_config(routes, &self.admin_listen))?;
        write_atomic_text_file(&self.config_path, &rendered, None)?;
        tracing::info!(path = %self.config_path.display(), routes = count, "wrote caddy config");

        let written = Some(self.config_path.clone());
        if !self.runner.on_path("caddy") {
            return Ok(PublishOutcome {
                written,
                reloaded: false,
                warning: Some(format!(
                    "caddy is not installed; routes written to {} will apply once caddy runs with it",
                    self.config_path.display()
                )),
            });
        }
        let args = vec![
            "reload".to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--address".to_string(),
            self.admin_listen.clone(),
        ];
        let warning = match self.runner.run("caddy", &args, &RunOptions::default()) {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!(
                "caddy reload failed (is caddy running?): {}",
                output.stderr_text()
            )),
            Err(err) => Some(spawn_error("caddy", &args, &err).to_string()),
        };
        if let Some(ref warning) = warning {
            tracing::warn!(%warning, "caddy reload failed");
        }
        Ok(PublishOutcome {
            written,
            reloaded: warning.is_none(),
            warning,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub status: u16,
    pub body: String,
}

/// Read access to the caddy admin API.
pub trait AdminApi {
    fn get(&self, path: &str) -> Result<AdminResponse>;
}

pub struct HttpAdmin {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpAdmin {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(ADMIN_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl AdminApi for HttpAdmin {
    fn get(&self, path: &str) -> Result<AdminResponse> {
        let url = format!("{}{path}", self.base_url);
        tracing::debug!(%url, "caddy admin GET");
        let response = self
            .client
            .get(&url)
            .header("User-Agent", "devx-cli")
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(AdminResponse { status, body })
    }
}

fn parse_json_or_empty(response: &AdminResponse) -> Result<Option<Value>> {
    if response.status == 404 {
        return Ok(None);
    }
    if !(200..300).contains(&response.status) {
        return Err(DevxError::ExternalUnavailable(format!(
            "caddy admin API returned HTTP {}: {}",
            response.status,
            response.body.trim()
        )));
    }
    let body = response.body.trim();
    if body.is_empty() || body == "null" {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(body)?))
}

/// Name of the server listening on port 80; `:8080` and friends don't count.
pub fn pick_http_server(servers: &serde_json::Map<String, Value>) -> Option<String> {
    servers
        .iter()
        .find(|(_, server)| {
            server
                .get("listen")
                .and_then(Value::as_array)
                .is_some_and(|listen| {
                    listen
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|addr| addr.ends_with(":80"))
                })
        })
        .map(|(name, _)| name.clone())
}

pub fn route_ids(routes: &Value) -> Vec<String> {
    routes
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|route| route.get("@id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct CaddyClient<'a> {
    api: &'a dyn AdminApi,
}

impl<'a> CaddyClient<'a> {
    pub fn new(api: &'a dyn AdminApi) -> Self {
        Self { api }
    }

    pub fn reachable(&self) -> bool {
        match self.api.get("/config/") {
            Ok(response) => (200..300).contains(&response.status),
            Err(err) => {
                tracing::debug!(%err, "caddy admin unreachable");
                false
            }
        }
    }

    pub fn discover_server_name(&self) -> Result<String> {
        let response = self.api.get("/config/apps/http/servers")?;
        let name = parse_json_or_empty(&response)?
            .as_ref()
            .and_then(Value::as_object)
            .and_then(pick_http_server);
        Ok(name.unwrap_or_else(|| SERVER_NAME.to_string()))
    }

    pub fn current_route_ids(&self, server: &str) -> Result<Vec<String>> {
        let response = self
            .api
            .get(&format!("/config/apps/http/servers/{server}/routes"))?;
        Ok(parse_json_or_empty(&response)?
            .map(|routes| route_ids(&routes))
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub reachable: bool,
    pub server: Option<String>,
    pub routes_needed: usize,
    pub routes_existing: usize,
    pub missing: Vec<String>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.reachable && self.missing.is_empty()
    }
}

pub fn check_health(client: &CaddyClient<'_>, desired: &[Route]) -> Result<HealthReport> {
    let needed: Vec<String> = desired.iter().map(|r| r.id.clone()).collect();
    if !client.reachable() {
        return Ok(HealthReport {
            reachable: false,
            server: None,
            routes_needed: needed.len(),
            routes_existing: 0,
            missing: needed,
        });
    }
    let server = client.discover_server_name()?;
    let live = client.current_route_ids(&server)?;
    let missing: Vec<String> = needed
        .iter()
        .filter(|id| !live.contains(id))
        .cloned()
        .collect();
    Ok(HealthReport {
        reachable: true,
        server: Some(server),
        routes_needed: needed.len(),
        routes_existing: needed.len() - missing.len(),
        missing,
    })
}
