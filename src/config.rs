use crate::error::{DevxError, Result};
use crate::naming::{normalize_dns, port_env_var};
use crate::paths::{normalize_relative_path, write_atomic_text_file, StateFile, StorageLocator};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const ENV_PREFIX: &str = "DEVX_";
pub const DEFAULT_CADDY_ADMIN: &str = "localhost:2019";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub ports: Vec<String>,
    pub editor: String,
    pub host_scheme: String,
    pub disable_caddy: bool,
    pub caddy_admin: String,
    pub cleanup_command: String,
    pub bootstrap_files: Vec<String>,
    pub tmux_settle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            ports: vec!["ui".to_string(), "api".to_string()],
            editor: String::new(),
            host_scheme: "http".to_string(),
            disable_caddy: false,
            caddy_admin: DEFAULT_CADDY_ADMIN.to_string(),
            cleanup_command: String::new(),
            bootstrap_files: Vec::new(),
            tmux_settle_ms: 500,
        }
    }
}

impl Config {
    /// Admin listen address without scheme, e.g. `localhost:2019`.
    pub fn caddy_admin_listen(&self) -> String {
        let raw = self.caddy_admin.trim();
        let raw = if raw.is_empty() { DEFAULT_CADDY_ADMIN } else { raw };
        raw.trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string()
    }

    pub fn caddy_admin_url(&self) -> String {
        let raw = self.caddy_admin.trim().trim_end_matches('/');
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return raw.to_string();
        }
        format!("http://{}", self.caddy_admin_listen())
    }
}

/// Top-level keys, used for `DEVX_<KEY>` overrides and `config get/set`.
pub fn config_keys() -> Vec<String> {
    match serde_yaml::to_value(Config::default()) {
        Ok(Value::Mapping(map)) => map
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn read_yaml_mapping(path: &Path) -> Result<Option<Mapping>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Some(Mapping::new()));
    }
    match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Mapping(map)) => Ok(Some(map)),
        Ok(Value::Null) => Ok(Some(Mapping::new())),
        Ok(_) => Err(DevxError::Config(format!(
            "{} must contain a YAML mapping",
            path.display()
        ))),
        Err(err) => Err(DevxError::Config(format!(
            "failed to parse {}: {err}",
            path.display()
        ))),
    }
}

/// Mappings merge key by key; anything else in `overlay` replaces `base`.
fn merge_yaml(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_yaml(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_override_value(key: &str, raw: &str) -> Value {
    let defaults = serde_yaml::to_value(Config::default()).unwrap_or(Value::Null);
    match defaults.get(key) {
        Some(Value::String(_)) => Value::String(raw.to_string()),
        Some(Value::Sequence(_)) => match serde_yaml::from_str::<Value>(raw) {
            Ok(Value::Sequence(items)) => Value::Sequence(items),
            _ => Value::Sequence(
                raw.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
        },
        _ => serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn apply_env_overrides<F>(map: &mut Mapping, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for key in config_keys() {
        let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
        if let Some(raw) = lookup(&var) {
            tracing::debug!(%var, "config override from environment");
            map.insert(Value::String(key.clone()), parse_override_value(&key, &raw));
        }
    }
}

pub fn config_from_mapping(map: Mapping) -> Result<Config> {
    let cfg: Config = serde_yaml::from_value(Value::Mapping(map))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
pub fn read_config_from_str(content: &str) -> Result<Config> {
    let map = match serde_yaml::from_str::<Value>(content)? {
        Value::Mapping(map) => map,
        Value::Null => Mapping::new(),
        _ => return Err(DevxError::Config("config must be a YAML mapping".to_string())),
    };
    config_from_mapping(map)
}

fn effective_mapping_with<F>(locator: &StorageLocator, lookup: F) -> Result<Mapping>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = Mapping::new();
    if let Some(global) = read_yaml_mapping(&locator.global(StateFile::Config))? {
        merge_yaml(&mut merged, global);
    }
    if let Some(project_dir) = locator.project_dir() {
        if let Some(project) = read_yaml_mapping(&project_dir.join(StateFile::Config.file_name()))? {
            merge_yaml(&mut merged, project);
        }
    }
    apply_env_overrides(&mut merged, lookup);
    Ok(merged)
}

/// Global config, overlaid by the project config, overlaid by `DEVX_*`.
pub fn load_config(locator: &StorageLocator) -> Result<Config> {
    let merged = effective_mapping_with(locator, |var| env::var(var).ok())?;
    config_from_mapping(merged)
}

pub fn validate_service_name(service: &str) -> Result<()> {
    if service.is_empty()
        || !service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DevxError::Validation(format!(
            "service name '{service}' must use only letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Services that share a hostname label or a `<SVC>_PORT` variable would
/// publish the same route id, so they are rejected together.
pub fn ensure_distinct_services<'a, I>(services: I) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut labels: BTreeMap<String, &str> = BTreeMap::new();
    let mut vars: BTreeMap<String, &str> = BTreeMap::new();
    for service in services {
        let by_label = labels.insert(normalize_dns(service), service);
        let by_var = vars.insert(port_env_var(service), service);
        if let Some(other) = by_label.or(by_var) {
            return Err(DevxError::Validation(format!(
                "services '{other}' and '{service}' map to the same hostname or {} variable",
                port_env_var(service)
            )));
        }
    }
    Ok(())
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.version != 1 {
        return Err(DevxError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    for service in &cfg.ports {
        validate_service_name(service).map_err(|err| DevxError::Config(format!("ports: {err}")))?;
        if normalize_dns(service).is_empty() {
            return Err(DevxError::Config(format!(
                "ports: service '{service}' has no DNS-safe characters"
            )));
        }
    }
    ensure_distinct_services(&cfg.ports)
        .map_err(|err| DevxError::Config(format!("ports: {err}")))?;
    if cfg.host_scheme != "http" && cfg.host_scheme != "https" {
        return Err(DevxError::Config(format!(
            "host_scheme must be 'http' or 'https', got '{}'",
            cfg.host_scheme
        )));
    }
    for entry in &cfg.bootstrap_files {
        normalize_relative_path(entry)
            .map_err(|reason| DevxError::Config(format!("bootstrap_files: {reason}")))?;
    }
    if cfg.tmux_settle_ms > 10_000 {
        return Err(DevxError::Config(
            "tmux_settle_ms must be at most 10000".to_string(),
        ));
    }
    Ok(())
}

pub fn get_key(cfg: &Config, key: &str) -> Result<Value> {
    let value = serde_yaml::to_value(cfg)?;
    value.get(key).cloned().ok_or_else(|| {
        DevxError::NotFound(format!(
            "unknown config key '{key}' (known keys: {})",
            config_keys().join(", ")
        ))
    })
}

/// Sets `key` in the config file at `path`. The file is validated on its
/// own before anything is written.
pub fn set_key(locator: &StorageLocator, path: &Path, key: &str, raw: &str) -> Result<Config> {
    if !config_keys().iter().any(|k| k == key) {
        return Err(DevxError::NotFound(format!(
            "unknown config key '{key}' (known keys: {})",
            config_keys().join(", ")
        )));
    }
    let mut file_map = read_yaml_mapping(path)?.unwrap_or_default();
    if !file_map.contains_key("version") {
        file_map.insert(
            Value::String("version".to_string()),
            Value::Number(serde_yaml::Number::from(1u64)),
        );
    }
    file_map.insert(Value::String(key.to_string()), parse_override_value(key, raw));
    config_from_mapping(file_map.clone())?;

    let rendered = serde_yaml::to_string(&Value::Mapping(file_map))?;
    write_atomic_text_file(path, &rendered, None)?;
    load_config(locator)
}

/// Creates `path` from the bundled default. Returns false when it already
/// exists (the file is left untouched).
pub fn init_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_atomic_text_file(path, DEFAULT_CONFIG_YAML, None)?;
    Ok(true)
}

pub fn project_config_path(root: &Path) -> PathBuf {
    root.join(crate::paths::PROJECT_DIR_NAME)
        .join(StateFile::Config.file_name())
}
