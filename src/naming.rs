//! DNS label, route identifier and environment variable derivation.
//!
//! Session names double as git branch names, tmux targets and path
//! components, so the validator accepts only the intersection of those
//! grammars. Hostname labels are capped at 63 bytes; labels that would exceed
//! the cap are shortened with a short CRC suffix so distinct inputs stay
//! distinct.

use crate::error::{DevxError, Result};

pub const MAX_SESSION_NAME_LEN: usize = 100;
pub const MAX_LABEL_LEN: usize = 63;
pub const HOSTNAME_SUFFIX: &str = ".localhost";
pub const ROUTE_ID_PREFIX: &str = "sess-";

const HASH_HEX_LEN: usize = 4;
const MIN_PREFIX_LEN: usize = 6;
const DEGRADED_PREFIX_LEN: usize = MAX_LABEL_LEN - HASH_HEX_LEN - 1;

fn collapse_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.to_lowercase().chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}

/// Lowercases and maps everything outside `[a-z0-9-]` to `-`, collapsing
/// runs and trimming the ends. May return an empty string.
pub fn normalize_dns(input: &str) -> String {
    collapse_label(input)
}

/// Same as [`normalize_dns`], with `/` explicitly treated as a separator so
/// branch-style names such as `feature/x` become `feature-x`.
pub fn sanitize_hostname(input: &str) -> String {
    collapse_label(&input.replace('/', "-"))
}

pub fn validate_session_name(name: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(DevxError::Validation(format!(
            "invalid session name '{name}': {reason}"
        )))
    };

    if name.is_empty() {
        return reject("name must not be empty");
    }
    if name.len() > MAX_SESSION_NAME_LEN {
        return reject(&format!(
            "name must be at most {MAX_SESSION_NAME_LEN} characters"
        ));
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return reject("name must start with a letter or digit");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
    {
        return reject(&format!(
            "character '{bad}' is not allowed (use letters, digits, '.', '_', '/', '-')"
        ));
    }
    if name.ends_with('/') {
        return reject("name must not end with '/'");
    }
    if name.contains("//") {
        return reject("name must not contain consecutive '/'");
    }
    for segment in name.split('/') {
        if segment == "." || segment == ".." {
            return reject("path segments '.' and '..' are not allowed");
        }
        if segment.ends_with(".lock") {
            return reject("path segments must not end with '.lock'");
        }
        if segment.ends_with('.') {
            return reject("path segments must not end with '.'");
        }
        if segment.contains("..") {
            return reject("path segments must not contain '..'");
        }
    }
    Ok(())
}

fn label_hash(label: &str) -> String {
    let crc = crc32fast::hash(label.as_bytes());
    format!("{:0width$x}", crc & 0xffff, width = HASH_HEX_LEN)
}

fn truncate_label(label: &str, dns_service: &str) -> String {
    if label.len() <= MAX_LABEL_LEN {
        return label.to_string();
    }
    let hash = label_hash(label);
    let suffix = format!("-{hash}-{dns_service}");
    let room = MAX_LABEL_LEN.saturating_sub(suffix.len());
    if room < MIN_PREFIX_LEN {
        let prefix = label[..DEGRADED_PREFIX_LEN].trim_end_matches('-');
        return format!("{prefix}-{hash}");
    }
    let prefix = label[..room].trim_end_matches('-');
    format!("{prefix}{suffix}")
}

fn join_label(session: &str, dns_service: &str, project_alias: Option<&str>) -> String {
    let sanitized_session = sanitize_hostname(session);
    let alias = project_alias.map(normalize_dns).unwrap_or_default();
    if alias.is_empty() {
        format!("{sanitized_session}-{dns_service}")
    } else {
        format!("{alias}-{sanitized_session}-{dns_service}")
    }
}

/// Hostname for `service` in `session`, e.g. `travally-feat-x-ui.localhost`.
/// Returns an empty string when the service name has no DNS-safe characters;
/// callers skip the route in that case.
pub fn build_hostname(session: &str, service: &str, project_alias: Option<&str>) -> String {
    let dns_service = normalize_dns(service);
    if dns_service.is_empty() {
        return String::new();
    }
    let label = join_label(session, &dns_service, project_alias);
    format!("{}{HOSTNAME_SUFFIX}", truncate_label(&label, &dns_service))
}

/// Proxy route identifier. Never truncated.
pub fn build_route_id(session: &str, service: &str, project_alias: Option<&str>) -> String {
    let dns_service = normalize_dns(service);
    if dns_service.is_empty() {
        return String::new();
    }
    format!(
        "{ROUTE_ID_PREFIX}{}",
        join_label(session, &dns_service, project_alias)
    )
}

fn env_stem(service: &str) -> String {
    service.to_uppercase().replace('-', "_")
}

pub fn port_env_var(service: &str) -> String {
    format!("{}_PORT", env_stem(service))
}

pub fn host_env_var(service: &str) -> String {
    format!("{}_HOST", env_stem(service))
}

pub fn host_url(scheme: &str, hostname: &str) -> String {
    format!("{scheme}://{hostname}")
}

/// tmux rewrites `.` and `:` in session names; every tmux target goes
/// through this mapping.
pub fn tmux_session_name(name: &str) -> String {
    name.replace(['.', ':'], "_")
}
