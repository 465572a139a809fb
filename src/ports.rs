use crate::error::{DevxError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{Ipv4Addr, TcpListener};

pub const MIN_PORT: u16 = 1024;
pub const ATTEMPTS_PER_SERVICE: usize = 20;

/// Source of currently-free local TCP ports.
pub trait PortProbe {
    fn free_port(&self) -> io::Result<u16>;
}

/// Binds `127.0.0.1:0`, reads the assigned port and releases it again. No
/// reservation is held afterwards.
pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn free_port(&self) -> io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }
}

/// Allocates one distinct port per service, skipping anything in `taken`.
pub fn allocate_ports(
    probe: &dyn PortProbe,
    services: &[String],
    taken: &BTreeSet<u16>,
) -> Result<BTreeMap<String, u16>> {
    let mut allocated: BTreeMap<String, u16> = BTreeMap::new();
    for service in services {
        if allocated.contains_key(service) {
            continue;
        }
        let mut assigned = None;
        for _ in 0..ATTEMPTS_PER_SERVICE {
            let port = probe.free_port().map_err(|err| {
                DevxError::PortExhaustion(format!(
                    "failed to obtain a free port for '{service}': {err}"
                ))
            })?;
            if port < MIN_PORT || taken.contains(&port) || allocated.values().any(|p| *p == port)
            {
                continue;
            }
            assigned = Some(port);
            break;
        }
        let port = assigned.ok_or_else(|| {
            DevxError::PortExhaustion(format!(
                "no free port for '{service}' after {ATTEMPTS_PER_SERVICE} attempts"
            ))
        })?;
        tracing::debug!(service = %service, port, "allocated port");
        allocated.insert(service.clone(), port);
    }
    Ok(allocated)
}

pub fn validate_port(service: &str, port: u32) -> Result<u16> {
    if port < u32::from(MIN_PORT) || port > u32::from(u16::MAX) {
        return Err(DevxError::Validation(format!(
            "port {port} for '{service}' must be between {MIN_PORT} and {}",
            u16::MAX
        )));
    }
    Ok(port as u16)
}

/// Validates user-specified ports: each in range, no value used twice.
pub fn validate_port_overrides(overrides: &BTreeMap<String, u32>) -> Result<BTreeMap<String, u16>> {
    let mut seen: BTreeMap<u16, &str> = BTreeMap::new();
    let mut out = BTreeMap::new();
    for (service, port) in overrides {
        let port = validate_port(service, *port)?;
        if let Some(other) = seen.insert(port, service) {
            return Err(DevxError::Validation(format!(
                "port {port} requested for both '{other}' and '{service}'"
            )));
        }
        out.insert(service.clone(), port);
    }
    Ok(out)
}

/// Parses a `service=port` override as given on the command line.
pub fn parse_port_assignment(raw: &str) -> Result<(String, u32)> {
    let (service, port) = raw.split_once('=').ok_or_else(|| {
        DevxError::Validation(format!("expected <service>=<port>, got '{raw}'"))
    })?;
    let service = service.trim();
    if service.is_empty() {
        return Err(DevxError::Validation(format!(
            "missing service name in '{raw}'"
        )));
    }
    let port = port.trim().parse::<u32>().map_err(|_| {
        DevxError::Validation(format!("port in '{raw}' is not a number"))
    })?;
    Ok((service.to_string(), port))
}
