//! Network topology lookups through `ip -j`.

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::command::{checked_stdout, CommandRunner};

#[derive(Debug, Deserialize)]
struct Route {
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Interface {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: Option<String>,
    local: Option<String>,
}

/// Extracts the gateway of the first default route from `ip -j route show default`.
pub fn parse_default_gateway(json: &str) -> Result<String> {
    let routes: Vec<Route> = serde_json::from_str(json).context("Parsing ip route output")?;
    match routes.into_iter().next().and_then(|route| route.gateway) {
        Some(gateway) => Ok(gateway),
        None => bail!("No default gateway found"),
    }
}

/// Extracts the first IPv4 address from `ip -j addr show <interface>`.
pub fn parse_interface_ipv4(json: &str, interface: &str) -> Result<Ipv4Addr> {
    let interfaces: Vec<Interface> =
        serde_json::from_str(json).context("Parsing ip addr output")?;
    let local = interfaces
        .iter()
        .flat_map(|iface| &iface.addr_info)
        .filter(|addr| addr.family.as_deref() == Some("inet"))
        .find_map(|addr| addr.local.as_deref());
    match local {
        Some(local) => local
            .parse()
            .with_context(|| format!("Invalid IPv4 address {local:?} on {interface}")),
        None => bail!("No IPv4 address found for interface {interface}"),
    }
}

/// Looks up the default IPv4 gateway.
pub async fn default_gateway(runner: &impl CommandRunner) -> Result<String> {
    let args = ["-j", "route", "show", "default"].map(String::from);
    let json = checked_stdout(runner, "ip", &args)
        .await
        .context("Failed to get default route")?;
    parse_default_gateway(&json)
}

/// Looks up the IPv4 address bound to `interface`.
pub async fn interface_ipv4(runner: &impl CommandRunner, interface: &str) -> Result<Ipv4Addr> {
    let args = ["-j", "addr", "show", interface].map(String::from);
    let json = checked_stdout(runner, "ip", &args)
        .await
        .context("Failed to get interface info")?;
    parse_interface_ipv4(&json, interface)
}
