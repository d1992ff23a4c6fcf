use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::engine::ContainerInfo;

pub const SERVER_LABEL_PREFIX: &str = "devbox.server.";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerEndpoint {
    pub url: String,
    /// Container-side port key, e.g. `8080/tcp`.
    pub port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Turns container metadata into externally reachable server endpoints.
pub trait ServerEvaluationStrategy: Send + Sync + fmt::Debug {
    fn servers(&self, info: &ContainerInfo, host: &str) -> BTreeMap<String, ServerEndpoint>;
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerStrategyKind {
    /// `<external host>:<published host port>`
    #[default]
    Published,
    /// `<container ip>:<container port>`
    ContainerAddress,
}

impl ServerStrategyKind {
    pub fn build(self) -> Arc<dyn ServerEvaluationStrategy> {
        match self {
            Self::Published => Arc::new(PublishedPortsStrategy),
            Self::ContainerAddress => Arc::new(ContainerAddressStrategy),
        }
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("unknown server strategy: {0} (expected: published, container-address)")]
pub struct ParseStrategyError(pub String);

impl FromStr for ServerStrategyKind {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "published" => Ok(Self::Published),
            "container-address" => Ok(Self::ContainerAddress),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

impl fmt::Display for ServerStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Published => write!(f, "published"),
            Self::ContainerAddress => write!(f, "container-address"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PublishedPortsStrategy;

impl ServerEvaluationStrategy for PublishedPortsStrategy {
    fn servers(&self, info: &ContainerInfo, host: &str) -> BTreeMap<String, ServerEndpoint> {
        let mut servers = BTreeMap::new();
        for (port_key, bindings) in exposed_ports(info) {
            let Some(host_port) = bindings
                .iter()
                .map(|binding| binding.host_port.trim())
                .find(|port| !port.is_empty())
            else {
                continue;
            };
            let (name, endpoint) = endpoint(info, port_key, &format!("{host}:{host_port}"));
            insert_first(&mut servers, name, endpoint);
        }
        servers
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ContainerAddressStrategy;

impl ServerEvaluationStrategy for ContainerAddressStrategy {
    fn servers(&self, info: &ContainerInfo, _host: &str) -> BTreeMap<String, ServerEndpoint> {
        let ip = info.network_settings.ip_address.trim();
        if ip.is_empty() {
            return BTreeMap::new();
        }
        let mut servers = BTreeMap::new();
        for (port_key, _) in exposed_ports(info) {
            let port = port_key.split('/').next().unwrap_or(port_key);
            let (name, endpoint) = endpoint(info, port_key, &format!("{ip}:{port}"));
            insert_first(&mut servers, name, endpoint);
        }
        servers
    }
}

/// Two ports labelled with the same ref resolve to whichever port key sorts
/// first.
fn insert_first(
    servers: &mut BTreeMap<String, ServerEndpoint>,
    name: String,
    endpoint: ServerEndpoint,
) {
    match servers.entry(name) {
        Entry::Vacant(slot) => {
            slot.insert(endpoint);
        }
        Entry::Occupied(kept) => warn!(
            server = %kept.key(),
            kept = %kept.get().port,
            ignored = %endpoint.port,
            "duplicate server ref"
        ),
    }
}

fn exposed_ports(
    info: &ContainerInfo,
) -> impl Iterator<Item = (&str, &[crate::engine::PortBinding])> {
    info.network_settings
        .ports
        .iter()
        .flatten()
        .map(|(key, bindings)| (key.as_str(), bindings.as_deref().unwrap_or_default()))
}

fn endpoint(info: &ContainerInfo, port_key: &str, address: &str) -> (String, ServerEndpoint) {
    let label = |attr: &str| {
        info.label(&format!("{SERVER_LABEL_PREFIX}{port_key}.{attr}"))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let name = label("ref").unwrap_or(port_key).to_string();
    let protocol = label("protocol").map(str::to_string);
    let path = label("path").map(|path| {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    });
    let url = match &protocol {
        Some(protocol) => format!(
            "{protocol}://{address}{}",
            path.as_deref().unwrap_or_default()
        ),
        None => address.to_string(),
    };
    (
        name,
        ServerEndpoint {
            url,
            port: port_key.to_string(),
            protocol,
            path,
        },
    )
}
