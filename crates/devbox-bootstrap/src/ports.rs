//! Server ports declared by an agent and the shell tests that tell, from
//! inside the machine, whether something listens on them.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("Port format is not supported {0}")]
pub struct UnsupportedPort(pub String);

/// One entry of [`devbox_events::ResolvedAgent::servers`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerPort {
    /// The key as the agent declared it.
    pub key: String,
    pub port: u16,
    pub transport: Transport,
}

impl FromStr for ServerPort {
    type Err = UnsupportedPort;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let unsupported = || UnsupportedPort(raw.to_string());
        let key = raw.trim();
        let (port, transport) = match key.split_once('/') {
            None => (key, Transport::Tcp),
            Some((port, "tcp")) => (port, Transport::Tcp),
            Some((port, "udp")) => (port, Transport::Udp),
            Some(_) => return Err(unsupported()),
        };
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(unsupported)?;
        Ok(Self {
            key: key.to_string(),
            port,
            transport,
        })
    }
}

impl fmt::Display for ServerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl ServerPort {
    /// Shell test that exits 0 when a socket in the machine is bound to the
    /// port: LISTEN (`0A`) for tcp, unconnected (`07`) for udp.
    ///
    /// Reads the kernel socket tables, so it only needs `grep` in the image.
    pub fn listening_check(&self) -> String {
        let (table, state) = match self.transport {
            Transport::Tcp => ("tcp", "0A"),
            Transport::Udp => ("udp", "07"),
        };
        format!(
            "grep -qiE ':{:04X} [0-9A-F]+:[0-9A-F]+ {state} ' /proc/net/{table} /proc/net/{table}6 2>/dev/null",
            self.port
        )
    }
}

/// Exits 0 only if every port passes [`ServerPort::listening_check`].
pub fn all_listening_check(ports: &[ServerPort]) -> String {
    ports
        .iter()
        .map(ServerPort::listening_check)
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Parses every declared key, failing on the first unsupported one.
pub fn parse_server_ports(keys: &[String]) -> Result<Vec<ServerPort>, UnsupportedPort> {
    keys.iter().map(|key| key.parse()).collect()
}
