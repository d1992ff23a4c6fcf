pub mod bus;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bus::{Delivery, EventBus, Subscriber, Subscription, SubscriptionId};

/// Identifies one running workspace instance.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct RuntimeIdentity {
    pub workspace_id: String,
    pub environment_name: String,
    pub owner: String,
}

impl RuntimeIdentity {
    pub fn new(
        workspace_id: impl Into<String>,
        environment_name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            environment_name: environment_name.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.workspace_id, self.environment_name, self.owner
        )
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("expected runtime id in format 'workspace:environment:owner', got '{0}'")]
pub struct ParseRuntimeIdError(pub String);

impl FromStr for RuntimeIdentity {
    type Err = ParseRuntimeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        match parts.as_slice() {
            [workspace, environment, owner]
                if !workspace.is_empty() && !environment.is_empty() && !owner.is_empty() =>
            {
                Ok(Self::new(*workspace, *environment, *owner))
            }
            _ => Err(ParseRuntimeIdError(s.to_string())),
        }
    }
}

/// Correlation key for every event that belongs to one machine's bootstrap.
///
/// Two refs are the same machine only when the machine name and all three
/// runtime identity fields are equal.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct MachineRef {
    pub machine_name: String,
    pub runtime: RuntimeIdentity,
}

impl MachineRef {
    pub fn new(machine_name: impl Into<String>, runtime: RuntimeIdentity) -> Self {
        Self {
            machine_name: machine_name.into(),
            runtime,
        }
    }
}

impl fmt::Display for MachineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.machine_name, self.runtime)
    }
}

/// An agent ready to run: the install script is already fully resolved.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResolvedAgent {
    pub id: String,
    pub script: String,
    /// Ports the script leaves a server listening on, as `4411/tcp`,
    /// `4411/udp` or a bare `4411`. When present the agent counts as
    /// installed once all of them accept connections, not when the script
    /// exits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
}

impl ResolvedAgent {
    pub fn new(id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: script.into(),
            servers: Vec::new(),
        }
    }

    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapStatus {
    Available,
    Done,
    Failed,
}

impl BootstrapStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallerStatus {
    Starting,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "STDOUT"),
            Self::Stderr => write!(f, "STDERR"),
        }
    }
}

/// Whole-bootstrap lifecycle. `Done` and `Failed` are terminal and published
/// exactly once per bootstrap.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BootstrapEvent {
    pub machine: MachineRef,
    pub status: BootstrapStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BootstrapEvent {
    pub fn available(machine: MachineRef) -> Self {
        Self::new(machine, BootstrapStatus::Available, None)
    }

    pub fn done(machine: MachineRef) -> Self {
        Self::new(machine, BootstrapStatus::Done, None)
    }

    pub fn failed(machine: MachineRef, error: impl Into<String>) -> Self {
        Self::new(machine, BootstrapStatus::Failed, Some(error.into()))
    }

    fn new(machine: MachineRef, status: BootstrapStatus, error: Option<String>) -> Self {
        Self {
            machine,
            status,
            timestamp: Utc::now(),
            error,
        }
    }
}

/// Per-agent progress. Published outward only.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstallerEvent {
    pub machine: MachineRef,
    pub installer_id: String,
    pub status: InstallerStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallerEvent {
    pub fn starting(machine: MachineRef, installer_id: impl Into<String>) -> Self {
        Self::new(machine, installer_id, InstallerStatus::Starting, None)
    }

    pub fn running(machine: MachineRef, installer_id: impl Into<String>) -> Self {
        Self::new(machine, installer_id, InstallerStatus::Running, None)
    }

    pub fn failed(
        machine: MachineRef,
        installer_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(
            machine,
            installer_id,
            InstallerStatus::Failed,
            Some(error.into()),
        )
    }

    fn new(
        machine: MachineRef,
        installer_id: impl Into<String>,
        status: InstallerStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            machine,
            installer_id: installer_id.into(),
            status,
            timestamp: Utc::now(),
            error,
        }
    }
}

/// One chunk of installer output, forwarded as it arrives.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstallerLogEvent {
    pub machine: MachineRef,
    pub installer_id: String,
    pub stream: LogStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl InstallerLogEvent {
    pub fn new(
        machine: MachineRef,
        installer_id: impl Into<String>,
        stream: LogStream,
        text: impl Into<String>,
    ) -> Self {
        Self {
            machine,
            installer_id: installer_id.into(),
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}
