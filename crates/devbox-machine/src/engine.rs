use std::collections::BTreeMap;

use async_trait::async_trait;
use devbox_events::LogStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Failure reported by a container-engine client.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("{context} failed (code {code:?}): {stderr}")]
    Command {
        context: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("decode {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected engine response: {0}")]
    Protocol(String),
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogMessage {
    pub stream: LogStream,
    pub content: String,
}

impl LogMessage {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecHandle {
    pub id: String,
    pub container_id: String,
    pub argv: Vec<String>,
}

/// Outcome of an exec whose output stream has closed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecExit {
    pub exit_code: Option<i64>,
}

impl ExecExit {
    pub fn code(exit_code: i64) -> Self {
        Self {
            exit_code: Some(exit_code),
        }
    }

    /// An unreported exit code counts as success.
    pub fn is_success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoveContainerOptions {
    pub remove_volumes: bool,
    pub force: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitRequest {
    pub container_id: String,
    pub repository: String,
    pub tag: String,
    pub comment: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushRequest {
    pub repository: String,
    pub registry: String,
    pub tag: String,
}

impl PushRequest {
    /// Repository name qualified with the registry host, as it must be tagged
    /// locally before a push.
    pub fn full_repository(&self) -> String {
        format!("{}/{}", self.registry.trim_end_matches('/'), self.repository)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushProgress {
    pub status: String,
}

/// Subset of `docker inspect` output the machine layer relies on.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

impl ContainerInfo {
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.config
            .labels
            .iter()
            .flatten()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    pub ip_address: String,
    /// Keyed by `<port>/<protocol>`; `None` for exposed but unpublished ports.
    #[serde(default)]
    pub ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

/// Container-engine primitives consumed by [`crate::ContainerMachine`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo, EngineError>;

    async fn create_exec(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> Result<ExecHandle, EngineError>;

    /// Runs the exec and feeds every output chunk to `sink` in the order the
    /// engine delivers it. Returns once the output stream closes.
    async fn start_exec(
        &self,
        exec: &ExecHandle,
        sink: &mut (dyn FnMut(LogMessage) + Send),
    ) -> Result<ExecExit, EngineError>;

    async fn put_resource(
        &self,
        container_id: &str,
        target_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), EngineError>;

    async fn remove_container(
        &self,
        container_id: &str,
        options: RemoveContainerOptions,
    ) -> Result<(), EngineError>;

    async fn remove_image(&self, image: &str, force: bool) -> Result<(), EngineError>;

    async fn commit(&self, request: &CommitRequest) -> Result<(), EngineError>;

    /// Pushes `request` and returns the digest reported by the registry.
    async fn push(
        &self,
        request: &PushRequest,
        progress: &mut (dyn FnMut(PushProgress) + Send),
    ) -> Result<String, EngineError>;
}
