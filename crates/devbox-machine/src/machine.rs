use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::config::MachineConfig;
use crate::engine::{
    CommitRequest, ContainerEngine, ContainerInfo, ExecExit, LogMessage, PushProgress,
    PushRequest, RemoveContainerOptions,
};
use crate::error::{InfrastructureError, SnapshotError};
use crate::servers::{ServerEndpoint, ServerEvaluationStrategy};

pub const LATEST_TAG: &str = "latest";
pub const SNAPSHOT_PREFIX: &str = "machine_snapshot_";
const SNAPSHOT_SUFFIX_LEN: usize = 16;

/// Watches a container for unexpected stops. The machine only needs to turn
/// it off before removing the container.
pub trait StopDetector: Send + Sync {
    fn stop_detection(&self, container_id: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStopDetector;

impl StopDetector for NoopStopDetector {
    fn stop_detection(&self, _container_id: &str) {}
}

/// A committed, optionally pushed, image of a machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SnapshotResult {
    pub repository: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// One running container backing a workspace machine.
///
/// Construction inspects the container, so a `ContainerMachine` always refers
/// to a container that existed at creation time. Lifecycle-changing calls
/// (`destroy`, `save_to_snapshot`) must not race each other or `exec` on the
/// same machine.
pub struct ContainerMachine {
    container_id: String,
    image: String,
    info: ContainerInfo,
    config: MachineConfig,
    engine: Arc<dyn ContainerEngine>,
    strategy: Arc<dyn ServerEvaluationStrategy>,
    stop_detector: Arc<dyn StopDetector>,
}

impl ContainerMachine {
    pub async fn new(
        engine: Arc<dyn ContainerEngine>,
        container_id: impl Into<String>,
        image: impl Into<String>,
        config: MachineConfig,
    ) -> Result<Self, InfrastructureError> {
        let container_id = container_id.into();
        let info = engine
            .inspect_container(&container_id)
            .await
            .map_err(|err| {
                InfrastructureError::with_source(
                    format!("failed to inspect container {container_id}: {err}"),
                    err,
                )
            })?;
        debug!(container = %container_id, name = %info.name, "inspected container");

        Ok(Self {
            container_id,
            image: image.into(),
            info,
            strategy: config.server_strategy.build(),
            config,
            engine,
            stop_detector: Arc::new(NoopStopDetector),
        })
    }

    pub fn with_stop_detector(mut self, stop_detector: Arc<dyn StopDetector>) -> Self {
        self.stop_detector = stop_detector;
        self
    }

    pub fn with_server_strategy(mut self, strategy: Arc<dyn ServerEvaluationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn servers(&self) -> BTreeMap<String, ServerEndpoint> {
        self.strategy
            .servers(&self.info, &self.config.external_host)
    }

    /// Writes `source` to the absolute `target_path` inside the container.
    pub async fn put_resource<R>(
        &self,
        target_path: &str,
        mut source: R,
    ) -> Result<(), InfrastructureError>
    where
        R: AsyncRead + Send + Unpin,
    {
        if !target_path.starts_with('/') {
            return Err(InfrastructureError::new(format!(
                "target path must be absolute: {target_path}"
            )));
        }
        self.engine
            .put_resource(&self.container_id, target_path, &mut source)
            .await?;
        debug!(container = %self.container_id, path = target_path, "put resource");
        Ok(())
    }

    /// Runs `script` with `/bin/sh -c`, handing each output chunk to `on_log`
    /// on whatever thread the engine streams from.
    pub async fn exec<F>(&self, script: &str, mut on_log: F) -> Result<ExecExit, InfrastructureError>
    where
        F: FnMut(LogMessage) + Send,
    {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        let exec = self
            .engine
            .create_exec(&self.container_id, &argv)
            .await?;
        debug!(container = %self.container_id, exec = %exec.id, "starting exec");
        let exit = self.engine.start_exec(&exec, &mut on_log).await?;
        debug!(container = %self.container_id, exec = %exec.id, exit_code = ?exit.exit_code, "exec finished");
        Ok(exit)
    }

    /// Removes the container and its volumes, then tries to remove the
    /// backing image. Only the container removal can fail the call.
    pub async fn destroy(&self) -> Result<(), InfrastructureError> {
        self.stop_detector.stop_detection(&self.container_id);
        self.engine
            .remove_container(
                &self.container_id,
                RemoveContainerOptions {
                    remove_volumes: true,
                    force: true,
                },
            )
            .await?;
        info!(container = %self.container_id, "container removed");

        if let Err(err) = self.engine.remove_image(&self.image, false).await {
            warn!(
                container = %self.container_id,
                image = %self.image,
                "failed to remove machine image, ignoring: {err}"
            );
        }
        Ok(())
    }

    /// Commits the container under a fresh repository name and, when the
    /// registry is enabled, pushes it and drops the local copy.
    pub async fn save_to_snapshot(&self) -> Result<SnapshotResult, SnapshotError> {
        let repository = self.generate_repository();
        if !self.config.snapshot_use_registry {
            self.commit(&repository, LATEST_TAG).await?;
            info!(container = %self.container_id, %repository, "snapshot committed");
            return Ok(SnapshotResult {
                repository,
                tag: LATEST_TAG.to_string(),
                registry: None,
                digest: None,
            });
        }

        let registry = self
            .config
            .registry
            .clone()
            .ok_or_else(|| SnapshotError::new("snapshot registry is not configured"))?;
        let push = PushRequest {
            repository: repository.clone(),
            registry: registry.clone(),
            tag: LATEST_TAG.to_string(),
        };
        let full_repository = push.full_repository();
        self.commit(&full_repository, LATEST_TAG).await?;

        let container_id = self.container_id.clone();
        let digest = self
            .engine
            .push(&push, &mut |progress: PushProgress| {
                debug!(container = %container_id, "push: {}", progress.status);
            })
            .await?;
        info!(container = %self.container_id, repository = %full_repository, %digest, "snapshot pushed");

        let local = format!("{full_repository}:{LATEST_TAG}");
        if let Err(err) = self.engine.remove_image(&local, false).await {
            warn!(image = %local, "failed to remove pushed snapshot image, ignoring: {err}");
        }

        Ok(SnapshotResult {
            repository,
            tag: LATEST_TAG.to_string(),
            registry: Some(registry),
            digest: Some(digest),
        })
    }

    async fn commit(&self, repository: &str, tag: &str) -> Result<(), SnapshotError> {
        let comment = format!(
            "Suspended at {}",
            Utc::now().format("%a %b %d %H:%M:%S %Z %Y")
        );
        self.engine
            .commit(&CommitRequest {
                container_id: self.container_id.clone(),
                repository: repository.to_string(),
                tag: tag.to_string(),
                comment,
            })
            .await?;
        Ok(())
    }

    fn generate_repository(&self) -> String {
        let name = format!("{SNAPSHOT_PREFIX}{}", random_suffix());
        match &self.config.registry_namespace {
            Some(namespace) => format!("{namespace}/{name}"),
            None => name,
        }
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SNAPSHOT_SUFFIX_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}

impl fmt::Debug for ContainerMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerMachine")
            .field("container_id", &self.container_id)
            .field("image", &self.image)
            .field("config", &self.config)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
