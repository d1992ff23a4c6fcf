//! Container-backed workspace machines: exec, file upload, server discovery,
//! teardown and snapshotting on top of a pluggable [`ContainerEngine`].

pub mod config;
pub mod docker_cli;
pub mod engine;
pub mod error;
pub mod machine;
pub mod servers;

pub use config::{ConfigError, MachineConfig};
pub use docker_cli::DockerCli;
pub use engine::{
    CommitRequest, ContainerConfig, ContainerEngine, ContainerInfo, EngineError, ExecExit,
    ExecHandle, LogMessage, NetworkSettings, PortBinding, PushProgress, PushRequest,
    RemoveContainerOptions,
};
pub use error::{InfrastructureError, SnapshotError};
pub use machine::{
    ContainerMachine, LATEST_TAG, NoopStopDetector, SNAPSHOT_PREFIX, SnapshotResult, StopDetector,
};
pub use servers::{
    ContainerAddressStrategy, PublishedPortsStrategy, SERVER_LABEL_PREFIX, ServerEndpoint,
    ServerEvaluationStrategy, ServerStrategyKind,
};
