use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use devbox_machine::{
    CommitRequest, ContainerConfig, ContainerEngine, ContainerInfo, EngineError, ExecExit,
    ExecHandle, LogMessage, PushProgress, PushRequest, RemoveContainerOptions,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FAKE_DIGEST: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Engine operations a fault can be injected into.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FaultPoint {
    Inspect,
    CreateExec,
    StartExec,
    PutResource,
    RemoveContainer,
    RemoveImage,
    Commit,
    Push,
}

/// Every call the fake received, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EngineCall {
    Inspect {
        container_id: String,
    },
    CreateExec {
        container_id: String,
        argv: Vec<String>,
    },
    StartExec {
        exec_id: String,
    },
    PutResource {
        container_id: String,
        path: String,
    },
    RemoveContainer {
        container_id: String,
        options: RemoveContainerOptions,
    },
    RemoveImage {
        image: String,
        force: bool,
    },
    Commit(CommitRequest),
    Push(PushRequest),
}

/// Canned behavior for an exec whose command line contains a given needle.
#[derive(Clone, Debug, Default)]
pub struct ScriptedExec {
    pub output: Vec<LogMessage>,
    pub exit_code: Option<i64>,
    pub delay: Option<Duration>,
    pub fail: Option<String>,
    /// How many more execs this script may answer; `None` is unlimited.
    pub uses: Option<usize>,
}

impl ScriptedExec {
    /// Exits 0 without output.
    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// The engine never reports an exit code.
    pub fn unreported() -> Self {
        Self::default()
    }

    /// Output is delivered, then the stream breaks with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn stdout(mut self, line: impl Into<String>) -> Self {
        self.output.push(LogMessage::stdout(line));
        self
    }

    pub fn stderr(mut self, line: impl Into<String>) -> Self {
        self.output.push(LogMessage::stderr(line));
        self
    }

    /// Answers only the next `n` matching execs, after which later scripts
    /// with the same needle take over.
    pub fn times(mut self, n: usize) -> Self {
        self.uses = Some(n);
        self
    }

    /// Waits `delay` before producing any output.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, ContainerInfo>,
    scripts: Vec<(String, ScriptedExec)>,
    pending: HashMap<String, ScriptedExec>,
    faults: HashSet<FaultPoint>,
    calls: Vec<EngineCall>,
    files: BTreeMap<(String, String), Vec<u8>>,
    push_digest: Option<String>,
    next_exec: u64,
}

/// In-memory [`ContainerEngine`].
///
/// Containers must be registered before they can be inspected or exec'd
/// into. Execs run the first script whose needle appears in the joined
/// command line and that has uses left, or exit 0 silently when none match.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, info: ContainerInfo) -> Self {
        self.add_container(info);
        self
    }

    pub fn add_container(&self, info: ContainerInfo) {
        self.state.lock().containers.insert(info.id.clone(), info);
    }

    pub fn script_exec(&self, needle: impl Into<String>, exec: ScriptedExec) {
        self.state.lock().scripts.push((needle.into(), exec));
    }

    pub fn fail(&self, point: FaultPoint) {
        self.state.lock().faults.insert(point);
    }

    pub fn heal(&self, point: FaultPoint) {
        self.state.lock().faults.remove(&point);
    }

    pub fn set_push_digest(&self, digest: impl Into<String>) {
        self.state.lock().push_digest = Some(digest.into());
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Command lines of every created exec, in order.
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::CreateExec { argv, .. } => Some(argv.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn file(&self, container_id: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(&(container_id.to_string(), path.to_string()))
            .cloned()
    }

    /// Records `call` and returns the injected fault for `point`, if any.
    fn enter(&self, point: FaultPoint, call: EngineCall) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.faults.contains(&point) {
            return Err(EngineError::Command {
                context: format!("fake {point:?}"),
                code: Some(1),
                stderr: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn require_container(&self, container_id: &str) -> Result<(), EngineError> {
        if self.state.lock().containers.contains_key(container_id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(container_id.to_string()))
        }
    }
}

/// Minimal inspect result for a container running `image`.
pub fn container_info(id: &str, image: &str) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: format!("/{id}"),
        image: image.to_string(),
        config: ContainerConfig {
            image: image.to_string(),
            labels: None,
        },
        ..ContainerInfo::default()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        self.enter(
            FaultPoint::Inspect,
            EngineCall::Inspect {
                container_id: container_id.to_string(),
            },
        )?;
        self.state
            .lock()
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
    }

    async fn create_exec(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> Result<ExecHandle, EngineError> {
        self.enter(
            FaultPoint::CreateExec,
            EngineCall::CreateExec {
                container_id: container_id.to_string(),
                argv: argv.to_vec(),
            },
        )?;
        self.require_container(container_id)?;

        let command = argv.join(" ");
        let mut state = self.state.lock();
        let script = match state
            .scripts
            .iter_mut()
            .find(|(needle, script)| script.uses != Some(0) && command.contains(needle.as_str()))
        {
            Some((_, script)) => {
                if let Some(uses) = script.uses.as_mut() {
                    *uses -= 1;
                }
                script.clone()
            }
            None => ScriptedExec::ok(),
        };
        state.next_exec += 1;
        let id = format!("exec-{}", state.next_exec);
        state.pending.insert(id.clone(), script);
        Ok(ExecHandle {
            id,
            container_id: container_id.to_string(),
            argv: argv.to_vec(),
        })
    }

    async fn start_exec(
        &self,
        exec: &ExecHandle,
        sink: &mut (dyn FnMut(LogMessage) + Send),
    ) -> Result<ExecExit, EngineError> {
        self.enter(
            FaultPoint::StartExec,
            EngineCall::StartExec {
                exec_id: exec.id.clone(),
            },
        )?;
        let script = self
            .state
            .lock()
            .pending
            .remove(&exec.id)
            .ok_or_else(|| EngineError::NotFound(exec.id.clone()))?;

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        for message in script.output {
            sink(message);
        }
        if let Some(message) = script.fail {
            return Err(EngineError::Interrupted(message));
        }
        Ok(ExecExit {
            exit_code: script.exit_code,
        })
    }

    async fn put_resource(
        &self,
        container_id: &str,
        target_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), EngineError> {
        self.enter(
            FaultPoint::PutResource,
            EngineCall::PutResource {
                container_id: container_id.to_string(),
                path: target_path.to_string(),
            },
        )?;
        self.require_container(container_id)?;

        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await?;
        self.state
            .lock()
            .files
            .insert((container_id.to_string(), target_path.to_string()), bytes);
        Ok(())
    }

    async fn remove_container(
        &self,
        container_id: &str,
        options: RemoveContainerOptions,
    ) -> Result<(), EngineError> {
        self.enter(
            FaultPoint::RemoveContainer,
            EngineCall::RemoveContainer {
                container_id: container_id.to_string(),
                options,
            },
        )?;
        self.state
            .lock()
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<(), EngineError> {
        self.enter(
            FaultPoint::RemoveImage,
            EngineCall::RemoveImage {
                image: image.to_string(),
                force,
            },
        )
    }

    async fn commit(&self, request: &CommitRequest) -> Result<(), EngineError> {
        self.enter(FaultPoint::Commit, EngineCall::Commit(request.clone()))?;
        self.require_container(&request.container_id)
    }

    async fn push(
        &self,
        request: &PushRequest,
        progress: &mut (dyn FnMut(PushProgress) + Send),
    ) -> Result<String, EngineError> {
        self.enter(FaultPoint::Push, EngineCall::Push(request.clone()))?;
        progress(PushProgress {
            status: format!("The push refers to repository [{}]", request.full_repository()),
        });
        let digest = self
            .state
            .lock()
            .push_digest
            .clone()
            .unwrap_or_else(|| FAKE_DIGEST.to_string());
        progress(PushProgress {
            status: format!("{}: digest: {digest} size: 1570", request.tag),
        });
        Ok(digest)
    }
}
