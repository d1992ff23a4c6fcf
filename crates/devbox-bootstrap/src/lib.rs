//! Installs agents into a freshly started machine and reports the outcome as
//! events.
//!
//! [`Bootstrapper::bootstrap`] publishes everything on an [`EventBus`] and
//! waits on that same bus for the terminal [`BootstrapEvent`] of the machine
//! it was asked about, so any other component watching the bus sees exactly
//! the sequence the caller's result is derived from.

pub mod config;
pub mod ports;

use std::sync::Arc;
use std::time::Duration;

use devbox_events::{
    BootstrapEvent, BootstrapStatus, Delivery, EventBus, InstallerEvent, InstallerLogEvent,
    MachineRef, ResolvedAgent, Subscriber,
};
use devbox_machine::{ContainerMachine, InfrastructureError, LogMessage};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use config::{BootstrapConfig, DEFAULT_BOOTSTRAP_TIMEOUT, MIN_BOOTSTRAP_TIMEOUT_SECS};

use crate::ports::{ServerPort, UnsupportedPort, all_listening_check, parse_server_ports};

pub const TIMEOUT_MESSAGE: &str = "Timeout reached";
pub const INTERRUPTED_MESSAGE: &str = "Bootstrapping interrupted";

pub struct Bootstrapper {
    machine: Arc<ContainerMachine>,
    bus: EventBus,
    config: BootstrapConfig,
}

impl Bootstrapper {
    pub fn new(machine: Arc<ContainerMachine>, bus: EventBus) -> Self {
        Self {
            machine,
            bus,
            config: BootstrapConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BootstrapConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Installs `agents` one after another and waits for the outcome.
    ///
    /// Returns once the terminal event for `machine_ref` is published: `Ok`
    /// on DONE, the carried error on FAILED. If nothing terminal arrives
    /// within the configured ceiling the call fails with "Timeout reached";
    /// if the bus drops the waiter first it fails with "Bootstrapping
    /// interrupted". In both cases the installation keeps running in the
    /// background and its late terminal event no longer affects this call.
    pub async fn bootstrap(
        &self,
        machine_ref: MachineRef,
        agents: Vec<ResolvedAgent>,
    ) -> Result<(), InfrastructureError> {
        self.bootstrap_until(machine_ref, agents, std::future::pending())
            .await
    }

    /// [`bootstrap`](Self::bootstrap) that also stops waiting with
    /// "Bootstrapping interrupted" once `interrupt` completes. Only this
    /// call's waiter leaves the bus.
    pub async fn bootstrap_until(
        &self,
        machine_ref: MachineRef,
        agents: Vec<ResolvedAgent>,
        interrupt: impl Future<Output = ()>,
    ) -> Result<(), InfrastructureError> {
        let (tx, rx) = oneshot::channel();
        let _waiter = self
            .bus
            .subscribe::<BootstrapEvent, _>(TerminalEventWaiter::new(machine_ref.clone(), tx));

        info!(machine = %machine_ref, agents = agents.len(), "bootstrapping machine");
        let run = InstallRun {
            machine: self.machine.clone(),
            bus: self.bus.clone(),
            machine_ref: machine_ref.clone(),
            agents,
            installer_timeout: self.config.installer_timeout,
            server_time_limit: self
                .config
                .installer_timeout
                .unwrap_or(self.config.timeout),
            server_check_period: self.config.server_check_period,
            manifest_path: self.config.manifest_path.clone(),
        };
        tokio::spawn(run.execute());

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.timeout, rx) => outcome,
            () = interrupt => {
                warn!(machine = %machine_ref, "bootstrap wait interrupted by caller");
                return Err(InfrastructureError::new(INTERRUPTED_MESSAGE));
            }
        };
        match outcome {
            Ok(Ok(event)) if event.status == BootstrapStatus::Done => Ok(()),
            Ok(Ok(event)) => Err(InfrastructureError::new(
                event
                    .error
                    .unwrap_or_else(|| "Bootstrapping failed".to_string()),
            )),
            Ok(Err(_)) => {
                warn!(machine = %machine_ref, "bootstrap wait interrupted");
                Err(InfrastructureError::new(INTERRUPTED_MESSAGE))
            }
            Err(_) => {
                warn!(machine = %machine_ref, timeout = ?self.config.timeout, "bootstrap timed out");
                Err(InfrastructureError::new(TIMEOUT_MESSAGE))
            }
        }
    }
}

/// Hands the first terminal event for one machine to a waiting caller, then
/// asks the bus to drop it.
struct TerminalEventWaiter {
    machine: MachineRef,
    tx: Mutex<Option<oneshot::Sender<BootstrapEvent>>>,
}

impl TerminalEventWaiter {
    fn new(machine: MachineRef, tx: oneshot::Sender<BootstrapEvent>) -> Self {
        Self {
            machine,
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl Subscriber<BootstrapEvent> for TerminalEventWaiter {
    fn on_event(&self, event: &BootstrapEvent) -> Delivery {
        if !event.status.is_terminal() || event.machine != self.machine {
            return Delivery::Keep;
        }
        if let Some(tx) = self.tx.lock().take() {
            // The caller may already have given up.
            let _ = tx.send(event.clone());
        }
        Delivery::Unsubscribe
    }
}

#[derive(Debug, Error)]
enum InstallFailure {
    #[error("Exit code for installer '{installer}' installation is '{code}' while should be 0")]
    ExitCode { installer: String, code: i64 },
    #[error("Timeout reached before installation of '{installer}' completed")]
    Timeout { installer: String },
    #[error("Timeout reached before installation of '{installer}' finished")]
    ServerTimeout { installer: String },
    #[error("Installation of {installer} was interrupted")]
    ServerExited { installer: String },
    #[error("server address 'localhost:{port}' already in use")]
    PortInUse { port: String },
    #[error(transparent)]
    Port(#[from] UnsupportedPort),
    #[error("failed to encode installer manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Machine(#[from] InfrastructureError),
}

/// Background half of a bootstrap. Owns everything it touches so the caller
/// can stop waiting without affecting it.
struct InstallRun {
    machine: Arc<ContainerMachine>,
    bus: EventBus,
    machine_ref: MachineRef,
    agents: Vec<ResolvedAgent>,
    installer_timeout: Option<Duration>,
    server_time_limit: Duration,
    server_check_period: Duration,
    manifest_path: Option<String>,
}

impl InstallRun {
    async fn execute(self) {
        self.bus
            .publish(BootstrapEvent::available(self.machine_ref.clone()));

        match self.install_all().await {
            Ok(()) => {
                info!(machine = %self.machine_ref, "bootstrap done");
                self.bus.publish(BootstrapEvent::done(self.machine_ref.clone()));
            }
            Err(err) => {
                error!(machine = %self.machine_ref, "bootstrap failed: {err}");
                self.bus.publish(BootstrapEvent::failed(
                    self.machine_ref.clone(),
                    err.to_string(),
                ));
            }
        }
    }

    async fn install_all(&self) -> Result<(), InstallFailure> {
        if let Some(path) = &self.manifest_path {
            let manifest = serde_json::to_vec_pretty(&self.agents)?;
            self.machine.put_resource(path, manifest.as_slice()).await?;
            debug!(machine = %self.machine_ref, path = %path, "installer manifest written");
        }
        for agent in &self.agents {
            self.launch(agent).await?;
        }
        Ok(())
    }

    async fn launch(&self, agent: &ResolvedAgent) -> Result<(), InstallFailure> {
        self.bus
            .publish(InstallerEvent::starting(self.machine_ref.clone(), &agent.id));
        info!(machine = %self.machine_ref, installer = %agent.id, "installing agent");
        self.bus
            .publish(InstallerEvent::running(self.machine_ref.clone(), &agent.id));

        let result = self.run_script(agent).await;
        if let Err(err) = &result {
            warn!(machine = %self.machine_ref, installer = %agent.id, "agent failed: {err}");
            self.bus.publish(InstallerEvent::failed(
                self.machine_ref.clone(),
                &agent.id,
                err.to_string(),
            ));
        }
        result
    }

    async fn run_script(&self, agent: &ResolvedAgent) -> Result<(), InstallFailure> {
        let ports = parse_server_ports(&agent.servers)?;
        if ports.is_empty() {
            self.run_to_exit(agent).await
        } else {
            self.run_server(agent, &ports).await
        }
    }

    fn log_forwarder(&self, agent: &ResolvedAgent) -> impl FnMut(LogMessage) + Send + 'static {
        let bus = self.bus.clone();
        let machine_ref = self.machine_ref.clone();
        let installer = agent.id.clone();
        move |message: LogMessage| {
            bus.publish(InstallerLogEvent::new(
                machine_ref.clone(),
                installer.clone(),
                message.stream,
                message.content,
            ));
        }
    }

    async fn run_to_exit(&self, agent: &ResolvedAgent) -> Result<(), InstallFailure> {
        let exec = self.machine.exec(&agent.script, self.log_forwarder(agent));
        let exit = match self.installer_timeout {
            Some(limit) => tokio::time::timeout(limit, exec).await.map_err(|_| {
                InstallFailure::Timeout {
                    installer: agent.id.clone(),
                }
            })??,
            None => exec.await?,
        };

        if exit.is_success() {
            return Ok(());
        }
        Err(InstallFailure::ExitCode {
            installer: agent.id.clone(),
            code: exit.exit_code.unwrap_or_default(),
        })
    }

    /// Runs a script that starts servers and succeeds once every port in
    /// `ports` is listening. The script is not waited for after that.
    async fn run_server(
        &self,
        agent: &ResolvedAgent,
        ports: &[ServerPort],
    ) -> Result<(), InstallFailure> {
        for port in ports {
            if self.check_passes(&port.listening_check()).await? {
                return Err(InstallFailure::PortInUse {
                    port: port.key.clone(),
                });
            }
        }

        let check = all_listening_check(ports);
        let script = self.machine.exec(&agent.script, self.log_forwarder(agent));
        tokio::pin!(script);
        let deadline = tokio::time::sleep(self.server_time_limit);
        tokio::pin!(deadline);
        let mut ticks = tokio::time::interval_at(
            Instant::now() + self.server_check_period,
            self.server_check_period,
        );
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                exit = &mut script => {
                    let exit = exit?;
                    if self.check_passes(&check).await? {
                        break;
                    }
                    debug!(
                        machine = %self.machine_ref,
                        installer = %agent.id,
                        exit_code = ?exit.exit_code,
                        "server script exited before its ports were listening"
                    );
                    return Err(InstallFailure::ServerExited {
                        installer: agent.id.clone(),
                    });
                }
                _ = ticks.tick() => {
                    if self.check_passes(&check).await? {
                        break;
                    }
                }
                () = &mut deadline => {
                    return Err(InstallFailure::ServerTimeout {
                        installer: agent.id.clone(),
                    });
                }
            }
        }
        info!(machine = %self.machine_ref, installer = %agent.id, servers = ?agent.servers, "servers listening");
        Ok(())
    }

    async fn check_passes(&self, check: &str) -> Result<bool, InstallFailure> {
        let exit = self.machine.exec(check, |_| {}).await?;
        // Only an explicit zero counts here.
        Ok(exit.exit_code == Some(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_events::{InstallerStatus, LogStream, RuntimeIdentity};
    use devbox_machine::MachineConfig;
    use devbox_test_utils::{
        EngineCall, EventRecorder, FakeEngine, FaultPoint, RecordedEvent, ScriptedExec,
        container_info,
    };

    const CONTAINER: &str = "c0ffee";

    fn dev_machine() -> MachineRef {
        MachineRef::new("dev", RuntimeIdentity::new("ws-1", "default", "alice"))
    }

    fn agents(ids: &[&str]) -> Vec<ResolvedAgent> {
        ids.iter()
            .map(|id| ResolvedAgent::new(*id, format!("install-{id}.sh")))
            .collect()
    }

    fn fake_engine() -> Arc<FakeEngine> {
        Arc::new(FakeEngine::new().with_container(container_info(CONTAINER, "devbox/base")))
    }

    async fn bootstrapper(engine: &Arc<FakeEngine>, bus: &EventBus) -> Bootstrapper {
        let machine = ContainerMachine::new(
            engine.clone(),
            CONTAINER,
            "devbox/base",
            MachineConfig::default(),
        )
        .await
        .expect("machine");
        Bootstrapper::new(Arc::new(machine), bus.clone())
    }

    fn with_timeout(timeout: Duration) -> BootstrapConfig {
        BootstrapConfig {
            timeout,
            ..BootstrapConfig::default()
        }
    }

    #[tokio::test]
    async fn installs_agents_in_order_and_reports_done() {
        let engine = fake_engine();
        engine.script_exec(
            "install-git.sh",
            ScriptedExec::ok().stdout("git installed"),
        );
        engine.script_exec(
            "install-node.sh",
            ScriptedExec::ok().stderr("npm warn").stdout("node installed"),
        );
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git", "node"]))
            .await
            .expect("bootstrap");

        let machine = dev_machine();
        let sequence: Vec<String> = recorder
            .events()
            .into_iter()
            .map(|event| match event {
                RecordedEvent::Bootstrap(event) => {
                    assert_eq!(event.machine, machine);
                    format!("bootstrap {:?}", event.status)
                }
                RecordedEvent::Installer(event) => {
                    assert_eq!(event.machine, machine);
                    format!("{} {:?}", event.installer_id, event.status)
                }
                RecordedEvent::Log(event) => {
                    format!("{} {} {}", event.installer_id, event.stream, event.text)
                }
            })
            .collect();
        assert_eq!(
            sequence,
            vec![
                "bootstrap Available",
                "git Starting",
                "git Running",
                "git STDOUT git installed",
                "node Starting",
                "node Running",
                "node STDERR npm warn",
                "node STDOUT node installed",
                "bootstrap Done",
            ]
        );
        assert_eq!(recorder.terminal_count(), 1);
        assert_eq!(bus.subscriber_count::<BootstrapEvent>(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_each_agent_before_starting_the_next() {
        let engine = fake_engine();
        engine.script_exec(
            "install-git.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(5)),
        );
        let bus = EventBus::new();

        bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git", "node"]))
            .await
            .expect("bootstrap");

        let execs: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::CreateExec { argv, .. } => Some(format!("create {}", argv[2])),
                EngineCall::StartExec { exec_id } => Some(format!("start {exec_id}")),
                _ => None,
            })
            .collect();
        assert_eq!(
            execs,
            vec![
                "create install-git.sh",
                "start exec-1",
                "create install-node.sh",
                "start exec-2",
            ]
        );
    }

    #[tokio::test]
    async fn first_failing_agent_aborts_the_rest() {
        let engine = fake_engine();
        engine.script_exec("install-node.sh", ScriptedExec::exit(2).stderr("boom"));
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git", "node", "java"]))
            .await
            .expect_err("node fails");

        let expected = "Exit code for installer 'node' installation is '2' while should be 0";
        assert_eq!(err.message(), expected);
        assert_eq!(
            recorder.installer_statuses(),
            vec![
                ("git".to_string(), InstallerStatus::Starting),
                ("git".to_string(), InstallerStatus::Running),
                ("node".to_string(), InstallerStatus::Starting),
                ("node".to_string(), InstallerStatus::Running),
                ("node".to_string(), InstallerStatus::Failed),
            ]
        );
        let failed = recorder
            .installer_events()
            .into_iter()
            .find(|event| event.status == InstallerStatus::Failed)
            .expect("failed event");
        assert_eq!(failed.error.as_deref(), Some(expected));

        let bootstrap = recorder.bootstrap_events();
        assert_eq!(
            recorder.bootstrap_statuses(),
            vec![BootstrapStatus::Available, BootstrapStatus::Failed]
        );
        assert_eq!(bootstrap[1].error.as_deref(), Some(expected));
        assert_eq!(engine.exec_commands().len(), 2);
        assert_eq!(recorder.log_events()[0].stream, LogStream::Stderr);
    }

    #[tokio::test]
    async fn exec_failure_fails_the_bootstrap() {
        let engine = fake_engine();
        engine.fail(FaultPoint::CreateExec);
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git", "node"]))
            .await
            .expect_err("exec fault");

        assert!(err.message().contains("injected fault"), "{err}");
        assert_eq!(
            recorder.installer_statuses().last(),
            Some(&("git".to_string(), InstallerStatus::Failed))
        );
        assert_eq!(recorder.terminal_count(), 1);
    }

    #[tokio::test]
    async fn unreported_exit_code_counts_as_success() {
        let engine = fake_engine();
        engine.script_exec("install-git.sh", ScriptedExec::unreported());
        let bus = EventBus::new();

        bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git"]))
            .await
            .expect("bootstrap");
    }

    #[tokio::test]
    async fn empty_agent_list_completes() {
        let engine = fake_engine();
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), Vec::new())
            .await
            .expect("bootstrap");

        assert_eq!(
            recorder.bootstrap_statuses(),
            vec![BootstrapStatus::Available, BootstrapStatus::Done]
        );
        assert!(recorder.installer_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_ignores_late_completion() {
        let engine = fake_engine();
        engine.script_exec(
            "install-git.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(60)),
        );
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .with_config(with_timeout(Duration::from_secs(10)))
            .bootstrap(dev_machine(), agents(&["git"]))
            .await
            .expect_err("timeout");

        assert_eq!(err.message(), TIMEOUT_MESSAGE);
        // Only the recorder is left listening.
        assert_eq!(bus.subscriber_count::<BootstrapEvent>(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            recorder.bootstrap_statuses(),
            vec![BootstrapStatus::Available, BootstrapStatus::Done]
        );
        assert_eq!(bus.subscriber_count::<BootstrapEvent>(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_bus_interrupts_the_wait() {
        let engine = fake_engine();
        engine.script_exec(
            "install-git.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(60)),
        );
        let bus = EventBus::new();
        let clearing = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            clearing.clear();
        });

        let err = bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git"]))
            .await
            .expect_err("interrupted");
        assert_eq!(err.message(), INTERRUPTED_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn installer_timeout_fails_slow_agent() {
        let engine = fake_engine();
        engine.script_exec(
            "install-slow.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(30)),
        );
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .with_config(BootstrapConfig {
                installer_timeout: Some(Duration::from_secs(5)),
                ..BootstrapConfig::default()
            })
            .bootstrap(dev_machine(), agents(&["slow", "next"]))
            .await
            .expect_err("installer timeout");

        assert_eq!(
            err.message(),
            "Timeout reached before installation of 'slow' completed"
        );
        assert_eq!(engine.exec_commands().len(), 1);
        assert_eq!(recorder.terminal_count(), 1);
    }

    #[tokio::test]
    async fn writes_manifest_before_first_agent() {
        let engine = fake_engine();
        let bus = EventBus::new();
        let path = "/etc/devbox/agents.json";
        let agents = agents(&["git", "node"]);

        bootstrapper(&engine, &bus)
            .await
            .with_config(BootstrapConfig {
                manifest_path: Some(path.to_string()),
                ..BootstrapConfig::default()
            })
            .bootstrap(dev_machine(), agents.clone())
            .await
            .expect("bootstrap");

        let written = engine.file(CONTAINER, path).expect("manifest");
        let decoded: Vec<ResolvedAgent> = serde_json::from_slice(&written).expect("decode");
        assert_eq!(decoded, agents);

        let calls = engine.calls();
        let put = calls
            .iter()
            .position(|call| matches!(call, EngineCall::PutResource { .. }))
            .expect("put resource call");
        let first_exec = calls
            .iter()
            .position(|call| matches!(call, EngineCall::CreateExec { .. }))
            .expect("exec call");
        assert!(put < first_exec);
    }

    #[tokio::test]
    async fn manifest_failure_starts_no_agent() {
        let engine = fake_engine();
        engine.fail(FaultPoint::PutResource);
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        bootstrapper(&engine, &bus)
            .await
            .with_config(BootstrapConfig {
                manifest_path: Some("/etc/devbox/agents.json".to_string()),
                ..BootstrapConfig::default()
            })
            .bootstrap(dev_machine(), agents(&["git"]))
            .await
            .expect_err("manifest fault");

        assert!(engine.exec_commands().is_empty());
        assert!(recorder.installer_events().is_empty());
        assert_eq!(
            recorder.bootstrap_statuses(),
            vec![BootstrapStatus::Available, BootstrapStatus::Failed]
        );
    }

    #[test]
    fn waiter_matches_only_the_exact_machine() {
        let machine = dev_machine();
        let (tx, mut rx) = oneshot::channel();
        let waiter = TerminalEventWaiter::new(machine.clone(), tx);

        let others = [
            MachineRef::new("other", machine.runtime.clone()),
            MachineRef::new("dev", RuntimeIdentity::new("ws-2", "default", "alice")),
            MachineRef::new("dev", RuntimeIdentity::new("ws-1", "staging", "alice")),
            MachineRef::new("dev", RuntimeIdentity::new("ws-1", "default", "bob")),
        ];
        for other in others {
            assert_eq!(
                waiter.on_event(&BootstrapEvent::done(other)),
                Delivery::Keep
            );
        }
        assert_eq!(
            waiter.on_event(&BootstrapEvent::available(machine.clone())),
            Delivery::Keep
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            waiter.on_event(&BootstrapEvent::failed(machine.clone(), "broken")),
            Delivery::Unsubscribe
        );
        let event = rx.try_recv().expect("terminal event");
        assert_eq!(event.status, BootstrapStatus::Failed);
        assert_eq!(event.machine, machine);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_terminal_events_do_not_complete_the_wait() {
        let engine = fake_engine();
        engine.script_exec(
            "install-git.sh",
            ScriptedExec::exit(1).delayed(Duration::from_secs(5)),
        );
        let bus = EventBus::new();
        let foreign = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let other = MachineRef::new("dev", RuntimeIdentity::new("ws-1", "default", "bob"));
            foreign.publish(BootstrapEvent::done(other));
        });

        let err = bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), agents(&["git"]))
            .await
            .expect_err("own failure wins");
        assert!(err.message().starts_with("Exit code for installer 'git'"));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupting_the_wait_keeps_other_subscribers() {
        let engine = fake_engine();
        engine.script_exec(
            "install-git.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(60)),
        );
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .bootstrap_until(
                dev_machine(),
                agents(&["git"]),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .expect_err("interrupted");
        assert_eq!(err.message(), INTERRUPTED_MESSAGE);
        assert_eq!(bus.subscriber_count::<BootstrapEvent>(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            recorder.bootstrap_statuses(),
            vec![BootstrapStatus::Available, BootstrapStatus::Done]
        );
    }

    fn terminal_agent() -> ResolvedAgent {
        ResolvedAgent::new("terminal", "run-terminal.sh").with_servers(["4411/tcp"])
    }

    fn terminal_check() -> String {
        "4411/tcp"
            .parse::<ServerPort>()
            .expect("port key")
            .listening_check()
    }

    fn check_count(engine: &FakeEngine) -> usize {
        let check = terminal_check();
        engine
            .exec_commands()
            .iter()
            .filter(|argv| argv[2] == check)
            .count()
    }

    fn server_config() -> BootstrapConfig {
        BootstrapConfig {
            server_check_period: Duration::from_secs(1),
            ..BootstrapConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn server_agent_succeeds_once_its_ports_listen() {
        let engine = fake_engine();
        engine.script_exec(
            "run-terminal.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(600)),
        );
        // Free before the run and on the first check, listening on the second.
        engine.script_exec(terminal_check(), ScriptedExec::exit(1).times(2));
        engine.script_exec(terminal_check(), ScriptedExec::ok());
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let mut installs = vec![terminal_agent()];
        installs.extend(agents(&["git"]));
        bootstrapper(&engine, &bus)
            .await
            .with_config(server_config())
            .bootstrap(dev_machine(), installs)
            .await
            .expect("bootstrap");

        assert_eq!(check_count(&engine), 3);
        assert_eq!(
            recorder.installer_statuses(),
            vec![
                ("terminal".to_string(), InstallerStatus::Starting),
                ("terminal".to_string(), InstallerStatus::Running),
                ("git".to_string(), InstallerStatus::Starting),
                ("git".to_string(), InstallerStatus::Running),
            ]
        );
    }

    #[tokio::test]
    async fn server_agent_fails_when_a_port_is_taken() {
        let engine = fake_engine();
        engine.script_exec(terminal_check(), ScriptedExec::ok());
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .with_config(server_config())
            .bootstrap(dev_machine(), vec![terminal_agent()])
            .await
            .expect_err("port in use");

        assert_eq!(
            err.message(),
            "server address 'localhost:4411/tcp' already in use"
        );
        assert_eq!(engine.exec_commands().len(), 1);
        assert_eq!(
            recorder.installer_statuses().last(),
            Some(&("terminal".to_string(), InstallerStatus::Failed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_agent_times_out_when_ports_never_listen() {
        let engine = fake_engine();
        engine.script_exec(
            "run-terminal.sh",
            ScriptedExec::ok().delayed(Duration::from_secs(600)),
        );
        engine.script_exec(terminal_check(), ScriptedExec::exit(1));
        let bus = EventBus::new();

        let err = bootstrapper(&engine, &bus)
            .await
            .with_config(BootstrapConfig {
                installer_timeout: Some(Duration::from_secs(5)),
                ..server_config()
            })
            .bootstrap(dev_machine(), vec![terminal_agent()])
            .await
            .expect_err("server timeout");

        assert_eq!(
            err.message(),
            "Timeout reached before installation of 'terminal' finished"
        );
        // One pre-check plus a check per elapsed period.
        assert!(check_count(&engine) >= 5, "{}", check_count(&engine));
    }

    #[tokio::test(start_paused = true)]
    async fn server_agent_fails_when_its_script_exits_early() {
        let engine = fake_engine();
        engine.script_exec("run-terminal.sh", ScriptedExec::exit(1).stderr("bind failed"));
        engine.script_exec(terminal_check(), ScriptedExec::exit(1));
        let bus = EventBus::new();
        let recorder = EventRecorder::attach(&bus);

        let err = bootstrapper(&engine, &bus)
            .await
            .with_config(server_config())
            .bootstrap(dev_machine(), vec![terminal_agent()])
            .await
            .expect_err("script exited");

        assert_eq!(err.message(), "Installation of terminal was interrupted");
        assert_eq!(check_count(&engine), 2);
        let logs = recorder.log_events();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].text, "bind failed");
    }

    #[tokio::test(start_paused = true)]
    async fn daemonizing_server_script_counts_once_ports_listen() {
        let engine = fake_engine();
        engine.script_exec("run-terminal.sh", ScriptedExec::ok());
        engine.script_exec(terminal_check(), ScriptedExec::exit(1).times(1));
        engine.script_exec(terminal_check(), ScriptedExec::ok());
        let bus = EventBus::new();

        bootstrapper(&engine, &bus)
            .await
            .with_config(server_config())
            .bootstrap(dev_machine(), vec![terminal_agent()])
            .await
            .expect("bootstrap");
        assert_eq!(check_count(&engine), 2);
    }

    #[tokio::test]
    async fn unsupported_server_port_fails_before_running() {
        let engine = fake_engine();
        let bus = EventBus::new();
        let agent = ResolvedAgent::new("terminal", "run-terminal.sh").with_servers(["4411/sctp"]);

        let err = bootstrapper(&engine, &bus)
            .await
            .bootstrap(dev_machine(), vec![agent])
            .await
            .expect_err("bad port");
        assert_eq!(err.message(), "Port format is not supported 4411/sctp");
        assert!(engine.exec_commands().is_empty());
    }
}
