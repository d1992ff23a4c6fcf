mod agents;
mod printer;

use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use devbox_bootstrap::{BootstrapConfig, Bootstrapper};
use devbox_events::{EventBus, LogStream, MachineRef, ResolvedAgent, RuntimeIdentity};
use devbox_machine::{
    ContainerEngine, ContainerMachine, DockerCli, MachineConfig, ServerStrategyKind,
};
use serde::Serialize;
use tracing::warn;

use crate::agents::{AgentSpec, ServerSpec, load_agents, parse_agent_spec, parse_server_spec};

#[derive(Debug, Parser)]
#[command(name = "devbox")]
#[command(about = "Bootstrap, inspect and snapshot workspace machine containers")]
struct Cli {
    /// Docker client binary
    #[arg(long, env = "DEVBOX_DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Image the container was started from (defaults to the one reported by inspect)
    #[arg(long, global = true)]
    image: Option<String>,

    /// Server evaluation strategy, overrides DEVBOX_SERVER_STRATEGY
    #[arg(long, global = true)]
    server_strategy: Option<ServerStrategyKind>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install agents into a running container, printing events as JSON lines
    Bootstrap {
        /// Container id or name
        #[arg(long)]
        container: String,

        /// Machine name used in published events
        #[arg(long)]
        machine: String,

        /// Runtime identity as workspace:environment:owner
        #[arg(long)]
        runtime: RuntimeIdentity,

        /// Agent to install, as <id>=<script file>; repeat to install several in order
        #[arg(long = "agent", value_parser = parse_agent_spec)]
        agents: Vec<AgentSpec>,

        /// Server port an agent leaves listening, as <agent id>=<port>[/tcp|/udp]; repeatable
        #[arg(long = "server", value_parser = parse_server_spec)]
        servers: Vec<ServerSpec>,

        /// Overall completion ceiling in seconds (at least 10), overrides DEVBOX_BOOTSTRAP_TIMEOUT_SECS
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Run a shell command inside the container, streaming its output
    Exec {
        #[arg(long)]
        container: String,

        /// Command line passed to /bin/sh -c
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the container's servers as JSON
    Servers {
        #[arg(long)]
        container: String,
    },

    /// Commit (and optionally push) the container, printing the result as JSON
    Snapshot {
        #[arg(long)]
        container: String,
    },

    /// Remove the container, its volumes and, best effort, its image
    Destroy {
        #[arg(long)]
        container: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.cmd {
        Command::Bootstrap {
            container,
            machine,
            runtime,
            agents,
            servers,
            timeout_secs,
        } => {
            let agents = load_agents(agents, servers)?;
            cmd_bootstrap(&cli, container, machine, runtime, agents, *timeout_secs).await
        }
        Command::Exec { container, command } => cmd_exec(&cli, container, command).await,
        Command::Servers { container } => cmd_servers(&cli, container).await,
        Command::Snapshot { container } => cmd_snapshot(&cli, container).await,
        Command::Destroy { container } => cmd_destroy(&cli, container).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

async fn open_machine(cli: &Cli, container: &str) -> anyhow::Result<ContainerMachine> {
    let mut config = MachineConfig::from_env().context("load machine config")?;
    if let Some(strategy) = cli.server_strategy {
        config.server_strategy = strategy;
    }

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::new(&cli.docker_bin));
    let image = match &cli.image {
        Some(image) => image.clone(),
        None => {
            engine
                .inspect_container(container)
                .await
                .with_context(|| format!("inspect container {container}"))?
                .config
                .image
        }
    };
    ContainerMachine::new(engine, container, image, config)
        .await
        .with_context(|| format!("open machine for container {container}"))
}

fn with_timeout_override(mut config: BootstrapConfig, timeout_secs: Option<u64>) -> BootstrapConfig {
    if let Some(secs) = timeout_secs {
        config.set_timeout_secs(secs);
    }
    config
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("encode output")?
    );
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn cmd_bootstrap(
    cli: &Cli,
    container: &str,
    machine_name: &str,
    runtime: &RuntimeIdentity,
    agents: Vec<ResolvedAgent>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let machine = open_machine(cli, container).await?;

    let config = with_timeout_override(BootstrapConfig::from_env(), timeout_secs);

    let bus = EventBus::new();
    let _printer = printer::attach(&bus);
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    let machine_ref = MachineRef::new(machine_name, runtime.clone());
    Bootstrapper::new(Arc::new(machine), bus)
        .with_config(config)
        .bootstrap_until(machine_ref.clone(), agents, interrupt)
        .await
        .with_context(|| format!("bootstrap {machine_ref}"))
}

async fn cmd_exec(cli: &Cli, container: &str, command: &[String]) -> anyhow::Result<()> {
    let machine = open_machine(cli, container).await?;
    let exit = machine
        .exec(&command.join(" "), |message| match message.stream {
            LogStream::Stdout => println!("{}", message.content),
            LogStream::Stderr => eprintln!("{}", message.content),
        })
        .await
        .context("exec")?;

    match exit.exit_code {
        Some(0) | None => Ok(()),
        Some(code) => {
            let code = i32::try_from(code).map_err(|_| anyhow!("exit code {code} out of range"))?;
            std::process::exit(code)
        }
    }
}

async fn cmd_servers(cli: &Cli, container: &str) -> anyhow::Result<()> {
    let machine = open_machine(cli, container).await?;
    print(&machine.servers())
}

async fn cmd_snapshot(cli: &Cli, container: &str) -> anyhow::Result<()> {
    let machine = open_machine(cli, container).await?;
    let snapshot = machine
        .save_to_snapshot()
        .await
        .with_context(|| format!("snapshot container {container}"))?;
    print(&snapshot)
}

async fn cmd_destroy(cli: &Cli, container: &str) -> anyhow::Result<()> {
    let machine = open_machine(cli, container).await?;
    machine
        .destroy()
        .await
        .with_context(|| format!("destroy container {container}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_bootstrap_arguments() {
        let cli = Cli::try_parse_from([
            "devbox",
            "bootstrap",
            "--container",
            "c0ffee",
            "--machine",
            "dev",
            "--runtime",
            "ws-1:default:alice",
            "--agent",
            "git=install-git.sh",
            "--agent",
            "node=install-node.sh",
            "--server",
            "node=3000/tcp",
            "--timeout-secs",
            "3",
        ])
        .expect("parse");
        let Command::Bootstrap {
            runtime,
            agents,
            servers,
            timeout_secs,
            ..
        } = cli.cmd
        else {
            panic!("expected bootstrap");
        };
        assert_eq!(runtime, RuntimeIdentity::new("ws-1", "default", "alice"));
        assert_eq!(
            agents.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            vec!["git", "node"]
        );
        assert_eq!(servers[0].agent_id, "node");
        assert_eq!(servers[0].port, "3000/tcp");

        let config = with_timeout_override(BootstrapConfig::default(), timeout_secs);
        assert_eq!(
            config.timeout,
            std::time::Duration::from_secs(devbox_bootstrap::MIN_BOOTSTRAP_TIMEOUT_SECS)
        );
    }

    #[test]
    fn rejects_malformed_runtime() {
        let err = Cli::try_parse_from([
            "devbox",
            "bootstrap",
            "--container",
            "c0ffee",
            "--machine",
            "dev",
            "--runtime",
            "ws-1:alice",
        ])
        .expect_err("bad runtime");
        assert!(err.to_string().contains("workspace:environment:owner"), "{err}");
    }

    #[test]
    fn exec_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "devbox",
            "exec",
            "--container",
            "c0ffee",
            "ls",
            "-la",
            "/workspace",
        ])
        .expect("parse");
        let Command::Exec { command, .. } = cli.cmd else {
            panic!("expected exec");
        };
        assert_eq!(command, vec!["ls", "-la", "/workspace"]);
    }
}
