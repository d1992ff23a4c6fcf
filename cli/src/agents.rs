use std::path::PathBuf;

use anyhow::{Context, bail};
use devbox_bootstrap::ports::ServerPort;
use devbox_events::ResolvedAgent;

/// `--agent <id>=<script file>` as given on the command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentSpec {
    pub id: String,
    pub script_path: PathBuf,
}

pub fn parse_agent_spec(raw: &str) -> Result<AgentSpec, String> {
    let Some((id, path)) = raw.split_once('=') else {
        return Err(format!("expected <id>=<script file>, got `{raw}`"));
    };
    let id = id.trim();
    let path = path.trim();
    if id.is_empty() || path.is_empty() {
        return Err(format!("agent id and script file must be non-empty: `{raw}`"));
    }
    Ok(AgentSpec {
        id: id.to_string(),
        script_path: PathBuf::from(path),
    })
}

/// `--server <agent id>=<port>`: a port the agent's script leaves listening.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSpec {
    pub agent_id: String,
    pub port: String,
}

pub fn parse_server_spec(raw: &str) -> Result<ServerSpec, String> {
    let Some((id, port)) = raw.split_once('=') else {
        return Err(format!("expected <agent id>=<port>, got `{raw}`"));
    };
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("agent id must be non-empty: `{raw}`"));
    }
    let port: ServerPort = port.parse().map_err(|err| format!("{err}"))?;
    Ok(ServerSpec {
        agent_id: id.to_string(),
        port: port.key,
    })
}

/// Reads every script, keeping command-line order, and attaches declared
/// server ports. Ids must be unique and every server must name a given agent.
pub fn load_agents(
    specs: &[AgentSpec],
    servers: &[ServerSpec],
) -> anyhow::Result<Vec<ResolvedAgent>> {
    let mut agents: Vec<ResolvedAgent> = Vec::with_capacity(specs.len());
    for spec in specs {
        if agents.iter().any(|agent| agent.id == spec.id) {
            bail!("agent `{}` given more than once", spec.id);
        }
        let script = std::fs::read_to_string(&spec.script_path).with_context(|| {
            format!(
                "read script for agent `{}` from {}",
                spec.id,
                spec.script_path.display()
            )
        })?;
        agents.push(ResolvedAgent::new(&spec.id, script));
    }
    for server in servers {
        let Some(agent) = agents.iter_mut().find(|agent| agent.id == server.agent_id) else {
            bail!("server {} names unknown agent `{}`", server.port, server.agent_id);
        };
        agent.servers.push(server.port.clone());
    }
    Ok(agents)
}
