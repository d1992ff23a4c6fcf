//! [`ContainerEngine`] backed by the `docker` command-line client.

use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use devbox_events::LogStream;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::engine::{
    CommitRequest, ContainerEngine, ContainerInfo, EngineError, ExecExit, ExecHandle, LogMessage,
    PushProgress, PushRequest, RemoveContainerOptions,
};

pub const DEFAULT_DOCKER_BIN: &str = "docker";

// Writes stdin to "$1", creating the parent directory first.
const PUT_RESOURCE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

#[derive(Clone, Debug)]
pub struct DockerCli {
    docker_bin: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_BIN)
    }
}

impl DockerCli {
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, cmd: &mut Command, context: &str) -> Result<Output, EngineError> {
        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(output);
        }
        Err(command_error(
            context,
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        let output = self
            .run(
                self.command()
                    .args(["inspect", "--type", "container", container_id]),
                "docker inspect",
            )
            .await?;
        let mut infos: Vec<ContainerInfo> =
            serde_json::from_slice(&output.stdout).map_err(|source| EngineError::Decode {
                context: "docker inspect output".to_string(),
                source,
            })?;
        if infos.is_empty() {
            return Err(EngineError::NotFound(container_id.to_string()));
        }
        Ok(infos.swap_remove(0))
    }

    async fn create_exec(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> Result<ExecHandle, EngineError> {
        if argv.is_empty() {
            return Err(EngineError::Protocol("exec needs a command".to_string()));
        }
        // The CLI has no separate create step; the handle just carries the
        // request until start.
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Ok(ExecHandle {
            id: format!("cli-{}", id.to_ascii_lowercase()),
            container_id: container_id.to_string(),
            argv: argv.to_vec(),
        })
    }

    async fn start_exec(
        &self,
        exec: &ExecHandle,
        sink: &mut (dyn FnMut(LogMessage) + Send),
    ) -> Result<ExecExit, EngineError> {
        let mut child = self
            .command()
            .arg("exec")
            .arg(&exec.container_id)
            .args(&exec.argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (stdout, stderr) = take_pipes(&mut child, "exec")?;
        drain_lines(stdout, stderr, |stream, content| {
            sink(LogMessage { stream, content })
        })
        .await?;

        let status = child.wait().await?;
        debug!(exec = %exec.id, code = ?status.code(), "docker exec exited");
        Ok(ExecExit {
            exit_code: status.code().map(i64::from),
        })
    }

    async fn put_resource(
        &self,
        container_id: &str,
        target_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), EngineError> {
        let mut child = self
            .command()
            .args(["exec", "-i", container_id, "/bin/sh", "-c", PUT_RESOURCE_SCRIPT, "sh"])
            .arg(target_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("put resource stdin not captured".to_string()))?;
        tokio::io::copy(source, &mut stdin).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }
        Err(command_error(
            "docker put resource",
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn remove_container(
        &self,
        container_id: &str,
        options: RemoveContainerOptions,
    ) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.arg("rm");
        if options.force {
            cmd.arg("--force");
        }
        if options.remove_volumes {
            cmd.arg("--volumes");
        }
        cmd.arg(container_id);
        self.run(&mut cmd, "docker rm").await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.arg("rmi");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(image);
        self.run(&mut cmd, "docker rmi").await?;
        Ok(())
    }

    async fn commit(&self, request: &CommitRequest) -> Result<(), EngineError> {
        self.run(
            self.command()
                .args(["commit", "--message", request.comment.as_str()])
                .arg(&request.container_id)
                .arg(format!("{}:{}", request.repository, request.tag)),
            "docker commit",
        )
        .await?;
        Ok(())
    }

    async fn push(
        &self,
        request: &PushRequest,
        progress: &mut (dyn FnMut(PushProgress) + Send),
    ) -> Result<String, EngineError> {
        let reference = format!("{}:{}", request.full_repository(), request.tag);
        let mut child = self
            .command()
            .args(["push", reference.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (stdout, stderr) = take_pipes(&mut child, "push")?;

        let mut digest = None;
        let mut errors = String::new();
        drain_lines(stdout, stderr, |stream, line| match stream {
            LogStream::Stdout => {
                if let Some(found) = parse_push_digest(&line) {
                    digest = Some(found.to_string());
                }
                progress(PushProgress { status: line });
            }
            LogStream::Stderr => {
                errors.push_str(&line);
                errors.push('\n');
            }
        })
        .await?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(command_error("docker push", status.code(), &errors));
        }
        digest.ok_or_else(|| {
            EngineError::Protocol(format!("docker push of {reference} reported no digest"))
        })
    }
}

fn take_pipes(
    child: &mut Child,
    context: &str,
) -> Result<(ChildStdout, ChildStderr), EngineError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Protocol(format!("{context} stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Protocol(format!("{context} stderr not captured")))?;
    Ok((stdout, stderr))
}

/// Reads both pipes to EOF at the same time, handing over one line at a time
/// with the trailing newline stripped. Bytes that are not valid UTF-8 are
/// replaced rather than failing the read.
async fn drain_lines(
    stdout: impl AsyncRead + Unpin,
    stderr: impl AsyncRead + Unpin,
    mut on_line: impl FnMut(LogStream, String),
) -> std::io::Result<()> {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    // read_until keeps partial lines in the buffer when select! drops it.
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let (mut stdout_open, mut stderr_open) = (true, true);
    while stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut out_buf), if stdout_open => {
                if read? == 0 {
                    stdout_open = false;
                } else {
                    on_line(LogStream::Stdout, decode_line(&out_buf));
                    out_buf.clear();
                }
            }
            read = stderr.read_until(b'\n', &mut err_buf), if stderr_open => {
                if read? == 0 {
                    stderr_open = false;
                } else {
                    on_line(LogStream::Stderr, decode_line(&err_buf));
                    err_buf.clear();
                }
            }
        }
    }
    Ok(())
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Extracts the digest from a push summary such as
/// `latest: digest: sha256:ab12... size: 1234`.
fn parse_push_digest(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("digest: ")?;
    rest.split_whitespace()
        .next()
        .filter(|digest| digest.contains(':'))
}

fn command_error(context: &str, code: Option<i32>, stderr: &str) -> EngineError {
    let stderr = stderr.trim();
    if let Some(missing) = stderr
        .lines()
        .find_map(|line| line.split_once("No such ").map(|(_, rest)| rest))
    {
        let object = missing.split_once(": ").map_or(missing, |(_, name)| name);
        return EngineError::NotFound(object.trim().to_string());
    }
    EngineError::Command {
        context: context.to_string(),
        code,
        stderr: stderr.to_string(),
    }
}
