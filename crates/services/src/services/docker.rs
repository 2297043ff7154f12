//! Builds and supervises the agent container.
//!
//! The container is launched by handing the argument vector straight to the
//! `docker` client, so the prompt never passes through a shell. The rendered
//! single-line form of the same command exists for the execution log (raw
//! values) and for the audit trail (masked values); rendering shell-quotes
//! the prompt losslessly.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        dev_environment::DevEnvironment,
        system_config::{DEV_ENVIRONMENT_TYPES_KEY, SystemConfig},
    },
};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use utils::{shell, text};
use uuid::Uuid;

pub const DEFAULT_IMAGE: &str = "claude-code:latest";

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_STDERR_MESSAGE_BYTES: usize = 1000;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    ContainerFailed(String),
    #[error("container cleanup failed: {0}")]
    CleanupFailed(String),
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("execution cancelled")]
    Cancelled,
}

/// Where the runner's pipe readers deliver each captured line. Implemented by
/// the executor's durable log sink; the runner never talks to the database
/// directly.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, exec_log_id: Uuid, conversation_id: Uuid, content: &str);
}

/// Everything the runner needs to launch one agent container.
pub struct AgentRunSpec<'a> {
    pub task_id: Uuid,
    pub conversation_id: Uuid,
    pub exec_log_id: Uuid,
    pub prompt: &'a str,
    pub dev_environment: &'a DevEnvironment,
    pub workspace: &'a Path,
}

/// The built command in both renderings plus the tracked container name.
pub struct PreparedCommand {
    pub args: Vec<String>,
    pub audit_command: String,
    pub container_name: String,
}

#[derive(Deserialize)]
struct EnvTypeImage {
    key: String,
    image: String,
}

#[derive(Clone)]
pub struct DockerRunner {
    db: DBService,
    sink: Arc<dyn LogSink>,
    execution_timeout: Duration,
}

impl DockerRunner {
    pub fn new(db: DBService, sink: Arc<dyn LogSink>, execution_timeout: Duration) -> Self {
        Self {
            db,
            sink,
            execution_timeout,
        }
    }

    pub fn container_name(task_id: Uuid, conversation_id: Uuid) -> String {
        format!("xsha-task-{task_id}-conv-{conversation_id}")
    }

    /// `docker version` with a short timeout; anything but a clean exit means
    /// the daemon is unreachable.
    pub async fn check_availability(&self) -> Result<(), DockerError> {
        let mut cmd = Command::new("docker");
        cmd.arg("version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(PREFLIGHT_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(DockerError::Unavailable(format!(
                "docker version exited with {status}"
            ))),
            Ok(Err(e)) => Err(DockerError::Unavailable(format!(
                "docker command not runnable: {e}"
            ))),
            Err(_) => Err(DockerError::Unavailable(format!(
                "docker version timed out after {PREFLIGHT_TIMEOUT:?}"
            ))),
        }
    }

    /// Resolve the container image for an environment type from the
    /// `dev_environment_types` system config; unknown types and broken
    /// config fall back to the default image.
    async fn image_for_env_type(&self, env_type: &str) -> String {
        let raw = match SystemConfig::get_value(&self.db.pool, DEV_ENVIRONMENT_TYPES_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return DEFAULT_IMAGE.to_string(),
            Err(e) => {
                tracing::warn!("Failed to read dev environment types: {e}");
                return DEFAULT_IMAGE.to_string();
            }
        };
        let entries: Vec<EnvTypeImage> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Malformed dev environment types config: {e}");
                return DEFAULT_IMAGE.to_string();
            }
        };
        entries
            .into_iter()
            .find(|entry| entry.key == env_type)
            .map(|entry| entry.image)
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    /// Build both command renderings and the container name.
    pub async fn prepare(&self, spec: &AgentRunSpec<'_>) -> PreparedCommand {
        let image = self.image_for_env_type(&spec.dev_environment.env_type).await;
        let args = build_run_args(spec, &image, false);
        let masked_args = build_run_args(spec, &image, true);
        PreparedCommand {
            audit_command: render_command(&masked_args),
            container_name: Self::container_name(spec.task_id, spec.conversation_id),
            args,
        }
    }

    /// Run the prepared container to completion, streaming both pipes into
    /// the log sink. On cancellation or timeout the container is stopped and
    /// force-removed before returning; the readers are always drained first,
    /// so every captured line is durable when this returns.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        spec: &AgentRunSpec<'_>,
        prepared: &PreparedCommand,
    ) -> Result<(), DockerError> {
        if let Err(e) = self.check_availability().await {
            self.append(spec, &format!("{e}\n")).await;
            return Err(e);
        }
        self.append(spec, "docker availability check passed\n").await;
        self.append(
            spec,
            &format!("starting container: {}\n", prepared.container_name),
        )
        .await;

        let mut cmd = Command::new("docker");
        cmd.args(&prepared.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = self.spawn_reader(spec, stdout, "STDOUT", false);
        let stderr_reader = self.spawn_reader(spec, stderr, "STDERR", true);

        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.execution_timeout) => {
                self.append(
                    spec,
                    &format!("execution timed out after {:?}\n", self.execution_timeout),
                )
                .await;
                // reuse the cancellation path below
                let _ = self.teardown(spec, prepared, &mut child).await;
                drain_reader(stdout_reader).await;
                drain_reader(stderr_reader).await;
                return Err(DockerError::Timeout(self.execution_timeout));
            }
        };

        let status = match wait_result {
            Some(status) => status?,
            None => {
                self.append(
                    spec,
                    &format!(
                        "execution cancelled, cleaning up container: {}\n",
                        prepared.container_name
                    ),
                )
                .await;
                let _ = self.teardown(spec, prepared, &mut child).await;
                drain_reader(stdout_reader).await;
                drain_reader(stderr_reader).await;
                return Err(DockerError::Cancelled);
            }
        };

        drain_reader(stdout_reader).await;
        let stderr_lines = drain_reader(stderr_reader).await;

        if status.success() {
            return Ok(());
        }
        let message = if stderr_lines.is_empty() {
            format!("container exited with {status}")
        } else {
            let joined = stderr_lines.join("\n");
            if joined.len() > MAX_STDERR_MESSAGE_BYTES {
                format!(
                    "{}...",
                    text::truncate_to_char_boundary(&joined, MAX_STDERR_MESSAGE_BYTES)
                )
            } else {
                joined
            }
        };
        Err(DockerError::ContainerFailed(message))
    }

    /// `docker stop` (grace period) then `docker rm -f`. A container that is
    /// already gone is success.
    pub async fn stop_and_remove_container(&self, container_name: &str) -> Result<(), DockerError> {
        let mut stop = Command::new("docker");
        stop.args(["stop", container_name])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(STOP_TIMEOUT, stop.output()).await {
            Ok(Ok(out)) if out.status.success() => {}
            Ok(Ok(out)) => {
                tracing::warn!(
                    "docker stop {container_name} failed, will force remove: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
            }
            Ok(Err(e)) => {
                tracing::warn!("docker stop {container_name} not runnable: {e}");
            }
            Err(_) => {
                tracing::warn!("docker stop {container_name} timed out");
            }
        }

        let mut remove = Command::new("docker");
        remove
            .args(["rm", "-f", container_name])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(REMOVE_TIMEOUT, remove.output()).await {
            Ok(Ok(out)) => {
                if out.status.success() {
                    return Ok(());
                }
                let stderr = String::from_utf8_lossy(&out.stderr);
                if stderr.contains("No such container") {
                    return Ok(());
                }
                Err(DockerError::CleanupFailed(stderr.trim().to_string()))
            }
            Ok(Err(e)) => Err(DockerError::CleanupFailed(e.to_string())),
            Err(_) => Err(DockerError::CleanupFailed(format!(
                "docker rm -f {container_name} timed out"
            ))),
        }
    }

    async fn teardown(
        &self,
        spec: &AgentRunSpec<'_>,
        prepared: &PreparedCommand,
        child: &mut tokio::process::Child,
    ) -> Result<(), DockerError> {
        let cleanup = self.stop_and_remove_container(&prepared.container_name).await;
        if let Err(e) = &cleanup {
            self.append(spec, &format!("failed to clean up container: {e}\n")).await;
            tracing::error!(
                "Failed to clean up container {}: {e}",
                prepared.container_name
            );
        } else {
            self.append(
                spec,
                &format!("container cleaned up: {}\n", prepared.container_name),
            )
            .await;
        }
        // the attached client exits once the container is gone; kill it
        // outright so a failed cleanup cannot leave the readers blocked
        let _ = child.start_kill();
        let _ = child.wait().await;
        cleanup
    }

    fn spawn_reader(
        &self,
        spec: &AgentRunSpec<'_>,
        pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
        stream_label: &'static str,
        capture: bool,
    ) -> Option<JoinHandle<Vec<String>>> {
        let pipe = pipe?;
        let sink = Arc::clone(&self.sink);
        let exec_log_id = spec.exec_log_id;
        let conversation_id = spec.conversation_id;
        Some(tokio::spawn(async move {
            let mut captured = Vec::new();
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let stamped = format!(
                    "[{}] {stream_label}: {line}\n",
                    chrono::Local::now().format("%H:%M:%S")
                );
                sink.append(exec_log_id, conversation_id, &stamped).await;
                if capture {
                    captured.push(line);
                }
            }
            captured
        }))
    }

    async fn append(&self, spec: &AgentRunSpec<'_>, content: &str) {
        self.sink
            .append(spec.exec_log_id, spec.conversation_id, content)
            .await;
    }
}

async fn drain_reader(handle: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// The `docker run` argument vector. With `masked` the env values are
/// replaced by their audit form.
fn build_run_args(spec: &AgentRunSpec<'_>, image: &str, masked: bool) -> Vec<String> {
    let env = spec.dev_environment;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        format!(
            "--name={}",
            DockerRunner::container_name(spec.task_id, spec.conversation_id)
        ),
        "-v".to_string(),
        format!("{}:/app", spec.workspace.display()),
    ];
    if env.cpu_limit > 0.0 {
        args.push(format!("--cpus={:.2}", env.cpu_limit));
    }
    if env.memory_limit > 0 {
        args.push(format!("--memory={}m", env.memory_limit));
    }

    let mut env_vars: Vec<(String, String)> = env.env_vars_map().into_iter().collect();
    env_vars.sort();
    for (key, value) in env_vars {
        let value = if masked {
            text::mask_sensitive_value(&value)
        } else {
            value
        };
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(image.to_string());
    args.extend(agent_args(&env.env_type, spec.prompt));
    args
}

/// Per-agent-type argument convention. Unknown types run the claude form.
fn agent_args(env_type: &str, prompt: &str) -> Vec<String> {
    match env_type {
        "opencode" | "gemini_cli" => vec![prompt.to_string()],
        _ => vec![
            "claude".to_string(),
            "-p".to_string(),
            "--output-format=stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--verbose".to_string(),
            prompt.to_string(),
        ],
    }
}

/// Single-line rendering of the argument vector. The trailing prompt is
/// always quoted; other arguments only when they need it.
fn render_command(args: &[String]) -> String {
    let mut parts = vec!["docker".to_string()];
    if let Some((prompt, rest)) = args.split_last() {
        parts.extend(rest.iter().map(|a| shell::quote_if_needed(a)));
        parts.push(shell::quote(prompt));
    }
    parts.join(" ")
}
