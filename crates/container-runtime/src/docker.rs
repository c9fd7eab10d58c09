use async_trait::async_trait;
use serde::Deserialize;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::types::{
    env_to_map, BindMount, ContainerSpec, CreatedContainer, ImageMetadata, ObservedContainer,
    PullEvent,
};
use crate::{ContainerRuntime, RuntimeError};

/// Pull status lines that carry no information worth surfacing.
const PULL_NOISE: [&str; 2] = ["Pulling dependent layers", "Download complete"];

/// Runtime adapter that shells out to a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, args: &[String]) -> Result<CommandLogs, RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                runtime: self.binary.clone(),
                source,
            })?;
        Ok(CommandLogs::from_output(&output))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    #[instrument(skip(self, on_event))]
    async fn pull_image(
        &self,
        reference: &str,
        on_event: &mut (dyn FnMut(PullEvent) + Send),
    ) -> Result<(), RuntimeError> {
        let mut child = self
            .command(["pull", reference])
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                runtime: self.binary.clone(),
                source,
            })?;

        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text).await;
            }
            text
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(|e| RuntimeError::Pull {
                image: reference.to_string(),
                message: e.to_string(),
            })? {
                let status = line.trim();
                if status.is_empty() || PULL_NOISE.iter().any(|noise| status.ends_with(noise)) {
                    continue;
                }
                on_event(PullEvent {
                    status: status.to_string(),
                });
            }
        }

        let status = child.wait().await.map_err(|source| RuntimeError::Spawn {
            runtime: self.binary.clone(),
            source,
        })?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            let message = match stderr.trim() {
                "" => format!("runtime exited with {}", status),
                text => truncate(text, 2048),
            };
            Err(RuntimeError::Pull {
                image: reference.to_string(),
                message,
            })
        }
    }

    #[instrument(skip(self))]
    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<Option<ObservedContainer>, RuntimeError> {
        let logs = self
            .run(&["container".into(), "inspect".into(), name.into()])
            .await?;

        if !logs.success() {
            if is_not_found(&logs.stderr) {
                return Ok(None);
            }
            return Err(logs.into_error("inspect container", name));
        }

        parse_container_inspect(name, &logs.stdout)
    }

    #[instrument(skip(self))]
    async fn inspect_image(&self, reference: &str) -> Result<ImageMetadata, RuntimeError> {
        let logs = self
            .run(&["image".into(), "inspect".into(), reference.into()])
            .await?;

        if !logs.success() {
            return Err(logs.into_error("inspect image", reference));
        }

        parse_image_inspect(reference, &logs.stdout)
    }

    #[instrument(skip(self, spec, mounts), fields(name = %spec.name))]
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        mounts: &[BindMount],
    ) -> Result<CreatedContainer, RuntimeError> {
        let logs = self.run(&create_args(spec, mounts)).await?;

        if !logs.success() {
            return Err(logs.into_error("create container", &spec.name));
        }

        let id = logs
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| RuntimeError::EmptyResponse {
                operation: "create container",
                target: spec.name.clone(),
            })?
            .to_string();

        Ok(CreatedContainer {
            id,
            warnings: creation_warnings(&logs.stderr),
        })
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let logs = self.run(&["start".into(), id.into()]).await?;
        if logs.success() {
            Ok(())
        } else {
            Err(logs.into_error("start container", id))
        }
    }

    #[instrument(skip(self))]
    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let logs = self.run(&["kill".into(), id.into()]).await?;
        if logs.success() || logs.stderr.to_lowercase().contains("is not running") {
            Ok(())
        } else {
            Err(logs.into_error("kill container", id))
        }
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["rm".to_string(), "--force".to_string()];
        if remove_volumes {
            args.push("--volumes".to_string());
        }
        args.push(id.to_string());

        let logs = self.run(&args).await?;
        if logs.success() {
            Ok(())
        } else {
            Err(logs.into_error("remove container", id))
        }
    }
}

fn create_args(spec: &ContainerSpec, mounts: &[BindMount]) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        // The job command must run as configured, not wrapped by the image entrypoint.
        "--entrypoint".to_string(),
        String::new(),
    ];

    for mount in mounts {
        args.push("--volume".to_string());
        args.push(mount.to_bind_arg());
    }

    for (key, value) in &spec.environment {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn creation_warnings(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter_map(|line| line.trim().strip_prefix("WARNING:"))
        .map(|warning| warning.trim().to_string())
        .filter(|warning| !warning.is_empty())
        .collect()
}

fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    mounts: Option<Vec<InspectMount>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(default)]
    destination: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageInspect {
    id: String,
    #[serde(default)]
    config: Option<InspectConfig>,
}

fn parse_container_inspect(
    name: &str,
    stdout: &str,
) -> Result<Option<ObservedContainer>, RuntimeError> {
    let entries: Vec<ContainerInspect> =
        serde_json::from_str(stdout).map_err(|source| RuntimeError::Parse {
            operation: "inspect container",
            target: name.to_string(),
            source,
        })?;

    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let config = entry.config.unwrap_or_default();
    let mounted_paths = entry
        .mounts
        .unwrap_or_default()
        .into_iter()
        // Anonymous volumes declared by the image are not part of the job's bind table.
        .filter(|mount| matches!(mount.kind.as_deref(), None | Some("bind")))
        .filter_map(|mount| mount.destination)
        .collect();

    Ok(Some(ObservedContainer {
        id: entry.id,
        image_reference: config.image.unwrap_or_default(),
        image_id: entry.image,
        command: config.cmd.unwrap_or_default(),
        mounted_paths,
        environment: env_to_map(config.env.unwrap_or_default()),
    }))
}

fn parse_image_inspect(reference: &str, stdout: &str) -> Result<ImageMetadata, RuntimeError> {
    let entries: Vec<ImageInspect> =
        serde_json::from_str(stdout).map_err(|source| RuntimeError::Parse {
            operation: "inspect image",
            target: reference.to_string(),
            source,
        })?;

    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| RuntimeError::EmptyResponse {
            operation: "inspect image",
            target: reference.to_string(),
        })?;

    Ok(ImageMetadata {
        id: entry.id,
        environment: env_to_map(
            entry
                .config
                .and_then(|config| config.env)
                .unwrap_or_default(),
        ),
    })
}

#[derive(Debug, Clone)]
struct CommandLogs {
    stdout: String,
    stderr: String,
    exit_status: Option<i32>,
}

impl CommandLogs {
    fn from_output(output: &Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_status: output.status.code(),
        }
    }

    fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    fn into_error(self, operation: &'static str, target: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            operation,
            target: target.to_string(),
            status: match self.exit_status {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            },
            stderr: truncate(self.stderr.trim(), 2048),
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… (truncated)", &text[..end])
}
