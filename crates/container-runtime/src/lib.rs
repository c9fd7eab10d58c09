use async_trait::async_trait;
use thiserror::Error;

pub mod docker;
pub mod types;

pub use docker::DockerCli;
pub use types::{
    env_to_map, Access, BindMount, ContainerSpec, CreatedContainer, ImageMetadata,
    ObservedContainer, PullEvent,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to pull image {image}: {message}")]
    Pull { image: String, message: String },
    #[error("Failed to spawn container runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error("{operation} {target} failed ({status}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        target: String,
        status: String,
        stderr: String,
    },
    #[error("Failed to parse {operation} output for {target}: {source}")]
    Parse {
        operation: &'static str,
        target: String,
        source: serde_json::Error,
    },
    #[error("{operation} {target} returned no result")]
    EmptyResponse {
        operation: &'static str,
        target: String,
    },
}

/// Control plane of the container engine hosting job containers.
///
/// Implementations issue one call at a time; the session never overlaps them.
/// A missing container is `Ok(None)` from [`ContainerRuntime::inspect_container`],
/// never an error.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `reference`, reporting each status line through `on_event`.
    async fn pull_image(
        &self,
        reference: &str,
        on_event: &mut (dyn FnMut(PullEvent) + Send),
    ) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, name: &str)
        -> Result<Option<ObservedContainer>, RuntimeError>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageMetadata, RuntimeError>;

    /// Create a stopped container. Bind mounts are fixed at creation.
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        mounts: &[BindMount],
    ) -> Result<CreatedContainer, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop the container. Killing an already stopped container succeeds.
    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), RuntimeError>;
}
