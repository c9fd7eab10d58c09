use config_loader::SessionConfig;
use container_runtime::{BindMount, ContainerSpec};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::naming::encode_container_name;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Validated job parameters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub image: String,
    pub environment: BTreeMap<String, String>,
    pub volumes: Vec<BindMount>,
    /// Always recreate at startup and remove at teardown.
    pub clean: bool,
}

/// Where the agent files live on the host and inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLayout {
    pub install_mount: String,
    pub agent_dir: PathBuf,
    pub launch_script: String,
    pub init_hash: String,
}

impl AgentLayout {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            install_mount: config.install_mount_path(),
            agent_dir: config.agent_dir.clone(),
            launch_script: config.launch_script(),
            init_hash: content_hash(&config.init_script()),
        }
    }
}

/// Desired container for a job. The trailing launch argument is the init
/// script hash, so editing that script changes the command and forces a
/// fresh container.
pub fn build_spec(
    job_name: &str,
    image: &str,
    volumes: &[BindMount],
    environment: &BTreeMap<String, String>,
    layout: &AgentLayout,
) -> ContainerSpec {
    let mount_paths = bind_mounts(volumes, layout)
        .into_iter()
        .map(|mount| mount.container_path)
        .collect();

    ContainerSpec {
        image: image.to_string(),
        name: encode_container_name(job_name),
        command: vec![
            "/bin/bash".to_string(),
            layout.launch_script.clone(),
            layout.init_hash.clone(),
        ],
        mount_paths,
        environment: environment.clone(),
    }
}

/// The job's volumes plus the agent directory, read-only at the install path.
pub fn bind_mounts(volumes: &[BindMount], layout: &AgentLayout) -> Vec<BindMount> {
    let mut mounts = Vec::with_capacity(volumes.len() + 1);
    mounts.push(BindMount::read_only(
        layout.agent_dir.clone(),
        layout.install_mount.clone(),
    ));
    mounts.extend(volumes.iter().cloned());
    mounts
}

/// Hex SHA-256 of a file's contents. A missing or unreadable file hashes as
/// empty input.
pub fn content_hash(path: &Path) -> String {
    let mut hasher = Sha256::new();

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!("Cannot read {}: {}", path.display(), err);
            }
            return hex::encode(Sha256::digest(b""));
        }
    };

    let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => hasher.update(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("Cannot read {}: {}", path.display(), err);
                return hex::encode(Sha256::digest(b""));
            }
        }
    }

    hex::encode(hasher.finalize())
}
