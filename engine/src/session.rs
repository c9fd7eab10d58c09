use bridge::{bind_listener, relay, BridgeConfig, BridgeError, RelayReport};
use config_loader::{ConfigError, SessionConfig};
use container_runtime::{ContainerRuntime, PullEvent, RuntimeError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use crate::reconcile::{self, Action, Decision};
use crate::spec::{bind_mounts, build_spec, AgentLayout, JobRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Recreated,
    Reused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ImagePulled,
    Reconciled,
    ContainerReady(Readiness),
    Started,
    Bridging,
    TornDown,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::TornDown | SessionState::Aborted)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Pull(RuntimeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub container_id: String,
    pub decision: Decision,
    pub readiness: Readiness,
    pub relay: RelayReport,
}

/// Drives one job session from image pull to teardown.
pub struct SessionController<R> {
    runtime: R,
    config: SessionConfig,
    state: SessionState,
}

impl<R: ContainerRuntime> SessionController<R> {
    pub fn new(runtime: R, config: SessionConfig) -> Self {
        Self {
            runtime,
            config,
            state: SessionState::Init,
        }
    }

    /// Load configuration from the environment and build the runtime from it.
    pub fn from_env<F>(make_runtime: F) -> Result<Self, SessionError>
    where
        F: FnOnce(&SessionConfig) -> R,
    {
        let config = SessionConfig::from_env()?;
        let runtime = make_runtime(&config);
        Ok(Self::new(runtime, config))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the session to completion, relaying `input` to the agent and the
    /// agent's output to `output`.
    ///
    /// Whatever container the session created or reused is stopped (or removed
    /// under `clean`) on every exit path. A teardown failure after an earlier
    /// error is only logged; the earlier error is returned.
    #[instrument(skip_all, fields(job = %request.name, image = %request.image))]
    pub async fn run<I, O>(
        &mut self,
        request: &JobRequest,
        input: I,
        output: O,
    ) -> Result<SessionReport, SessionError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let mut active: Option<String> = None;

        match self.drive(request, input, output, &mut active).await {
            Ok(report) => {
                if let Err(err) = self.teardown(&report.container_id, request.clean).await {
                    self.transition(SessionState::Aborted);
                    return Err(err.into());
                }
                self.transition(SessionState::TornDown);
                Ok(report)
            }
            Err(err) => {
                warn!("Session failed: {}", err);
                let bridging = self.state == SessionState::Bridging;
                let torn_down = match active {
                    Some(id) => match self.teardown(&id, request.clean).await {
                        Ok(()) => true,
                        Err(teardown_err) => {
                            warn!("Teardown of container {} failed: {}", id, teardown_err);
                            false
                        }
                    },
                    None => false,
                };
                self.transition(if bridging && torn_down {
                    SessionState::TornDown
                } else {
                    SessionState::Aborted
                });
                Err(err)
            }
        }
    }

    async fn drive<I, O>(
        &mut self,
        request: &JobRequest,
        input: I,
        output: O,
        active: &mut Option<String>,
    ) -> Result<SessionReport, SessionError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let layout = AgentLayout::from_config(&self.config);
        let spec = build_spec(
            &request.name,
            &request.image,
            &request.volumes,
            &request.environment,
            &layout,
        );
        let mounts = bind_mounts(&request.volumes, &layout);

        info!("Pulling image {}", spec.image);
        let mut on_event = |event: PullEvent| info!("{}", event.status);
        self.runtime
            .pull_image(&spec.image, &mut on_event)
            .await
            .map_err(|err| match err {
                RuntimeError::Pull { .. } => SessionError::Pull(err),
                other => SessionError::Runtime(other),
            })?;
        self.transition(SessionState::ImagePulled);

        let observed = self.runtime.inspect_container(&spec.name).await?;
        let decision = match reconcile::precheck(observed.as_ref(), request.clean) {
            Some(decision) => decision,
            None => {
                let image = self.runtime.inspect_image(&spec.image).await?;
                reconcile::decide(observed.as_ref(), &spec, &image, request.clean)
            }
        };
        self.log_decision(&spec.name, &decision, request.clean);
        self.transition(SessionState::Reconciled);

        let (container_id, readiness) = match (decision.action, observed) {
            (Action::Reuse, Some(existing)) => {
                *active = Some(existing.id.clone());
                self.runtime.kill_container(&existing.id).await?;
                self.transition(SessionState::ContainerReady(Readiness::Reused));
                (existing.id, Readiness::Reused)
            }
            (_, previous) => {
                if let Some(previous) = previous {
                    info!("Removing container {}", previous.id);
                    self.runtime.remove_container(&previous.id, true).await?;
                }
                self.transition(SessionState::ContainerReady(Readiness::Recreated));

                info!("Creating container {}", spec.name);
                let created = self.runtime.create_container(&spec, &mounts).await?;
                for warning in &created.warnings {
                    warn!("{}", warning);
                }
                *active = Some(created.id.clone());
                (created.id, Readiness::Recreated)
            }
        };

        // The agent connects as soon as it starts, so listen first.
        let listener = bind_listener(&self.bridge_config()).await?;

        info!("Starting container {}", container_id);
        self.runtime.start_container(&container_id).await?;
        self.transition(SessionState::Started);

        self.transition(SessionState::Bridging);
        let peer = listener.accept().await?;
        let traffic = relay(peer, input, output, self.config.outbound_grace).await?;
        info!(
            "Agent session closed ({} bytes sent, {} bytes received)",
            traffic.outbound_bytes, traffic.inbound_bytes
        );

        Ok(SessionReport {
            container_id,
            decision,
            readiness,
            relay: traffic,
        })
    }

    async fn teardown(&self, id: &str, clean: bool) -> Result<(), RuntimeError> {
        if clean {
            info!("Removing container {}", id);
            self.runtime.remove_container(id, true).await
        } else {
            info!("Stopping container {}", id);
            self.runtime.kill_container(id).await
        }
    }

    fn log_decision(&self, name: &str, decision: &Decision, clean: bool) {
        match decision.action {
            Action::Reuse => info!("Reusing existing container {}", name),
            Action::Recreate if decision.reasons.is_empty() && clean => {
                info!("Recreating container {}: clean requested", name)
            }
            Action::Recreate => {
                for reason in &decision.reasons {
                    info!("Recreating container {}: {}", name, reason);
                }
            }
        }
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            address: self.config.connect_address.clone(),
            port: self.config.connect_port,
            accept_timeout: self.config.accept_timeout,
            bind_retry_delay: self.config.bind_retry_delay,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
