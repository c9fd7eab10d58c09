use async_trait::async_trait;
use bridge::{BridgeError, Direction};
use config_loader::SessionConfig;
use container_runtime::{
    BindMount, ContainerRuntime, ContainerSpec, CreatedContainer, ImageMetadata,
    ObservedContainer, PullEvent, RuntimeError,
};
use engine::{
    build_spec, Action, AgentLayout, JobRequest, Readiness, SessionController, SessionError,
    SessionReport, SessionState, NO_EXISTING_CONTAINER,
};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const NEW_ID: &str = "new-container";
const OLD_ID: &str = "old-container";

#[derive(Default)]
struct Fake {
    calls: Vec<String>,
    existing: Option<ObservedContainer>,
    image: ImageMetadata,
    agent_port: Option<u16>,
    fail_on: Option<&'static str>,
}

/// Records every runtime call. Starting a container launches an in-process
/// agent that dials the session's port, reads its input to the end and
/// answers with the byte count.
#[derive(Clone, Default)]
struct FakeRuntime {
    inner: Arc<Mutex<Fake>>,
}

impl FakeRuntime {
    fn new(agent_port: Option<u16>) -> Self {
        let runtime = Self::default();
        runtime.inner.lock().unwrap().agent_port = agent_port;
        runtime.inner.lock().unwrap().image = ImageMetadata {
            id: "sha256:current".to_string(),
            environment: BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())]),
        };
        runtime
    }

    fn with_existing(self, existing: ObservedContainer) -> Self {
        self.inner.lock().unwrap().existing = Some(existing);
        self
    }

    fn failing_on(self, operation: &'static str) -> Self {
        self.inner.lock().unwrap().fail_on = Some(operation);
        self
    }

    fn image(&self) -> ImageMetadata {
        self.inner.lock().unwrap().image.clone()
    }

    fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn record(&self, operation: &'static str, call: String) -> Result<(), RuntimeError> {
        let mut fake = self.inner.lock().unwrap();
        fake.calls.push(call.clone());
        if fake.fail_on == Some(operation) {
            return Err(RuntimeError::CommandFailed {
                operation,
                target: call,
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(
        &self,
        reference: &str,
        on_event: &mut (dyn FnMut(PullEvent) + Send),
    ) -> Result<(), RuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(format!("pull {}", reference));
        if self.inner.lock().unwrap().fail_on == Some("pull") {
            return Err(RuntimeError::Pull {
                image: reference.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        on_event(PullEvent {
            status: "Status: Image is up to date".to_string(),
        });
        Ok(())
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<Option<ObservedContainer>, RuntimeError> {
        self.record("inspect_container", format!("inspect_container {}", name))?;
        Ok(self.inner.lock().unwrap().existing.clone())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageMetadata, RuntimeError> {
        self.record("inspect_image", format!("inspect_image {}", reference))?;
        Ok(self.image())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        mounts: &[BindMount],
    ) -> Result<CreatedContainer, RuntimeError> {
        assert!(mounts
            .iter()
            .all(|mount| spec.mount_paths.contains(&mount.container_path)));
        self.record("create", format!("create {}", spec.name))?;
        Ok(CreatedContainer {
            id: NEW_ID.to_string(),
            warnings: vec!["WARNING: memory limit ignored".to_string()],
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("start", format!("start {}", id))?;
        let agent_port = self.inner.lock().unwrap().agent_port;
        if let Some(port) = agent_port {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let mut seen = Vec::new();
                stream.read_to_end(&mut seen).await.unwrap();
                stream
                    .write_all(format!("agent saw {} bytes", seen.len()).as_bytes())
                    .await
                    .unwrap();
                stream.shutdown().await.unwrap();
            });
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("kill", format!("kill {}", id))
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), RuntimeError> {
        self.record("remove", format!("remove {} volumes={}", id, remove_volumes))
    }
}

/// Stdout whose consumer has gone away.
struct BrokenOutput;

impl AsyncWrite for BrokenOutput {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "stdout closed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn free_port() -> u16 {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn session_config(port: u16) -> SessionConfig {
    SessionConfig {
        install_dir: PathBuf::from("/var/lib/jobdock"),
        agent_dir: PathBuf::from("/nonexistent/jobdock/agent"),
        connect_address: "127.0.0.1".to_string(),
        connect_port: port,
        accept_timeout: Duration::from_secs(5),
        bind_retry_delay: Duration::from_millis(20),
        outbound_grace: Duration::from_millis(500),
        runtime_binary: "docker".to_string(),
    }
}

fn job(clean: bool) -> JobRequest {
    JobRequest {
        name: "build#42".to_string(),
        image: "worker:latest".to_string(),
        environment: BTreeMap::from([("JOB".to_string(), "build".to_string())]),
        volumes: vec![BindMount::read_only("/srv/cache", "/cache")],
        clean,
    }
}

/// What the runtime would report for a container created from `request`.
fn observed_for(
    config: &SessionConfig,
    request: &JobRequest,
    image: &ImageMetadata,
) -> ObservedContainer {
    let layout = AgentLayout::from_config(config);
    let spec = build_spec(
        &request.name,
        &request.image,
        &request.volumes,
        &request.environment,
        &layout,
    );
    let mut environment = image.environment.clone();
    environment.extend(spec.environment.clone());

    ObservedContainer {
        id: OLD_ID.to_string(),
        image_reference: spec.image,
        image_id: image.id.clone(),
        command: spec.command,
        mounted_paths: spec.mount_paths,
        environment,
    }
}

async fn run_session(
    controller: &mut SessionController<FakeRuntime>,
    request: &JobRequest,
) -> (Result<SessionReport, SessionError>, String) {
    let (relay_input, mut stdin) = duplex(1024);
    let (relay_output, mut stdout) = duplex(1024);
    stdin.write_all(b"hello").await.unwrap();
    stdin.shutdown().await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        controller.run(request, relay_input, relay_output),
    )
    .await
    .expect("session must finish");

    let mut answer = String::new();
    stdout.read_to_string(&mut answer).await.unwrap();
    (result, answer)
}

#[tokio::test]
async fn fresh_job_creates_starts_and_stops_container() {
    let port = free_port();
    let runtime = FakeRuntime::new(Some(port));
    let mut controller = SessionController::new(runtime.clone(), session_config(port));

    let (result, answer) = run_session(&mut controller, &job(false)).await;
    let report = result.unwrap();

    assert_eq!(answer, "agent saw 5 bytes");
    assert_eq!(report.container_id, NEW_ID);
    assert_eq!(report.decision.action, Action::Recreate);
    assert_eq!(report.decision.reasons, vec![NO_EXISTING_CONTAINER]);
    assert_eq!(report.readiness, Readiness::Recreated);
    assert_eq!(report.relay.outbound_bytes, 5);
    assert_eq!(controller.state(), SessionState::TornDown);
    assert_eq!(
        runtime.calls(),
        vec![
            "pull worker:latest",
            "inspect_container build0023_42",
            "create build0023_42",
            "start new-container",
            "kill new-container",
        ]
    );
}

#[tokio::test]
async fn matching_container_is_killed_then_restarted() {
    let port = free_port();
    let config = session_config(port);
    let request = job(false);
    let runtime = FakeRuntime::new(Some(port));
    let existing = observed_for(&config, &request, &runtime.image());
    let runtime = runtime.with_existing(existing);
    let mut controller = SessionController::new(runtime.clone(), config);

    let (result, answer) = run_session(&mut controller, &request).await;
    let report = result.unwrap();

    assert_eq!(answer, "agent saw 5 bytes");
    assert!(report.decision.is_reuse());
    assert_eq!(report.readiness, Readiness::Reused);
    assert_eq!(report.container_id, OLD_ID);
    assert_eq!(
        runtime.calls(),
        vec![
            "pull worker:latest",
            "inspect_container build0023_42",
            "inspect_image worker:latest",
            "kill old-container",
            "start old-container",
            "kill old-container",
        ]
    );
    assert!(!runtime.calls().iter().any(|call| call.starts_with("create")));
}

#[tokio::test]
async fn rebuilt_image_replaces_container() {
    let port = free_port();
    let config = session_config(port);
    let request = job(false);
    let runtime = FakeRuntime::new(Some(port));
    let mut existing = observed_for(&config, &request, &runtime.image());
    existing.image_id = "sha256:previous".to_string();
    let runtime = runtime.with_existing(existing);
    let mut controller = SessionController::new(runtime.clone(), config);

    let (result, _) = run_session(&mut controller, &request).await;
    let report = result.unwrap();

    assert_eq!(report.decision.action, Action::Recreate);
    assert!(report.decision.reasons[0].contains("image id changed"));
    assert_eq!(
        runtime.calls(),
        vec![
            "pull worker:latest",
            "inspect_container build0023_42",
            "inspect_image worker:latest",
            "remove old-container volumes=true",
            "create build0023_42",
            "start new-container",
            "kill new-container",
        ]
    );
}

#[tokio::test]
async fn clean_job_recreates_and_removes_container() {
    let port = free_port();
    let config = session_config(port);
    let request = job(true);
    let runtime = FakeRuntime::new(Some(port));
    let existing = observed_for(&config, &request, &runtime.image());
    let runtime = runtime.with_existing(existing);
    let mut controller = SessionController::new(runtime.clone(), config);

    let (result, _) = run_session(&mut controller, &request).await;
    let report = result.unwrap();

    assert_eq!(report.decision.action, Action::Recreate);
    assert!(report.decision.reasons.is_empty());
    assert_eq!(controller.state(), SessionState::TornDown);
    assert_eq!(
        runtime.calls(),
        vec![
            "pull worker:latest",
            "inspect_container build0023_42",
            "remove old-container volumes=true",
            "create build0023_42",
            "start new-container",
            "remove new-container volumes=true",
        ]
    );
}

#[tokio::test]
async fn pull_failure_aborts_before_touching_containers() {
    let port = free_port();
    let runtime = FakeRuntime::new(Some(port)).failing_on("pull");
    let mut controller = SessionController::new(runtime.clone(), session_config(port));

    let (result, answer) = run_session(&mut controller, &job(false)).await;

    assert!(matches!(result, Err(SessionError::Pull(_))));
    assert!(answer.is_empty());
    assert_eq!(controller.state(), SessionState::Aborted);
    assert_eq!(runtime.calls(), vec!["pull worker:latest"]);
}

#[tokio::test]
async fn inspect_failure_is_fatal() {
    let port = free_port();
    let runtime = FakeRuntime::new(Some(port)).failing_on("inspect_container");
    let mut controller = SessionController::new(runtime.clone(), session_config(port));

    let (result, _) = run_session(&mut controller, &job(false)).await;

    assert!(matches!(result, Err(SessionError::Runtime(_))));
    assert_eq!(controller.state(), SessionState::Aborted);
    assert_eq!(
        runtime.calls(),
        vec!["pull worker:latest", "inspect_container build0023_42"]
    );
}

#[tokio::test]
async fn start_failure_tears_down_created_container() {
    let port = free_port();
    let runtime = FakeRuntime::new(Some(port)).failing_on("start");
    let mut controller = SessionController::new(runtime.clone(), session_config(port));

    let (result, _) = run_session(&mut controller, &job(false)).await;

    assert!(matches!(result, Err(SessionError::Runtime(_))));
    assert_eq!(controller.state(), SessionState::Aborted);
    assert_eq!(
        runtime.calls().last().map(String::as_str),
        Some("kill new-container")
    );
}

#[tokio::test]
async fn missing_agent_times_out_and_stops_container() {
    let port = free_port();
    let mut config = session_config(port);
    config.accept_timeout = Duration::from_millis(100);
    let runtime = FakeRuntime::new(None);
    let mut controller = SessionController::new(runtime.clone(), config);

    let (result, _) = run_session(&mut controller, &job(false)).await;

    assert!(matches!(
        result,
        Err(SessionError::Bridge(BridgeError::AcceptTimeout { .. }))
    ));
    assert_eq!(controller.state(), SessionState::TornDown);
    assert_eq!(
        runtime.calls().last().map(String::as_str),
        Some("kill new-container")
    );
}

#[tokio::test]
async fn teardown_failure_after_clean_session_is_reported() {
    let port = free_port();
    let runtime = FakeRuntime::new(Some(port)).failing_on("kill");
    let mut controller = SessionController::new(runtime.clone(), session_config(port));

    let (result, answer) = run_session(&mut controller, &job(false)).await;

    assert_eq!(answer, "agent saw 5 bytes");
    assert!(matches!(result, Err(SessionError::Runtime(_))));
    assert_eq!(controller.state(), SessionState::Aborted);
}

#[tokio::test]
async fn relay_failure_still_stops_container() {
    let port = free_port();
    let runtime = FakeRuntime::new(Some(port));
    let mut controller = SessionController::new(runtime.clone(), session_config(port));

    let (relay_input, mut stdin) = duplex(1024);
    stdin.write_all(b"hello").await.unwrap();
    stdin.shutdown().await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        controller.run(&job(false), relay_input, BrokenOutput),
    )
    .await
    .expect("session must finish");

    assert!(matches!(
        result,
        Err(SessionError::Bridge(BridgeError::Io {
            direction: Direction::Inbound,
            ..
        }))
    ));
    assert_eq!(controller.state(), SessionState::TornDown);
    assert_eq!(
        runtime.calls().last().map(String::as_str),
        Some("kill new-container")
    );
}

#[tokio::test]
async fn unbindable_address_aborts_and_stops_created_container() {
    let port = free_port();
    let mut config = session_config(port);
    // TEST-NET-3, never assigned to a local interface.
    config.connect_address = "203.0.113.7".to_string();
    let runtime = FakeRuntime::new(Some(port));
    let mut controller = SessionController::new(runtime.clone(), config);

    let (result, answer) = run_session(&mut controller, &job(false)).await;

    assert!(matches!(
        result,
        Err(SessionError::Bridge(BridgeError::Bind { .. }))
    ));
    assert!(answer.is_empty());
    assert_eq!(controller.state(), SessionState::Aborted);
    assert_eq!(
        runtime.calls(),
        vec![
            "pull worker:latest",
            "inspect_container build0023_42",
            "create build0023_42",
            "kill new-container",
        ]
    );
    assert!(!runtime.calls().iter().any(|call| call.starts_with("start")));
}
