//! Container reconciliation and session sequencing for a single CI job.

pub mod naming;
pub mod reconcile;
pub mod session;
pub mod spec;

pub use naming::encode_container_name;
pub use reconcile::{decide, precheck, Action, Decision, NO_EXISTING_CONTAINER};
pub use session::{Readiness, SessionController, SessionError, SessionReport, SessionState};
pub use spec::{bind_mounts, build_spec, content_hash, AgentLayout, JobRequest};
