//! Reuse-or-recreate decision for the job container.

use container_runtime::{ContainerSpec, ImageMetadata, ObservedContainer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const NO_EXISTING_CONTAINER: &str = "no existing container";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Reuse,
    Recreate,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Reuse => f.write_str("reuse"),
            Action::Recreate => f.write_str("recreate"),
        }
    }
}

/// Outcome of comparing desired and observed container state. `reasons` is
/// empty for `Reuse` and for a recreate forced by the clean policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reasons: Vec<String>,
}

impl Decision {
    pub fn reuse() -> Self {
        Self {
            action: Action::Reuse,
            reasons: Vec::new(),
        }
    }

    pub fn recreate(reasons: Vec<String>) -> Self {
        Self {
            action: Action::Recreate,
            reasons,
        }
    }

    pub fn no_existing_container() -> Self {
        Self::recreate(vec![NO_EXISTING_CONTAINER.to_string()])
    }

    pub fn forced_clean() -> Self {
        Self::recreate(Vec::new())
    }

    pub fn is_reuse(&self) -> bool {
        self.action == Action::Reuse
    }
}

/// The decision when it does not depend on comparing state: no container to
/// compare against, or a clean run. `None` means the image metadata is needed.
pub fn precheck(observed: Option<&ObservedContainer>, force_clean: bool) -> Option<Decision> {
    match observed {
        None => Some(Decision::no_existing_container()),
        Some(_) if force_clean => Some(Decision::forced_clean()),
        Some(_) => None,
    }
}

pub fn decide(
    observed: Option<&ObservedContainer>,
    desired: &ContainerSpec,
    image: &ImageMetadata,
    force_clean: bool,
) -> Decision {
    match (observed, precheck(observed, force_clean)) {
        (Some(observed), None) => {
            let reasons = diff(observed, desired, image);
            if reasons.is_empty() {
                Decision::reuse()
            } else {
                Decision::recreate(reasons)
            }
        }
        (_, settled) => settled.unwrap_or_else(Decision::no_existing_container),
    }
}

/// Every mismatch between the observed container and what `desired` plus the
/// image would produce, in a fixed order: image reference, command, mounts,
/// image id, environment.
pub fn diff(
    observed: &ObservedContainer,
    desired: &ContainerSpec,
    image: &ImageMetadata,
) -> Vec<String> {
    let mut reasons = Vec::new();

    if desired.image != observed.image_reference {
        reasons.push(format!(
            "image changed: expected={}, found={}",
            desired.image, observed.image_reference
        ));
    }

    if desired.command != observed.command {
        reasons.push(format!(
            "command changed: expected={:?}, found={:?}",
            desired.command, observed.command
        ));
    }

    if desired.mount_paths != observed.mounted_paths {
        reasons.push(format!(
            "mounts changed: expected={}, found={}",
            join_paths(&desired.mount_paths),
            join_paths(&observed.mounted_paths)
        ));
    }

    if image.id != observed.image_id {
        reasons.push(format!(
            "image id changed: expected={}, found={}",
            image.id, observed.image_id
        ));
    }

    let expected = expected_environment(image, desired);
    reasons.extend(environment_diff(&expected, &observed.environment));

    reasons
}

/// The image's own environment with the desired variables laid over it.
pub fn expected_environment(
    image: &ImageMetadata,
    desired: &ContainerSpec,
) -> BTreeMap<String, String> {
    let mut expected = image.environment.clone();
    expected.extend(
        desired
            .environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    expected
}

pub fn environment_diff(
    expected: &BTreeMap<String, String>,
    found: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut reasons = Vec::new();

    for (key, value) in expected {
        match found.get(key) {
            None => reasons.push(format!("environment variable {} missing", key)),
            Some(actual) if actual != value => reasons.push(format!(
                "environment variable {} changed: expected={:?}, found={:?}",
                key, value, actual
            )),
            Some(_) => {}
        }
    }

    for key in found.keys().filter(|key| !expected.contains_key(*key)) {
        reasons.push(format!("environment variable {} unexpected", key));
    }

    reasons
}

fn join_paths(paths: &BTreeSet<String>) -> String {
    let joined: Vec<&str> = paths.iter().map(String::as_str).collect();
    format!("[{}]", joined.join(", "))
}
