//! Host environment detection.

use std::path::Path;

/// Marker files left by container runtimes.
const CONTAINER_MARKERS: &[&str] = &[
    // dockerd mounts this by default
    "/.dockerenv",
    // podman
    "/run/.containerenv",
];

/// Best-effort check for running inside a container.
#[must_use]
pub fn is_container() -> bool {
    std::process::id() == 1 || CONTAINER_MARKERS.iter().any(|p| Path::new(p).exists())
}
