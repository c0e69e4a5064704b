//! Container runtime seam.
//!
//! The container backend and the provider never talk to Docker directly;
//! they go through [`ContainerEngine`]. Production code uses [`DockerCli`],
//! tests substitute an engine that maps containers onto temporary
//! directories.
//!
//! Every method blocks until the runtime has finished the request.

pub mod docker;

pub use docker::DockerCli;

use crate::error::Result;
use crate::process_guard::StepIo;
use serde::Deserialize;

/// The parts of an image's configuration the container backend needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageConfig {
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: String,
}

/// Operations slingshot needs from a container runtime.
pub trait ContainerEngine: Send + Sync {
    /// Version string of the runtime server, used as a connectivity check.
    fn server_version(&self) -> Result<String>;

    /// IDs of local images whose reference is exactly `reference` (`repo:tag`).
    fn list_images(&self, reference: &str) -> Result<Vec<String>>;

    /// Pull `reference` from its registry.
    fn pull_image(&self, reference: &str) -> Result<()>;

    fn inspect_image(&self, image_id: &str) -> Result<ImageConfig>;

    /// Create a container that runs `command` with an empty entrypoint.
    /// Returns the container ID.
    fn create_container(&self, image_id: &str, command: &[String]) -> Result<String>;

    fn start_container(&self, container_id: &str) -> Result<()>;

    /// Run `argv` inside a running container and return its exit code.
    ///
    /// Errors are reserved for failures to run anything at all.
    fn exec(&self, container_id: &str, argv: &[String], io: &mut StepIo) -> Result<i32>;

    /// Tar stream of `path` inside the container, entries named after the
    /// last component of `path`.
    fn download(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Extract `archive` into directory `dir` inside the container.
    fn upload(&self, container_id: &str, dir: &str, archive: &[u8]) -> Result<()>;

    /// Remove the container, killing it if it still runs.
    fn remove_container(&self, container_id: &str) -> Result<()>;
}
