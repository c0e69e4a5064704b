//! Execution backends
//!
//! An operation runs inside a sandbox owned by exactly one backend value:
//! a temporary directory on the host ([`HostBackend`]) or a long-lived
//! container created from the provider image ([`ContainerBackend`]). Which
//! one is decided by [`OperationSpec::kind`] and captured in the [`Backend`]
//! sum type; callers only see the capability set of [`ExecutionBackend`].
//!
//! Sandbox lifecycle: `prepare` allocates, `clean_up` releases. Calling
//! `prepare` twice without `clean_up` in between is not supported.

pub mod container;
pub mod host;

pub use container::{ContainerBackend, ContainerSandbox};
pub use host::{HostBackend, HostSandbox};

use crate::engine::ContainerEngine;
use crate::error::{ProvisionError, Result};
use crate::operation::{BackendKind, OperationSpec};
use crate::process_guard::StepIo;
use crate::settings::EngineSettings;
use std::sync::Arc;

/// Capability set shared by every backend.
pub trait ExecutionBackend {
    /// Allocate the sandbox, unpack the working directory seed and write
    /// `parameters` to the operation's parameter file, if both are given.
    fn prepare(&mut self, parameters: Option<&[u8]>) -> Result<()>;

    /// Run one argument vector to completion.
    ///
    /// A program that runs and exits non-zero is `Ok(code)`; `Err` means
    /// nothing could be run.
    fn exec(&mut self, argv: &[String], io: &mut StepIo) -> Result<i32>;

    /// Content of the result file, empty when the operation declares none.
    fn output(&mut self) -> Result<Vec<u8>>;

    /// Archive the sandbox content at `persist_paths`.
    fn read_state(&mut self, persist_paths: &[String]) -> Result<Vec<u8>>;

    /// Unpack a state archive at `dest` (relative to the working directory).
    fn extract_state(&mut self, archive: &[u8], dest: &str) -> Result<()>;

    /// Release the sandbox. Never fails; problems are logged.
    fn clean_up(&mut self);
}

/// A provider image resolved to a local image ID, plus the engine that owns it.
#[derive(Clone)]
pub struct ImageHandle {
    pub engine: Arc<dyn ContainerEngine>,
    pub image_id: String,
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("image_id", &self.image_id)
            .finish_non_exhaustive()
    }
}

/// Backend selected by an operation's kind.
#[derive(Debug)]
pub enum Backend {
    Host(HostBackend),
    Container(ContainerBackend),
}

impl Backend {
    /// Build the backend `spec` asks for. Container operations need an image.
    pub fn for_operation(
        spec: &OperationSpec,
        settings: &EngineSettings,
        image: Option<&ImageHandle>,
    ) -> Result<Self> {
        match spec.kind {
            BackendKind::Host => Ok(Backend::Host(HostBackend::new(
                spec.clone(),
                settings.host.clone(),
            ))),
            BackendKind::Container => {
                let image = image.ok_or_else(|| {
                    ProvisionError::infrastructure(
                        "docker operation requested without a provider image",
                    )
                })?;
                Ok(Backend::Container(ContainerBackend::new(
                    spec.clone(),
                    image.clone(),
                    settings.container.clone(),
                )))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Host(_) => BackendKind::Host,
            Backend::Container(_) => BackendKind::Container,
        }
    }

    fn inner(&mut self) -> &mut dyn ExecutionBackend {
        match self {
            Backend::Host(b) => b,
            Backend::Container(b) => b,
        }
    }
}

impl ExecutionBackend for Backend {
    fn prepare(&mut self, parameters: Option<&[u8]>) -> Result<()> {
        self.inner().prepare(parameters)
    }

    fn exec(&mut self, argv: &[String], io: &mut StepIo) -> Result<i32> {
        self.inner().exec(argv, io)
    }

    fn output(&mut self) -> Result<Vec<u8>> {
        self.inner().output()
    }

    fn read_state(&mut self, persist_paths: &[String]) -> Result<Vec<u8>> {
        self.inner().read_state(persist_paths)
    }

    fn extract_state(&mut self, archive: &[u8], dest: &str) -> Result<()> {
        self.inner().extract_state(archive, dest)
    }

    fn clean_up(&mut self) {
        self.inner().clean_up()
    }
}

pub(crate) fn not_prepared() -> ProvisionError {
    ProvisionError::infrastructure("sandbox is not prepared")
}
