//! Slingshot Library
//!
//! Provisions compute clusters by chaining two provider images: an
//! infrastructure provider that builds machines and a config provider that
//! configures them. Provider operations run in a sandbox, either a
//! temporary directory on the host or a container created from the
//! provider image, with selected paths persisted between runs.

pub mod archive;
pub mod backend;
pub mod cli;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod operation;
pub mod orchestrator;
pub mod parameters;
pub mod pipeline;
pub mod process_guard;
pub mod provider;
pub mod settings;
pub mod state;

// Re-export main types for convenience
pub use backend::{Backend, ExecutionBackend, ImageHandle};
pub use cluster::{Cluster, ClusterConfig};
pub use engine::{ContainerEngine, DockerCli, ImageConfig};
pub use error::{PipelineErrors, ProvisionError, Result};
pub use operation::{BackendKind, OperationSpec, ProviderCatalog, ProviderMeta};
pub use orchestrator::{CommandOrchestrator, ExecOutput, RunStage};
pub use parameters::ParameterDocument;
pub use pipeline::{ClusterPipeline, PipelineStage};
pub use process_guard::{ChildTracker, OutputSink, ShutdownGuard, SpawnInGroup, StepIo};
pub use provider::{ImageRef, Provider, ProviderKind};
pub use settings::EngineSettings;
pub use state::StateStore;
