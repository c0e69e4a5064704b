//! Providers
//!
//! A provider is a container image that knows how to do one half of the
//! cluster lifecycle: build machines (`infrastructure`) or configure them
//! (`config`). Slingshot learns what an image can do by running its
//! `discover` bootstrap, then runs the declared commands by name.

use crate::backend::ImageHandle;
use crate::engine::ContainerEngine;
use crate::error::{ProvisionError, Result};
use crate::operation::{OperationSpec, ProviderCatalog};
use crate::orchestrator::CommandOrchestrator;
use crate::settings::EngineSettings;
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};
use tracing::{debug, info, warn};

/// Argument vector of the catalog bootstrap.
pub const DISCOVER_COMMAND: &str = "discover";

/// The two provider roles a cluster needs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum ProviderKind {
    #[serde(rename = "infrastructure")]
    #[strum(serialize = "infrastructure")]
    Infrastructure,
    #[serde(rename = "config")]
    #[strum(serialize = "config")]
    Config,
}

impl ProviderKind {
    /// Parse a provider role name; unknown names are `ProviderNotFound`.
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| ProvisionError::ProviderNotFound(name.to_string()))
    }
}

/// A `repository[:tag][@digest]` image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    /// Empty when the image is pinned by digest alone
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageRef {
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Split off an `@digest`, then the tag at the last `:` unless that
    /// `:` belongs to a registry port. Without either, the tag is `latest`.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProvisionError::validation("image name must not be empty"));
        }
        let invalid = || ProvisionError::validation(format!("invalid image name '{}'", name));

        let (named, digest) = match name.split_once('@') {
            Some((named, digest)) if !digest.is_empty() => (named, Some(digest)),
            Some(_) => return Err(invalid()),
            None => (name, None),
        };

        let (repository, tag) = match named.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                if tag.is_empty() {
                    return Err(invalid());
                }
                (repository, tag)
            }
            _ if digest.is_some() => (named, ""),
            _ => (named, Self::DEFAULT_TAG),
        };
        if repository.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.map(str::to_string),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// A provider image and its resolved command catalog.
pub struct Provider {
    kind: ProviderKind,
    engine: Arc<dyn ContainerEngine>,
    settings: Arc<EngineSettings>,
    state: StateStore,
    image: Option<(ImageRef, ImageHandle)>,
    catalog: ProviderCatalog,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("kind", &self.kind)
            .field("image", &self.image)
            .field("state", &self.state)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// An uninitialized provider whose state lives below `cluster_dir`.
    pub fn new(
        kind: ProviderKind,
        engine: Arc<dyn ContainerEngine>,
        settings: Arc<EngineSettings>,
        cluster_dir: &Path,
    ) -> Self {
        Self {
            kind,
            engine,
            settings,
            state: StateStore::for_provider(cluster_dir, &kind.to_string()),
            image: None,
            catalog: ProviderCatalog::default(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    pub fn state_path(&self) -> PathBuf {
        self.state.path().to_path_buf()
    }

    pub fn image_id(&self) -> Option<&str> {
        self.image.as_ref().map(|(_, handle)| handle.image_id.as_str())
    }

    /// Resolve `image_name` to a local image (pulling it once if needed)
    /// and load its command catalog.
    pub fn init_image(&mut self, image_name: &str) -> Result<()> {
        let reference = ImageRef::parse(image_name)?;
        let image_id = resolve_image(self.engine.as_ref(), &reference)?;
        info!(
            provider = %self.kind,
            image = %reference,
            id = %short_id(&image_id),
            "using provider image"
        );

        let handle = ImageHandle {
            engine: self.engine.clone(),
            image_id,
        };
        let catalog = discover(&handle, &self.settings)?;
        self.check_declared_kind(&catalog)?;
        self.catalog = catalog;
        debug!(
            provider = %self.kind,
            commands = ?self.catalog.command_names().collect::<Vec<_>>(),
            "discovered commands"
        );
        self.image = Some((reference, handle));
        Ok(())
    }

    /// An image may declare its role. An unknown role is rejected, a
    /// different known role only warned about.
    fn check_declared_kind(&self, catalog: &ProviderCatalog) -> Result<()> {
        let declared = catalog.meta.provider_type.trim();
        if declared.is_empty() {
            return Ok(());
        }
        let kind = ProviderKind::from_name(declared)?;
        if kind != self.kind {
            warn!(
                provider = %self.kind,
                declared = %kind,
                "image declares a different provider type"
            );
        }
        Ok(())
    }

    /// Run the catalog command `name` with `parameters` and return its output.
    pub fn run_command(&self, name: &str, parameters: Option<&[u8]>) -> Result<Vec<u8>> {
        let Some((_, handle)) = &self.image else {
            return Err(ProvisionError::ProviderNotInitialized(self.kind.to_string()));
        };
        let spec = self
            .catalog
            .get(name)
            .ok_or_else(|| ProvisionError::CommandNotFound {
                provider: self.kind.to_string(),
                name: name.to_string(),
            })?;

        info!(provider = %self.kind, command = name, "running provider command");
        let orchestrator = CommandOrchestrator::new(
            spec.clone(),
            &self.settings,
            Some(handle),
            Some(self.state.clone()),
        )?;
        orchestrator.run(parameters)
    }
}

/// Local image ID for `reference`, pulling it once if it is not present.
///
/// Fails if the pull did not produce a local image or if more than one
/// local image carries the reference.
pub fn resolve_image(engine: &dyn ContainerEngine, reference: &ImageRef) -> Result<String> {
    let name = reference.to_string();
    let mut ids = engine.list_images(&name)?;

    if ids.is_empty() {
        info!(image = %name, "pulling provider image");
        engine.pull_image(&name)?;
        ids = engine.list_images(&name)?;
    }

    match ids.len() {
        0 => Err(ProvisionError::ImageNotFound(name)),
        1 => Ok(ids.remove(0)),
        count => Err(ProvisionError::AmbiguousImage { image: name, count }),
    }
}

/// Ask an image for its catalog by running its `discover` bootstrap.
pub fn discover(image: &ImageHandle, settings: &EngineSettings) -> Result<ProviderCatalog> {
    let orchestrator =
        CommandOrchestrator::new(OperationSpec::discover(), settings, Some(image), None)?;
    let out = orchestrator.execute(&[DISCOVER_COMMAND.to_string()])?;

    if out.exit_code != 0 {
        return Err(ProvisionError::DiscoverFailed {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    ProviderCatalog::parse(&out.stdout)
}

fn short_id(image_id: &str) -> &str {
    let hex = image_id.strip_prefix("sha256:").unwrap_or(image_id);
    hex.get(..12).unwrap_or(hex)
}
