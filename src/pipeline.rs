//! Cluster pipeline
//!
//! Sequences the two providers of a cluster:
//!
//! ```text
//! Created
//!     ↓  init providers (resolve images, discover catalogs)
//! ProvidersInitialized
//!     ↓  infrastructure apply, merge output, validate, inventory snapshot
//! InfraApplied
//!     ↓  config apply
//! ConfigApplied
//!
//! ProvidersInitialized
//!     ↓  infrastructure destroy
//! InfraDestroyed
//!
//! (Any stage can transition to Failed)
//! ```
//!
//! Independent problems are collected into one [`PipelineErrors`] list;
//! a stage that fails stops the pipeline.

use crate::cluster::Cluster;
use crate::engine::ContainerEngine;
use crate::error::{PipelineErrors, ProvisionError};
use crate::provider::{Provider, ProviderKind};
use crate::settings::EngineSettings;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const APPLY_COMMAND: &str = "apply";
pub const DESTROY_COMMAND: &str = "destroy";

type PipelineResult<T> = std::result::Result<T, PipelineErrors>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Created,
    ProvidersInitialized,
    InfraApplied,
    ConfigApplied,
    InfraDestroyed,
    Failed,
}

impl PipelineStage {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ConfigApplied | Self::InfraDestroyed | Self::Failed
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ProvidersInitialized => "providers initialized",
            Self::InfraApplied => "infrastructure applied",
            Self::ConfigApplied => "configuration applied",
            Self::InfraDestroyed => "infrastructure destroyed",
            Self::Failed => "failed",
        }
    }

    /// Whether the pipeline may move from `self` to `to`.
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::ProvidersInitialized)
                | (Self::ProvidersInitialized, Self::InfraApplied)
                | (Self::ProvidersInitialized, Self::InfraDestroyed)
                | (Self::InfraApplied, Self::ConfigApplied)
        ) || (!self.is_terminal() && matches!(to, Self::Failed))
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Runs `apply` and `destroy` for one cluster.
pub struct ClusterPipeline {
    cluster: Cluster,
    engine: Arc<dyn ContainerEngine>,
    settings: Arc<EngineSettings>,
    providers: BTreeMap<ProviderKind, Provider>,
    stage: PipelineStage,
    history: Vec<PipelineStage>,
}

impl fmt::Debug for ClusterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterPipeline")
            .field("cluster", &self.cluster.name())
            .field("stage", &self.stage)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ClusterPipeline {
    pub fn new(
        cluster: Cluster,
        engine: Arc<dyn ContainerEngine>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            cluster,
            engine,
            settings,
            providers: BTreeMap::new(),
            stage: PipelineStage::Created,
            history: vec![PipelineStage::Created],
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Every stage entered so far, starting with `Created`.
    pub fn history(&self) -> &[PipelineStage] {
        &self.history
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn into_cluster(self) -> Cluster {
        self.cluster
    }

    /// Build the infrastructure, then configure it.
    pub fn apply(&mut self) -> PipelineResult<()> {
        let result = self.run_apply();
        self.finish(result)
    }

    /// Tear the infrastructure down. The config provider is not involved.
    pub fn destroy(&mut self) -> PipelineResult<()> {
        let result = self.run_destroy();
        self.finish(result)
    }

    fn run_apply(&mut self) -> PipelineResult<()> {
        self.init_providers()?;

        let parameters = self.parameter_bytes()?;
        let output = self
            .provider(ProviderKind::Infrastructure)?
            .run_command(APPLY_COMMAND, Some(&parameters))
            .map_err(|e| e.context("error while running infrastructure provider"))?;

        self.cluster
            .parameters_mut()
            .merge_bytes(&output)
            .map_err(|e| e.context("error while reading infrastructure provider output"))?;

        let problems = self.cluster.parameters().validate();
        if !problems.is_empty() {
            return Err(PipelineErrors(problems));
        }

        self.cluster
            .write_inventory()
            .map_err(|e| e.context("error while writing inventory"))?;
        self.transition(PipelineStage::InfraApplied)?;

        let parameters = self.parameter_bytes()?;
        self.provider(ProviderKind::Config)?
            .run_command(APPLY_COMMAND, Some(&parameters))
            .map_err(|e| e.context("error while running config provider"))?;
        self.transition(PipelineStage::ConfigApplied)
    }

    fn run_destroy(&mut self) -> PipelineResult<()> {
        self.init_providers()?;

        let parameters = self.parameter_bytes()?;
        self.provider(ProviderKind::Infrastructure)?
            .run_command(DESTROY_COMMAND, Some(&parameters))
            .map_err(|e| e.context("error while running infrastructure provider"))?;
        self.transition(PipelineStage::InfraDestroyed)
    }

    /// Resolve every provider that has an image name.
    ///
    /// A missing image name only matters once a stage needs that provider.
    fn init_providers(&mut self) -> PipelineResult<()> {
        self.check_transition(PipelineStage::ProvidersInitialized)?;
        let mut errors = PipelineErrors::new();

        if let Err(e) = self.cluster.ensure_dir() {
            errors.push(e.context("error while creating cluster directory"));
            return Err(errors);
        }

        for kind in [ProviderKind::Infrastructure, ProviderKind::Config] {
            let Some(image_name) = self.cluster.image_name(kind) else {
                warn!(provider = %kind, "no image name specified, skipping provider");
                continue;
            };

            let mut provider = Provider::new(
                kind,
                self.engine.clone(),
                self.settings.clone(),
                self.cluster.dir(),
            );
            match provider.init_image(image_name) {
                Ok(()) => {
                    self.providers.insert(kind, provider);
                }
                Err(e) => {
                    errors.push(e.context(format!("error while initializing {} provider", kind)))
                }
            }
        }

        errors.into_result()?;
        self.transition(PipelineStage::ProvidersInitialized)
    }

    fn provider(&self, kind: ProviderKind) -> PipelineResult<&Provider> {
        self.providers
            .get(&kind)
            .ok_or_else(|| ProvisionError::ProviderNotInitialized(kind.to_string()).into())
    }

    fn parameter_bytes(&self) -> PipelineResult<Vec<u8>> {
        self.cluster
            .parameters()
            .to_bytes()
            .map_err(|e| e.context("error while writing parameters file").into())
    }

    fn check_transition(&self, to: PipelineStage) -> PipelineResult<()> {
        if self.stage.can_transition_to(to) {
            Ok(())
        } else {
            Err(ProvisionError::validation(format!(
                "pipeline cannot move from '{}' to '{}'",
                self.stage, to
            ))
            .into())
        }
    }

    fn transition(&mut self, to: PipelineStage) -> PipelineResult<()> {
        self.check_transition(to)?;
        info!(cluster = %self.cluster.name(), from = %self.stage, to = %to, "pipeline stage");
        self.stage = to;
        self.history.push(to);
        Ok(())
    }

    fn finish(&mut self, result: PipelineResult<()>) -> PipelineResult<()> {
        if let Err(errors) = &result {
            for e in errors.iter() {
                error!(cluster = %self.cluster.name(), stage = %self.stage, error = %e, "pipeline failed");
            }
            if !self.stage.is_terminal() {
                self.stage = PipelineStage::Failed;
                self.history.push(PipelineStage::Failed);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_transitions() {
        use PipelineStage::*;

        assert!(Created.can_transition_to(ProvidersInitialized));
        assert!(ProvidersInitialized.can_transition_to(InfraApplied));
        assert!(ProvidersInitialized.can_transition_to(InfraDestroyed));
        assert!(InfraApplied.can_transition_to(ConfigApplied));
        assert!(InfraApplied.can_transition_to(Failed));

        assert!(!Created.can_transition_to(InfraApplied));
        assert!(!ConfigApplied.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(ProvidersInitialized));
    }

    #[test]
    fn test_terminal_stages() {
        assert!(PipelineStage::ConfigApplied.is_terminal());
        assert!(PipelineStage::InfraDestroyed.is_terminal());
        assert!(PipelineStage::Failed.is_terminal());
        assert!(!PipelineStage::InfraApplied.is_terminal());
    }
}
