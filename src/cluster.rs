//! Cluster definitions on disk
//!
//! Each cluster owns a directory below the configuration root:
//!
//! ```text
//! ~/.slingshot/<name>/
//!     cluster.yaml                  definition (parameters, provider images)
//!     inventory.yaml                machines of the last successful infra apply
//!     provider-infrastructure.tar   persisted provider state
//!     provider-config.tar
//! ```
//!
//! Everything in it is private to the operator.

use crate::error::{PipelineErrors, ProvisionError, Result};
use crate::parameters::ParameterDocument;
use crate::provider::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CLUSTER_FILE_NAME: &str = "cluster.yaml";
pub const INVENTORY_FILE_NAME: &str = "inventory.yaml";
pub const CONFIG_DIR_NAME: &str = ".slingshot";
pub const CLUSTER_FILE_VERSION: &str = "1";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Content of `cluster.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub version: String,
    #[serde(default)]
    pub parameters: ParameterDocument,
    #[serde(default)]
    pub provider_image_names: BTreeMap<ProviderKind, String>,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    name: String,
    dir: PathBuf,
    config: ClusterConfig,
}

impl Cluster {
    /// Define a new cluster below `root` and write its `cluster.yaml`.
    ///
    /// Problems with the name and every missing provider image are
    /// reported together.
    pub fn create(
        root: &Path,
        name: &str,
        images: &BTreeMap<ProviderKind, String>,
        mut parameters: ParameterDocument,
    ) -> std::result::Result<Self, PipelineErrors> {
        let mut errors = PipelineErrors::new();
        errors.extend(validate_name(name));
        for kind in [ProviderKind::Infrastructure, ProviderKind::Config] {
            if images.get(&kind).is_none_or(|image| image.trim().is_empty()) {
                errors.push(ProvisionError::validation(format!(
                    "{} provider image must be specified",
                    kind
                )));
            }
        }
        errors.extend(parameters.validate());
        errors.into_result()?;

        let dir = root.join(name);
        if dir.join(CLUSTER_FILE_NAME).exists() {
            return Err(ProvisionError::validation(format!(
                "cluster with the name '{}' already exists",
                name
            ))
            .into());
        }

        parameters.set_path(
            &["general", "cluster", "name"],
            serde_yaml::Value::from(name),
        );

        let cluster = Self {
            name: name.to_string(),
            dir,
            config: ClusterConfig {
                version: CLUSTER_FILE_VERSION.to_string(),
                parameters,
                provider_image_names: images.clone(),
            },
        };
        cluster.write_config()?;
        info!(cluster = %cluster.name, dir = %cluster.dir.display(), "created cluster");
        Ok(cluster)
    }

    /// Read an existing cluster definition.
    pub fn load(root: &Path, name: &str) -> Result<Self> {
        if let Some(err) = validate_name(name).into_iter().next() {
            return Err(err);
        }

        let dir = root.join(name);
        let path = dir.join(CLUSTER_FILE_NAME);
        let content = fs::read(&path).map_err(|e| {
            ProvisionError::config(format!(
                "cannot read cluster '{}' from {}: {}",
                name,
                path.display(),
                e
            ))
        })?;
        let config: ClusterConfig = serde_yaml::from_slice(&content)?;
        debug!(cluster = name, path = %path.display(), "loaded cluster");

        Ok(Self {
            name: name.to_string(),
            dir,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn parameters(&self) -> &ParameterDocument {
        &self.config.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterDocument {
        &mut self.config.parameters
    }

    pub fn image_name(&self, kind: ProviderKind) -> Option<&str> {
        self.config
            .provider_image_names
            .get(&kind)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.dir.join(CLUSTER_FILE_NAME)
    }

    pub fn inventory_file_path(&self) -> PathBuf {
        self.dir.join(INVENTORY_FILE_NAME)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        ensure_directory(&self.dir)
    }

    pub fn write_config(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.config)?;
        self.ensure_dir()?;
        write_private(&self.config_file_path(), yaml.as_bytes())
    }

    /// Snapshot the parameter document's inventory.
    pub fn write_inventory(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.config.parameters.inventory())?;
        self.ensure_dir()?;
        write_private(&self.inventory_file_path(), yaml.as_bytes())
    }

    /// The inventory written by the last successful apply.
    pub fn read_inventory(&self) -> Result<serde_yaml::Value> {
        let content = fs::read(self.inventory_file_path())?;
        Ok(serde_yaml::from_slice(&content)?)
    }
}

/// Cluster names become directory names: lowercase letters, digits, `-`.
pub fn validate_name(name: &str) -> Vec<ProvisionError> {
    let mut errors = Vec::new();
    if name.is_empty() {
        errors.push(ProvisionError::validation("cluster name must not be empty"));
    } else if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        errors.push(ProvisionError::validation(format!(
            "cluster name '{}' may only contain lowercase letters, digits and '-'",
            name
        )));
    }
    errors
}

/// `$HOME/.slingshot`
pub fn default_config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(CONFIG_DIR_NAME))
}

/// Create `path` (and parents) readable by the owner only.
pub fn ensure_directory(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)?;
    Ok(())
}

fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.write_all(content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))?;
    debug!(path = %path.display(), "wrote file");
    Ok(())
}
