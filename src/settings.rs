//! Engine settings that can be saved and loaded.
//!
//! The fallback values the execution backends rely on (placeholder process,
//! default entrypoint, default working directory) live here as named
//! constants and reach the backends through `EngineSettings`, never through
//! mutable globals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Binary used to talk to the container runtime.
pub const DEFAULT_DOCKER_BINARY: &str = "docker";

/// Process that keeps a sandbox container alive between execs.
pub const DEFAULT_PLACEHOLDER_COMMAND: [&str; 2] = ["/bin/sleep", "3600"];

/// Entrypoint assumed when the image cannot be inspected.
pub const DEFAULT_ENTRYPOINT: [&str; 2] = ["/bin/sh", "-c"];

/// Working directory assumed when the image cannot be inspected.
pub const DEFAULT_WORKING_DIR: &str = "/";

/// Prefix of host sandbox temporary directories.
pub const DEFAULT_TEMP_DIR_PREFIX: &str = "slingshot";

/// Container backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub docker_binary: String,
    pub placeholder_command: Vec<String>,
    pub default_entrypoint: Vec<String>,
    pub default_working_dir: String,
    /// When set, used as the exec prefix instead of the image entrypoint.
    pub entrypoint_override: Option<Vec<String>>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_binary: DEFAULT_DOCKER_BINARY.to_string(),
            placeholder_command: to_strings(&DEFAULT_PLACEHOLDER_COMMAND),
            default_entrypoint: to_strings(&DEFAULT_ENTRYPOINT),
            default_working_dir: DEFAULT_WORKING_DIR.to_string(),
            entrypoint_override: None,
        }
    }
}

/// Host backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub temp_dir_prefix: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            temp_dir_prefix: DEFAULT_TEMP_DIR_PREFIX.to_string(),
        }
    }
}

/// Settings shared by every orchestrated run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub container: ContainerSettings,
    pub host: HostSettings,
    /// Stop a step sequence at the first non-zero exit code.
    ///
    /// Off by default: only infrastructure errors stop a sequence.
    pub strict_exit_codes: bool,
}

impl EngineSettings {
    /// Save settings to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize settings to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load settings from a JSON file; missing keys take their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path.as_ref()))?;

        let settings: Self =
            serde_json::from_str(&content).context("Failed to parse settings JSON")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.container.docker_binary.trim().is_empty() {
            anyhow::bail!("container.docker_binary must be specified");
        }
        if self.container.placeholder_command.is_empty() {
            anyhow::bail!("container.placeholder_command must not be empty");
        }
        if !self.container.default_working_dir.starts_with('/') {
            anyhow::bail!(
                "container.default_working_dir must be absolute, got '{}'",
                self.container.default_working_dir
            );
        }
        if matches!(&self.container.entrypoint_override, Some(e) if e.is_empty()) {
            anyhow::bail!("container.entrypoint_override must not be an empty list");
        }
        if self.host.temp_dir_prefix.contains('/') {
            anyhow::bail!("host.temp_dir_prefix cannot contain '/'");
        }
        Ok(())
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
