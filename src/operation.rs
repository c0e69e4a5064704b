//! Provider command catalog
//!
//! A provider answers `discover` with a YAML document declaring the named
//! operations it supports:
//!
//! ```yaml
//! provider:
//!   type: infrastructure
//!   version: 1
//! commands:
//!   apply:
//!     type: docker
//!     parameterFile: parameters.yaml
//!     resultFile: output.yaml
//!     persistPaths: [terraform.tfstate]
//!     execs:
//!       - [terraform, apply, -auto-approve]
//! ```
//!
//! Each entry becomes an immutable [`OperationSpec`]. Lookup happens by name
//! at call time; the set of commands is whatever the image declared.

use crate::error::{ProvisionError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Where an operation's steps run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum BackendKind {
    /// Directly on the operator's machine, inside a temporary directory
    #[serde(rename = "host")]
    #[strum(serialize = "host")]
    Host,
    /// Inside a container created from the provider's image
    #[serde(rename = "docker")]
    #[strum(serialize = "docker")]
    Container,
}

/// Declarative description of one named provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// Where the parameter document is written inside the sandbox
    #[serde(default, rename = "parameterFile")]
    pub parameter_file_path: Option<String>,

    /// Where the operation leaves its output inside the sandbox
    #[serde(default, rename = "resultFile")]
    pub result_file_path: Option<String>,

    /// Sandbox paths carried over between runs
    #[serde(default)]
    pub persist_paths: Vec<String>,

    /// gzip-compressed tar unpacked into the working directory before any step
    #[serde(
        default,
        rename = "workingDirContent",
        deserialize_with = "deserialize_base64"
    )]
    pub working_dir_seed: Option<Vec<u8>>,

    /// Argument vectors, run in order
    #[serde(default, rename = "execs")]
    pub steps: Vec<Vec<String>>,
}

impl OperationSpec {
    /// A bare operation with no files, state or steps.
    pub fn bare(kind: BackendKind) -> Self {
        Self {
            kind,
            parameter_file_path: None,
            result_file_path: None,
            persist_paths: Vec::new(),
            working_dir_seed: None,
            steps: Vec::new(),
        }
    }

    /// The transient operation used to ask an image for its catalog.
    pub fn discover() -> Self {
        Self::bare(BackendKind::Container)
    }

    pub fn with_steps(mut self, steps: Vec<Vec<String>>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_persist_paths(mut self, paths: Vec<String>) -> Self {
        self.persist_paths = paths;
        self
    }

    pub fn with_parameter_file(mut self, path: impl Into<String>) -> Self {
        self.parameter_file_path = Some(path.into());
        self
    }

    pub fn with_result_file(mut self, path: impl Into<String>) -> Self {
        self.result_file_path = Some(path.into());
        self
    }

    pub fn with_working_dir_seed(mut self, seed: Vec<u8>) -> Self {
        self.working_dir_seed = Some(seed);
        self
    }

    pub fn persists_state(&self) -> bool {
        !self.persist_paths.is_empty()
    }

    /// Reject operations that could never run.
    pub fn validate(&self, name: &str) -> Result<()> {
        if let Some(step) = self.steps.iter().position(|argv| argv.is_empty()) {
            return Err(ProvisionError::validation(format!(
                "command '{}': step {} has an empty argument vector",
                name, step
            )));
        }
        Ok(())
    }
}

/// Identity a provider reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderMeta {
    #[serde(default, rename = "type")]
    pub provider_type: String,
    #[serde(default, deserialize_with = "deserialize_version")]
    pub version: String,
}

/// The command set a provider image declares via `discover`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderCatalog {
    #[serde(default, rename = "provider")]
    pub meta: ProviderMeta,
    #[serde(default)]
    pub commands: BTreeMap<String, OperationSpec>,
}

impl ProviderCatalog {
    /// Parse and validate a discover response.
    pub fn parse(content: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(content)?;
        for (name, spec) in &catalog.commands {
            spec.validate(name)?;
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&OperationSpec> {
        self.commands.get(name)
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

fn deserialize_base64<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        None => Ok(None),
        Some(text) => {
            // block scalars wrap the payload over several lines
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            if compact.is_empty() {
                return Ok(None);
            }
            STANDARD
                .decode(compact.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}

fn deserialize_version<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "provider version must be a scalar, got {:?}",
            other
        ))),
    }
}
