//! Container backend: one container per sandbox, kept alive by a placeholder
//! command while steps are run inside it with `exec`.

use super::{ExecutionBackend, ImageHandle, not_prepared};
use crate::archive;
use crate::error::{ProvisionError, Result};
use crate::operation::OperationSpec;
use crate::process_guard::StepIo;
use crate::settings::ContainerSettings;
use std::path::{Component, Path};
use tracing::{debug, warn};

/// A running container plus what was learned about its image.
#[derive(Debug, Clone)]
pub struct ContainerSandbox {
    pub container_id: String,
    /// Prefixed to every step unless the settings override it
    pub entrypoint: Vec<String>,
    /// Absolute directory inside the container all relative paths resolve against
    pub working_dir: String,
}

impl ContainerSandbox {
    fn path(&self, relative: &str) -> String {
        container_path(&self.working_dir, relative)
    }
}

#[derive(Debug)]
pub struct ContainerBackend {
    spec: OperationSpec,
    image: ImageHandle,
    settings: ContainerSettings,
    sandbox: Option<ContainerSandbox>,
}

impl ContainerBackend {
    pub fn new(spec: OperationSpec, image: ImageHandle, settings: ContainerSettings) -> Self {
        Self {
            spec,
            image,
            settings,
            sandbox: None,
        }
    }

    pub fn sandbox(&self) -> Option<&ContainerSandbox> {
        self.sandbox.as_ref()
    }

    fn require_sandbox(&self) -> Result<&ContainerSandbox> {
        self.sandbox.as_ref().ok_or_else(not_prepared)
    }

    /// Entrypoint and working directory of the image, or the configured
    /// defaults when the image cannot be inspected.
    fn image_layout(&self) -> (Vec<String>, String) {
        match self.image.engine.inspect_image(&self.image.image_id) {
            Ok(config) => {
                let working_dir = if config.working_dir.is_empty() {
                    self.settings.default_working_dir.clone()
                } else {
                    config.working_dir
                };
                (config.entrypoint.unwrap_or_default(), working_dir)
            }
            Err(e) => {
                warn!(
                    image = %self.image.image_id,
                    error = %e,
                    "could not inspect image, using default entrypoint"
                );
                (
                    self.settings.default_entrypoint.clone(),
                    self.settings.default_working_dir.clone(),
                )
            }
        }
    }

    fn upload_file(&self, sandbox: &ContainerSandbox, relative: &str, body: &[u8]) -> Result<()> {
        let full = sandbox.path(relative);
        let full = Path::new(&full);
        let name = full
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProvisionError::validation(format!("'{}' is not a file path", relative)))?;
        let dir = full
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| sandbox.working_dir.clone());

        let tar = archive::build_single_file(name, body, 0o644)?;
        self.image
            .engine
            .upload(&sandbox.container_id, &dir, &tar)
    }
}

impl ExecutionBackend for ContainerBackend {
    fn prepare(&mut self, parameters: Option<&[u8]>) -> Result<()> {
        let (entrypoint, working_dir) = self.image_layout();
        let engine = self.image.engine.clone();

        let container_id =
            engine.create_container(&self.image.image_id, &self.settings.placeholder_command)?;
        debug!(container = %container_id, image = %self.image.image_id, "created container");

        // recorded before start so clean_up removes it even if start fails
        let sandbox = ContainerSandbox {
            container_id,
            entrypoint,
            working_dir,
        };
        self.sandbox = Some(sandbox.clone());

        engine.start_container(&sandbox.container_id)?;

        if let Some(seed) = &self.spec.working_dir_seed {
            let tar = archive::gunzip(seed)?;
            engine.upload(&sandbox.container_id, &sandbox.working_dir, &tar)?;
        }

        if let (Some(file), Some(parameters)) = (&self.spec.parameter_file_path, parameters) {
            self.upload_file(&sandbox, file, parameters)?;
            debug!(path = %sandbox.path(file), "wrote parameters file");
        }

        Ok(())
    }

    fn exec(&mut self, argv: &[String], io: &mut StepIo) -> Result<i32> {
        let sandbox = self.require_sandbox()?;
        if argv.is_empty() {
            return Err(ProvisionError::validation("empty argument vector"));
        }

        let prefix = self
            .settings
            .entrypoint_override
            .as_ref()
            .unwrap_or(&sandbox.entrypoint);
        let command: Vec<String> = prefix.iter().chain(argv).cloned().collect();

        debug!(container = %sandbox.container_id, ?command, "run command");
        self.image
            .engine
            .exec(&sandbox.container_id, &command, io)
    }

    fn output(&mut self) -> Result<Vec<u8>> {
        let Some(file) = &self.spec.result_file_path else {
            return Ok(Vec::new());
        };
        let sandbox = self.require_sandbox()?;
        let path = sandbox.path(file);

        debug!(path = %path, "read output from file");
        let tar = self.image.engine.download(&sandbox.container_id, &path)?;
        let (body, _) = archive::first_file(&tar)?;
        Ok(body)
    }

    fn read_state(&mut self, persist_paths: &[String]) -> Result<Vec<u8>> {
        let sandbox = self.require_sandbox()?;
        let mut archives = Vec::new();

        for relative in persist_paths {
            let path = sandbox.path(relative);
            match self.image.engine.download(&sandbox.container_id, &path) {
                Ok(tar) if is_working_dir(relative) => {
                    // named `<working dir>/...`, restored into the working dir
                    archives.push(archive::strip_root(&tar)?);
                }
                Ok(tar) => {
                    // downloads are named after their last component only
                    let parent = Path::new(relative.trim_end_matches('/'))
                        .parent()
                        .unwrap_or(Path::new(""));
                    archives.push(archive::rebase(&tar, parent)?);
                }
                Err(e) => debug!(path = %path, error = %e, "skip storing state"),
            }
        }

        if archives.is_empty() {
            return Err(ProvisionError::EmptyInput("no files to persist".to_string()));
        }
        archive::merge(&archives)
    }

    fn extract_state(&mut self, archive: &[u8], dest: &str) -> Result<()> {
        let sandbox = self.require_sandbox()?;
        let dir = sandbox.path(dest);
        self.image
            .engine
            .upload(&sandbox.container_id, &dir, archive)
    }

    fn clean_up(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        if let Err(e) = self.image.engine.remove_container(&sandbox.container_id) {
            warn!(container = %sandbox.container_id, error = %e, "failed to remove container");
        } else {
            debug!(container = %sandbox.container_id, "removed container");
        }
    }
}

impl Drop for ContainerBackend {
    fn drop(&mut self) {
        self.clean_up();
    }
}

/// Whether `relative` names the working directory itself (`.`, `./`, ``).
fn is_working_dir(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .all(|c| matches!(c, Component::CurDir))
}

/// Resolve `relative` against the container's working directory.
fn container_path(working_dir: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches("./");
    if relative.is_empty() || relative == "." {
        return working_dir.to_string();
    }
    Path::new(working_dir)
        .join(relative)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_path() {
        assert_eq!(container_path("/work", ""), "/work");
        assert_eq!(container_path("/work", "."), "/work");
        assert_eq!(container_path("/work", "params.yaml"), "/work/params.yaml");
        assert_eq!(container_path("/", "./state/tf"), "/state/tf");
        assert_eq!(container_path("/work", "state/"), "/work/state/");
    }

    #[test]
    fn test_is_working_dir() {
        assert!(is_working_dir("."));
        assert!(is_working_dir("./"));
        assert!(is_working_dir(""));
        assert!(!is_working_dir("state"));
        assert!(!is_working_dir("./state"));
    }
}
