//! Host backend: steps run as plain child processes inside a fresh
//! temporary directory that becomes the operator process's working
//! directory for the lifetime of the sandbox.

use super::{ExecutionBackend, not_prepared};
use crate::archive;
use crate::error::{ProvisionError, Result};
use crate::operation::OperationSpec;
use crate::process_guard::{self, StepIo};
use crate::settings::HostSettings;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use tracing::{debug, warn};

/// The working directory is process-wide, so only one host sandbox may be
/// live at a time. A second `prepare` blocks until the first is cleaned up.
static WORKING_DIR_LOCK: Mutex<()> = Mutex::new(());

/// Resources held by a prepared host sandbox.
#[derive(Debug)]
pub struct HostSandbox {
    saved_working_dir: PathBuf,
    temp_working_dir: TempDir,
    _working_dir_lock: MutexGuard<'static, ()>,
}

impl HostSandbox {
    pub fn dir(&self) -> &Path {
        self.temp_working_dir.path()
    }

    pub fn saved_working_dir(&self) -> &Path {
        &self.saved_working_dir
    }
}

#[derive(Debug)]
pub struct HostBackend {
    spec: OperationSpec,
    settings: HostSettings,
    sandbox: Option<HostSandbox>,
}

impl HostBackend {
    pub fn new(spec: OperationSpec, settings: HostSettings) -> Self {
        Self {
            spec,
            settings,
            sandbox: None,
        }
    }

    pub fn sandbox(&self) -> Option<&HostSandbox> {
        self.sandbox.as_ref()
    }

    fn dir(&self) -> Result<&Path> {
        self.sandbox.as_ref().map(HostSandbox::dir).ok_or_else(not_prepared)
    }
}

impl ExecutionBackend for HostBackend {
    fn prepare(&mut self, parameters: Option<&[u8]>) -> Result<()> {
        let lock = WORKING_DIR_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let saved_working_dir = std::env::current_dir()?;
        let temp_working_dir = tempfile::Builder::new()
            .prefix(&self.settings.temp_dir_prefix)
            .tempdir()?;
        std::env::set_current_dir(temp_working_dir.path())?;

        let dir = temp_working_dir.path().to_path_buf();
        debug!(dir = %dir.display(), "prepared host sandbox");

        self.sandbox = Some(HostSandbox {
            saved_working_dir,
            temp_working_dir,
            _working_dir_lock: lock,
        });

        if let Some(seed) = &self.spec.working_dir_seed {
            archive::extract_gz(seed, &dir)?;
        }

        if let (Some(file), Some(parameters)) = (&self.spec.parameter_file_path, parameters) {
            let path = dir.join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, parameters)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
            debug!(path = %path.display(), "wrote parameters file");
        }

        Ok(())
    }

    fn exec(&mut self, argv: &[String], io: &mut StepIo) -> Result<i32> {
        let dir = self.dir()?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProvisionError::validation("empty argument vector"))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(dir);

        debug!(command = ?argv, "run command");
        let status = process_guard::run_tracked(&mut cmd, io).map_err(|e| {
            ProvisionError::infrastructure(format!("failed to start '{}': {}", program, e))
        })?;

        process_guard::exit_code(status).ok_or_else(|| {
            ProvisionError::infrastructure(format!(
                "exit status of '{}' unavailable: {}",
                program, status
            ))
        })
    }

    fn output(&mut self) -> Result<Vec<u8>> {
        match &self.spec.result_file_path {
            Some(file) => {
                let path = self.dir()?.join(file);
                debug!(path = %path.display(), "read output from file");
                Ok(fs::read(&path)?)
            }
            None => Ok(Vec::new()),
        }
    }

    fn read_state(&mut self, persist_paths: &[String]) -> Result<Vec<u8>> {
        let dir = self.dir()?;
        let existing: Vec<&str> = persist_paths
            .iter()
            .map(String::as_str)
            .filter(|p| {
                let present = dir.join(p).exists();
                if !present {
                    debug!(path = %p, "skip storing state for missing path");
                }
                present
            })
            .collect();

        if existing.is_empty() {
            return Err(ProvisionError::EmptyInput("no files to persist".to_string()));
        }
        archive::build_from_paths(dir, &existing)
    }

    fn extract_state(&mut self, archive: &[u8], dest: &str) -> Result<()> {
        let target = self.dir()?.join(dest);
        archive::extract(archive, &target)
    }

    fn clean_up(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };

        if let Err(e) = std::env::set_current_dir(&sandbox.saved_working_dir) {
            warn!(
                dir = %sandbox.saved_working_dir.display(),
                error = %e,
                "failed to restore working directory"
            );
        }

        let dir = sandbox.temp_working_dir.path().to_path_buf();
        if let Err(e) = sandbox.temp_working_dir.close() {
            warn!(dir = %dir.display(), error = %e, "failed to remove sandbox directory");
        }
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        self.clean_up();
    }
}
