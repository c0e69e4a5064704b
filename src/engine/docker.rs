//! [`ContainerEngine`] backed by the `docker` command line client.

use super::{ContainerEngine, ImageConfig};
use crate::error::{ProvisionError, Result};
use crate::process_guard::{self, StepIo};
use std::process::Command;
use tracing::debug;

/// Drives containers through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Build a client and make sure the daemon answers.
    pub fn connect(binary: impl Into<String>) -> Result<Self> {
        let client = Self::new(binary);
        let version = client.server_version()?;
        debug!(version = %version, "connected to docker");
        Ok(client)
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run a management command and return its stdout; any non-zero status
    /// is an infrastructure error carrying docker's stderr.
    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);

        let mut io = StepIo::capture();
        if let Some(bytes) = stdin {
            io = io.with_stdin(bytes);
        }

        debug!(binary = %self.binary, ?args, "docker");
        let status = process_guard::run_tracked(&mut cmd, &mut io).map_err(|e| {
            ProvisionError::infrastructure(format!("failed to run '{}': {}", self.binary, e))
        })?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(io.stderr.captured()).trim().to_string();
            return Err(ProvisionError::infrastructure(format!(
                "'{} {}' failed ({}): {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                status,
                stderr
            )));
        }

        Ok(io.stdout.into_captured())
    }

    fn run_text(&self, args: &[&str]) -> Result<String> {
        let stdout = self.run(args, None)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_DOCKER_BINARY)
    }
}

impl ContainerEngine for DockerCli {
    fn server_version(&self) -> Result<String> {
        self.run_text(&["version", "--format", "{{.Server.Version}}"])
    }

    fn list_images(&self, reference: &str) -> Result<Vec<String>> {
        let listing = self.run_text(&["images", "--no-trunc", "--quiet", reference])?;
        let mut ids: Vec<String> = Vec::new();
        for id in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    fn pull_image(&self, reference: &str) -> Result<()> {
        self.run(&["pull", "--quiet", reference], None).map(|_| ())
    }

    fn inspect_image(&self, image_id: &str) -> Result<ImageConfig> {
        let json = self.run_text(&["image", "inspect", "--format", "{{json .Config}}", image_id])?;
        Ok(serde_json::from_str(&json)?)
    }

    fn create_container(&self, image_id: &str, command: &[String]) -> Result<String> {
        let mut args = vec!["create", "--entrypoint", "", image_id];
        args.extend(command.iter().map(String::as_str));
        let id = self.run_text(&args)?;
        if id.is_empty() {
            return Err(ProvisionError::infrastructure(
                "docker create returned no container id",
            ));
        }
        Ok(id)
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        self.run(&["start", container_id], None).map(|_| ())
    }

    fn exec(&self, container_id: &str, argv: &[String], io: &mut StepIo) -> Result<i32> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec");
        if io.stdin.is_some() {
            cmd.arg("--interactive");
        }
        cmd.arg(container_id).args(argv);

        let status = process_guard::run_tracked(&mut cmd, io).map_err(|e| {
            ProvisionError::infrastructure(format!("failed to run '{} exec': {}", self.binary, e))
        })?;

        process_guard::exit_code(status).ok_or_else(|| {
            ProvisionError::infrastructure(format!("exit status unavailable: {}", status))
        })
    }

    fn download(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let source = format!("{}:{}", container_id, path);
        self.run(&["cp", &source, "-"], None)
    }

    fn upload(&self, container_id: &str, dir: &str, archive: &[u8]) -> Result<()> {
        let target = format!("{}:{}", container_id, dir);
        self.run(&["cp", "-", &target], Some(archive)).map(|_| ())
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        self.run(&["rm", "--force", container_id], None).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_infrastructure_error() {
        let docker = DockerCli::new("/nonexistent/docker");
        let err = docker.server_version().unwrap_err();
        assert!(matches!(err, ProvisionError::Infrastructure(_)));

        let mut io = StepIo::capture();
        let err = docker
            .exec("abc", &["true".to_string()], &mut io)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Infrastructure(_)));
    }

    #[test]
    fn test_failing_management_call_reports_stderr() {
        // `sh` stands in for docker: "images ..." is not a script it can run
        let docker = DockerCli::new("sh");
        let err = docker.list_images("busybox:latest").unwrap_err();
        assert!(matches!(err, ProvisionError::Infrastructure(_)));
    }

    #[test]
    fn test_image_config_from_inspect_json() {
        let config: ImageConfig =
            serde_json::from_str(r#"{"Entrypoint":["/bin/provider"],"WorkingDir":"/work","Env":[]}"#)
                .unwrap();
        assert_eq!(config.entrypoint, Some(vec!["/bin/provider".to_string()]));
        assert_eq!(config.working_dir, "/work");

        let config: ImageConfig =
            serde_json::from_str(r#"{"Entrypoint":null,"WorkingDir":""}"#).unwrap();
        assert_eq!(config, ImageConfig::default());
    }
}
