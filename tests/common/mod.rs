//! Shared test fixtures
//!
//! `FakeEngine` implements `ContainerEngine` without a container runtime:
//! every container is a directory standing in for its root filesystem, and
//! `exec` dispatches to a closure registered for the container's image.

#![allow(dead_code)]

use slingshot::archive;
use slingshot::engine::{ContainerEngine, ImageConfig};
use slingshot::error::{ProvisionError, Result};
use slingshot::process_guard::StepIo;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// What an exec handler gets to see.
pub struct ExecContext<'a> {
    /// Host directory standing in for the container's `/`
    pub root: &'a Path,
    /// Full argument vector, entrypoint included
    pub argv: &'a [String],
}

impl ExecContext<'_> {
    /// Host location of an absolute container path.
    pub fn path(&self, container_path: &str) -> PathBuf {
        self.root.join(container_path.trim_start_matches('/'))
    }

    /// Argument after the entrypoint, i.e. the provider command.
    pub fn command(&self) -> &str {
        self.argv.last().map(String::as_str).unwrap_or_default()
    }
}

pub type ExecHandler = Arc<dyn Fn(&ExecContext<'_>, &mut StepIo) -> i32 + Send + Sync>;

struct Container {
    image_id: String,
    root: PathBuf,
    started: bool,
}

#[derive(Default)]
struct Registry {
    local: HashMap<String, Vec<String>>,
    remote: HashMap<String, String>,
    configs: HashMap<String, ImageConfig>,
    handlers: HashMap<String, ExecHandler>,
    containers: HashMap<String, Container>,
}

pub struct FakeEngine {
    dir: TempDir,
    registry: Mutex<Registry>,
    next_id: AtomicUsize,
    pulls: AtomicUsize,
    removed: Mutex<Vec<String>>,
    execs: Mutex<Vec<Vec<String>>>,
    fail_start: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicUsize::new(1),
            pulls: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            fail_start: false,
        }
    }

    /// An image present locally under `reference`.
    pub fn with_image(self, reference: &str, image_id: &str, config: ImageConfig) -> Self {
        {
            let mut registry = self.registry.lock().unwrap();
            registry
                .local
                .entry(reference.to_string())
                .or_default()
                .push(image_id.to_string());
            registry.configs.insert(image_id.to_string(), config);
        }
        self
    }

    /// An image that only becomes local after a pull.
    pub fn with_remote_image(self, reference: &str, image_id: &str, config: ImageConfig) -> Self {
        {
            let mut registry = self.registry.lock().unwrap();
            registry
                .remote
                .insert(reference.to_string(), image_id.to_string());
            registry.configs.insert(image_id.to_string(), config);
        }
        self
    }

    /// Local image whose configuration cannot be inspected.
    pub fn with_uninspectable_image(self, reference: &str, image_id: &str) -> Self {
        self.registry
            .lock()
            .unwrap()
            .local
            .entry(reference.to_string())
            .or_default()
            .push(image_id.to_string());
        self
    }

    pub fn on_exec<F>(self, image_id: &str, handler: F) -> Self
    where
        F: Fn(&ExecContext<'_>, &mut StepIo) -> i32 + Send + Sync + 'static,
    {
        self.registry
            .lock()
            .unwrap()
            .handlers
            .insert(image_id.to_string(), Arc::new(handler));
        self
    }

    pub fn with_failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn live_containers(&self) -> usize {
        self.registry.lock().unwrap().containers.len()
    }

    /// Every argument vector run so far, in order.
    pub fn execs(&self) -> Vec<Vec<String>> {
        self.execs.lock().unwrap().clone()
    }

    fn container_root(&self, container_id: &str) -> Result<PathBuf> {
        self.registry
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.root.clone())
            .ok_or_else(|| ProvisionError::infrastructure(format!("no such container: {}", container_id)))
    }
}

fn host_path(root: &Path, container_path: &str) -> PathBuf {
    root.join(container_path.trim_start_matches('/'))
}

impl ContainerEngine for FakeEngine {
    fn server_version(&self) -> Result<String> {
        Ok("fake".to_string())
    }

    fn list_images(&self, reference: &str) -> Result<Vec<String>> {
        Ok(self
            .registry
            .lock()
            .unwrap()
            .local
            .get(reference)
            .cloned()
            .unwrap_or_default())
    }

    fn pull_image(&self, reference: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let mut registry = self.registry.lock().unwrap();
        if let Some(id) = registry.remote.remove(reference) {
            registry.local.entry(reference.to_string()).or_default().push(id);
        }
        Ok(())
    }

    fn inspect_image(&self, image_id: &str) -> Result<ImageConfig> {
        self.registry
            .lock()
            .unwrap()
            .configs
            .get(image_id)
            .cloned()
            .ok_or_else(|| ProvisionError::infrastructure(format!("no such image: {}", image_id)))
    }

    fn create_container(&self, image_id: &str, _command: &[String]) -> Result<String> {
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let root = self.dir.path().join(&id);
        fs::create_dir_all(&root)?;
        self.registry.lock().unwrap().containers.insert(
            id.clone(),
            Container {
                image_id: image_id.to_string(),
                root,
                started: false,
            },
        );
        Ok(id)
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        if self.fail_start {
            return Err(ProvisionError::infrastructure("container failed to start"));
        }
        let mut registry = self.registry.lock().unwrap();
        let container = registry
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ProvisionError::infrastructure("no such container"))?;
        container.started = true;
        Ok(())
    }

    fn exec(&self, container_id: &str, argv: &[String], io: &mut StepIo) -> Result<i32> {
        let (root, handler) = {
            let registry = self.registry.lock().unwrap();
            let container = registry
                .containers
                .get(container_id)
                .filter(|c| c.started)
                .ok_or_else(|| ProvisionError::infrastructure("container is not running"))?;
            (
                container.root.clone(),
                registry.handlers.get(&container.image_id).cloned(),
            )
        };
        self.execs.lock().unwrap().push(argv.to_vec());

        match handler {
            Some(handler) => Ok(handler(&ExecContext { root: &root, argv }, io)),
            None => {
                io.write_stderr(b"executable file not found\n");
                Ok(127)
            }
        }
    }

    fn download(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let root = self.container_root(container_id)?;
        let source = host_path(&root, path.trim_end_matches('/'));
        if !source.exists() {
            return Err(ProvisionError::infrastructure(format!(
                "Could not find the file {} in container {}",
                path, container_id
            )));
        }
        let parent = source.parent().unwrap_or(&root).to_path_buf();
        let name = source.file_name().unwrap().to_string_lossy().into_owned();
        archive::build_from_paths(&parent, &[name])
    }

    fn upload(&self, container_id: &str, dir: &str, tar: &[u8]) -> Result<()> {
        let root = self.container_root(container_id)?;
        let target = host_path(&root, dir);
        fs::create_dir_all(&target)?;
        archive::extract(tar, &target)
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        let container = self
            .registry
            .lock()
            .unwrap()
            .containers
            .remove(container_id)
            .ok_or_else(|| ProvisionError::infrastructure("no such container"))?;
        fs::remove_dir_all(&container.root)?;
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

/// Image configuration with an entrypoint and working directory.
pub fn image_config(entrypoint: &[&str], working_dir: &str) -> ImageConfig {
    ImageConfig {
        entrypoint: Some(entrypoint.iter().map(|s| s.to_string()).collect()),
        working_dir: working_dir.to_string(),
    }
}

pub fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Gzip-compressed archive of `files`, as a catalog seed.
pub fn gzip_seed(files: &[(&str, &str)]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    for (name, body) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }
    let names: Vec<&str> = files.iter().map(|(name, _)| *name).collect();
    let tar = archive::build_from_paths(dir.path(), &names).unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}
