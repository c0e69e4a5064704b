//! Slingshot - Main entry point

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use slingshot::backend::ImageHandle;
use slingshot::cli::{Cli, ClusterCommands, Commands, CreateArgs, ProviderCommands};
use slingshot::cluster::{self, Cluster};
use slingshot::engine::{ContainerEngine, DockerCli};
use slingshot::error::PipelineErrors;
use slingshot::parameters::ParameterDocument;
use slingshot::pipeline::ClusterPipeline;
use slingshot::process_guard::{self, ShutdownGuard};
use slingshot::provider::{self, ImageRef, ProviderKind};
use slingshot::settings::EngineSettings;

/// Initialize logging; `RUST_LOG` overrides the verbosity flag
fn init_logger(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.log_level());
    debug!("CLI arguments parsed");

    // Terminate provider processes if we receive SIGINT/SIGTERM
    if let Err(e) = process_guard::install_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ShutdownGuard::new();

    if let Err(e) = run(cli) {
        debug!("run failed: {:?}", e);
        if let Some(errors) = e.downcast_ref::<PipelineErrors>() {
            for err in errors.iter() {
                eprintln!("✗ {}", err);
            }
        } else {
            eprintln!("✗ {:#}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Arc::new(load_settings(cli.settings.as_deref())?);
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => cluster::default_config_dir()
            .ok_or_else(|| anyhow!("cannot determine configuration directory, HOME is not set"))?,
    };
    debug!(config_dir = %config_dir.display(), "using configuration directory");

    match cli.command {
        Commands::Cluster { command } => match command {
            ClusterCommands::Create(args) => {
                let apply = !args.no_apply;
                let cluster = create_cluster(&config_dir, args)?;
                if apply {
                    let engine = connect_engine(&settings)?;
                    apply_cluster(ClusterPipeline::new(cluster, engine, settings))?;
                }
                Ok(())
            }
            ClusterCommands::Apply { name } => {
                apply_cluster(open_pipeline(&config_dir, &name, settings)?)
            }
            ClusterCommands::Destroy { name } => {
                let mut pipeline = open_pipeline(&config_dir, &name, settings)?;
                pipeline.destroy()?;
                info!(cluster = %name, "cluster destroyed");
                println!("✓ Cluster '{}' destroyed", name);
                Ok(())
            }
        },
        Commands::Provider { command } => match command {
            ProviderCommands::Discover { image } => discover_provider(&image, &settings),
        },
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<EngineSettings> {
    match path {
        Some(path) => {
            info!("Loading settings from: {:?}", path);
            EngineSettings::load_from_file(path)
        }
        None => Ok(EngineSettings::default()),
    }
}

fn connect_engine(settings: &EngineSettings) -> anyhow::Result<Arc<dyn ContainerEngine>> {
    let docker = DockerCli::connect(settings.container.docker_binary.clone())
        .context("Docker is not reachable")?;
    Ok(Arc::new(docker))
}

fn apply_cluster(mut pipeline: ClusterPipeline) -> anyhow::Result<()> {
    pipeline.apply()?;
    let cluster = pipeline.cluster();
    info!(cluster = %cluster.name(), "cluster applied");
    println!(
        "✓ Cluster '{}' applied, inventory at {}",
        cluster.name(),
        cluster.inventory_file_path().display()
    );
    Ok(())
}

fn create_cluster(config_dir: &Path, args: CreateArgs) -> anyhow::Result<Cluster> {
    let parameters = match &args.cluster_file {
        Some(path) => read_parameters(path)?,
        None => ParameterDocument::new(),
    };

    let images: BTreeMap<_, _> = [
        (ProviderKind::Infrastructure, args.infrastructure_provider),
        (ProviderKind::Config, args.config_provider),
    ]
    .into_iter()
    .filter_map(|(kind, image)| image.map(|image| (kind, image)))
    .collect();

    cluster::ensure_directory(config_dir)?;
    let cluster = Cluster::create(config_dir, &args.name, &images, parameters)?;
    println!(
        "✓ Cluster '{}' created at {}",
        cluster.name(),
        cluster.config_file_path().display()
    );
    Ok(cluster)
}

fn read_parameters(path: &Path) -> anyhow::Result<ParameterDocument> {
    let content = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    ParameterDocument::from_bytes(&content)
        .with_context(|| format!("Failed to parse cluster file {:?}", path))
}

fn open_pipeline(
    config_dir: &Path,
    name: &str,
    settings: Arc<EngineSettings>,
) -> anyhow::Result<ClusterPipeline> {
    let cluster = Cluster::load(config_dir, name)?;
    let engine = connect_engine(&settings)?;
    Ok(ClusterPipeline::new(cluster, engine, settings))
}

fn discover_provider(image: &str, settings: &EngineSettings) -> anyhow::Result<()> {
    let engine = connect_engine(settings)?;
    let reference = ImageRef::parse(image)?;
    let image_id = provider::resolve_image(engine.as_ref(), &reference)?;
    let catalog = provider::discover(&ImageHandle { engine, image_id }, settings)?;

    println!(
        "{} provider {} (version {})",
        reference,
        if catalog.meta.provider_type.is_empty() {
            "<untyped>"
        } else {
            catalog.meta.provider_type.as_str()
        },
        if catalog.meta.version.is_empty() {
            "unknown"
        } else {
            catalog.meta.version.as_str()
        }
    );
    for (name, spec) in &catalog.commands {
        println!(
            "  {:<12} {:<7} {} step(s){}",
            name,
            spec.kind.to_string(),
            spec.steps.len(),
            if spec.persists_state() {
                format!(", persists {}", spec.persist_paths.join(" "))
            } else {
                String::new()
            }
        );
    }
    Ok(())
}
