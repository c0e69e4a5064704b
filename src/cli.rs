use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Slingshot - provision clusters with pluggable provider images
#[derive(Parser)]
#[command(name = "slingshot")]
#[command(about = "Provision compute clusters by chaining infrastructure and config providers")]
#[command(version)]
pub struct Cli {
    /// Directory holding cluster definitions (default: $HOME/.slingshot)
    #[arg(long, global = true, env = "SLINGSHOT_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Engine settings file (JSON)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Inspect provider images
    Provider {
        #[command(subcommand)]
        command: ProviderCommands,
    },
}

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// Define a new cluster and apply it
    Create(CreateArgs),
    /// Build the infrastructure and configure it
    Apply {
        /// Cluster name
        name: String,
    },
    /// Tear down the cluster's infrastructure
    Destroy {
        /// Cluster name
        name: String,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Cluster name (lowercase letters, digits and '-')
    pub name: String,

    /// Image of the infrastructure provider
    #[arg(long)]
    pub infrastructure_provider: Option<String>,

    /// Image of the config provider
    #[arg(long)]
    pub config_provider: Option<String>,

    /// Initial parameters (YAML)
    #[arg(short = 'f', long)]
    pub cluster_file: Option<PathBuf>,

    /// Only write the cluster definition; run `cluster apply` later
    #[arg(long)]
    pub no_apply: bool,
}

#[derive(Subcommand)]
pub enum ProviderCommands {
    /// Print the commands a provider image declares
    Discover {
        /// Image name, `repository[:tag]`
        image: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Default log filter for the requested verbosity.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
