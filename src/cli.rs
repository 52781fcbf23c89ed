use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "gatekeeper",
    about = "Sandboxed vault access and SkyPilot cluster provisioning"
)]
pub struct Cli {
    /// Path to config file (default: gatekeeper.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check cloud credentials and toolchain availability
    Check,

    /// Show cluster status
    Status {
        /// Query the cloud provider instead of trusting local state
        #[arg(long)]
        refresh: bool,
    },

    /// Launch the cluster, streaming progress until it is up
    Launch {
        /// Cloud provider (e.g. aws, gcp)
        #[arg(long)]
        cloud: Option<String>,

        /// Provider region
        #[arg(long)]
        region: Option<String>,

        /// Exact instance type (overrides cpus/memory)
        #[arg(long)]
        instance_type: Option<String>,

        /// CPU requirement, e.g. "4+"
        #[arg(long)]
        cpus: Option<String>,

        /// Memory requirement in GB, e.g. "16+"
        #[arg(long)]
        memory: Option<String>,

        /// Disk size in GB
        #[arg(long)]
        disk_size: Option<u32>,

        /// Use spot instances
        #[arg(long)]
        spot: bool,
    },

    /// Stop the running cluster (instances survive, billing mostly stops)
    Stop,

    /// Tear the cluster down completely
    Destroy,

    /// Install the uv + SkyPilot toolchain under ~/.carapace
    Install,

    /// Show what is installed under ~/.carapace
    InstallStatus,

    /// Read a vault file (path like public/notes/readme.txt)
    Read { path: String },

    /// List files in the vaults visible under the current mode
    List,
}
