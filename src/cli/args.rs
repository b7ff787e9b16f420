//! Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "registry-proxy")]
#[command(about = "Pull-through cache for container image registries")]
#[command(version)]
pub struct Args {
    /// Proxy configuration file (JSON). Without one, PROXY_* environment variables are used
    #[arg(long = "config", short = 'c')]
    pub config: Option<PathBuf>,

    /// Root directory of the local registry storage
    #[arg(long = "root", short = 'r', default_value = "./registry-data")]
    pub root: PathBuf,

    /// Verbose output
    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Only print warnings and errors
    #[arg(long = "quiet", short = 'q')]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Pull an image through the cache, fetching whatever is missing locally
    Pull {
        /// Repository name, e.g. library/redis or registry-1.docker.io/library/redis
        name: String,
        /// Tag or digest
        #[arg(default_value = "latest")]
        reference: String,
        /// Upstream host, for namespace mode
        #[arg(long = "ns")]
        ns: Option<String>,
    },
    /// List cached repositories
    Repositories {
        /// Only list repositories after this one
        #[arg(long = "last")]
        last: Option<String>,
        /// Maximum number of repositories
        #[arg(short = 'n', long = "limit", default_value = "100")]
        n: usize,
    },
    /// List every blob in local storage
    Blobs,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Command::Repositories { n: 0, .. } = self.command {
            return Err("Repository limit must be greater than 0".to_string());
        }
        if let Command::Pull { name, .. } = &self.command {
            if name.is_empty() {
                return Err("Repository name cannot be empty".to_string());
            }
        }
        Ok(())
    }
}
