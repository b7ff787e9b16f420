//! Command-line entry point for the registry pull-through cache

use anyhow::Context;
use registry_proxy::cli::{Args, Runner};
use registry_proxy::logging::{self, LogOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse_args();
    logging::init(LogOptions {
        verbose: args.verbose,
        quiet: args.quiet,
    });

    let command = format!("{:?}", args.command);
    Runner::new(args)
        .run()
        .await
        .with_context(|| format!("registry-proxy failed running {}", command))
}
