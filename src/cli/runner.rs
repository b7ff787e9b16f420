//! Runs a single CLI command against the pull-through cache

use crate::cli::args::{Args, Command};
use crate::config::ProxyConfig;
use crate::context::{NAME_VAR, RequestContext};
use crate::digest::{Digest, SHA256_PREFIX};
use crate::distribution::Namespace;
use crate::error::{ProxyError, Result};
use crate::logging::{LogOptions, Logger, format_size};
use crate::proxy::{NAMESPACE_PARAM, ProxyingRegistry};
use crate::reference::RepositoryName;
use crate::storage::{FilesystemDriver, LocalRegistry, StorageDriver};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

pub struct Runner {
    args: Args,
    output: Logger,
}

#[derive(Debug, Default)]
struct PullStats {
    manifests: usize,
    blobs: usize,
    bytes: u64,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = Logger::new(LogOptions {
            verbose: args.verbose,
            quiet: args.quiet,
        });
        Self { args, output }
    }

    pub async fn run(&self) -> Result<()> {
        let start_time = Instant::now();
        self.args.validate().map_err(ProxyError::Config)?;

        let config = self.load_config()?;
        let driver: Arc<dyn StorageDriver> = Arc::new(FilesystemDriver::new(&self.args.root)?);
        let local = Arc::new(LocalRegistry::new(driver.clone()));
        let registry = ProxyingRegistry::new(local, driver, &config).await?;
        self.output.detail(&format!("Storage root: {}", self.args.root.display()));

        let outcome = match &self.args.command {
            Command::Pull { name, reference, ns } => {
                self.pull(&registry, name, reference, ns.as_deref()).await
            }
            Command::Repositories { last, n } => {
                self.list_repositories(&registry, last.as_deref(), *n).await
            }
            Command::Blobs => self.list_blobs(&registry).await,
        };
        registry.shutdown().await?;
        outcome?;

        self.output.detail(&format!(
            "Completed in {:.2}s",
            start_time.elapsed().as_secs_f64()
        ));
        Ok(())
    }

    fn load_config(&self) -> Result<ProxyConfig> {
        match &self.args.config {
            Some(path) => {
                self.output.detail(&format!("Loading configuration from {}", path.display()));
                ProxyConfig::from_file(path)
            }
            None => ProxyConfig::from_env(),
        }
    }

    async fn pull(
        &self,
        registry: &ProxyingRegistry,
        name: &str,
        reference: &str,
        ns: Option<&str>,
    ) -> Result<()> {
        self.output.section("Pull");
        let name = RepositoryName::parse(name)?;

        let mut url = Url::parse(&format!("http://localhost/v2/{}/manifests/{}", name, reference))?;
        if let Some(ns) = ns {
            url.query_pairs_mut().append_pair(NAMESPACE_PARAM, ns);
        }
        let ctx = RequestContext::for_request(url).with_var(NAME_VAR, name.as_str());
        let repository = registry.repository(&ctx, &name).await?;
        self.output.info(&format!("Repository: {}", repository.named()));

        let root = if reference.starts_with(SHA256_PREFIX) {
            Digest::parse(reference)?
        } else {
            let descriptor = repository.tags().get(reference).await?;
            self.output.detail(&format!("{} -> {}", reference, descriptor.digest));
            descriptor.digest
        };

        let manifests = repository.manifests(&[])?;
        let blobs = repository.blobs();
        let mut stats = PullStats::default();
        let mut pending = vec![root.clone()];
        while let Some(digest) = pending.pop() {
            let manifest = manifests.get(&digest).await?;
            stats.manifests += 1;
            self.output.detail(&format!(
                "Manifest {} ({})",
                digest.short(),
                manifest.media_type()
            ));

            for descriptor in manifest.references()? {
                if manifest.is_index() {
                    pending.push(descriptor.digest);
                    continue;
                }
                let mut content = blobs.open(&descriptor.digest).await?;
                let mut size = 0u64;
                while let Some(chunk) = content.next().await {
                    size += chunk?.len() as u64;
                }
                stats.blobs += 1;
                stats.bytes += size;
                self.output.detail(&format!(
                    "Blob {} ({})",
                    descriptor.digest.short(),
                    format_size(size)
                ));
            }
        }

        self.output.success(&format!("Pulled {}@{}", repository.named(), root));
        self.output.summary_kv(
            "Pull Summary",
            &[
                ("Repository", repository.named().to_string()),
                ("Manifests", stats.manifests.to_string()),
                ("Blobs", stats.blobs.to_string()),
                ("Size", format_size(stats.bytes)),
            ],
        );
        Ok(())
    }

    async fn list_repositories(
        &self,
        registry: &ProxyingRegistry,
        last: Option<&str>,
        n: usize,
    ) -> Result<()> {
        let repositories = registry.repositories(last, n).await?;
        self.output.list("Cached Repositories", &repositories);
        Ok(())
    }

    async fn list_blobs(&self, registry: &ProxyingRegistry) -> Result<()> {
        let statter = registry.blob_statter();
        let mut items = Vec::new();
        let mut total = 0;
        for digest in registry.blobs().enumerate().await? {
            let descriptor = statter.stat(&digest).await?;
            total += descriptor.size;
            items.push(format!("{} ({})", digest, format_size(descriptor.size)));
        }
        self.output.list("Cached Blobs", &items);
        self.output.summary_kv(
            "Blob Summary",
            &[("Count", items.len().to_string()), ("Size", format_size(total))],
        );
        Ok(())
    }
}
