//! objmeta Server
//!
//! Runs the bucket metadata layer of an S3 gateway node: the metadata
//! service, the usage accountant with its background flush, and the admin
//! endpoint for health, metrics and operator calls.

mod admin;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use objmeta_cache::{CacheStore, MemoryCache, RedisCache, TimeoutCache};
use objmeta_coldstorage::{ArchiveClient, HttpArchiveClient};
use objmeta_common::{CacheEngine, Config, RequestContext};
use objmeta_meta::{MetadataService, UsageAccountant, UsageMetrics, flush_loop};
use objmeta_meta_store::{MetaStore, PersistentStore, TimeoutStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "objmeta-server")]
#[command(about = "objmeta bucket metadata and usage accounting node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/objmeta/objmeta.toml")]
    config: PathBuf,

    /// Metadata database path (overrides [store] path)
    #[arg(long, env = "OBJMETA_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Cache server URL (overrides [cache] url)
    #[arg(long, env = "OBJMETA_CACHE_URL")]
    cache_url: Option<String>,

    /// Admin endpoint listen address (overrides [admin] listen)
    #[arg(long, env = "OBJMETA_ADMIN_LISTEN")]
    admin_listen: Option<SocketAddr>,

    /// Usage flush interval in milliseconds (overrides [accounting])
    #[arg(long, env = "OBJMETA_FLUSH_INTERVAL_MS")]
    flush_interval_ms: Option<u64>,

    /// Archival service endpoint (overrides [archive] endpoint)
    #[arg(long, env = "OBJMETA_ARCHIVE_ENDPOINT")]
    archive_endpoint: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.store_path {
            config.store.path.clone_from(path);
        }
        if let Some(url) = &self.cache_url {
            config.cache.url.clone_from(url);
        }
        if let Some(listen) = self.admin_listen {
            config.admin.listen = listen;
        }
        if let Some(interval) = self.flush_interval_ms {
            config.accounting.flush_interval_ms = interval;
        }
        if let Some(endpoint) = &self.archive_endpoint {
            config.archive.endpoint = Some(endpoint.clone());
        }
    }
}

fn init_logging(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    init_logging(&args);

    let mut config = settings::load(&args.config)?;
    args.apply(&mut config);
    info!("Starting objmeta node '{}'", config.node.name);

    // Persistent store
    let meta_store = MetaStore::open(&config.store.path).with_context(|| {
        format!("failed to open metadata store at {}", config.store.path.display())
    })?;
    let store: Arc<dyn PersistentStore> =
        Arc::new(TimeoutStore::new(Arc::new(meta_store), config.cache.op_timeout()));

    // Cache
    let engine: Arc<dyn CacheStore> = match config.cache.engine {
        CacheEngine::Redis => Arc::new(
            RedisCache::connect(&config.cache.url)
                .await
                .context("failed to connect to cache")?,
        ),
        CacheEngine::Memory => {
            warn!("In-process cache: unflushed usage is lost if this process exits");
            Arc::new(MemoryCache::new())
        }
    };
    let cache: Arc<dyn CacheStore> =
        Arc::new(TimeoutCache::new(engine, config.cache.op_timeout()));
    info!(
        "Cache engine '{}' with {:?} operation timeout",
        cache.name(),
        config.cache.op_timeout()
    );

    let service = Arc::new(
        MetadataService::new(Arc::clone(&cache), Arc::clone(&store))
            .with_single_flight(config.cache.single_flight),
    );
    let accountant = Arc::new(
        UsageAccountant::new(cache, store)
            .with_metrics(Arc::new(UsageMetrics::new()))
            .with_slow_threshold(config.accounting.slow_threshold()),
    );

    // Reconcile cached counters with the store before serving
    let report = accountant
        .init_usage_cache(&RequestContext::background("usage-init"))
        .await
        .context("failed to initialize usage cache")?;
    info!(
        "Usage cache ready: {} seeded, {} flushed, {} failed, {} dropped",
        report.seeded, report.flushed, report.failed, report.dropped
    );

    let archive: Option<Arc<dyn ArchiveClient>> = match &config.archive.endpoint {
        Some(endpoint) => {
            let client = HttpArchiveClient::new(endpoint.as_str(), config.archive.timeout())
                .map_err(|e| anyhow::anyhow!("Invalid archive endpoint {endpoint}: {e}"))?;
            info!("Archive retrieval via {}", endpoint);
            Some(Arc::new(client))
        }
        None => {
            info!("Archive retrieval disabled");
            None
        }
    };

    // Background flush
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_handle = tokio::spawn(flush_loop(
        Arc::clone(&accountant),
        config.accounting.flush_interval(),
        shutdown_rx,
    ));
    info!(
        "Usage flush every {:?}",
        config.accounting.flush_interval()
    );

    let app = admin::router(admin::AdminState {
        service,
        accountant,
        archive,
        archive_account: config.archive.account_id.clone(),
    });

    info!("Starting admin endpoint on {}", config.admin.listen);
    let listener = TcpListener::bind(config.admin.listen).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    // Stop the flush loop; it runs a final flush before returning
    shutdown_tx.send(true).ok();
    flush_handle.await.context("flush task panicked")?;

    info!("objmeta node shut down gracefully");
    Ok(())
}
