//! vetcache server entry point.
//!
//! Opens the authoritative store, starts the replicator and the purge loop,
//! then boots the MCP server on stdio transport.
//! Logging goes to stderr to avoid interfering with the JSON-RPC protocol on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing_subscriber::EnvFilter;
use vetcache_client::{Backend, FallbackInvoker, HttpBackend, Orchestrator};
use vetcache_core::replication::replica;
use vetcache_core::{AppConfig, CacheDb, MutationPipeline, Replicator, Tier, TieredStore};

mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        db_path = %config.db_path.display(),
        edge_region = %config.edge_region,
        providers = config.providers.len(),
        "Starting vetcache server on stdio transport"
    );

    let db = CacheDb::open(&config.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    let pipeline = Arc::new(MutationPipeline::open(db.clone(), config.policy.clone(), config.invalidation_grace())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (sink, reader) = replica(config.edge_region.clone(), config.replication.critical_lag());
    let mut replicator = Replicator::new(db, vec![sink], config.replication.clone());
    replicator.bootstrap().await.context("bootstrapping edge replica")?;
    let replicator_task = replicator.spawn(shutdown_rx.clone());
    let purge_task = spawn_purge(pipeline.clone(), config.purge_interval(), shutdown_rx);

    let backends = build_backends(&config)?;
    let fallback = FallbackInvoker::new(backends, &config.fallback, &config.breaker);
    let tiers = TieredStore::new(vec![Arc::new(reader.clone()) as Arc<dyn Tier>]);
    let orchestrator = Orchestrator::from_config(&config, tiers, Arc::new(fallback))?;

    let handler = handler::VetcacheServer::new(Arc::new(orchestrator), pipeline, reader);
    let transport = stdio();
    let server = serve_server(handler, transport).await?;

    server.waiting().await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(replicator_task, purge_task);
    tracing::info!("vetcache server stopped");

    Ok(())
}

/// One HTTP backend per configured provider, in priority order.
fn build_backends(config: &AppConfig) -> Result<Vec<Arc<dyn Backend>>> {
    if let Err(e) = config.require_providers() {
        tracing::warn!(error = %e, "no providers configured; cache misses will be served degraded");
    }

    config
        .providers
        .iter()
        .map(|provider| {
            let backend = HttpBackend::from_provider(provider)
                .with_context(|| format!("configuring provider {}", provider.id))?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        })
        .collect()
}

/// Remove invalidated entries past their grace period until shutdown.
fn spawn_purge(
    pipeline: Arc<MutationPipeline>, every: std::time::Duration, mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = pipeline.purge_expired().await {
                        tracing::error!(error = %e, "purge pass failed");
                    }
                }
            }
        }
    })
}
