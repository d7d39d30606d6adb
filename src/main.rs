use anyhow::Result;
use clap::Parser;
use slidingwindow::config::Cli;
use slidingwindow::datastore::{Datastore, MemoryDatastore};
use slidingwindow::handlers::{AppState, NamedLimiter};
use slidingwindow::health::HealthChecker;
use slidingwindow::redis::RedisDatastore;
use slidingwindow::server::Server;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("slidingwindow={},tower_http=debug", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli.check()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let config = cli.limiter_config();
    tracing::info!(
        "Configuration: resource={}, size={:?}, limit={}, sync={:?}, mode={:?}, scale={}",
        config.key,
        config.size,
        config.limit,
        config.sync_interval,
        config.sync_mode,
        cli.scale
    );

    let store: Arc<dyn Datastore> = match &cli.redis_url {
        Some(url) => {
            tracing::info!("Using Redis datastore at {}", url);
            Arc::new(RedisDatastore::new(url, config.datastore_ttl())?)
        }
        None => {
            tracing::info!("Using in-memory datastore");
            Arc::new(MemoryDatastore::with_ttl(config.datastore_ttl()))
        }
    };

    let mut limiters = Vec::with_capacity(cli.scale);
    let mut stops = Vec::with_capacity(cli.scale);
    for i in 0..cli.scale {
        let (limiter, stop) = config.new_limiter(Some(store.clone()))?;
        limiters.push(NamedLimiter {
            name: format!("lim-{}", i),
            limiter: Arc::new(limiter),
        });
        stops.push(stop);
    }

    let state = AppState::new(config.key.clone(), limiters, HealthChecker::new(store))?;
    let result = Server::new(Arc::new(state), cli.listen)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e));

    tracing::info!("Stopping limiters");
    for stop in stops {
        stop();
    }

    result
}
