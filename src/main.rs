//! EveTrade backend entry point.
//!
//! Wires the static catalog, snapshot store, cache fabric, and upstream
//! client into the HTTP server, then runs until interrupted. Startup
//! failures (missing catalog, unopenable database) exit non-zero.

use anyhow::{Context, Result};
use evetrade_backend::{
    api::{self, AppState},
    cache::{CacheFabric, RedisCache, RemoteCache},
    character::CharacterService,
    config::Config,
    esi::{ErrorBudget, EsiClient, TokenBucket, UpstreamApi},
    market::{MarketOrderStore, MarketRefresher, VolumeService},
    navigation::Navigation,
    sde::SdeCatalog,
    trading::{InventorySellOrchestrator, RouteEngine},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const CACHE_JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_BUDGET_WINDOW: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(
        upstream = %config.upstream_base_url,
        listen = %config.listen_addr,
        "EveTrade backend starting"
    );

    let sde = Arc::new(SdeCatalog::load(&config.catalog_path).context("loading static catalog")?);
    let store =
        Arc::new(MarketOrderStore::open(&config.db_dsn).context("opening market database")?);

    let remote: Option<Arc<dyn RemoteCache>> = match &config.cache_remote_addr {
        Some(addr) => match RedisCache::connect(addr).await {
            Ok(redis) => Some(Arc::new(redis)),
            Err(e) => {
                warn!(error = %e, "Remote cache unavailable, continuing local-only");
                None
            }
        },
        None => None,
    };
    let cache = Arc::new(CacheFabric::new(remote));

    let bucket = Arc::new(TokenBucket::new(config.rate_limit_rps));
    let budget = Arc::new(ErrorBudget::new(config.error_budget, ERROR_BUDGET_WINDOW));
    let esi: Arc<dyn UpstreamApi> = Arc::new(
        EsiClient::new(&config, bucket.clone(), budget).context("building upstream client")?,
    );

    let navigation = Arc::new(Navigation::new(sde.clone()));
    let character = Arc::new(CharacterService::new(esi.clone(), cache.clone(), sde.clone()));
    let volume = Arc::new(VolumeService::new(esi.clone(), store.clone(), cache.clone()));
    let engine = Arc::new(RouteEngine::new(
        store.clone(),
        sde.clone(),
        navigation.clone(),
        character.clone(),
        volume,
    ));
    let inventory = Arc::new(InventorySellOrchestrator::new(
        character.clone(),
        navigation.clone(),
        store.clone(),
        sde.clone(),
    ));
    let refresher = Arc::new(MarketRefresher::new(esi.clone(), store.clone()));

    let state = AppState {
        config: config.clone(),
        sde,
        store,
        cache,
        esi,
        character,
        navigation,
        engine,
        inventory,
        refresher,
        bucket,
    };

    spawn_background_tasks(&state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Periodic housekeeping: stale-order sweeping and local cache eviction.
fn spawn_background_tasks(state: &AppState) {
    let store = state.store.clone();
    let horizon = state.config.staleness_horizon;
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep(horizon) {
                error!(error = %e, "Order sweep failed");
            }
        }
    });

    let cache = state.cache.clone();
    tokio::spawn(async move {
        let mut ticker = interval(CACHE_JANITOR_INTERVAL);
        loop {
            ticker.tick().await;
            cache.evict_expired_local();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
