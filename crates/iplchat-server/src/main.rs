use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use iplchat_server::broker::Broker;
use iplchat_server::config;
use iplchat_server::console::Console;
use iplchat_server::logging;
use iplchat_server::session::{RateLimitPolicy, SessionRegistry};
use iplchat_shared::constants::DEFAULT_PORT;
use iplchat_store::{Store, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_path) = config::load_or_prompt()?;
    logging::init(&config)?;

    info!(
        "starting iplchat broker v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let mut store_config = StoreConfig::new(config.db_file(), config.snapshot_path.clone());
    store_config.snapshot_backlog = config.snapshot_backlog;
    store_config.buffered = config.database_buffered_access;
    store_config.queue_capacity = config.database_queue_size;
    let store = Arc::new(Store::open(store_config)?);

    let registry = Arc::new(SessionRegistry::new());
    let rate_limit = if config.rate_limit == 0 {
        RateLimitPolicy::DISABLED
    } else {
        RateLimitPolicy {
            window: Duration::from_secs(config.rate_limit),
            multiplier: config.rate_limit_multiplier,
            random: config.random_rate_limit,
        }
    };
    let broker = Arc::new(Broker::new(store.clone(), registry.clone(), rate_limit));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Accept loop. Each connection gets its own task, so a panicking
    // handler never takes the broker down.
    let listener = TcpListener::bind(("0.0.0.0", DEFAULT_PORT)).await?;
    info!(port = DEFAULT_PORT, "listening");
    {
        let broker = broker.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(broker.clone().serve_connection(stream));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Periodic queue flush.
    if config.database_flush_timeout > 0 {
        let store = store.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(config.database_flush_timeout * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush() {
                            warn!(error = %e, "periodic flush failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Periodic snapshot.
    if config.snapshot_timeout > 0 {
        let store = store.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(config.snapshot_timeout * 3600);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.save_snapshot() {
                            warn!(error = %e, "periodic snapshot failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // The console owns the foreground; returning from it shuts down.
    Console::new(
        store.clone(),
        registry,
        config.clone(),
        config_path.clone(),
        shutdown_tx,
    )
    .run()
    .await;

    info!("shutting down: flushing write queue");
    if let Err(e) = store.flush() {
        warn!(error = %e, "final flush failed");
    }
    if config.autosave {
        if let Err(e) = config.save(&config_path) {
            warn!(error = %e, "failed to save configuration");
        }
    }
    info!("bye");
    Ok(())
}
