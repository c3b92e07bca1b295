//! virtlink daemon
//!
//! Connects every configured host, serves the console bridge on loopback and
//! runs until Ctrl-C.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use virtlink::bridge::BridgeServer;
use virtlink::config::{AppConfig, ConfigStorage};
use virtlink::ssh::ConnectionPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let storage = ConfigStorage::new()?;
    let mut config = storage.load().await?;
    virtlink::init_tracing(&config.log_filter);
    info!("Loaded config from {:?}", storage.path());

    let pool = Arc::new(ConnectionPool::with_retry(config.retry.clone()));

    if connect_hosts(&pool, &mut config).await {
        if let Err(e) = storage.save(&config).await {
            warn!("Failed to persist host keys: {}", e);
        }
    }

    let cancel = CancellationToken::new();
    let (port, server) = BridgeServer::start(pool.clone(), config.bridge.clone(), cancel.clone()).await?;
    println!("{}", port);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    if let Err(e) = server.await {
        error!("Bridge server task failed: {}", e);
    }
    pool.close_all().await;
    Ok(())
}

/// Connect every host; returns `true` if a first-contact key was pinned
async fn connect_hosts(pool: &ConnectionPool, config: &mut AppConfig) -> bool {
    let mut pinned = Vec::new();
    for entry in &config.hosts {
        match pool.connect(&entry.id, entry.connection.clone()).await {
            Ok(conn) => {
                if entry.connection.host_key.is_empty() {
                    pinned.push((entry.id.clone(), conn.connected_host_key().await));
                }
                info!("Host {} ready", entry.id);
            }
            Err(e) => warn!("Host {} unavailable: {}", entry.id, e),
        }
    }

    let mut changed = false;
    for (id, key) in pinned {
        if config.pin_host_key(&id, &key) {
            info!("Pinned host key for {}", id);
            changed = true;
        }
    }
    changed
}
