//! Connection pool keyed by host identifier
//!
//! Holds at most one live [`Connection`] per host. Connects to the same host
//! are serialized by a per-host lock so two callers racing on `connect`
//! never leave two transports behind.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::client::Connection;
use super::config::{ConnectionConfig, RetryPolicy};
use super::error::SshError;

/// Registry of live connections, one per host id
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    retry: RetryPolicy,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_retry(RetryPolicy::default())
    }

    /// Pool whose connections retry stale sessions per `retry`
    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connect_locks: DashMap::new(),
            retry,
        }
    }

    fn connect_lock(&self, host_id: &str) -> Arc<Mutex<()>> {
        self.connect_locks
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-host lock unless another caller is holding or waiting on it.
    /// `held` is the caller's own clone.
    fn release_connect_lock(&self, host_id: &str, held: &Arc<Mutex<()>>) {
        self.connect_locks
            .remove_if(host_id, |_, lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) <= 2);
    }

    /// Connect to `host_id`, replacing any existing connection.
    ///
    /// The old connection is closed before dialing. On failure nothing is
    /// stored for `host_id`.
    pub async fn connect(
        &self,
        host_id: &str,
        config: ConnectionConfig,
    ) -> Result<Arc<Connection>, SshError> {
        let lock = self.connect_lock(host_id);
        let _guard = lock.lock().await;

        let previous = self.connections.write().await.remove(host_id);
        if let Some(old) = previous {
            debug!("Closing previous connection for {}", host_id);
            if let Err(e) = old.close().await {
                warn!("Failed to close previous connection for {}: {}", host_id, e);
            }
        }

        let conn = Arc::new(Connection::new(host_id, config).with_retry(self.retry.clone()));
        if let Err(e) = conn.connect().await {
            self.release_connect_lock(host_id, &lock);
            return Err(e);
        }

        self.connections
            .write()
            .await
            .insert(host_id.to_string(), conn.clone());
        info!("Pool: {} connected", host_id);
        Ok(conn)
    }

    /// Current connection for `host_id`
    pub async fn get(&self, host_id: &str) -> Result<Arc<Connection>, SshError> {
        self.connections
            .read()
            .await
            .get(host_id)
            .cloned()
            .ok_or_else(|| SshError::NotConnected(host_id.to_string()))
    }

    /// Remove and close the connection for `host_id`. No-op if absent.
    pub async fn disconnect(&self, host_id: &str) -> Result<(), SshError> {
        let lock = self.connect_lock(host_id);
        let _guard = lock.lock().await;

        let removed = self.connections.write().await.remove(host_id);
        self.release_connect_lock(host_id, &lock);
        match removed {
            Some(conn) => {
                info!("Pool: {} disconnected", host_id);
                conn.close().await
            }
            None => Ok(()),
        }
    }

    /// Present in the pool and answering keepalives
    pub async fn is_connected(&self, host_id: &str) -> bool {
        let conn = self.connections.read().await.get(host_id).cloned();
        match conn {
            Some(conn) => conn.is_alive().await,
            None => false,
        }
    }

    /// Fingerprint of the host key observed for `host_id`
    pub async fn fingerprint(&self, host_id: &str) -> Result<String, SshError> {
        let conn = self.get(host_id).await?;
        conn.host_fingerprint()
            .await
            .ok_or_else(|| SshError::NotConnected(host_id.to_string()))
    }

    /// Host ids currently in the pool
    pub async fn hosts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every connection and empty the pool
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<Connection>)> =
            self.connections.write().await.drain().collect();
        for (id, conn) in drained {
            if let Err(e) = conn.close().await {
                warn!("Failed to close {}: {}", id, e);
            }
        }
        self.connect_locks.clear();
        info!("Pool: all connections closed");
    }
}
