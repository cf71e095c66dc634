//! Registry of live connections.
//!
//! Guarantees a single [`Connection`] per IP flow and closes connections
//! that stopped forwarding traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::endpoint::{KernelSide, NetworkSide};
use crate::error::Error;
use crate::router::Router;
use crate::types::{Flow, IpFlowKey, TrafficStats};

use super::Connection;

/// Connection registry.
pub struct Registry {
    connections: Mutex<HashMap<IpFlowKey, Arc<Connection>>>,
    router: Arc<Router>,
    kernel: Arc<dyn KernelSide>,
    network: Arc<dyn NetworkSide>,
    config: ConnectionConfig,
    created: AtomicU64,
}

impl Registry {
    pub fn new(
        config: ConnectionConfig,
        router: Arc<Router>,
        kernel: Arc<dyn KernelSide>,
        network: Arc<dyn NetworkSide>,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            router,
            kernel,
            network,
            config,
            created: AtomicU64::new(0),
        }
    }

    /// Get the connection of a flow, creating it on first sight.
    pub fn retrieve(&self, flow: &Flow) -> Arc<Connection> {
        let key = flow.ip_flow.key();
        let mut connections = self.connections.lock();

        if let Some(connection) = connections.get(&key) {
            return Arc::clone(connection);
        }

        let connection = Arc::new(Connection::new(
            flow.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.kernel),
            Arc::clone(&self.network),
            self.config.traffic_establish_delay,
        ));
        connections.insert(key, Arc::clone(&connection));
        self.created.fetch_add(1, Ordering::Relaxed);

        debug!(connection = %connection.id(), flow = %key, "Created connection");
        connection
    }

    pub fn get(&self, key: &IpFlowKey) -> Option<Arc<Connection>> {
        self.connections.lock().get(key).cloned()
    }

    /// Close and forget the connection of `key`.
    ///
    /// The entry stays in the map until the close has finished, so packets
    /// arriving meanwhile reach the closing connection and are dropped
    /// instead of opening endpoints that the close would tear down.
    pub async fn close(&self, key: &IpFlowKey, reason: &Error) -> bool {
        let Some(connection) = self.get(key) else {
            return false;
        };
        connection.close(reason).await;
        self.forget(key, &connection);
        true
    }

    /// Close and remove every connection idle for longer than the threshold.
    ///
    /// Closes run concurrently; a connection whose lock is held by a blocked
    /// worker only delays its own removal.
    pub async fn reclaim_idle(&self) -> usize {
        let threshold = self.config.idle_threshold;
        let idle = self.idle(Instant::now(), threshold);
        let count = idle.len();

        let reason = Error::Idle(threshold);
        join_all(idle.iter().map(|(_, connection)| connection.close(&reason))).await;
        for (key, connection) in &idle {
            self.forget(key, connection);
        }

        if count > 0 {
            info!("Reclaimed {} idle connections", count);
        }

        count
    }

    fn idle(&self, now: Instant, threshold: Duration) -> Vec<(IpFlowKey, Arc<Connection>)> {
        self.connections
            .lock()
            .iter()
            .filter(|(_, connection)| now.saturating_duration_since(connection.touched()) > threshold)
            .map(|(key, connection)| (*key, Arc::clone(connection)))
            .collect()
    }

    /// Remove `key` if it still maps to `connection`.
    fn forget(&self, key: &IpFlowKey, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock();
        if connections
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            connections.remove(key);
        }
    }

    /// Start the reclamation task.
    pub fn start_reclaim_task(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.reclaim_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                self.reclaim_idle().await;
            }
        })
    }

    /// Close every connection. Used on shutdown.
    pub async fn close_all(&self, reason: &Error) -> usize {
        let all: Vec<_> = self
            .connections
            .lock()
            .iter()
            .map(|(key, connection)| (*key, Arc::clone(connection)))
            .collect();

        join_all(all.iter().map(|(_, connection)| connection.close(reason))).await;
        for (key, connection) in &all {
            self.forget(key, connection);
        }
        all.len()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Connections created since startup.
    pub fn total_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Sum of the traffic of all live connections.
    pub fn aggregate_stats(&self) -> TrafficStats {
        let mut total = TrafficStats::default();
        for connection in self.connections.lock().values() {
            total.add(&connection.stats());
        }
        total
    }
}
