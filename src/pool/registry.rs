//! Connection pool registry.
//!
//! # Responsibilities
//! - Map each destination to its own shard (sub-pool)
//! - Hand out idle connections or grow a shard up to its limit
//! - Suspend callers while a destination is saturated, up to a timeout
//! - Take back connections as healthy (idle) or unhealthy (destroyed)

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{PoolConfig, TimeoutConfig};
use crate::observability::metrics;
use crate::pool::connection::{ConnectError, PooledConnection};
use crate::pool::destination::Destination;
use crate::pool::shard::{Checkout, Shard};

/// Error type for pool acquisition.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool for {destination} exhausted after waiting {waited:?}")]
    Exhausted {
        destination: Destination,
        waited: Duration,
    },

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Pool settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_per_destination: usize,
    pub connect_timeout: Duration,
    pub idle_ttl: Duration,
}

impl PoolSettings {
    pub fn from_config(pool: &PoolConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            max_per_destination: pool.max_connections_per_destination,
            connect_timeout: Duration::from_millis(timeouts.connect_ms),
            idle_ttl: pool.idle_ttl(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default(), &TimeoutConfig::default())
    }
}

/// Point-in-time counts for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
}

/// Keyed registry of per-destination sub-pools.
#[derive(Debug)]
pub struct ConnectionPool {
    shards: DashMap<Destination, Arc<Shard>>,
    settings: PoolSettings,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            shards: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn shard(&self, destination: &Destination) -> Arc<Shard> {
        if let Some(shard) = self.shards.get(destination) {
            return shard.clone();
        }
        self.shards
            .entry(destination.clone())
            .or_insert_with(|| {
                Arc::new(Shard::new(
                    destination.clone(),
                    self.settings.max_per_destination,
                ))
            })
            .clone()
    }

    /// Check out a connection to `destination`.
    ///
    /// Waits at most `timeout` for capacity. Connection establishment is
    /// bounded separately by the configured connect timeout.
    pub async fn acquire(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        let shard = self.shard(destination);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = shard.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match shard.checkout(self.settings.idle_ttl) {
                Checkout::Reused(conn) => {
                    tracing::trace!(connection_id = %conn.id(), destination = %destination, "Reusing idle connection");
                    metrics::record_pool_event("reused");
                    self.record_gauges(&shard);
                    return Ok(conn);
                }
                Checkout::Reserved(slot) => {
                    match PooledConnection::connect(destination, self.settings.connect_timeout).await {
                        Ok(mut conn) => {
                            conn.slot = Some(slot);
                            metrics::record_pool_event("created");
                            self.record_gauges(&shard);
                            return Ok(conn);
                        }
                        Err(e) => {
                            // Dropping the slot frees the reservation.
                            drop(slot);
                            tracing::debug!(destination = %destination, error = %e, "Connect failed, reservation released");
                            metrics::record_pool_event("connect_failed");
                            return Err(e.into());
                        }
                    }
                }
                Checkout::Saturated => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited = started.elapsed();
                        tracing::warn!(
                            destination = %destination,
                            waited_ms = waited.as_millis() as u64,
                            "Connection pool exhausted"
                        );
                        metrics::record_pool_event("exhausted");
                        return Err(PoolError::Exhausted {
                            destination: destination.clone(),
                            waited,
                        });
                    }
                }
            }
        }
    }

    /// Give a checked-out connection back.
    ///
    /// Healthy, still-open connections go to the idle tail; everything else
    /// is destroyed and its slot freed.
    pub fn release(&self, mut conn: PooledConnection, healthy: bool) {
        let Some(slot) = conn.slot.take() else {
            // Not checked out from this pool; nothing to account.
            conn.mark_closed();
            return;
        };
        let shard = slot.shard().clone();

        if healthy && conn.is_open() {
            tracing::trace!(connection_id = %conn.id(), "Returning connection to idle pool");
            shard.park(conn, slot);
            metrics::record_pool_event("released");
        } else {
            tracing::debug!(
                connection_id = %conn.id(),
                destination = %conn.destination(),
                healthy,
                "Destroying upstream connection"
            );
            conn.mark_closed();
            drop(conn);
            drop(slot);
            metrics::record_pool_event("destroyed");
        }
        self.record_gauges(&shard);
    }

    /// Destroy idle connections that have been parked longer than `older_than`.
    ///
    /// Returns the number of connections evicted. Shards left empty and
    /// unreferenced are removed from the registry.
    pub fn evict_idle(&self, older_than: Duration) -> usize {
        let shards: Vec<Arc<Shard>> = self.shards.iter().map(|e| e.value().clone()).collect();
        let mut evicted = 0;
        for shard in &shards {
            evicted += shard.evict_idle(older_than);
            self.record_gauges(shard);
        }
        drop(shards);

        // Strong count 1 means only the registry holds the shard: no caller
        // is waiting on it and no connection or slot refers to it.
        self.shards
            .retain(|_, shard| !(Arc::strong_count(shard) == 1 && shard.is_empty()));

        if evicted > 0 {
            metrics::record_pool_eviction(evicted);
        }
        evicted
    }

    /// Counts for one destination; zero for destinations never used.
    pub fn stats(&self, destination: &Destination) -> PoolStats {
        self.shards
            .get(destination)
            .map(|shard| {
                let (in_use, idle) = shard.counts();
                PoolStats { in_use, idle }
            })
            .unwrap_or_default()
    }

    /// Number of destinations currently tracked.
    pub fn destination_count(&self) -> usize {
        self.shards.len()
    }

    fn record_gauges(&self, shard: &Shard) {
        let (in_use, idle) = shard.counts();
        metrics::record_pool_gauges(&shard.destination().to_string(), in_use, idle);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}
