//! Background idle eviction.
//!
//! # Responsibilities
//! - Periodically destroy idle connections older than `idle_ttl`
//! - Stay off the request path; exit on shutdown

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::config::PoolConfig;
use crate::pool::registry::ConnectionPool;

pub struct IdleEvictor {
    pool: Arc<ConnectionPool>,
    interval: Duration,
    idle_ttl: Duration,
}

impl IdleEvictor {
    pub fn new(pool: Arc<ConnectionPool>, interval: Duration, idle_ttl: Duration) -> Self {
        Self {
            pool,
            interval,
            idle_ttl,
        }
    }

    pub fn from_config(pool: Arc<ConnectionPool>, config: &PoolConfig) -> Self {
        Self::new(pool, config.idle_eviction_interval(), config.idle_ttl())
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            idle_ttl_secs = self.idle_ttl.as_secs_f64(),
            "Idle evictor starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be stale yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.pool.evict_idle(self.idle_ttl);
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted idle upstream connections");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Idle evictor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
