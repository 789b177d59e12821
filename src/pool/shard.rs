//! Per-destination sub-pool.
//!
//! # Responsibilities
//! - Hold the idle queue and in-use count for one destination
//! - Enforce `in_use + idle <= max_per_destination`
//! - Wake waiters whenever a slot or an idle connection frees up
//!
//! # Design Decisions
//! - A plain mutex per shard; it is never held across an await
//! - Connections are never dropped while a checked-out slot would need the lock

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::pool::connection::PooledConnection;
use crate::pool::destination::Destination;

#[derive(Debug, Default)]
struct ShardState {
    /// Oldest at the front, most recently released at the back.
    idle: VecDeque<PooledConnection>,
    in_use: usize,
}

/// Outcome of a non-blocking checkout attempt.
pub(crate) enum Checkout {
    /// An idle connection was taken; it already carries its slot.
    Reused(PooledConnection),
    /// A slot was reserved for a new connection the caller must establish.
    Reserved(SlotGuard),
    /// The destination is saturated.
    Saturated,
}

#[derive(Debug)]
pub(crate) struct Shard {
    destination: Destination,
    max_connections: usize,
    state: Mutex<ShardState>,
    available: Notify,
}

impl Shard {
    pub(crate) fn new(destination: Destination, max_connections: usize) -> Self {
        Self {
            destination,
            max_connections,
            state: Mutex::new(ShardState::default()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.available
    }

    /// Take the most recently used healthy idle connection, or reserve a slot.
    pub(crate) fn checkout(self: &Arc<Self>, idle_ttl: Duration) -> Checkout {
        let mut stale = Vec::new();
        let checkout = {
            let mut state = self.lock();
            let mut reused = None;
            while let Some(conn) = state.idle.pop_back() {
                if conn.is_open() && conn.idle_for() <= idle_ttl {
                    reused = Some(conn);
                    break;
                }
                stale.push(conn);
            }

            if let Some(mut conn) = reused {
                state.in_use += 1;
                conn.mark_in_use();
                conn.slot = Some(SlotGuard::new(self.clone()));
                Checkout::Reused(conn)
            } else if state.in_use + state.idle.len() < self.max_connections {
                state.in_use += 1;
                Checkout::Reserved(SlotGuard::new(self.clone()))
            } else {
                Checkout::Saturated
            }
        };

        if !stale.is_empty() {
            tracing::debug!(
                destination = %self.destination,
                discarded = stale.len(),
                "Discarded stale idle connections"
            );
            // Freed capacity may unblock other waiters.
            self.available.notify_waiters();
        }
        checkout
    }

    /// Park a connection at the idle tail, converting its in-use slot.
    pub(crate) fn park(&self, mut conn: PooledConnection, mut slot: SlotGuard) {
        conn.mark_idle();
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.idle.push_back(conn);
        }
        slot.disarm();
        self.available.notify_waiters();
    }

    fn free_slot(&self) {
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.available.notify_waiters();
    }

    /// Remove idle connections older than `older_than` or already closed.
    pub(crate) fn evict_idle(&self, older_than: Duration) -> usize {
        let evicted: Vec<PooledConnection> = {
            let mut state = self.lock();
            let (keep, evict): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.is_open() && conn.idle_for() <= older_than);
            state.idle = keep;
            Vec::from(evict)
        };

        let count = evicted.len();
        for mut conn in evicted {
            conn.mark_closed();
            tracing::debug!(
                connection_id = %conn.id(),
                destination = %self.destination,
                "Evicting idle connection"
            );
        }
        if count > 0 {
            self.available.notify_waiters();
        }
        count
    }

    /// `(in_use, idle)` snapshot.
    pub(crate) fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.in_use, state.idle.len())
    }

    pub(crate) fn is_empty(&self) -> bool {
        let (in_use, idle) = self.counts();
        in_use == 0 && idle == 0
    }
}

/// A reserved in-use slot in a shard.
///
/// Dropping an armed guard gives the slot back, so a connection or a pending
/// connect that is abandoned mid-flight never leaks capacity.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    shard: Arc<Shard>,
    armed: bool,
}

impl SlotGuard {
    fn new(shard: Arc<Shard>) -> Self {
        Self { shard, armed: true }
    }

    pub(crate) fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shard.free_slot();
        }
    }
}
