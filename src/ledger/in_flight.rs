//! In-memory "in progress" markers
//!
//! Rejects a second concurrent request for the same principal before it
//! reaches the ledger. Markers are RAII guards; a marker older than the TTL is
//! treated as abandoned and may be taken over.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::metrics::metrics;

#[derive(Debug, Clone)]
pub struct InFlightRegistry {
    markers: Arc<DashMap<String, Instant>>,
    ttl: Duration,
}

impl InFlightRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            markers: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Claim `key`; `None` if another live claim holds it
    pub fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        let now = Instant::now();
        match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < self.ttl {
                    return None;
                }
                warn!(key = %key, "Taking over stale in-flight marker");
                occupied.insert(now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                metrics().units_in_flight.inc();
            }
        }
        Some(InFlightGuard {
            markers: Arc::clone(&self.markers),
            key: key.to_string(),
            acquired_at: now,
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.markers
            .get(key)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Releases its marker on drop
#[derive(Debug)]
pub struct InFlightGuard {
    markers: Arc<DashMap<String, Instant>>,
    key: String,
    acquired_at: Instant,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // A stale takeover re-stamps the marker; only remove our own
        let removed = self
            .markers
            .remove_if(&self.key, |_, at| *at == self.acquired_at);
        if removed.is_some() {
            metrics().units_in_flight.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_rejected_until_release() {
        let registry = InFlightRegistry::default();
        let guard = registry.try_acquire("unit-1").unwrap();
        assert!(registry.try_acquire("unit-1").is_none());
        assert!(registry.try_acquire("unit-2").is_some());
        drop(guard);
        assert!(registry.try_acquire("unit-1").is_some());
    }

    #[test]
    fn test_stale_marker_taken_over() {
        let registry = InFlightRegistry::new(Duration::ZERO);
        let first = registry.try_acquire("unit-1").unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = registry.try_acquire("unit-1").unwrap();
        drop(first);
        // The takeover's marker survives the original guard's drop
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }
}
