//! Per-document processing leases.
//!
//! At most one worker may run the pipeline for a given document at a time.
//! A lease is an in-process entry keyed by document id, released on guard
//! drop (including on panic or early return). Entries older than the TTL
//! are treated as abandoned by a crashed holder and may be reclaimed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Shared arena of per-document leases.
#[derive(Clone)]
pub struct LeaseArena {
    inner: Arc<Mutex<HashMap<Uuid, Instant>>>,
    ttl: Duration,
}

impl LeaseArena {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Try to take the lease for a document. Returns `None` when another
    /// holder has a live (non-expired) lease.
    pub fn acquire(&self, document_id: Uuid) -> Option<LeaseGuard> {
        let now = Instant::now();
        let mut map = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(taken_at) = map.get(&document_id) {
            if now.duration_since(*taken_at) < self.ttl {
                return None;
            }
            // Expired lease: reclaim
        }

        map.insert(document_id, now);
        Some(LeaseGuard {
            arena: self.inner.clone(),
            document_id,
        })
    }

    #[cfg(test)]
    fn is_held(&self, document_id: Uuid) -> bool {
        match self.inner.lock() {
            Ok(g) => g.contains_key(&document_id),
            Err(poisoned) => poisoned.into_inner().contains_key(&document_id),
        }
    }
}

/// RAII handle for a held lease; releases on drop.
pub struct LeaseGuard {
    arena: Arc<Mutex<HashMap<Uuid, Instant>>>,
    document_id: Uuid,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut map = match self.arena.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(&self.document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let arena = LeaseArena::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        let guard = arena.acquire(id);
        assert!(guard.is_some());
        assert!(arena.acquire(id).is_none());
    }

    #[test]
    fn drop_releases_the_lease() {
        let arena = LeaseArena::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        {
            let _guard = arena.acquire(id);
            assert!(arena.is_held(id));
        }
        assert!(!arena.is_held(id));
        assert!(arena.acquire(id).is_some());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let arena = LeaseArena::new(Duration::from_millis(0));
        let id = Uuid::new_v4();
        let _stale = arena.acquire(id);
        // TTL of zero means the first lease is immediately expired
        assert!(arena.acquire(id).is_some());
    }

    #[test]
    fn leases_are_per_document() {
        let arena = LeaseArena::new(Duration::from_secs(60));
        let _a = arena.acquire(Uuid::new_v4());
        assert!(arena.acquire(Uuid::new_v4()).is_some());
    }
}
