use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::vendor::ListingRow;

// ---------------------------------------------------------------------------
// ListingCache
// ---------------------------------------------------------------------------

struct CachedListing {
    rows: Arc<Vec<ListingRow>>,
    fetched_at: Instant,
}

/// Exchange listings keyed by exchange code.
///
/// Entries expire after `ttl`; callers can also drop one exchange or the whole
/// cache when they know the listing changed (e.g. before a full rebuild).
pub struct ListingCache {
    entries: DashMap<String, CachedListing>,
    ttl: Duration,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
        })
    }

    /// Fresh entry for `exchange`, evicting it if expired.
    pub fn get(&self, exchange: &str) -> Option<Arc<Vec<ListingRow>>> {
        let expired = match self.entries.get(exchange) {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => {
                return Some(Arc::clone(&entry.rows));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(exchange);
        }
        None
    }

    pub fn put(&self, exchange: &str, rows: Vec<ListingRow>) -> Arc<Vec<ListingRow>> {
        let rows = Arc::new(rows);
        self.entries.insert(
            exchange.to_string(),
            CachedListing {
                rows: Arc::clone(&rows),
                fetched_at: Instant::now(),
            },
        );
        rows
    }

    pub fn invalidate(&self, exchange: &str) {
        self.entries.remove(exchange);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
