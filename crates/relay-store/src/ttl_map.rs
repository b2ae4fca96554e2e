//! In-memory TTL map — the fallback backend behind every cache-backed
//! store when redis is absent or unreachable.
//!
//! Entries expire lazily on read; a periodic sweeper bounds memory growth
//! in pure-fallback mode where reads may never touch stale keys. Time is
//! `tokio::time::Instant` so expiry is testable under paused time.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// A set of string keys with per-key expiry.
#[derive(Default)]
pub struct TtlMap {
    entries: RwLock<HashMap<String, Instant>>,
}

impl TtlMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh `key` to expire after `ttl`.
    pub fn insert(&self, key: &str, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        let _ = self.entries.write().insert(key.to_string(), deadline);
    }

    /// Whether `key` is present and unexpired. An expired entry is removed
    /// on the way out and never reported as present.
    pub fn contains(&self, key: &str) -> bool {
        let deadline = match self.entries.read().get(key) {
            Some(deadline) => *deadline,
            None => return false,
        };
        if Instant::now() < deadline {
            return true;
        }
        // re-check under the write lock: an insert may have refreshed the
        // key since the read snapshot
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(deadline) if Instant::now() < *deadline => true,
            Some(_) => {
                let _ = entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Remove `key` regardless of expiry.
    pub fn remove(&self, key: &str) {
        let _ = self.entries.write().remove(key);
    }

    /// All unexpired keys.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, deadline)| now < **deadline)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, deadline| now < *deadline);
        before - entries.len()
    }

    /// Number of entries, including any not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the map holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Periodically purge expired entries. Only needed in pure-fallback mode;
/// with redis as primary the map stays near-empty.
pub fn spawn_sweeper(map: Arc<TtlMap>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // immediate first tick
        loop {
            let _ = ticker.tick().await;
            let purged = map.purge_expired();
            if purged > 0 {
                debug!(purged, "ttl sweeper purged expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let map = TtlMap::new();
        map.insert("k", Duration::from_secs(30));
        assert!(map.contains("k"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!map.contains("k"));
        // lazy expiry removed it
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_deadline() {
        let map = TtlMap::new();
        map.insert("k", Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(20)).await;
        map.insert("k", Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(map.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_keys_skips_expired() {
        let map = TtlMap::new();
        map.insert("old", Duration::from_secs(1));
        map.insert("new", Duration::from_secs(100));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(map.live_keys(), vec!["new".to_string()]);
    }

    #[test]
    fn concurrent_refresh_is_never_lost_to_lazy_expiry() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let map = Arc::new(TtlMap::new());
        let stop = Arc::new(AtomicBool::new(false));

        // hammer the lazy-expiry path while the key cycles between
        // expired and refreshed
        let reader = {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = map.contains("k");
                }
            })
        };

        for _ in 0..30 {
            map.insert("k", Duration::from_millis(50));
            assert!(map.contains("k"), "a just-refreshed key must be present");
            std::thread::sleep(Duration::from_millis(60)); // let it expire
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_bounds_growth() {
        let map = Arc::new(TtlMap::new());
        for i in 0..100 {
            map.insert(&format!("k{i}"), Duration::from_secs(5));
        }
        let handle = spawn_sweeper(Arc::clone(&map), Duration::from_secs(10));
        // let the sweeper set up its interval and consume the immediate tick
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(map.len(), 0);
        handle.abort();
    }
}
