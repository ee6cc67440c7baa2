//! Process-local cache tier.
//!
//! A sharded concurrent map of expiring byte payloads. Reads evict lazily;
//! a background janitor sweeps whatever reads never touch.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct LocalEntry {
    pub bytes: Arc<Vec<u8>>,
    pub negative: bool,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
pub struct LocalTier {
    entries: DashMap<String, LocalEntry>,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<LocalEntry> {
        let hit = self.entries.get(key)?.value().clone();
        if hit.is_expired() {
            self.entries.remove(key);
            return None;
        }
        Some(hit)
    }

    pub fn set(&self, key: &str, bytes: Arc<Vec<u8>>, negative: bool, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                bytes,
                negative,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Janitor pass. Returns how many entries were dropped.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let tier = LocalTier::new();
        tier.set("a", bytes("1"), false, Duration::from_secs(5));
        assert!(tier.get("a").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(tier.get("a").is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_sweeps_untouched_entries() {
        let tier = LocalTier::new();
        tier.set("a", bytes("1"), false, Duration::from_secs(1));
        tier.set("b", bytes("2"), false, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tier.evict_expired(), 1);
        assert_eq!(tier.len(), 1);
        assert!(tier.get("b").is_some());
    }

    #[tokio::test]
    async fn prefix_removal() {
        let tier = LocalTier::new();
        tier.set("char:loc:1", bytes("x"), false, Duration::from_secs(60));
        tier.set("char:loc:2", bytes("y"), false, Duration::from_secs(60));
        tier.set("market:orders:1:2", bytes("z"), false, Duration::from_secs(60));

        assert_eq!(tier.remove_prefix("char:loc:"), 2);
        assert_eq!(tier.len(), 1);
    }
}
