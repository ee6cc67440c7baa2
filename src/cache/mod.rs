//! Two-tier cache fabric.
//!
//! Values live in a process-local map with a short TTL and, when a remote
//! tier is configured, in Redis with the full TTL. Misses can be computed
//! through a single-flight barrier so one loader feeds every concurrent
//! caller. Payloads are JSON; callers always receive owned copies.

pub mod flight;
pub mod local;
pub mod remote;

pub use flight::FlightGroup;
pub use remote::{RedisCache, RemoteCache};

use crate::error::{Error, Result};
use crate::models::Deadline;
use local::LocalTier;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Local entries never outlive this; the remote tier carries the real TTL.
const LOCAL_TTL_CAP: Duration = Duration::from_secs(5);
/// Lifetime of a cached miss.
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// Remote payload envelope: one flag byte, then the JSON body.
const FLAG_VALUE: u8 = 0;
const FLAG_NEGATIVE: u8 = 1;

pub enum Lookup {
    Hit(Arc<Vec<u8>>),
    /// A recent load found nothing; absorb the miss instead of re-fetching.
    Negative,
    Miss,
}

pub struct CacheFabric {
    local: LocalTier,
    remote: Option<Arc<dyn RemoteCache>>,
    flights: FlightGroup<Arc<Vec<u8>>>,
}

impl CacheFabric {
    pub fn new(remote: Option<Arc<dyn RemoteCache>>) -> Self {
        Self {
            local: LocalTier::new(),
            remote,
            flights: FlightGroup::new(),
        }
    }

    fn local_ttl(&self, ttl: Duration) -> Duration {
        if self.remote.is_some() {
            ttl.min(LOCAL_TTL_CAP)
        } else {
            ttl
        }
    }

    pub async fn lookup(&self, key: &str) -> Lookup {
        if let Some(entry) = self.local.get(key) {
            return if entry.negative {
                Lookup::Negative
            } else {
                Lookup::Hit(entry.bytes)
            };
        }

        let Some(remote) = &self.remote else {
            return Lookup::Miss;
        };
        match remote.get(key).await {
            Ok(Some(envelope)) => match envelope.split_first() {
                Some((&FLAG_NEGATIVE, _)) => {
                    self.local
                        .set(key, Arc::new(Vec::new()), true, NEGATIVE_TTL.min(LOCAL_TTL_CAP));
                    Lookup::Negative
                }
                Some((&FLAG_VALUE, body)) => {
                    let bytes = Arc::new(body.to_vec());
                    self.local
                        .set(key, bytes.clone(), false, LOCAL_TTL_CAP);
                    Lookup::Hit(bytes)
                }
                _ => Lookup::Miss,
            },
            Ok(None) => Lookup::Miss,
            Err(e) => {
                // The remote tier is an accelerator, never a dependency.
                warn!(key, error = %e, "Remote cache read failed");
                Lookup::Miss
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.lookup(key).await {
            Lookup::Hit(bytes) => serde_json::from_slice(&bytes).ok(),
            _ => None,
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let bytes = Arc::new(serde_json::to_vec(value)?);
        self.store(key, bytes, ttl).await;
        Ok(())
    }

    async fn store(&self, key: &str, bytes: Arc<Vec<u8>>, ttl: Duration) {
        self.local.set(key, bytes.clone(), false, self.local_ttl(ttl));
        if let Some(remote) = &self.remote {
            let mut envelope = Vec::with_capacity(bytes.len() + 1);
            envelope.push(FLAG_VALUE);
            envelope.extend_from_slice(&bytes);
            if let Err(e) = remote.set(key, &envelope, ttl).await {
                warn!(key, error = %e, "Remote cache write failed");
            }
        }
    }

    /// Records a miss so hot keys do not hammer the loader.
    pub async fn set_negative(&self, key: &str) {
        self.local
            .set(key, Arc::new(Vec::new()), true, self.local_ttl(NEGATIVE_TTL));
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.set(key, &[FLAG_NEGATIVE], NEGATIVE_TTL).await {
                warn!(key, error = %e, "Remote cache write failed");
            }
        }
    }

    /// Returns the cached value or computes it through the single-flight
    /// barrier: the loader runs at most once per key across concurrent
    /// callers and every caller gets a byte-identical payload.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Deadline,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.lookup(key).await {
            Lookup::Hit(bytes) => return Ok(serde_json::from_slice(&bytes)?),
            Lookup::Negative => return Err(Error::NotFound(key.to_string())),
            Lookup::Miss => {}
        }

        let bytes = self
            .flights
            .run(key, deadline, || async {
                // Another flight may have populated the key while this
                // caller was queueing on the barrier.
                if let Lookup::Hit(bytes) = self.lookup(key).await {
                    return Ok(bytes);
                }
                let value = loader().await?;
                let bytes = Arc::new(serde_json::to_vec(&value)?);
                self.store(key, bytes.clone(), ttl).await;
                Ok(bytes)
            })
            .await?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn invalidate(&self, key: &str) {
        self.local.remove(key);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(key).await {
                warn!(key, error = %e, "Remote cache delete failed");
            }
        }
    }

    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.local.remove_prefix(prefix);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete_prefix(prefix).await {
                warn!(prefix, error = %e, "Remote cache prefix delete failed");
            }
        }
    }

    /// Janitor entry point for the background eviction task.
    pub fn evict_expired_local(&self) -> usize {
        self.local.evict_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryRemote;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fabric_with_remote() -> (CacheFabric, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::default());
        (CacheFabric::new(Some(remote.clone())), remote)
    }

    #[tokio::test]
    async fn set_writes_both_tiers() {
        let (fabric, remote) = fabric_with_remote();
        fabric
            .set("k", &"value".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            fabric.get::<String>("k").await,
            Some("value".to_string())
        );
        assert!(remote.contains("k"));
    }

    #[tokio::test]
    async fn remote_tier_backfills_local() {
        let (fabric, remote) = fabric_with_remote();
        fabric
            .set("k", &7u64, Duration::from_secs(60))
            .await
            .unwrap();
        // Simulate a fresh process: local tier is empty, remote survives.
        let fresh = CacheFabric::new(Some(remote.clone() as Arc<dyn RemoteCache>));
        assert_eq!(fresh.get::<u64>("k").await, Some(7));
    }

    #[tokio::test]
    async fn negative_entries_absorb_misses() {
        let (fabric, _remote) = fabric_with_remote();
        fabric.set_negative("missing").await;

        let result = fabric
            .get_or_compute::<u64, _, _>(
                "missing",
                Duration::from_secs(60),
                Deadline::after(Duration::from_secs(5)),
                || async { panic!("loader must not run for a cached miss") },
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn single_flight_loads_once() {
        let fabric = Arc::new(CacheFabric::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let fabric = fabric.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                fabric
                    .get_or_compute::<u64, _, _>(
                        "hot",
                        Duration::from_secs(60),
                        Deadline::after(Duration::from_secs(5)),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(99)
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_prefix_clears_domain() {
        let (fabric, remote) = fabric_with_remote();
        fabric.set("char:loc:1", &1u64, Duration::from_secs(60)).await.unwrap();
        fabric.set("char:loc:2", &2u64, Duration::from_secs(60)).await.unwrap();
        fabric.set("market:orders:1:34", &3u64, Duration::from_secs(60)).await.unwrap();

        fabric.invalidate_prefix("char:loc:").await;
        assert_eq!(fabric.get::<u64>("char:loc:1").await, None);
        assert_eq!(fabric.get::<u64>("char:loc:2").await, None);
        assert_eq!(fabric.get::<u64>("market:orders:1:34").await, Some(3));
        assert!(!remote.contains("char:loc:1"));
    }
}
