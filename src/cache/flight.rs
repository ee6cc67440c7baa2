//! Single-flight request coalescing.
//!
//! Concurrent callers for the same key share one underlying computation:
//! the first caller becomes the leader and runs the work, everyone else
//! subscribes to the leader's broadcast. All callers observe the same value
//! or the same error.

use crate::error::{Error, Result};
use crate::models::Deadline;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct FlightGroup<T: Clone + Send + 'static> {
    flights: Arc<Mutex<HashMap<String, broadcast::Sender<Result<T>>>>>,
}

impl<T: Clone + Send + 'static> Default for FlightGroup<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` under the flight for `key`, or waits on the in-progress
    /// flight if one exists. The leader's deadline bounds the computation;
    /// when it expires every waiter receives `DeadlineExceeded`.
    pub async fn run<F, Fut>(&self, key: &str, deadline: Deadline, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        enum Action<T> {
            Wait(broadcast::Receiver<Result<T>>),
            Lead(broadcast::Sender<Result<T>>),
        }

        let action = {
            let mut flights = self.flights.lock();
            if let Some(tx) = flights.get(key) {
                Action::Wait(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                flights.insert(key.to_string(), tx.clone());
                Action::Lead(tx)
            }
        };

        match action {
            Action::Lead(tx) => self.lead(key, deadline, tx, work).await,
            Action::Wait(mut rx) => {
                match tokio::time::timeout_at(deadline.instant(), rx.recv()).await {
                    Err(_) => Err(Error::DeadlineExceeded),
                    Ok(Ok(result)) => result,
                    // The leader went away without publishing (cancelled task).
                    Ok(Err(_)) => {
                        Err(Error::Internal("coalesced computation was abandoned".into()))
                    }
                }
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        deadline: Deadline,
        tx: broadcast::Sender<Result<T>>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Clears the flight even if the leader's future is dropped, so a
        // later caller can start fresh instead of waiting forever.
        let _guard = FlightGuard {
            flights: self.flights.clone(),
            key: key.to_string(),
        };

        let result = match tokio::time::timeout_at(deadline.instant(), work()).await {
            Err(_) => Err(Error::DeadlineExceeded),
            Ok(result) => result,
        };

        // Waiters may have all timed out already; a send failure is fine.
        let _ = tx.send(result.clone());
        result
    }
}

struct FlightGuard<T> {
    flights: Arc<Mutex<HashMap<String, broadcast::Sender<Result<T>>>>>,
    key: String,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.flights.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let group = Arc::new(FlightGroup::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("key", deadline, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42u64)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let group = Arc::new(FlightGroup::<u64>::new());
        let deadline = Deadline::after(Duration::from_secs(5));

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key", deadline, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u64, _>(Error::UpstreamUnavailable("down".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = group.run("key", deadline, || async { Ok(7u64) }).await;
        assert!(matches!(follower, Err(Error::UpstreamUnavailable(_))));
        assert!(matches!(
            leader.await.unwrap(),
            Err(Error::UpstreamUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_release_on_deadline() {
        let group = Arc::new(FlightGroup::<u64>::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key", Deadline::after(Duration::from_millis(100)), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1u64)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = group
            .run("key", Deadline::after(Duration::from_millis(100)), || async { Ok(2u64) })
            .await;
        assert!(matches!(follower, Err(Error::DeadlineExceeded)));
        assert!(matches!(leader.await.unwrap(), Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn flight_clears_after_completion() {
        let group = FlightGroup::<u64>::new();
        let deadline = Deadline::after(Duration::from_secs(5));

        let first = group.run("key", deadline, || async { Ok(1u64) }).await.unwrap();
        let second = group.run("key", deadline, || async { Ok(2u64) }).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
