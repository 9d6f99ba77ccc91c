use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;

/// Deduplicates concurrent work by key: the first caller (the leader) runs
/// the work, everyone else arriving while it is in flight waits for the
/// leader's result.
///
/// The key is cleared before the result is published, so callers arriving
/// after completion start a fresh flight.
pub struct Singleflight<T: Clone> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Waiter(watch::Receiver<Option<T>>),
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<Option<T>>>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `work` under `key`, or wait for the in-flight leader. Returns
    /// the result and whether this caller led.
    ///
    /// If a leader dies without publishing (task panic or abort), one of
    /// the waiters takes over and runs the work itself.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut work = Some(work);
        loop {
            let role = {
                let mut calls = self.lock();
                match calls.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        calls.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let Some(work) = work.take() else {
                        // A caller can only lead once per run() invocation.
                        unreachable!("singleflight leader ran twice");
                    };
                    let result = work().await;
                    self.lock().remove(key);
                    let _ = tx.send(Some(result.clone()));
                    return (result, true);
                }
                Role::Waiter(mut rx) => {
                    let wait_result = rx.wait_for(|v| v.is_some()).await.map(|v| v.clone());
                    match wait_result {
                        Ok(value) => {
                            if let Some(v) = value {
                                return (v, false);
                            }
                        }
                        Err(_) => {
                            // Leader vanished without publishing; clear the
                            // dead entry (if still ours) and retry.
                            let mut calls = self.lock();
                            if calls.get(key).is_some_and(|cur| cur.same_channel(&rx)) {
                                calls.remove(key);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights = Arc::new(Singleflight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run("key", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42u32
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (value, led) = handle.await.unwrap();
            assert_eq!(value, 42);
            if led {
                leaders += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let flights = Singleflight::new();
        let (a, led_a) = flights.run("a", || async { "a" }).await;
        let (b, led_b) = flights.run("b", || async { "b" }).await;
        assert_eq!((a, b), ("a", "b"));
        assert!(led_a && led_b);
    }

    #[tokio::test]
    async fn sequential_calls_each_lead() {
        let flights = Singleflight::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            let (_, led) = flights
                .run("key", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            assert!(led);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn waiter_takes_over_after_leader_dies() {
        let flights = Arc::new(Singleflight::new());

        // Leader that never publishes: aborted mid-flight.
        let leader = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        0u32
                    })
                    .await
            })
        };
        // Give the leader time to claim the key.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move { flights.run("key", || async { 7u32 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let (value, led) = waiter.await.unwrap();
        assert_eq!(value, 7);
        assert!(led);
    }
}
