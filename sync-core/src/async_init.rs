use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

enum Slot<V> {
    Pending(Arc<tokio::sync::Notify>),
    Resolved(V),
}

/// Replaces ad-hoc module-global caches. Runs an initializer at most once
/// per key, caching the resolved value and handing the same value to all
/// concurrent callers for that key. On rejection the entry is evicted so
/// the next caller retries. This is the mechanism guaranteeing exactly one
/// database open / migrate / handler-wire-up per client id.
pub struct AsyncInitRegistry<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for AsyncInitRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }
}

impl<K, V> AsyncInitRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `init` at most once per `key`. Concurrent callers for the same
    /// key await the same in-flight initialization rather than racing it.
    pub async fn run<F, E>(&self, key: K, init: impl FnOnce() -> F) -> Result<V, E>
    where
        F: Future<Output = Result<V, E>>,
    {
        loop {
            let notify = {
                let mut slots = self.slots.lock().await;
                match slots.get(&key) {
                    Some(Slot::Resolved(value)) => return Ok(value.clone()),
                    Some(Slot::Pending(notify)) => notify.clone(),
                    None => {
                        let notify = Arc::new(tokio::sync::Notify::new());
                        slots.insert(key.clone(), Slot::Pending(notify.clone()));
                        drop(slots);

                        let result = init().await;
                        let mut slots = self.slots.lock().await;
                        match &result {
                            Ok(value) => {
                                slots.insert(key.clone(), Slot::Resolved(value.clone()));
                            }
                            Err(_) => {
                                slots.remove(&key);
                            }
                        }
                        notify.notify_waiters();
                        return result;
                    }
                }
            };
            notify.notified().await;
        }
    }

    /// Evicts the cached (or in-flight) entry for `key`, forcing the next
    /// `run` call to re-initialize.
    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_init_once_per_key() {
        let registry: AsyncInitRegistry<String, i32> = AsyncInitRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result = registry
                .run("db".to_string(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(42)
                })
                .await;
            assert_eq!(result, Ok(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_init() {
        let registry: Arc<AsyncInitRegistry<String, i32>> = Arc::new(AsyncInitRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .run("db".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Ok::<_, String>(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejection_is_evicted_and_retried() {
        let registry: AsyncInitRegistry<String, i32> = AsyncInitRegistry::new();

        let first = registry.run("db".to_string(), || async { Err::<i32, _>("boom") }).await;
        assert_eq!(first, Err("boom"));

        let second = registry.run("db".to_string(), || async { Ok::<_, &str>(99) }).await;
        assert_eq!(second, Ok(99));
    }

    #[tokio::test]
    async fn invalidate_forces_reinit() {
        let registry: AsyncInitRegistry<String, i32> = AsyncInitRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        registry
            .run("db".to_string(), || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await
            .unwrap();

        registry.invalidate(&"db".to_string()).await;

        let calls_clone = calls.clone();
        registry
            .run("db".to_string(), || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(2)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
