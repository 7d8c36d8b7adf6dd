use crate::models::OfflineResponse;
use redis::AsyncCommands;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, OnceCell},
    time::Instant,
};
use tracing::warn;

pub fn ttl_from_env() -> Duration {
    Duration::from_secs(crate::config::env_parse::<u64>("IDEMPOTENCY_TTL_SECS").unwrap_or(3600))
}

/// Replay keys are scoped per account so two sellers cannot collide.
pub fn scoped_key(account_id: &str, key: &str) -> String {
    format!("delist:idem:{account_id}:{key}")
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<OfflineResponse> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "delist.idempotency", error = %err, "redis_unavailable");
            return None;
        }
    };
    let s: Option<String> = conn.get(key).await.ok().flatten();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(
    client: &redis::Client,
    key: &str,
    value: &OfflineResponse,
    ttl_secs: u64,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

/// In-process replay store used when Redis is not configured.
///
/// Requests sharing a key run once: later callers wait for the first and get
/// its response. A failed run caches nothing. Stored responses expire after
/// `ttl`, and expired or abandoned slots are dropped on the next access.
pub struct MemoryReplay<T> {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot<T>>>,
}

struct Slot<T> {
    cell: Arc<OnceCell<T>>,
    created: Instant,
}

impl<T> Slot<T> {
    fn stale(&self, ttl: Duration) -> bool {
        if self.cell.initialized() {
            self.created.elapsed() >= ttl
        } else {
            Arc::strong_count(&self.cell) == 1
        }
    }
}

impl<T: Clone> MemoryReplay<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_run<E, F, Fut>(&self, key: String, run: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = {
            let mut slots = self.slots.lock().await;
            let ttl = self.ttl;
            slots.retain(|_, slot| !slot.stale(ttl));
            slots
                .entry(key)
                .or_insert_with(|| Slot {
                    cell: Arc::new(OnceCell::new()),
                    created: Instant::now(),
                })
                .cell
                .clone()
        };
        cell.get_or_try_init(run).await.cloned()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    async fn counted(runs: &AtomicU32) -> Result<u32, String> {
        Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[test]
    fn keys_are_namespaced_by_account() {
        assert_eq!(scoped_key("seller-1", "abc"), "delist:idem:seller-1:abc");
        assert_ne!(scoped_key("seller-1", "abc"), scoped_key("seller-2", "abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_expires_after_ttl() {
        let replay = MemoryReplay::new(TTL);
        let runs = AtomicU32::new(0);

        assert_eq!(replay.get_or_run("k".into(), || counted(&runs)).await, Ok(1));
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert_eq!(replay.get_or_run("k".into(), || counted(&runs)).await, Ok(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(replay.get_or_run("k".into(), || counted(&runs)).await, Ok(2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_dropped_on_access() {
        let replay = MemoryReplay::new(TTL);
        let runs = AtomicU32::new(0);
        for key in ["a", "b", "c"] {
            replay.get_or_run(key.into(), || counted(&runs)).await.unwrap();
        }
        assert_eq!(replay.len().await, 3);

        tokio::time::advance(TTL).await;
        replay.get_or_run("d".into(), || counted(&runs)).await.unwrap();
        assert_eq!(replay.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_run_once() {
        let replay = MemoryReplay::new(TTL);
        let runs = &AtomicU32::new(0);
        let slow = move || async move {
            let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>(n)
        };

        let (first, second) = tokio::join!(
            replay.get_or_run("k".into(), slow),
            replay.get_or_run("k".into(), slow),
        );
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_run_is_not_replayed() {
        let replay = MemoryReplay::<u32>::new(TTL);
        let failed = replay
            .get_or_run("k".into(), || async { Err::<u32, _>("bootstrap".to_string()) })
            .await;
        assert_eq!(failed, Err("bootstrap".to_string()));

        let runs = AtomicU32::new(0);
        assert_eq!(replay.get_or_run("k".into(), || counted(&runs)).await, Ok(1));
    }
}
