//! 按上传 ID 的内存锁：同一上传同一时刻只允许一次合并。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for lock on {0}")]
pub struct LockTimeout(pub String);

/// Manages asynchronous mutexes keyed by upload id.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取锁。
    pub async fn lock_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout(key.to_string()))
    }

    /// Drops the entry for `key` once nobody holds or waits on it.
    pub async fn prune(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(key)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
