//! Per-cluster serialization of lifecycle commands.
//!
//! Commands for the same cluster name run one at a time, in the order they
//! acquire the lock; commands for different names never wait on each other.
//! Entries exist only while someone holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
struct Registry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Registry {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Named async locks.
#[derive(Clone, Default)]
pub struct ClusterLocks {
    registry: Arc<Registry>,
}

/// Held while a command for `name` runs.
pub struct ClusterGuard {
    name: String,
    registry: Arc<Registry>,
    guard: OwnedMutexGuard<()>,
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        let mut slots = self.registry.slots();
        // The registry and this guard hold the only references: nobody waits.
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.guard)) == 2 {
            slots.remove(&self.name);
        }
    }
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &str) -> ClusterGuard {
        let slot = self
            .registry
            .slots()
            .entry(name.to_string())
            .or_default()
            .clone();
        let guard = slot.lock_owned().await;

        ClusterGuard {
            name: name.to_string(),
            registry: self.registry.clone(),
            guard,
        }
    }

    /// Names currently locked or awaited, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.slots().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.registry.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = ClusterLocks::new();
        let guard = locks.lock("alpha").await;
        assert_eq!(locks.active(), vec!["alpha".to_string()]);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_name_is_serialized() {
        let locks = ClusterLocks::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _guard = locks.lock("alpha").await;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let locks = ClusterLocks::new();
        let _alpha = locks.lock("alpha").await;

        let beta = tokio::time::timeout(Duration::from_secs(1), locks.lock("beta")).await;
        assert!(beta.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_keeps_entry_alive() {
        let locks = ClusterLocks::new();
        let first = locks.lock("alpha").await;

        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _guard = locks.lock("alpha").await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
