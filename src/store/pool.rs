use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use super::{Store, StoreError};

pub const DEFAULT_POOL_SIZE: usize = 5;

/// Bounded pool of store handles. A lease hands out exclusive ownership of
/// one handle; callers block on the condvar while all handles are out.
pub struct StorePool {
    idle: Mutex<Vec<Store>>,
    available: Condvar,
    size: usize,
}

impl StorePool {
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Arc<Self>, StoreError> {
        let size = size.max(1);
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(Store::open(path.as_ref())?);
        }

        Ok(Arc::new(Self {
            idle: Mutex::new(idle),
            available: Condvar::new(),
            size,
        }))
    }

    /// Blocks until a handle is free. The lease returns it on drop, on every
    /// exit path.
    pub fn lease(self: &Arc<Self>) -> StoreLease {
        let mut idle = self.idle.lock().expect("store pool lock poisoned");
        while idle.is_empty() {
            idle = self
                .available
                .wait(idle)
                .expect("store pool lock poisoned");
        }
        let store = idle.pop().expect("checked non-empty above");

        StoreLease {
            store: Some(store),
            pool: Arc::clone(self),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("store pool lock poisoned").len()
    }

    fn give_back(&self, store: Store) {
        self.idle
            .lock()
            .expect("store pool lock poisoned")
            .push(store);
        self.available.notify_one();
    }
}

pub struct StoreLease {
    store: Option<Store>,
    pool: Arc<StorePool>,
}

impl Deref for StoreLease {
    type Target = Store;

    fn deref(&self) -> &Store {
        self.store.as_ref().expect("lease already returned")
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            self.pool.give_back(store);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::StorePool;

    fn temp_db(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "faregate-pool-test-{suffix}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("temp pool dir should create");
        dir.join("store.db")
    }

    fn cleanup(path: &PathBuf) {
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn leases_are_returned_on_drop() {
        let path = temp_db("return");
        let pool = StorePool::open(&path, 2).expect("pool should open");
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle_count(), 2);

        {
            let first = pool.lease();
            let second = pool.lease();
            assert_eq!(pool.idle_count(), 0);
            drop(first);
            assert_eq!(pool.idle_count(), 1);
            drop(second);
        }
        assert_eq!(pool.idle_count(), 2);
        cleanup(&path);
    }

    #[test]
    fn lease_blocks_until_a_handle_frees_up() {
        let path = temp_db("block");
        let pool = StorePool::open(&path, 1).expect("pool should open");

        let held = pool.lease();
        let (tx, rx) = mpsc::channel();
        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || {
            let lease = waiter_pool.lease();
            tx.send(()).expect("send should work");
            drop(lease);
        });

        // the waiter cannot acquire while the handle is held
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        waiter.join().expect("waiter thread should finish");
        cleanup(&path);
    }

    #[test]
    fn pool_size_is_at_least_one() {
        let path = temp_db("min-size");
        let pool = StorePool::open(&path, 0).expect("pool should open");
        assert_eq!(pool.size(), 1);
        cleanup(&path);
    }
}
