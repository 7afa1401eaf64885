//! Bounded pool of reusable expensive resources.
//!
//! Takers pop a cached instance, fall back to the factory when one is
//! configured, and otherwise block on the item-freed signal until the
//! timeout. Returning an item runs the prepare hook first; a return that
//! would exceed capacity disposes the item instead of caching it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::ChainError;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Prepare<T> = Box<dyn Fn(&mut T) + Send + Sync>;

pub struct DisposableItemPool<T> {
    items: Mutex<Vec<T>>,
    freed: Condvar,
    capacity: usize,
    factory: Option<Factory<T>>,
    prepare: Option<Prepare<T>>,
}

impl<T> DisposableItemPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            freed: Condvar::new(),
            capacity,
            factory: None,
            prepare: None,
        }
    }

    pub fn with_factory(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let mut pool = Self::new(capacity);
        pool.factory = Some(Box::new(factory));
        pool
    }

    pub fn prepare_with(mut self, prepare: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.prepare = Some(Box::new(prepare));
        self
    }

    /// Adds an initial instance; over-capacity seeds are disposed.
    pub fn seed(&self, item: T) {
        let mut items = self.items.lock().expect("pool lock");
        if items.len() < self.capacity {
            items.push(item);
            drop(items);
            self.freed.notify_one();
        }
    }

    pub fn cached(&self) -> usize {
        self.items.lock().expect("pool lock").len()
    }

    pub fn take(pool: &Arc<Self>, timeout: Duration) -> Result<PoolHandle<T>, ChainError> {
        let deadline = Instant::now() + timeout;
        let mut items = pool.items.lock().expect("pool lock");
        loop {
            if let Some(item) = items.pop() {
                drop(items);
                return Ok(PoolHandle {
                    pool: Arc::clone(pool),
                    item: Some(item),
                });
            }
            if let Some(factory) = &pool.factory {
                drop(items);
                let item = factory();
                return Ok(PoolHandle {
                    pool: Arc::clone(pool),
                    item: Some(item),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ChainError::Timeout);
            }
            let (guard, _) = pool
                .freed
                .wait_timeout(items, deadline - now)
                .expect("pool lock");
            items = guard;
        }
    }

    fn give_back(&self, mut item: T) {
        if let Some(prepare) = &self.prepare {
            prepare(&mut item);
        }
        let mut items = self.items.lock().expect("pool lock");
        if items.len() < self.capacity {
            items.push(item);
            drop(items);
            self.freed.notify_one();
        }
        // Over capacity the item is simply dropped.
    }
}

pub struct PoolHandle<T> {
    pool: Arc<DisposableItemPool<T>>,
    item: Option<T>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle").field("item", &self.item).finish()
    }
}

impl<T> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pool item present")
    }
}

impl<T> DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pool item present")
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}
