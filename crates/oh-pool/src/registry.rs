//! PoolRegistry - the named-pool store shared by every backend adapter
//!
//! A pool is created once per name and lives until the registry is drained.
//! Asking to create a name that already exists returns the existing pool and
//! ignores the new options.

use std::any::Any;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::factory::ResourceFactory;
use crate::options::PoolOptions;
use crate::pool::{Pool, PoolStatus};
use crate::{PoolError, Result};

/// Type-erased view of a pool so pools of different resource types can share
/// one map.
trait RegisteredPool: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn status(&self) -> PoolStatus;
    fn drain(&self) -> BoxFuture<'static, ()>;
}

impl<R: Send + 'static> RegisteredPool for Pool<R> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn status(&self) -> PoolStatus {
        Pool::status(self)
    }

    fn drain(&self) -> BoxFuture<'static, ()> {
        let pool = self.clone();
        Box::pin(async move { pool.drain().await })
    }
}

/// Process-wide named pool store.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<dyn RegisteredPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pool `name`, or return it unchanged if it already exists.
    ///
    /// When `options.min_size > 0` and a tokio runtime is available, the pool
    /// is warmed up in the background; warm-up failures are logged only.
    pub fn create_pool<F>(
        &self,
        factory: F,
        name: &str,
        options: PoolOptions,
    ) -> Result<Pool<F::Resource>>
    where
        F: ResourceFactory,
    {
        let pool = match self.pools.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                debug!(pool = %name, "Pool already registered, reusing");
                return downcast::<F::Resource>(name, existing.get().as_ref());
            }
            Entry::Vacant(slot) => {
                let pool = Pool::new(name, factory, options)?;
                slot.insert(Arc::new(pool.clone()));
                pool
            }
        };

        info!(
            pool = %name,
            min_size = pool.options().min_size,
            max_size = pool.options().max_size,
            test_on_borrow = pool.options().test_on_borrow,
            "Created resource pool"
        );
        spawn_warm_up(&pool);

        Ok(pool)
    }

    /// Look up an existing pool. There is no implicit creation.
    pub fn get_pool<R: Send + 'static>(&self, name: &str) -> Result<Pool<R>> {
        let entry = self
            .pools
            .get(name)
            .ok_or_else(|| PoolError::Unavailable(name.to_string()))?;
        downcast::<R>(name, entry.value().as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<PoolStatus> = self.pools.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Drain every registered pool. Entries stay registered so late callers
    /// get `PoolError::Closed` rather than `Unavailable`.
    pub async fn drain_all(&self) {
        let pools: Vec<Arc<dyn RegisteredPool>> =
            self.pools.iter().map(|e| Arc::clone(e.value())).collect();

        for pool in pools {
            pool.drain().await;
        }
        info!(count = self.pools.len(), "All pools drained");
    }
}

fn downcast<R: Send + 'static>(name: &str, pool: &dyn RegisteredPool) -> Result<Pool<R>> {
    pool.as_any()
        .downcast_ref::<Pool<R>>()
        .cloned()
        .ok_or_else(|| PoolError::TypeMismatch(name.to_string()))
}

fn spawn_warm_up<R: Send + 'static>(pool: &Pool<R>) {
    if pool.options().min_size == 0 {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!(pool = %pool.name(), "No runtime available, skipping warm-up");
        return;
    };

    let pool = pool.clone();
    handle.spawn(async move {
        if let Err(e) = pool.ensure_min_size().await {
            warn!(pool = %pool.name(), error = %e, "Pool warm-up failed");
        }
    });
}
