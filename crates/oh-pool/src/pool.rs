//! Pool - bounded, named cache of lazily created resources
//!
//! - Semaphore-bounded borrowing with a deadline
//! - FIFO idle queue
//! - Lazy creation up to `max_size`, background warm-up to `min_size`
//! - Optional validation before an idle resource is lent again
//! - RAII guard that returns the resource on drop

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::factory::ResourceFactory;
use crate::options::PoolOptions;
use crate::{PoolError, Result};

/// Backoff while every slot is reserved by in-progress creations.
const RESERVATION_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    /// Live resources (idle + borrowed + being created)
    pub size: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub drained: bool,
}

struct PoolState<R> {
    idle: VecDeque<R>,
    size: usize,
    borrowed: usize,
    total_created: u64,
    total_destroyed: u64,
    drained: bool,
}

struct PoolInner<R: Send + 'static> {
    name: String,
    options: PoolOptions,
    factory: Arc<dyn ResourceFactory<Resource = R>>,
    state: Mutex<PoolState<R>>,
    /// Limits concurrently borrowed resources. Idle resources hold no permit.
    semaphore: Arc<Semaphore>,
}

enum Slot<R> {
    Idle(R),
    Create,
    Wait,
}

/// Generic resource pool. Cloning yields another handle to the same pool.
pub struct Pool<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + 'static> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<R: Send + 'static> Pool<R> {
    /// Build an unregistered pool. Most callers go through
    /// [`PoolRegistry::create_pool`](crate::PoolRegistry::create_pool).
    pub fn new<F>(name: impl Into<String>, factory: F, options: PoolOptions) -> Result<Self>
    where
        F: ResourceFactory<Resource = R>,
    {
        options.validate()?;
        let max = options.max_size;

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                options,
                factory: Arc::new(factory),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max),
                    size: 0,
                    borrowed: 0,
                    total_created: 0,
                    total_destroyed: 0,
                    drained: false,
                }),
                semaphore: Arc::new(Semaphore::new(max)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// True when both handles point at the same pool.
    pub fn same_pool(&self, other: &Pool<R>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow a resource, creating one if none is idle and the pool has room.
    pub async fn acquire(&self) -> Result<Pooled<R>> {
        let inner = &self.inner;
        let timeout = inner.options.acquire_timeout;
        let deadline = Instant::now() + timeout;

        if inner.state.lock().drained {
            return Err(PoolError::Closed(inner.name.clone()));
        }

        let permit = tokio::time::timeout(timeout, Arc::clone(&inner.semaphore).acquire_owned())
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|_| PoolError::Closed(inner.name.clone()))?;

        loop {
            let slot = {
                let mut state = inner.state.lock();
                if state.drained {
                    return Err(PoolError::Closed(inner.name.clone()));
                }
                if let Some(resource) = state.idle.pop_front() {
                    Slot::Idle(resource)
                } else if state.size < inner.options.max_size {
                    state.size += 1;
                    Slot::Create
                } else {
                    Slot::Wait
                }
            };

            match slot {
                Slot::Idle(resource) => {
                    if inner.options.test_on_borrow && !inner.factory.validate(&resource) {
                        debug!(pool = %inner.name, "Discarding resource that failed validation");
                        self.destroy_resource(resource).await;
                        continue;
                    }
                    return Ok(self.lend(resource, permit));
                }
                Slot::Create => {
                    let resource = self.create_reserved(Some(deadline)).await?;
                    return Ok(self.lend(resource, permit));
                }
                Slot::Wait => {
                    if Instant::now() >= deadline {
                        return Err(self.timeout_error());
                    }
                    tokio::time::sleep(RESERVATION_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Create resources until the pool holds at least `min_size`.
    ///
    /// Returns how many resources were created.
    pub async fn ensure_min_size(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut created = 0;

        loop {
            {
                let mut state = inner.state.lock();
                if state.drained || state.size >= inner.options.min_size {
                    break;
                }
                state.size += 1;
            }

            let resource = self.create_reserved(None).await?;
            let late = {
                let mut state = inner.state.lock();
                if state.drained {
                    Some(resource)
                } else {
                    state.idle.push_back(resource);
                    None
                }
            };
            if let Some(resource) = late {
                self.destroy_resource(resource).await;
                break;
            }
            created += 1;
        }

        if created > 0 {
            debug!(pool = %inner.name, created, "Pool warmed up to minimum size");
        }
        Ok(created)
    }

    /// Destroy idle resources and refuse further borrows. Resources still on
    /// loan are destroyed when they come back.
    pub async fn drain(&self) {
        let inner = &self.inner;
        let idle: Vec<R> = {
            let mut state = inner.state.lock();
            if state.drained {
                return;
            }
            state.drained = true;
            state.idle.drain(..).collect()
        };
        inner.semaphore.close();

        let count = idle.len();
        for resource in idle {
            self.destroy_resource(resource).await;
        }

        info!(pool = %inner.name, destroyed = count, "Pool drained");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            name: self.inner.name.clone(),
            size: state.size,
            idle: state.idle.len(),
            borrowed: state.borrowed,
            min_size: self.inner.options.min_size,
            max_size: self.inner.options.max_size,
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
            drained: state.drained,
        }
    }

    /// Create into a slot already counted in `size`. The slot is freed if
    /// creation fails, outlives `deadline`, or the caller stops polling.
    async fn create_reserved(&self, deadline: Option<Instant>) -> Result<R> {
        let reservation = Reservation::new(&self.inner);

        let created = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.inner.factory.create()).await {
                    Ok(created) => created,
                    Err(_) => {
                        warn!(pool = %self.inner.name, "Resource creation outlived the borrow timeout");
                        return Err(self.timeout_error());
                    }
                }
            }
            None => self.inner.factory.create().await,
        };

        match created {
            Ok(resource) => {
                reservation.commit();
                self.inner.state.lock().total_created += 1;
                debug!(pool = %self.inner.name, "Created pooled resource");
                Ok(resource)
            }
            Err(e) => {
                warn!(pool = %self.inner.name, error = %e, "Failed to create pooled resource");
                Err(e)
            }
        }
    }

    /// Counters are settled before the factory runs, so an interrupted
    /// destroy never leaves a phantom slot behind.
    async fn destroy_resource(&self, resource: R) {
        {
            let mut state = self.inner.state.lock();
            state.size = state.size.saturating_sub(1);
            state.total_destroyed += 1;
        }
        self.inner.factory.destroy(resource).await;
    }

    fn lend(&self, resource: R, permit: OwnedSemaphorePermit) -> Pooled<R> {
        self.inner.state.lock().borrowed += 1;
        Pooled {
            resource: Some(resource),
            pool: self.clone(),
            _permit: permit,
        }
    }

    /// Called from the guard's drop; must not await.
    fn give_back(&self, resource: R) {
        let mut state = self.inner.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
        if !state.drained {
            state.idle.push_back(resource);
            return;
        }
        drop(state);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move { pool.destroy_resource(resource).await });
            }
            Err(_) => {
                let mut state = self.inner.state.lock();
                state.size = state.size.saturating_sub(1);
                state.total_destroyed += 1;
            }
        }
    }

    fn timeout_error(&self) -> PoolError {
        PoolError::Timeout {
            name: self.inner.name.clone(),
            timeout_ms: self.inner.options.acquire_timeout.as_millis() as u64,
        }
    }
}

/// A `size` slot claimed for a resource under construction. Dropping it
/// without [`Reservation::commit`] hands the slot back.
struct Reservation<'a, R: Send + 'static> {
    inner: &'a PoolInner<R>,
    armed: bool,
}

impl<'a, R: Send + 'static> Reservation<'a, R> {
    fn new(inner: &'a PoolInner<R>) -> Self {
        Self { inner, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<R: Send + 'static> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.size = state.size.saturating_sub(1);
        }
    }
}

/// A borrowed resource. Returned to its pool when dropped.
pub struct Pooled<R: Send + 'static> {
    resource: Option<R>,
    pool: Pool<R>,
    _permit: OwnedSemaphorePermit,
}

impl<R: Send + 'static> std::fmt::Debug for Pooled<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl<R: Send + 'static> Pooled<R> {
    /// Destroy the resource instead of returning it.
    pub async fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            {
                let mut state = self.pool.inner.state.lock();
                state.borrowed = state.borrowed.saturating_sub(1);
            }
            self.pool.destroy_resource(resource).await;
        }
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }
}

impl<R: Send + 'static> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("pooled resource present until drop")
    }
}

impl<R: Send + 'static> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("pooled resource present until drop")
    }
}

impl<R: Send + 'static> Drop for Pooled<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.give_back(resource);
        }
    }
}
