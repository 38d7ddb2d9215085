//! Resource factories
//!
//! A factory knows how to open, check and close one kind of resource. Backend
//! adapters implement [`ResourceFactory`] directly; ad-hoc pools can assemble
//! one from closures with [`FactoryBuilder`], which refuses to build unless
//! both `create` and `destroy` were supplied.

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{PoolError, Result};

/// Create/validate/destroy callbacks for one resource type.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Open one physical resource.
    async fn create(&self) -> Result<Self::Resource>;

    /// Whether an idle resource may be lent again. Must not block; health
    /// is expected to be tracked on the resource itself.
    fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Release the underlying OS/network resource.
    async fn destroy(&self, resource: Self::Resource);
}

type CreateFn<R> = Box<dyn Fn() -> BoxFuture<'static, Result<R>> + Send + Sync>;
type ValidateFn<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;
type DestroyFn<R> = Box<dyn Fn(R) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builds a [`FnFactory`] from closures.
pub struct FactoryBuilder<R> {
    create: Option<CreateFn<R>>,
    validate: Option<ValidateFn<R>>,
    destroy: Option<DestroyFn<R>>,
}

impl<R: Send + 'static> FactoryBuilder<R> {
    pub fn new() -> Self {
        Self {
            create: None,
            validate: None,
            destroy: None,
        }
    }

    pub fn create<F, Fut>(mut self, create: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.create = Some(Box::new(move || Box::pin(create())));
        self
    }

    pub fn validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }

    pub fn destroy<F, Fut>(mut self, destroy: F) -> Self
    where
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.destroy = Some(Box::new(move |resource| Box::pin(destroy(resource))));
        self
    }

    pub fn build(self) -> Result<FnFactory<R>> {
        let create = self.create.ok_or_else(|| {
            PoolError::Config("resource factory must provide a create operation".to_string())
        })?;
        let destroy = self.destroy.ok_or_else(|| {
            PoolError::Config("resource factory must provide a destroy operation".to_string())
        })?;

        Ok(FnFactory {
            create,
            validate: self.validate,
            destroy,
        })
    }
}

impl<R: Send + 'static> Default for FactoryBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Closure-backed factory produced by [`FactoryBuilder`].
pub struct FnFactory<R> {
    create: CreateFn<R>,
    validate: Option<ValidateFn<R>>,
    destroy: DestroyFn<R>,
}

#[async_trait]
impl<R: Send + 'static> ResourceFactory for FnFactory<R> {
    type Resource = R;

    async fn create(&self) -> Result<R> {
        (self.create)().await
    }

    fn validate(&self, resource: &R) -> bool {
        self.validate.as_ref().map_or(true, |validate| validate(resource))
    }

    async fn destroy(&self, resource: R) {
        (self.destroy)(resource).await
    }
}
