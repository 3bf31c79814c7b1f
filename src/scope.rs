use std::ops::{Deref, DerefMut};

/// Grants a single-use, exclusively-owned execution resource per run.
///
/// The provider is an opaque collaborator; the framework only relies on
/// `acquire` handing out a resource no other concurrent run can observe, and
/// on `release` being called for every acquired resource. Implementations
/// must be safe to call concurrently from independent runs.
pub trait ResourceProvider<R>: Send + Sync {
    fn acquire(&self) -> anyhow::Result<R>;

    fn release(&self, resource: R);
}

/// RAII guard around a single acquired resource.
///
/// A fresh scope is opened for every task invocation, even for a directly
/// called task with no pool involvement, and the resource is handed back on
/// every exit path: normal return, error and cancellation alike.
pub struct ResourceScope<'a, R> {
    provider: &'a dyn ResourceProvider<R>,
    resource: Option<R>,
}

impl<'a, R> ResourceScope<'a, R> {
    pub fn acquire(provider: &'a dyn ResourceProvider<R>) -> anyhow::Result<Self> {
        let resource = provider.acquire()?;
        Ok(Self {
            provider,
            resource: Some(resource),
        })
    }

    pub fn resource_mut(&mut self) -> &mut R {
        // Only ever None inside drop.
        self.resource.as_mut().unwrap()
    }
}

impl<R> Deref for ResourceScope<'_, R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().unwrap()
    }
}

impl<R> DerefMut for ResourceScope<'_, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().unwrap()
    }
}

impl<R> Drop for ResourceScope<'_, R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.provider.release(resource);
        }
    }
}
