//! Deferred values resolved once and cached.
//!
//! A rule or store can be supplied ready-made, as a producer closure, or as a pending
//! computation (loading a config file, connecting to Redis). [`LazyValue`] resolves the source
//! on first access and memoizes the result; the source is never consulted again.

use crate::error::{BoxError, LoadError};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Source of a value that may not exist yet.
pub enum Loadable<T> {
    /// Ready to use.
    Value(T),
    /// Zero-argument producer, called once.
    Factory(Box<dyn FnOnce() -> T + Send>),
    /// Pending computation, awaited once.
    Pending(BoxFuture<'static, Result<T, BoxError>>),
}

impl<T> Loadable<T> {
    /// Wrap a producer closure.
    pub fn factory<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Loadable::Factory(Box::new(f))
    }

    /// Wrap a fallible future.
    pub fn pending<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Loadable::Pending(Box::pin(fut))
    }

    async fn resolve(self) -> Result<T, LoadError> {
        match self {
            Loadable::Value(value) => Ok(value),
            Loadable::Factory(f) => Ok(f()),
            Loadable::Pending(fut) => fut.await.map_err(LoadError::Failed),
        }
    }
}

impl<T> From<T> for Loadable<T> {
    fn from(value: T) -> Self {
        Loadable::Value(value)
    }
}

impl<T> std::fmt::Debug for Loadable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Loadable::Value(_) => "Value",
            Loadable::Factory(_) => "Factory",
            Loadable::Pending(_) => "Pending",
        };
        f.debug_tuple("Loadable").field(&kind).finish()
    }
}

/// Resolve-once holder for a [`Loadable`].
pub struct LazyValue<T> {
    source: Mutex<Option<Loadable<T>>>,
    value: OnceCell<Arc<T>>,
}

impl<T> LazyValue<T> {
    /// Wrap a source without resolving it.
    pub fn new(source: Loadable<T>) -> Self {
        Self { source: Mutex::new(Some(source)), value: OnceCell::new() }
    }

    /// Resolve on first call, then return the cached value.
    ///
    /// Concurrent first callers wait on a single resolution. If a pending computation fails the
    /// source is gone and later calls report [`LoadError::Consumed`].
    pub async fn get(&self) -> Result<Arc<T>, LoadError> {
        self.value
            .get_or_try_init(|| async {
                let source = self.source.lock().unwrap_or_else(PoisonError::into_inner).take();
                match source {
                    Some(source) => source.resolve().await.map(Arc::new),
                    None => Err(LoadError::Consumed),
                }
            })
            .await
            .cloned()
    }

    /// The cached value, if resolution already happened.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.value.get().cloned()
    }
}

impl<T> std::fmt::Debug for LazyValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyValue").field("resolved", &self.value.initialized()).finish()
    }
}
