//! Stale-while-revalidate resource cache.
//!
//! A [`CachedResource`] starts from whatever value was last persisted under
//! its key, then revalidates through its fetcher when activated. Successful
//! fetches replace the value and are written back best-effort. Failed
//! fetches keep the stale value and record the error.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, SharedClientError};
use crate::storage::KeyValueStorage;

pub const CACHE_PREFIX: &str = "swr:";

pub type Fetcher<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, ClientError>> + Send + Sync>;

#[derive(Debug)]
pub struct ResourceSnapshot<T> {
    pub data: Option<T>,
    pub error: Option<SharedClientError>,
    pub is_validating: bool,
}

impl<T> ResourceSnapshot<T> {
    /// Nothing to show yet: no value and no error.
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }
}

impl<T: Clone> Clone for ResourceSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_validating: self.is_validating,
        }
    }
}

pub fn storage_key(key: &str) -> String {
    format!("{CACHE_PREFIX}{key}")
}

struct ResourceInner<T> {
    key: String,
    storage: Arc<dyn KeyValueStorage>,
    fetcher: Fetcher<T>,
    state: watch::Sender<ResourceSnapshot<T>>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl<T> ResourceInner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn persist(&self, value: &T) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(key = %self.key, error = %error, "cache value not serializable");
                return;
            }
        };
        if let Err(error) = self.storage.set_item(&storage_key(&self.key), &encoded) {
            tracing::warn!(key = %self.key, error = %error, "cache write skipped");
        }
    }

    async fn revalidate(self: Arc<Self>) {
        if !self.is_alive() {
            return;
        }
        self.state.send_modify(|state| state.is_validating = true);

        let result = (self.fetcher)(self.cancel.clone()).await;

        if !self.is_alive() {
            tracing::debug!(key = %self.key, "discarding result for deactivated resource");
            return;
        }
        match result {
            Ok(fresh) => {
                self.persist(&fresh);
                self.state.send_modify(|state| {
                    state.data = Some(fresh);
                    state.error = None;
                    state.is_validating = false;
                });
            }
            Err(error) => {
                tracing::debug!(key = %self.key, error = %error, "revalidation failed");
                self.state.send_modify(|state| {
                    state.error = Some(Arc::new(error));
                    state.is_validating = false;
                });
            }
        }
    }
}

/// Handle to one cached resource. Dropping it deactivates the resource.
pub struct CachedResource<T> {
    inner: Arc<ResourceInner<T>>,
}

impl<T> std::fmt::Debug for CachedResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedResource")
            .field("key", &self.inner.key)
            .field("alive", &self.inner.alive.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> CachedResource<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates the resource, seeding it from storage. No fetch happens until
    /// [`activate`](Self::activate) or
    /// [`invalidate_and_refetch`](Self::invalidate_and_refetch).
    pub fn new<F, Fut>(key: impl Into<String>, storage: Arc<dyn KeyValueStorage>, fetcher: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        let key = key.into();
        let fetcher: Fetcher<T> = Arc::new(move |cancel| fetcher(cancel).boxed());
        let initial = read_persisted::<T>(storage.as_ref(), &key);
        let (state, _) = watch::channel(ResourceSnapshot {
            data: initial,
            error: None,
            is_validating: false,
        });
        Self {
            inner: Arc::new(ResourceInner {
                key,
                storage,
                fetcher,
                state,
                alive: AtomicBool::new(true),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Starts a background revalidation. Must be called inside a tokio runtime.
    /// The snapshot reports `is_validating` as soon as this returns.
    pub fn activate(&self) -> JoinHandle<()> {
        if self.inner.is_alive() {
            self.inner
                .state
                .send_modify(|state| state.is_validating = true);
        }
        tokio::spawn(Arc::clone(&self.inner).revalidate())
    }

    /// Revalidates now and resolves once the new state is in place.
    pub async fn invalidate_and_refetch(&self) {
        Arc::clone(&self.inner).revalidate().await;
    }

    /// Stops all future state updates and cancels in-flight fetches.
    pub fn deactivate(&self) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            self.inner.cancel.cancel();
            tracing::debug!(key = %self.inner.key, "resource deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_alive()
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn snapshot(&self) -> ResourceSnapshot<T> {
        self.inner.state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot<T>> {
        self.inner.state.subscribe()
    }
}

impl<T> Drop for CachedResource<T> {
    fn drop(&mut self) {
        self.inner.alive.store(false, Ordering::Release);
        self.inner.cancel.cancel();
    }
}

fn read_persisted<T: DeserializeOwned>(storage: &dyn KeyValueStorage, key: &str) -> Option<T> {
    let raw = storage.get_item(&storage_key(key))?;
    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(key, error = %error, "ignoring unreadable cache entry");
            None
        }
    }
}
