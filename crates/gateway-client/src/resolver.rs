//! Single-flight resolution of the signed-in profile.
//!
//! Concurrent callers that miss both the in-memory and the stored profile
//! share one `GET /auth/me` request. The shared handle is dropped as soon as
//! it settles so the next miss starts a fresh request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::SharedClientError;
use crate::identity::IdentityStore;
use crate::transport::AuthenticatedTransport;
use crate::types::UserProfile;

pub const ME_PATH: &str = "/auth/me";

type IdentityFuture = Shared<BoxFuture<'static, Result<UserProfile, SharedClientError>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    future: IdentityFuture,
}

#[derive(Clone)]
pub struct IdentityResolver {
    transport: AuthenticatedTransport,
    identity: Arc<IdentityStore>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("fetch_in_flight", &self.has_in_flight())
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    pub fn new(transport: AuthenticatedTransport) -> Self {
        let identity = Arc::clone(transport.identity());
        Self {
            transport,
            identity,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the profile from memory, then storage, then the network,
    /// joining a request already in flight rather than starting another.
    pub async fn get_identity(&self) -> Result<UserProfile, SharedClientError> {
        if let Some(profile) = self.identity.cached_profile() {
            return Ok(profile);
        }
        if let Some(profile) = self.identity.get_stored_profile() {
            self.identity.cache_profile(profile.clone());
            return Ok(profile);
        }

        let pending = {
            let mut slot = lock_slot(&self.in_flight);
            let epoch = self.identity.session_epoch();
            match slot.as_ref() {
                Some(existing) if existing.epoch == epoch => {
                    tracing::debug!(fetch = existing.id, "joining in-flight identity fetch");
                    existing.future.clone()
                }
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = self.start_fetch(id, epoch);
                    *slot = Some(InFlight {
                        id,
                        epoch,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        pending.await
    }

    /// Forgets the cached and stored profile so the next call refetches.
    /// The credential is kept.
    pub fn invalidate(&self) {
        self.identity.forget_cached_profile();
        self.identity.clear_stored_profile();
    }

    /// Invalidates and immediately resolves a fresh profile.
    pub async fn refresh(&self) -> Result<UserProfile, SharedClientError> {
        self.invalidate();
        self.get_identity().await
    }

    /// Drops any in-flight fetch and the cached profile. Fetches that settle
    /// afterwards do not repopulate the cache. Clearing the session in the
    /// identity store has the same effect on fetches.
    pub fn reset(&self) {
        self.identity.advance_epoch();
        lock_slot(&self.in_flight).take();
    }

    pub fn has_in_flight(&self) -> bool {
        lock_slot(&self.in_flight).is_some()
    }

    fn start_fetch(&self, id: u64, epoch: u64) -> IdentityFuture {
        let transport = self.transport.clone();
        let identity = Arc::clone(&self.identity);
        let in_flight = Arc::clone(&self.in_flight);

        tracing::debug!(fetch = id, epoch, "starting identity fetch");
        async move {
            let result = transport.get_json::<UserProfile>(ME_PATH).await;

            if let Ok(profile) = &result {
                identity.commit_profile(epoch, profile);
            }

            let mut slot = lock_slot(&in_flight);
            if slot.as_ref().is_some_and(|current| current.id == id) {
                slot.take();
            }
            drop(slot);

            result.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }
}

fn lock_slot(slot: &Mutex<Option<InFlight>>) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
